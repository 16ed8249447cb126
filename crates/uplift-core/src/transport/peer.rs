//! Peer-to-peer transport
//!
//! A resource published to a swarm has a metadata descriptor next to it,
//! named by appending [`SWARM_METADATA_SUFFIX`] to the resource URL. The
//! descriptor splits the file into fixed-size pieces, lists the SHA-256 of
//! every piece and the peers that serve the file. Pieces are requested from
//! several peers at once with HTTP range requests, verified, and written at
//! their offsets by a single writer.
//!
//! Throughput is the point of this transport, not reliability: it is meant to
//! run as the primary under a [`FallbackCoordinator`](crate::FallbackCoordinator).

use super::http::{build_client, ensure_success};
use super::{create_staging, ByteSink, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uplift_types::{Resource, TransferSettings};
use url::Url;

/// Appended to a resource URL to locate its swarm descriptor
pub const SWARM_METADATA_SUFFIX: &str = ".swarm";

/// Swarm metadata for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmDescriptor {
    /// Total file length in bytes
    pub length: u64,
    /// Size of every piece except possibly the last
    pub piece_length: u64,
    /// Lowercase hex SHA-256 of each piece, in order
    pub pieces: Vec<String>,
    /// Peers serving the complete file
    pub peers: Vec<Url>,
}

impl SwarmDescriptor {
    /// Describe `data` split into `piece_length` pieces served by `peers`
    pub fn describe(data: &[u8], piece_length: u64, peers: Vec<Url>) -> Self {
        let pieces = data
            .chunks(piece_length.max(1) as usize)
            .map(|piece| format!("{:x}", Sha256::digest(piece)))
            .collect();
        Self {
            length: data.len() as u64,
            piece_length,
            pieces,
            peers,
        }
    }

    pub fn piece_count(&self) -> u64 {
        if self.piece_length == 0 {
            return 0;
        }
        self.length.div_ceil(self.piece_length)
    }

    /// Offset and length of piece `index`
    pub fn piece_range(&self, index: u64) -> (u64, u64) {
        let start = index * self.piece_length;
        let len = self.piece_length.min(self.length - start);
        (start, len)
    }

    /// Check that the descriptor is internally consistent
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.piece_length == 0 {
            return Err(TransportError::Swarm("piece length is zero".to_string()));
        }
        if self.pieces.len() as u64 != self.piece_count() {
            return Err(TransportError::Swarm(format!(
                "descriptor lists {} pieces, length {} needs {}",
                self.pieces.len(),
                self.length,
                self.piece_count()
            )));
        }
        if self.peers.is_empty() {
            return Err(TransportError::Swarm("descriptor lists no peers".to_string()));
        }
        Ok(())
    }

    fn verify(&self, index: u64, data: &[u8]) -> bool {
        let digest = format!("{:x}", Sha256::digest(data));
        self.pieces[index as usize].eq_ignore_ascii_case(&digest)
    }
}

/// Location of the swarm descriptor for `remote`
pub fn swarm_metadata_url(remote: &Url) -> Url {
    let mut url = remote.clone();
    url.set_path(&format!("{}{}", remote.path(), SWARM_METADATA_SUFFIX));
    url
}

/// Downloads resources piecewise from a swarm of peers
#[derive(Debug)]
pub struct PeerTransport {
    client: Client,
    max_connections: usize,
    swarms: Mutex<HashMap<Url, Arc<SwarmDescriptor>>>,
}

impl PeerTransport {
    pub fn new(settings: &TransferSettings) -> Result<Self, TransportError> {
        Ok(Self::with_client(
            build_client(settings)?,
            settings.max_peer_connections,
        ))
    }

    pub fn with_client(client: Client, max_connections: usize) -> Self {
        Self {
            client,
            max_connections: max_connections.max(1),
            swarms: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch and validate the descriptor for a resource, caching it for `fetch`
    async fn setup(&self, resource: &Resource) -> Result<Arc<SwarmDescriptor>, TransportError> {
        if let Some(swarm) = self.swarms.lock().get(&resource.remote) {
            return Ok(Arc::clone(swarm));
        }

        let meta_url = swarm_metadata_url(&resource.remote);
        debug!("Fetching swarm descriptor {}", meta_url);
        let response = self.client.get(meta_url.clone()).send().await?;
        ensure_success(&meta_url, response.status())?;

        let body = response.bytes().await?;
        let swarm: SwarmDescriptor = serde_json::from_slice(&body)
            .map_err(|e| TransportError::Swarm(format!("bad descriptor {}: {}", meta_url, e)))?;
        swarm.validate()?;

        info!(
            "Joined swarm for {}: {} bytes in {} pieces, {} peers",
            resource.remote,
            swarm.length,
            swarm.pieces.len(),
            swarm.peers.len()
        );

        let swarm = Arc::new(swarm);
        self.swarms
            .lock()
            .insert(resource.remote.clone(), Arc::clone(&swarm));
        Ok(swarm)
    }

    /// Fetch one verified piece, trying each peer in turn
    async fn fetch_piece(
        &self,
        swarm: &SwarmDescriptor,
        index: u64,
    ) -> Result<(u64, Bytes), TransportError> {
        let (start, len) = swarm.piece_range(index);
        let peer_count = swarm.peers.len();
        let first = (index % peer_count as u64) as usize;
        let mut last_error = None;

        for attempt in 0..peer_count {
            let peer = &swarm.peers[(first + attempt) % peer_count];
            match self.request_range(peer, start, len, swarm.length).await {
                Ok(data) if swarm.verify(index, &data) => return Ok((index, data)),
                Ok(_) => {
                    warn!("Piece {} from {} failed verification", index, peer);
                    last_error = Some(format!("piece {} from {} is corrupt", index, peer));
                }
                Err(e) => {
                    debug!("Piece {} from {} failed: {}", index, peer, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(TransportError::Swarm(format!(
            "piece {} unavailable from {} peers (last error: {})",
            index,
            peer_count,
            last_error.unwrap_or_default()
        )))
    }

    async fn request_range(
        &self,
        peer: &Url,
        start: u64,
        len: u64,
        total: u64,
    ) -> Result<Bytes, TransportError> {
        let range = format!("bytes={}-{}", start, start + len - 1);
        let response = self
            .client
            .get(peer.clone())
            .header(reqwest::header::RANGE, range)
            .send()
            .await?;
        let status = response.status();
        ensure_success(peer, status)?;

        let body = response.bytes().await?;
        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }
        // Peer ignored the range and sent the whole file
        if body.len() as u64 == total {
            return Ok(body.slice(start as usize..(start + len) as usize));
        }
        Err(TransportError::Swarm(format!(
            "peer {} returned {} bytes for a {} byte file",
            peer,
            body.len(),
            total
        )))
    }
}

/// Forgets a cached descriptor once its fetch ends, however it ends
struct SwarmLease<'a> {
    swarms: &'a Mutex<HashMap<Url, Arc<SwarmDescriptor>>>,
    remote: &'a Url,
}

impl Drop for SwarmLease<'_> {
    fn drop(&mut self) {
        self.swarms.lock().remove(self.remote);
    }
}

#[async_trait]
impl Transport for PeerTransport {
    async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError> {
        let swarm = self.setup(resource).await?;
        Ok(Some(swarm.length))
    }

    async fn fetch(
        &self,
        resource: &Resource,
        on_bytes: &mut ByteSink<'_>,
    ) -> Result<(), TransportError> {
        let swarm = self.setup(resource).await?;
        let _lease = SwarmLease {
            swarms: &self.swarms,
            remote: &resource.remote,
        };
        let mut file = create_staging(&resource.staging).await?;
        file.set_len(swarm.length).await?;

        info!(
            "Collecting {} pieces of {} from the swarm",
            swarm.piece_count(),
            resource.remote
        );

        let mut pieces = stream::iter(0..swarm.piece_count())
            .map(|index| self.fetch_piece(&swarm, index))
            .buffer_unordered(self.max_connections);

        while let Some(piece) = pieces.next().await {
            let (index, data) = piece?;
            let (offset, _) = swarm.piece_range(index);
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            if on_bytes(data.len() as u64).is_break() {
                debug!("Swarm download of {} aborted by caller", resource.remote);
                return Err(TransportError::Aborted);
            }
        }

        file.flush().await?;
        Ok(())
    }
}
