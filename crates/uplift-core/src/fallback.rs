//! Transport fallback with a stall watchdog
//!
//! A fast but unreliable primary transport (the peer swarm) is tried first.
//! If it cannot probe a resource, fails outright, or has not moved enough
//! bytes by the time threshold, the batch switches to the secondary transport.
//! The switch happens at most once per coordinator and is never undone.

use crate::downloader::Downloader;
use crate::error::TransportError;
use crate::progress::{CancelHandle, ProgressObserver};
use crate::transport::{discard_staging, ByteSink, Transport, TransferState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uplift_types::{Outcome, Resource, StallSettings};

/// Where a coordinated batch currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPhase {
    /// Sizes are being probed on the primary transport
    Probing,
    /// The primary transport is moving bytes
    PrimaryActive,
    /// The watchdog judged the primary unhealthy; it is being shut down
    Stalled,
    /// Everything now goes through the secondary transport
    FallbackActive,
    Done,
    Failed,
}

/// When a primary transfer counts as stalled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallPolicy {
    /// Bytes the transfer must have moved once `time_threshold` has passed
    pub min_progress_bytes: u64,
    pub time_threshold: Duration,
    /// Watchdog sampling period
    pub poll_interval: Duration,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self::from(&StallSettings::default())
    }
}

impl From<&StallSettings> for StallPolicy {
    fn from(settings: &StallSettings) -> Self {
        Self {
            min_progress_bytes: settings.min_progress_bytes,
            time_threshold: Duration::from_millis(settings.time_threshold_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
        }
    }
}

impl StallPolicy {
    /// Watch a transfer, resolving only if it is judged unhealthy.
    ///
    /// A transfer that clears the byte threshold in time can never stall
    /// afterwards, so the watchdog then parks for good.
    pub async fn watch(&self, state: &TransferState) {
        let mut ticker = tokio::time::interval(self.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if state.elapsed() < self.time_threshold {
                continue;
            }
            if state.transferred() < self.min_progress_bytes {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Forwards attempt byte counts to the batch sink as a high-water mark, so a
/// transfer restarted on another transport is not counted twice
struct Relay<'a, 'b> {
    sink: &'a mut ByteSink<'b>,
    forwarded: u64,
}

impl<'a, 'b> Relay<'a, 'b> {
    fn new(sink: &'a mut ByteSink<'b>) -> Self {
        Self { sink, forwarded: 0 }
    }

    fn forward(&mut self, attempt_total: u64) -> ControlFlow<()> {
        let fresh = attempt_total.saturating_sub(self.forwarded);
        self.forwarded = self.forwarded.max(attempt_total);
        (self.sink)(fresh)
    }
}

/// Transport that routes to the primary or secondary, owning the switch
struct Switchboard<P, S> {
    primary: P,
    secondary: S,
    policy: StallPolicy,
    switched: AtomicBool,
    phase: Mutex<FallbackPhase>,
}

impl<P: Transport, S: Transport> Switchboard<P, S> {
    fn switched(&self) -> bool {
        self.switched.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: FallbackPhase) {
        *self.phase.lock() = phase;
    }

    fn switch_to_secondary(&self) {
        if !self.switched.swap(true, Ordering::AcqRel) {
            info!("Switching all remaining transfers to the secondary transport");
        }
        self.set_phase(FallbackPhase::FallbackActive);
    }
}

#[async_trait]
impl<P: Transport, S: Transport> Transport for Switchboard<P, S> {
    async fn check_size(&self, resource: &Resource) -> Result<Option<u64>, TransportError> {
        if self.switched() {
            return self.secondary.check_size(resource).await;
        }

        match self.primary.check_size(resource).await {
            Ok(size) => {
                self.set_phase(FallbackPhase::PrimaryActive);
                Ok(size)
            }
            Err(e) => {
                warn!(
                    "Primary transport could not probe {}: {}; falling back",
                    resource.remote, e
                );
                self.switch_to_secondary();
                self.secondary.check_size(resource).await
            }
        }
    }

    async fn fetch(
        &self,
        resource: &Resource,
        on_bytes: &mut ByteSink<'_>,
    ) -> Result<(), TransportError> {
        if self.switched() {
            return self.secondary.fetch(resource, on_bytes).await;
        }

        self.set_phase(FallbackPhase::PrimaryActive);
        let mut relay = Relay::new(on_bytes);
        let attempt = TransferState::new(None);

        let primary_result = {
            let mut sink = |bytes: u64| relay.forward(attempt.record(bytes));
            tokio::select! {
                result = self.primary.fetch(resource, &mut sink) => Some(result),
                _ = self.policy.watch(&attempt) => None,
            }
        };

        match primary_result {
            Some(Ok(())) => return Ok(()),
            Some(Err(TransportError::Aborted)) => return Err(TransportError::Aborted),
            Some(Err(e)) => {
                warn!(
                    "Primary transport failed on {}: {}; falling back",
                    resource.remote, e
                );
            }
            None => {
                self.set_phase(FallbackPhase::Stalled);
                warn!(
                    "Primary transport stalled on {} ({} bytes after {:?}, idle {:?}); falling back",
                    resource.remote,
                    attempt.transferred(),
                    attempt.elapsed(),
                    attempt.idle()
                );
            }
        }

        // The primary future is gone, so nothing else writes the staging file
        discard_staging(&resource.staging).await;
        self.switch_to_secondary();

        let attempt = TransferState::new(None);
        let mut sink = |bytes: u64| relay.forward(attempt.record(bytes));
        self.secondary.fetch(resource, &mut sink).await
    }
}

/// Downloads a batch over a primary transport, falling back to a secondary
/// one at most once
pub struct FallbackCoordinator<P, S> {
    downloader: Downloader<Switchboard<P, S>>,
}

impl<P: Transport, S: Transport> FallbackCoordinator<P, S> {
    pub fn new(primary: P, secondary: S, policy: StallPolicy) -> Self {
        let board = Switchboard {
            primary,
            secondary,
            policy,
            switched: AtomicBool::new(false),
            phase: Mutex::new(FallbackPhase::Probing),
        };
        Self {
            downloader: Downloader::new(board),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.downloader = self.downloader.with_observer(observer);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.downloader.cancel_handle()
    }

    pub fn phase(&self) -> FallbackPhase {
        *self.board().phase.lock()
    }

    /// Whether the secondary transport has taken over
    pub fn switched(&self) -> bool {
        self.board().switched()
    }

    pub fn primary(&self) -> &P {
        &self.board().primary
    }

    pub fn secondary(&self) -> &S {
        &self.board().secondary
    }

    fn board(&self) -> &Switchboard<P, S> {
        self.downloader.transport()
    }

    /// Download the batch and report its terminal outcome
    pub async fn run(&self, resources: &[Resource]) -> Outcome {
        if !self.switched() {
            self.board().set_phase(FallbackPhase::Probing);
        }

        let outcome = self.downloader.run(resources).await;
        match &outcome {
            Outcome::Succeeded => self.board().set_phase(FallbackPhase::Done),
            Outcome::Failed(_) => self.board().set_phase(FallbackPhase::Failed),
            Outcome::Cancelled => {}
        }
        outcome
    }
}

impl<P: Transport + 'static, S: Transport + 'static> FallbackCoordinator<P, S> {
    /// Run the batch on its own task so the caller is never blocked
    pub fn spawn(self, resources: Vec<Resource>) -> JoinHandle<Outcome> {
        tokio::spawn(async move { self.run(&resources).await })
    }
}
