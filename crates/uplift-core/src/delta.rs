//! Binary delta codec
//!
//! A delta rebuilds a new file from an old one. Layout (integers are
//! little-endian u64):
//!
//! ```text
//! "UPDELTA1" | new_len | old_len | op* | END sha256(new)
//! op := COPY offset len      (bytes taken from the old file)
//!     | INSERT len bytes     (literal bytes carried in the delta)
//! ```
//!
//! Application streams the ops, so neither file has to fit in memory, and the
//! trailing digest proves the output matches what the delta was built from.

use crate::error::DeltaError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::Path;

const MAGIC: &[u8; 8] = b"UPDELTA1";
const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

/// Matching granularity when searching the old file
const BLOCK_SIZE: usize = 32;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Build a delta that turns `old` into `new`
pub fn diff(old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(new.len() / 4 + 64);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(new.len() as u64).to_le_bytes());
    out.extend_from_slice(&(old.len() as u64).to_le_bytes());

    let mut blocks: HashMap<&[u8], usize> = HashMap::new();
    for (n, block) in old.chunks_exact(BLOCK_SIZE).enumerate() {
        blocks.entry(block).or_insert(n * BLOCK_SIZE);
    }

    let mut literal_start = 0;
    let mut pos = 0;
    while pos + BLOCK_SIZE <= new.len() {
        let Some(&found) = blocks.get(&new[pos..pos + BLOCK_SIZE]) else {
            pos += 1;
            continue;
        };

        // Grow the match backwards into pending literals, then forwards
        let (mut new_start, mut old_start) = (pos, found);
        while new_start > literal_start && old_start > 0 && new[new_start - 1] == old[old_start - 1]
        {
            new_start -= 1;
            old_start -= 1;
        }
        let mut len = pos - new_start + BLOCK_SIZE;
        while new_start + len < new.len()
            && old_start + len < old.len()
            && new[new_start + len] == old[old_start + len]
        {
            len += 1;
        }

        write_insert(&mut out, &new[literal_start..new_start]);
        out.push(OP_COPY);
        out.extend_from_slice(&(old_start as u64).to_le_bytes());
        out.extend_from_slice(&(len as u64).to_le_bytes());

        pos = new_start + len;
        literal_start = pos;
    }
    write_insert(&mut out, &new[literal_start..]);

    out.push(OP_END);
    out.extend_from_slice(&Sha256::digest(new));
    out
}

fn write_insert(out: &mut Vec<u8>, literal: &[u8]) {
    if literal.is_empty() {
        return;
    }
    out.push(OP_INSERT);
    out.extend_from_slice(&(literal.len() as u64).to_le_bytes());
    out.extend_from_slice(literal);
}

/// Apply `delta` to `old`, streaming the rebuilt file into `out`.
///
/// `progress` receives percent complete whenever it grows; returning
/// `ControlFlow::Break` aborts with [`DeltaError::Aborted`]. Returns the number
/// of bytes written.
pub fn apply<O, D, W, F>(old: &mut O, delta: &mut D, out: &mut W, mut progress: F) -> Result<u64, DeltaError>
where
    O: Read + Seek,
    D: Read,
    W: Write,
    F: FnMut(u8) -> ControlFlow<()>,
{
    let mut magic = [0u8; 8];
    read_exact(delta, &mut magic)?;
    if &magic != MAGIC {
        return Err(DeltaError::BadMagic);
    }
    let new_len = read_u64(delta)?;
    let expected_old = read_u64(delta)?;
    let old_len = old.seek(SeekFrom::End(0))?;
    if old_len != expected_old {
        return Err(DeltaError::BaseMismatch {
            expected: expected_old,
            actual: old_len,
        });
    }

    let mut sink = DigestWriter::new(out);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut last_percent = None;
    let mut report = |written: u64| -> Result<(), DeltaError> {
        let percent = if new_len == 0 {
            100
        } else {
            (written as u128 * 100 / new_len as u128).min(100) as u8
        };
        if last_percent.map_or(true, |last| percent > last) {
            last_percent = Some(percent);
            if progress(percent).is_break() {
                return Err(DeltaError::Aborted);
            }
        }
        Ok(())
    };

    loop {
        let mut op = [0u8; 1];
        read_exact(delta, &mut op)?;
        match op[0] {
            OP_COPY => {
                let offset = read_u64(delta)?;
                let len = read_u64(delta)?;
                if offset.checked_add(len).map_or(true, |end| end > old_len) {
                    return Err(DeltaError::CopyOutOfRange { offset, len, old_len });
                }
                old.seek(SeekFrom::Start(offset))?;
                copy_exact(old, &mut sink, len, &mut buffer, &mut report)?;
            }
            OP_INSERT => {
                let len = read_u64(delta)?;
                copy_exact(delta, &mut sink, len, &mut buffer, &mut report)?;
            }
            OP_END => {
                let mut expected = [0u8; 32];
                read_exact(delta, &mut expected)?;
                let (written, digest) = sink.finish()?;
                if written != new_len {
                    return Err(DeltaError::LengthMismatch {
                        expected: new_len,
                        actual: written,
                    });
                }
                if digest.as_slice() != expected {
                    return Err(DeltaError::ChecksumMismatch);
                }
                report(written)?;
                return Ok(written);
            }
            other => return Err(DeltaError::UnknownOp(other)),
        }
    }
}

/// Rebuild `new_path` from `old_path` and the delta stored at `delta_path`
pub fn apply_files<F>(old_path: &Path, delta_path: &Path, new_path: &Path, progress: F) -> Result<u64, DeltaError>
where
    F: FnMut(u8) -> ControlFlow<()>,
{
    let mut old = BufReader::new(File::open(old_path)?);
    let mut delta = BufReader::new(File::open(delta_path)?);
    let mut out = BufWriter::new(File::create(new_path)?);
    apply(&mut old, &mut delta, &mut out, progress)
}

fn copy_exact<R, W, F>(
    reader: &mut R,
    writer: &mut DigestWriter<W>,
    len: u64,
    buffer: &mut [u8],
    report: &mut F,
) -> Result<(), DeltaError>
where
    R: Read,
    W: Write,
    F: FnMut(u64) -> Result<(), DeltaError>,
{
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        read_exact(reader, &mut buffer[..want])?;
        writer.write_all(&buffer[..want])?;
        remaining -= want as u64;
        report(writer.written)?;
    }
    Ok(())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), DeltaError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DeltaError::Truncated,
        _ => DeltaError::Io(e),
    })
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, DeltaError> {
    let mut bytes = [0u8; 8];
    read_exact(reader, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Writer that hashes and counts everything passing through
struct DigestWriter<'a, W> {
    inner: &'a mut W,
    hasher: Sha256,
    written: u64,
}

impl<'a, W: Write> DigestWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn finish(self) -> io::Result<(u64, [u8; 32])> {
        self.inner.flush()?;
        Ok((self.written, self.hasher.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(old: &[u8], new: &[u8]) -> Vec<u8> {
        let delta = diff(old, new);
        let mut out = Vec::new();
        let written = apply(
            &mut Cursor::new(old),
            &mut Cursor::new(&delta),
            &mut out,
            |_| ControlFlow::Continue(()),
        )
        .unwrap();
        assert_eq!(written, new.len() as u64);
        out
    }

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_handles_empty_files() {
        assert_eq!(roundtrip(b"", b""), b"");
        assert_eq!(roundtrip(b"", b"hello"), b"hello");
        assert_eq!(roundtrip(b"goodbye", b""), b"");
    }

    #[test]
    fn test_roundtrip_edited_file_reuses_old_bytes() {
        let old = pseudo_random(100_000, 7);
        let mut new = old.clone();
        new.splice(5_000..5_010, b"inserted text".iter().copied());
        new.drain(40_000..41_000);
        new.extend_from_slice(b"trailer");

        let delta = diff(&old, &new);
        assert!(delta.len() < new.len() / 10, "delta is {} bytes", delta.len());
        assert_eq!(roundtrip(&old, &new), new);
    }

    #[test]
    fn test_roundtrip_unrelated_content() {
        let old = pseudo_random(3_000, 1);
        let new = pseudo_random(4_321, 2);
        assert_eq!(roundtrip(&old, &new), new);
    }

    #[test]
    fn test_progress_is_monotonic_and_finishes_at_100() {
        let old = pseudo_random(300_000, 3);
        let mut new = pseudo_random(200_000, 4);
        new.extend_from_slice(&old[..100_000]);
        let delta = diff(&old, &new);

        let mut seen = Vec::new();
        apply(
            &mut Cursor::new(&old),
            &mut Cursor::new(&delta),
            &mut Vec::new(),
            |p| {
                seen.push(p);
                ControlFlow::Continue(())
            },
        )
        .unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_wrong_base_file_is_rejected() {
        let old = pseudo_random(1_000, 5);
        let mut new = old.clone();
        new[500] ^= 0xff;
        let delta = diff(&old, &new);

        let err = apply(
            &mut Cursor::new(pseudo_random(1_000, 6)),
            &mut Cursor::new(&delta),
            &mut Vec::new(),
            |_| ControlFlow::Continue(()),
        )
        .unwrap_err();
        // Same length, different bytes: only the digest catches it
        assert!(matches!(err, DeltaError::ChecksumMismatch), "{err:?}");

        let err = apply(
            &mut Cursor::new(b"short"),
            &mut Cursor::new(&delta),
            &mut Vec::new(),
            |_| ControlFlow::Continue(()),
        )
        .unwrap_err();
        assert!(matches!(err, DeltaError::BaseMismatch { expected: 1000, actual: 5 }));
    }

    #[test]
    fn test_malformed_deltas_are_rejected() {
        let apply_to = |delta: &[u8]| {
            apply(
                &mut Cursor::new(b""),
                &mut Cursor::new(delta),
                &mut Vec::new(),
                |_| ControlFlow::Continue(()),
            )
            .unwrap_err()
        };

        assert!(matches!(apply_to(b"NOTDELTA"), DeltaError::BadMagic));

        let delta = diff(b"", b"payload");
        assert!(matches!(apply_to(&delta[..delta.len() - 5]), DeltaError::Truncated));

        let mut bogus = delta[..24].to_vec();
        bogus.push(0x7f);
        assert!(matches!(apply_to(&bogus), DeltaError::UnknownOp(0x7f)));

        let mut out_of_range = delta[..24].to_vec();
        out_of_range.push(OP_COPY);
        out_of_range.extend_from_slice(&0u64.to_le_bytes());
        out_of_range.extend_from_slice(&7u64.to_le_bytes());
        assert!(matches!(
            apply_to(&out_of_range),
            DeltaError::CopyOutOfRange { len: 7, .. }
        ));
    }

    #[test]
    fn test_progress_break_aborts() {
        let new = pseudo_random(200_000, 9);
        let delta = diff(b"", &new);
        let err = apply(
            &mut Cursor::new(b""),
            &mut Cursor::new(&delta),
            &mut Vec::new(),
            |p| if p >= 50 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) },
        )
        .unwrap_err();
        assert!(matches!(err, DeltaError::Aborted));
    }
}
