//! Validation of per-frame inertial batches and carry-forward of samples
//! that could not be used.
//!
//! Every frame arrives with the samples recorded since the previous frame.
//! [`ImuBatchBuffer::prepare`] turns that raw batch into the *effective*
//! batch for the frame: the last sample of the previous accepted batch and
//! any samples carried over from malformed batches are prepended, and the
//! result is checked to bracket the frame interval. A malformed batch makes
//! the frame image-only; its samples are kept for the next frame.

use thiserror::Error;
use tracing::warn;

use super::sample::ImuSample;

/// Two samples closer than this are treated as the same instant.
const DUPLICATE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImuError {
    #[error("no inertial samples for [{start:.4}, {end:.4}]")]
    Empty { start: f64, end: f64 },
    #[error("inertial samples do not bracket [{start:.4}, {end:.4}] (gap near t={at:.4})")]
    GapDetected { start: f64, end: f64, at: f64 },
    #[error("non-monotonic inertial timestamp at t={at:.4}")]
    NonMonotonic { at: f64 },
}

/// Checks that strictly increasing `samples` cover `[start, end]` with no
/// spacing larger than `max_gap` inside the interval.
pub fn check_coverage(samples: &[ImuSample], start: f64, end: f64, max_gap: f64) -> Result<(), ImuError> {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Err(ImuError::Empty { start, end });
    };
    for pair in samples.windows(2) {
        if pair[1].timestamp_s <= pair[0].timestamp_s {
            return Err(ImuError::NonMonotonic { at: pair[1].timestamp_s });
        }
    }
    if first.timestamp_s > start + max_gap {
        return Err(ImuError::GapDetected { start, end, at: start });
    }
    if last.timestamp_s < end - max_gap {
        return Err(ImuError::GapDetected { start, end, at: end });
    }
    for pair in samples.windows(2) {
        let (a, b) = (pair[0].timestamp_s, pair[1].timestamp_s);
        if b < start || a > end {
            continue;
        }
        if b - a > max_gap {
            return Err(ImuError::GapDetected { start, end, at: a });
        }
    }
    Ok(())
}

/// Outcome of preparing a frame's inertial batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatus {
    /// The effective batch brackets the frame interval.
    Valid,
    /// No inertial data at all for this frame.
    Missing,
    /// Malformed batch; the frame is processed image-only.
    Malformed(ImuError),
}

/// Effective inertial batch of one frame.
#[derive(Debug, Clone)]
pub struct EffectiveBatch {
    pub samples: Vec<ImuSample>,
    pub status: BatchStatus,
}

impl EffectiveBatch {
    pub fn is_valid(&self) -> bool {
        self.status == BatchStatus::Valid
    }
}

/// Per-stream state needed to build effective batches.
#[derive(Debug, Clone)]
pub struct ImuBatchBuffer {
    /// Samples from malformed batches, waiting for the next frame.
    carried: Vec<ImuSample>,
    /// Last sample of the previous accepted batch, used as the left bracket.
    last_accepted: Option<ImuSample>,
    max_gap: f64,
    max_carried: usize,
}

impl ImuBatchBuffer {
    pub fn new(max_gap: f64, max_carried: usize) -> Self {
        Self {
            carried: Vec::new(),
            last_accepted: None,
            max_gap,
            max_carried,
        }
    }

    pub fn carried(&self) -> &[ImuSample] {
        &self.carried
    }

    pub fn reset(&mut self) {
        self.carried.clear();
        self.last_accepted = None;
    }

    /// Builds the effective batch for a frame at `t_cur` whose predecessor was
    /// at `t_prev` (`None` for the very first frame).
    pub fn prepare(&mut self, batch: Option<&[ImuSample]>, t_prev: Option<f64>, t_cur: f64) -> EffectiveBatch {
        let raw = batch.unwrap_or(&[]);
        if raw.is_empty() && self.carried.is_empty() {
            return EffectiveBatch { samples: Vec::new(), status: BatchStatus::Missing };
        }

        let raw_error = raw
            .windows(2)
            .find(|pair| pair[1].timestamp_s <= pair[0].timestamp_s)
            .map(|pair| ImuError::NonMonotonic { at: pair[1].timestamp_s });

        let mut merged: Vec<ImuSample> = Vec::with_capacity(raw.len() + self.carried.len() + 1);
        merged.extend(self.last_accepted.iter().copied());
        merged.extend(self.carried.drain(..));
        merged.extend(raw.iter().copied());
        merged.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
        merged.dedup_by(|b, a| (b.timestamp_s - a.timestamp_s).abs() < DUPLICATE_EPS);

        let status = match (raw_error, t_prev) {
            (Some(err), _) => Err(err),
            (None, None) => Ok(()),
            (None, Some(t_prev)) => check_coverage(&merged, t_prev, t_cur, self.max_gap),
        };

        match status {
            Ok(()) => {
                self.last_accepted = merged.iter().rev().find(|s| s.timestamp_s <= t_cur + DUPLICATE_EPS).copied();
                EffectiveBatch { samples: merged, status: BatchStatus::Valid }
            }
            Err(err) => {
                warn!("[ImuBatch] frame at t={:.4} processed image-only: {}", t_cur, err);
                if merged.len() > self.max_carried {
                    let excess = merged.len() - self.max_carried;
                    merged.drain(..excess);
                }
                self.carried = merged;
                EffectiveBatch { samples: Vec::new(), status: BatchStatus::Malformed(err) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn samples(t0: f64, t1: f64, rate: f64) -> Vec<ImuSample> {
        let n = ((t1 - t0) * rate).round() as usize;
        (0..=n)
            .map(|i| ImuSample::new(t0 + i as f64 / rate, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()))
            .collect()
    }

    #[test]
    fn contiguous_batches_are_valid() {
        let mut buffer = ImuBatchBuffer::new(0.02, 1000);
        let first = buffer.prepare(Some(&samples(0.0, 0.1, 200.0)), None, 0.1);
        assert!(first.is_valid());
        // Next batch starts one sample period after the previous frame.
        let second = buffer.prepare(Some(&samples(0.105, 0.2, 200.0)), Some(0.1), 0.2);
        assert!(second.is_valid());
        assert!(second.samples[0].timestamp_s <= 0.1 + 1e-9);
    }

    #[test]
    fn gap_is_carried_into_next_batch() {
        let mut buffer = ImuBatchBuffer::new(0.02, 1000);
        buffer.prepare(Some(&samples(0.0, 0.1, 200.0)), None, 0.1);

        // Frame k: 50 ms of samples missing in the middle of the interval.
        let mut partial = samples(0.105, 0.12, 200.0);
        partial.extend(samples(0.17, 0.2, 200.0));
        let k = buffer.prepare(Some(&partial), Some(0.1), 0.2);
        assert!(matches!(k.status, BatchStatus::Malformed(ImuError::GapDetected { .. })));
        assert!(k.samples.is_empty());
        assert_eq!(buffer.carried().len(), partial.len() + 1);

        // Frame k+1: the carried samples come first in the effective batch.
        let next = samples(0.205, 0.3, 200.0);
        let k1 = buffer.prepare(Some(&next), Some(0.2), 0.3);
        assert!(k1.is_valid());
        for s in &partial {
            assert!(k1.samples.iter().any(|e| (e.timestamp_s - s.timestamp_s).abs() < 1e-12));
        }
        assert!(k1.samples.windows(2).all(|w| w[1].timestamp_s > w[0].timestamp_s));
    }

    #[test]
    fn non_monotonic_batch_is_malformed_and_sanitised() {
        let mut buffer = ImuBatchBuffer::new(0.02, 1000);
        buffer.prepare(Some(&samples(0.0, 0.1, 200.0)), None, 0.1);
        let mut bad = samples(0.105, 0.2, 200.0);
        bad.swap(3, 4);
        let k = buffer.prepare(Some(&bad), Some(0.1), 0.2);
        assert!(matches!(k.status, BatchStatus::Malformed(ImuError::NonMonotonic { .. })));
        let k1 = buffer.prepare(Some(&samples(0.205, 0.3, 200.0)), Some(0.2), 0.3);
        assert!(k1.is_valid());
    }

    #[test]
    fn missing_batch_is_reported() {
        let mut buffer = ImuBatchBuffer::new(0.02, 1000);
        let eb = buffer.prepare(None, Some(0.0), 0.1);
        assert_eq!(eb.status, BatchStatus::Missing);
    }
}
