//! Pose correlation
//!
//! Every present-notification carries the pose the producer rendered with.
//! The pose predictor keeps a short history of poses it handed out together
//! with the display time they were predicted for; matching the notified
//! matrix against that history recovers the frame's target timestamp.
//!
//! A miss is not an error. It means the history no longer (or never) held
//! that pose, and the frame is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::wire::PoseMatrix;

/// A pose the predictor handed out, with the display time it targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseRecord {
    pub target_timestamp_ns: u64,
    pub pose: PoseMatrix,
}

/// External pose predictor.
pub trait PoseHistory: Send + Sync {
    /// Best historical record for `pose`, if a recent enough one exists.
    fn best_match(&self, pose: &PoseMatrix) -> Option<PoseRecord>;
}

/// Thin per-session wrapper over the predictor.
pub struct PoseCorrelator {
    history: Arc<dyn PoseHistory>,
}

impl PoseCorrelator {
    pub fn new(history: Arc<dyn PoseHistory>) -> Self {
        Self { history }
    }

    pub fn correlate(&self, pose: &PoseMatrix) -> Option<PoseRecord> {
        let record = self.history.best_match(pose);
        if record.is_none() {
            trace!("no pose history match for position {:?}", pose.position());
        }
        record
    }
}

/// Bounded pose history matched by element-wise distance.
///
/// Holds the most recent `capacity` records; a lookup returns the closest
/// record within `tolerance`, preferring the newest on ties.
pub struct PoseLog {
    records: Mutex<VecDeque<PoseRecord>>,
    capacity: usize,
    tolerance: f32,
}

impl PoseLog {
    pub const DEFAULT_CAPACITY: usize = 360;
    pub const DEFAULT_TOLERANCE: f32 = 1e-5;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY, Self::DEFAULT_TOLERANCE)
    }

    pub fn with_capacity(capacity: usize, tolerance: f32) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            tolerance,
        }
    }

    /// Remember a pose handed to the producer.
    pub fn record(&self, pose: PoseMatrix, target_timestamp_ns: u64) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(PoseRecord {
            target_timestamp_ns,
            pose,
        });
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PoseLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseHistory for PoseLog {
    fn best_match(&self, pose: &PoseMatrix) -> Option<PoseRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .rev()
            .map(|record| (record.pose.max_abs_diff(pose), record))
            .filter(|(distance, _)| *distance <= self.tolerance)
            .fold(None, |best: Option<(f32, &PoseRecord)>, candidate| match best {
                Some(current) if current.0 <= candidate.0 => Some(current),
                _ => Some(candidate),
            })
            .map(|(_, record)| *record)
    }
}
