//! Per-session frame loop
//!
//! ```text
//! read_latest ─▶ bitrate ─▶ pose match ─▶ present ─▶ render ─▶ composed
//!                               │                                  │
//!                            (miss: drop)                          ▼
//!                    send_video ◀─ pull_encoded ◀─ push_frame(force?)
//! ```
//!
//! One notification in, at most one bitstream unit out. Nothing here blocks
//! except the channel read, which honors the cancellation flag.

use std::fmt;
use std::io::Read;
use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::backend::{
    BackendStages, Collaborators, FrameRenderer, Statistics, VideoEncoder, VideoSink,
};
use crate::channel::{self, PollTimings, ReadStatus};
use crate::pose::PoseCorrelator;
use crate::scheduler::EncodeScheduler;
use crate::service::SessionError;
use crate::wire::{PresentNotification, PRESENT_NOTIFICATION_SIZE};

/// Bitstream accumulated across encoder pulls until it is forwarded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    data: Vec<u8>,
    pts_ns: Option<u64>,
}

impl EncodedUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn set_pts(&mut self, pts_ns: u64) {
        self.pts_ns = Some(pts_ns);
    }

    pub fn pts_ns(&self) -> Option<u64> {
        self.pts_ns
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keeps the allocation for the next unit.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pts_ns = None;
    }
}

/// Stage marks for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimings {
    pub present: Instant,
    pub composed: Instant,
    pub encode_start: Instant,
}

impl FrameTimings {
    pub fn is_ordered(&self) -> bool {
        self.present <= self.composed && self.composed <= self.encode_start
    }
}

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No pose match; nothing was rendered.
    Dropped,
    /// Pushed to the encoder, no output yet.
    Pending { timings: FrameTimings },
    /// A bitstream unit went to the sink.
    Sent {
        timings: FrameTimings,
        pts_ns: u64,
        bytes: usize,
    },
}

/// Counters for one session, logged when it ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub notifications_read: u64,
    pub notifications_coalesced: u64,
    pub frames_dropped: u64,
    pub frames_pushed: u64,
    pub keyframes_forced: u64,
    pub units_sent: u64,
    pub bytes_sent: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} notifications ({} coalesced, {} dropped), {} frames pushed ({} forced keyframes), {} units / {} bytes sent",
            self.notifications_read,
            self.notifications_coalesced,
            self.frames_dropped,
            self.frames_pushed,
            self.keyframes_forced,
            self.units_sent,
            self.bytes_sent
        )
    }
}

pub struct FramePipeline {
    renderer: Box<dyn FrameRenderer>,
    encoder: Box<dyn VideoEncoder>,
    correlator: PoseCorrelator,
    stats: Arc<dyn Statistics>,
    sink: Arc<dyn VideoSink>,
    scheduler: Arc<EncodeScheduler>,
    unit: EncodedUnit,
    counters: SessionStats,
    record: [u8; PRESENT_NOTIFICATION_SIZE],
}

impl FramePipeline {
    pub fn new(
        stages: BackendStages,
        collaborators: &Collaborators,
        scheduler: Arc<EncodeScheduler>,
    ) -> Self {
        Self {
            renderer: stages.renderer,
            encoder: stages.encoder,
            correlator: PoseCorrelator::new(Arc::clone(&collaborators.poses)),
            stats: Arc::clone(&collaborators.stats),
            sink: Arc::clone(&collaborators.sink),
            scheduler,
            unit: EncodedUnit::new(),
            counters: SessionStats::default(),
            record: [0; PRESENT_NOTIFICATION_SIZE],
        }
    }

    /// Run one notification through render, encode and forward.
    pub fn process(
        &mut self,
        notification: &PresentNotification,
    ) -> Result<FrameOutcome, SessionError> {
        self.scheduler
            .apply_bitrate(self.stats.as_ref(), self.encoder.as_mut());

        let Some(record) = self.correlator.correlate(&notification.pose) else {
            self.counters.frames_dropped += 1;
            trace!("frame {} dropped, pose not in history", notification.frame);
            return Ok(FrameOutcome::Dropped);
        };
        let target_ts = record.target_timestamp_ns;

        let present = Instant::now();
        self.stats.report_present(target_ts, present);

        self.renderer
            .render(notification.image, notification.semaphore_value)
            .map_err(SessionError::Render)?;

        let composed = Instant::now();
        self.stats.report_composed(target_ts, composed);

        let force_keyframe = self.scheduler.check_forced_keyframe(composed);
        let encode_start = Instant::now();
        self.encoder
            .push_frame(target_ts, force_keyframe)
            .map_err(SessionError::Encode)?;
        self.counters.frames_pushed += 1;
        if force_keyframe {
            self.scheduler.keyframe_emitted(encode_start);
            self.counters.keyframes_forced += 1;
        }

        let timings = FrameTimings {
            present,
            composed,
            encode_start,
        };

        let ready = self
            .encoder
            .pull_encoded(&mut self.unit)
            .map_err(SessionError::Encode)?;
        if !ready || self.unit.is_empty() {
            trace!("frame {} pushed, encoder still buffering", notification.frame);
            return Ok(FrameOutcome::Pending { timings });
        }

        let pts_ns = self.unit.pts_ns().unwrap_or(target_ts);
        let bytes = self.unit.len();
        self.sink.send_video(self.unit.as_slice(), pts_ns);
        self.unit.clear();

        let latency = encode_start.elapsed();
        self.stats.encode_output(latency);
        self.counters.units_sent += 1;
        self.counters.bytes_sent += bytes as u64;

        trace!(
            "frame {} sent: pts {} ns, {} bytes, encode {:?}{}",
            notification.frame,
            pts_ns,
            bytes,
            latency,
            if force_keyframe { " (keyframe)" } else { "" }
        );

        Ok(FrameOutcome::Sent {
            timings,
            pts_ns,
            bytes,
        })
    }

    /// Wait for the newest notification and process it.
    ///
    /// Returns `None` when cancelled.
    pub fn step<C>(
        &mut self,
        channel: &C,
        timings: &PollTimings,
        cancel: &AtomicBool,
    ) -> Result<Option<FrameOutcome>, SessionError>
    where
        C: AsFd,
        for<'c> &'c C: Read,
    {
        let records = match channel::read_latest(channel, &mut self.record, timings, cancel)? {
            ReadStatus::Complete { records } => records as u64,
            ReadStatus::Cancelled => return Ok(None),
        };
        self.counters.notifications_read += records;
        self.counters.notifications_coalesced += records - 1;

        let notification = PresentNotification::decode(&self.record);
        if records > 1 {
            trace!(
                "skipped {} stale notifications, serving frame {}",
                records - 1,
                notification.frame
            );
        }

        self.process(&notification).map(Some)
    }

    /// Process notifications until cancelled or the session fails.
    pub fn run<C>(
        &mut self,
        channel: &C,
        timings: &PollTimings,
        cancel: &AtomicBool,
    ) -> Result<(), SessionError>
    where
        C: AsFd,
        for<'c> &'c C: Read,
    {
        while self.step(channel, timings, cancel)?.is_some() {}
        Ok(())
    }

    pub fn encoded_unit(&self) -> &EncodedUnit {
        &self.unit
    }

    pub fn stats(&self) -> &SessionStats {
        &self.counters
    }
}
