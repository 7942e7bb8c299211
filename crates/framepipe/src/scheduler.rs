//! Keyframe and bitrate scheduling
//!
//! Two independent reasons force the encoder to emit a keyframe (IDR):
//!
//! - **Loss**: the network layer saw packet loss, or an operator asked for one.
//!   The next pushed frame is forced, once.
//! - **Periodic**: too long since the last keyframe the encoder actually
//!   emitted. Stays due until `keyframe_emitted` is called.
//!
//! All state is atomic: the loss/manual side is poked from other threads while
//! the encoder thread polls `check_forced_keyframe` once per frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::backend::{Statistics, VideoEncoder};

pub struct EncodeScheduler {
    origin: Instant,
    periodic: Option<Duration>,
    requested: AtomicBool,
    /// Nanoseconds after `origin` of the last emitted keyframe.
    last_keyframe_ns: AtomicU64,
}

impl EncodeScheduler {
    pub fn new(periodic: Option<Duration>) -> Self {
        Self {
            origin: Instant::now(),
            periodic,
            requested: AtomicBool::new(false),
            last_keyframe_ns: AtomicU64::new(0),
        }
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic
    }

    /// Network loss detected; the next frame must be decodable on its own.
    pub fn on_packet_loss(&self) {
        debug!("packet loss reported, scheduling keyframe");
        self.requested.store(true, Ordering::Release);
    }

    /// Manual keyframe request.
    pub fn insert_idr(&self) {
        debug!("keyframe requested");
        self.requested.store(true, Ordering::Release);
    }

    /// Decide whether the frame about to be pushed must be a keyframe.
    ///
    /// Consumes a pending loss/manual request. The periodic timer is left
    /// alone; it restarts only through `keyframe_emitted`.
    pub fn check_forced_keyframe(&self, now: Instant) -> bool {
        let requested = self.requested.swap(false, Ordering::AcqRel);
        let periodic_due = self
            .periodic
            .is_some_and(|interval| self.since_last_keyframe(now) >= interval);
        requested || periodic_due
    }

    /// The encoder accepted a forced keyframe at `now`.
    pub fn keyframe_emitted(&self, now: Instant) {
        self.last_keyframe_ns
            .store(self.offset_ns(now), Ordering::Release);
    }

    /// Start a new session: drop pending requests and restart the timer.
    pub fn reset(&self, now: Instant) {
        self.requested.store(false, Ordering::Release);
        self.keyframe_emitted(now);
    }

    /// Forward a changed target bitrate to the encoder.
    ///
    /// Returns the applied bitrate, if any.
    pub fn apply_bitrate(
        &self,
        stats: &dyn Statistics,
        encoder: &mut dyn VideoEncoder,
    ) -> Option<u64> {
        if !stats.current_bitrate_changed() {
            return None;
        }
        let bps = stats.current_bitrate_bps();
        debug!("bitrate target changed to {} bps", bps);
        encoder.set_bitrate(bps);
        Some(bps)
    }

    fn offset_ns(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_nanos() as u64
    }

    fn since_last_keyframe(&self, now: Instant) -> Duration {
        let last = self.last_keyframe_ns.load(Ordering::Acquire);
        Duration::from_nanos(self.offset_ns(now).saturating_sub(last))
    }
}
