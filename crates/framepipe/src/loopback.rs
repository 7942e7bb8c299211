//! Loopback collaborators for bring-up without a GPU or network
//!
//! The renderer only checks the image slot, the encoder emits a tiny
//! annex-B shaped unit per frame, and the sink logs what it would send.
//! Enough to exercise the socket protocol end to end against a real
//! producer.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::ensure;
use tracing::{debug, trace};

use crate::backend::{
    BackendStages, Collaborators, FrameRenderer, RenderBackend, Statistics, VideoEncoder,
    VideoSink,
};
use crate::listener::SharedResourceSet;
use crate::pipeline::EncodedUnit;
use crate::pose::{PoseHistory, PoseRecord};
use crate::wire::{HandshakePacket, PoseMatrix};

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;

/// Default target bitrate reported by `CountingStatistics`.
pub const DEFAULT_BITRATE_BPS: u64 = 30_000_000;

#[derive(Debug, Default)]
pub struct LoopbackBackend {
    sessions: u64,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }
}

impl RenderBackend for LoopbackBackend {
    fn open(
        &mut self,
        handshake: &HandshakePacket,
        resources: SharedResourceSet,
    ) -> anyhow::Result<BackendStages> {
        ensure!(handshake.num_images > 0, "producer announced no images");

        self.sessions += 1;
        let fds: Vec<_> = resources.iter().map(|fd| fd.as_raw_fd()).collect();
        debug!(
            "loopback session {} on {}: memory type {}, descriptors {:?}",
            self.sessions, handshake.device_name, handshake.memory_index, fds
        );

        Ok(BackendStages {
            renderer: Box::new(LoopbackRenderer {
                num_images: handshake.num_images,
                _resources: resources,
            }),
            encoder: Box::new(LoopbackEncoder::default()),
        })
    }
}

struct LoopbackRenderer {
    num_images: u32,
    _resources: SharedResourceSet,
}

impl FrameRenderer for LoopbackRenderer {
    fn render(&mut self, image: u32, semaphore_value: u64) -> anyhow::Result<()> {
        ensure!(
            image < self.num_images,
            "image slot {} out of range, producer has {}",
            image,
            self.num_images
        );
        trace!("render slot {} after semaphore {}", image, semaphore_value);
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackEncoder {
    queued: Option<(u64, bool)>,
    bitrate_bps: u64,
}

impl VideoEncoder for LoopbackEncoder {
    fn set_bitrate(&mut self, bits_per_second: u64) {
        self.bitrate_bps = bits_per_second;
    }

    fn push_frame(&mut self, pts_ns: u64, force_keyframe: bool) -> anyhow::Result<()> {
        self.queued = Some((pts_ns, force_keyframe));
        Ok(())
    }

    fn pull_encoded(&mut self, unit: &mut EncodedUnit) -> anyhow::Result<bool> {
        let Some((pts_ns, keyframe)) = self.queued.take() else {
            return Ok(false);
        };
        unit.append(&START_CODE);
        unit.append(&[if keyframe { NAL_IDR } else { NAL_NON_IDR }]);
        unit.append(&pts_ns.to_be_bytes());
        unit.set_pts(pts_ns);
        Ok(true)
    }
}

/// Logs units instead of sending them.
#[derive(Debug, Default)]
pub struct LoggingSink {
    units: AtomicU64,
    bytes: AtomicU64,
}

impl LoggingSink {
    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl VideoSink for LoggingSink {
    fn send_video(&self, data: &[u8], pts_ns: u64) {
        self.units.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        trace!("video unit: {} bytes, pts {}", data.len(), pts_ns);
    }
}

/// Atomic counters plus a settable target bitrate.
#[derive(Debug)]
pub struct CountingStatistics {
    presents: AtomicU64,
    composed: AtomicU64,
    outputs: AtomicU64,
    last_latency_ns: AtomicU64,
    bitrate_bps: AtomicU64,
    bitrate_changed: AtomicBool,
}

impl CountingStatistics {
    pub fn new(bitrate_bps: u64) -> Self {
        Self {
            presents: AtomicU64::new(0),
            composed: AtomicU64::new(0),
            outputs: AtomicU64::new(0),
            last_latency_ns: AtomicU64::new(0),
            bitrate_bps: AtomicU64::new(bitrate_bps),
            bitrate_changed: AtomicBool::new(true),
        }
    }

    pub fn set_target_bitrate(&self, bits_per_second: u64) {
        self.bitrate_bps.store(bits_per_second, Ordering::Release);
        self.bitrate_changed.store(true, Ordering::Release);
    }

    pub fn presents(&self) -> u64 {
        self.presents.load(Ordering::Relaxed)
    }

    pub fn composed(&self) -> u64 {
        self.composed.load(Ordering::Relaxed)
    }

    pub fn outputs(&self) -> u64 {
        self.outputs.load(Ordering::Relaxed)
    }

    pub fn last_encode_latency(&self) -> Duration {
        Duration::from_nanos(self.last_latency_ns.load(Ordering::Relaxed))
    }
}

impl Default for CountingStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_BITRATE_BPS)
    }
}

impl Statistics for CountingStatistics {
    fn report_present(&self, _target_timestamp_ns: u64, _at: Instant) {
        self.presents.fetch_add(1, Ordering::Relaxed);
    }

    fn report_composed(&self, _target_timestamp_ns: u64, _at: Instant) {
        self.composed.fetch_add(1, Ordering::Relaxed);
    }

    fn encode_output(&self, latency: Duration) {
        self.outputs.fetch_add(1, Ordering::Relaxed);
        self.last_latency_ns
            .store(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    fn current_bitrate_changed(&self) -> bool {
        self.bitrate_changed.swap(false, Ordering::AcqRel)
    }

    fn current_bitrate_bps(&self) -> u64 {
        self.bitrate_bps.load(Ordering::Acquire)
    }
}

/// Matches every pose, stamping strictly increasing timestamps.
#[derive(Debug)]
pub struct TrustingPoseHistory {
    origin: Instant,
    last_ns: AtomicU64,
}

impl TrustingPoseHistory {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ns: AtomicU64::new(0),
        }
    }
}

impl Default for TrustingPoseHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseHistory for TrustingPoseHistory {
    fn best_match(&self, pose: &PoseMatrix) -> Option<PoseRecord> {
        let now = self.origin.elapsed().as_nanos() as u64;
        let previous = self
            .last_ns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        Some(PoseRecord {
            target_timestamp_ns: now.max(previous + 1),
            pose: *pose,
        })
    }
}

/// Loopback collaborators with a handle on the statistics counters.
pub fn collaborators() -> (Collaborators, Arc<CountingStatistics>, Arc<LoggingSink>) {
    let stats = Arc::new(CountingStatistics::default());
    let sink = Arc::new(LoggingSink::default());
    let collaborators = Collaborators {
        poses: Arc::new(TrustingPoseHistory::new()),
        stats: stats.clone(),
        sink: sink.clone(),
    };
    (collaborators, stats, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ImageCreateInfo;
    use std::os::fd::OwnedFd;

    fn handshake(num_images: u32) -> HandshakePacket {
        HandshakePacket {
            num_images,
            device_name: "loopback".to_string(),
            image: ImageCreateInfo::image_2d(44, 640, 480, 0),
            memory_index: 0,
            source_pid: 1,
        }
    }

    fn resources() -> SharedResourceSet {
        let fd = OwnedFd::from(tempfile::tempfile().unwrap());
        SharedResourceSet::from_descriptors(vec![fd]).unwrap()
    }

    #[test]
    fn test_loopback_stages_produce_units() {
        let mut backend = LoopbackBackend::new();
        let mut stages = backend.open(&handshake(3), resources()).unwrap();
        assert_eq!(backend.sessions(), 1);

        stages.renderer.render(2, 10).unwrap();
        assert!(stages.renderer.render(3, 11).is_err());

        let mut unit = EncodedUnit::new();
        assert!(!stages.encoder.pull_encoded(&mut unit).unwrap());

        stages.encoder.push_frame(42, true).unwrap();
        assert!(stages.encoder.pull_encoded(&mut unit).unwrap());
        assert_eq!(&unit.as_slice()[..5], &[0, 0, 0, 1, NAL_IDR]);
        assert_eq!(unit.pts_ns(), Some(42));
    }

    #[test]
    fn test_backend_rejects_zero_images() {
        let mut backend = LoopbackBackend::new();
        assert!(backend.open(&handshake(0), resources()).is_err());
    }

    #[test]
    fn test_statistics_bitrate_change_is_reported_once() {
        let stats = CountingStatistics::default();
        assert!(stats.current_bitrate_changed());
        assert!(!stats.current_bitrate_changed());

        stats.set_target_bitrate(5_000_000);
        assert!(stats.current_bitrate_changed());
        assert_eq!(stats.current_bitrate_bps(), 5_000_000);
    }

    #[test]
    fn test_trusting_history_is_monotonic() {
        let history = TrustingPoseHistory::new();
        let a = history.best_match(&PoseMatrix::IDENTITY).unwrap();
        let b = history.best_match(&PoseMatrix::IDENTITY).unwrap();
        assert!(b.target_timestamp_ns > a.target_timestamp_ns);
    }
}
