//! Collaborator seams
//!
//! The encoder thread drives these but owns none of their internals: the GPU
//! renderer, the hardware encoder, the network sender and the statistics
//! collector live behind traits so the loop can be exercised with fakes.
//!
//! Renderer and encoder calls are synchronous and carry no timeout of their
//! own. One that blocks forever stalls the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::listener::SharedResourceSet;
use crate::pipeline::EncodedUnit;
use crate::pose::PoseHistory;
use crate::wire::HandshakePacket;

/// Turns the producer's shared image slot into an encodable surface.
pub trait FrameRenderer {
    /// Wait for `semaphore_value` on the producer's timeline, then compose
    /// `image` into the encoder input surface.
    fn render(&mut self, image: u32, semaphore_value: u64) -> anyhow::Result<()>;
}

/// Hardware video encoder.
pub trait VideoEncoder {
    /// Request a new target bitrate. Ramp-up is the encoder's business.
    fn set_bitrate(&mut self, bits_per_second: u64);

    /// Submit the last rendered surface, tagged with its presentation time.
    fn push_frame(&mut self, pts_ns: u64, force_keyframe: bool) -> anyhow::Result<()>;

    /// Append available bitstream to `unit`.
    ///
    /// Returns `false` while the encoder is still buffering input; that is not
    /// an error.
    fn pull_encoded(&mut self, unit: &mut EncodedUnit) -> anyhow::Result<bool>;
}

/// Renderer and encoder built for one session.
pub struct BackendStages {
    pub renderer: Box<dyn FrameRenderer>,
    pub encoder: Box<dyn VideoEncoder>,
}

/// Builds per-session stages from the handshake and the producer's shared
/// resources. The stages own the resources until the session ends.
pub trait RenderBackend: Send {
    fn open(
        &mut self,
        handshake: &HandshakePacket,
        resources: SharedResourceSet,
    ) -> anyhow::Result<BackendStages>;
}

/// Network sender for finished bitstream units. Fire-and-forget.
pub trait VideoSink: Send + Sync {
    fn send_video(&self, data: &[u8], pts_ns: u64);
}

/// Network statistics and timing collector.
///
/// Called from the encoder thread; the bitrate side is typically updated by
/// the network thread, so implementations must be thread safe.
pub trait Statistics: Send + Sync {
    /// The frame targeting `target_timestamp_ns` reached the encoder thread.
    fn report_present(&self, target_timestamp_ns: u64, at: Instant);

    /// The frame targeting `target_timestamp_ns` finished rendering.
    fn report_composed(&self, target_timestamp_ns: u64, at: Instant);

    /// A bitstream unit was handed to the sink, `latency` after encode start.
    fn encode_output(&self, latency: Duration);

    /// True once after each change of the target bitrate.
    fn current_bitrate_changed(&self) -> bool;

    fn current_bitrate_bps(&self) -> u64;
}

/// Long-lived collaborators shared by every session.
#[derive(Clone)]
pub struct Collaborators {
    pub poses: Arc<dyn PoseHistory>,
    pub stats: Arc<dyn Statistics>,
    pub sink: Arc<dyn VideoSink>,
}
