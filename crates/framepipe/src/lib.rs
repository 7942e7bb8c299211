//! Framepipe: capture-and-encode loop for a remote-rendering video server
//!
//! A local producer (the compositor) renders into shared images and tells us
//! when a frame is ready. Framepipe matches each frame to the device pose it
//! was rendered for, drives a hardware encoder and forwards the bitstream to
//! the network sender.
//!
//! ```text
//!  producer ──unix socket──▶ listener ──handshake + SCM_RIGHTS──▶ RenderBackend
//!                               │
//!                               ▼
//!                        FramePipeline (encoder thread)
//!     read_latest ▶ PoseHistory ▶ FrameRenderer ▶ VideoEncoder ▶ VideoSink
//!                                                     ▲
//!                              EncodeScheduler ───────┘ (bitrate, keyframes)
//! ```
//!
//! The GPU, encoder, network and pose predictor live behind the traits in
//! [`backend`] and [`pose`]; [`loopback`] has stand-ins for bring-up.

pub mod backend;
pub mod channel;
pub mod listener;
pub mod loopback;
pub mod pipeline;
pub mod pose;
pub mod scheduler;
pub mod service;
pub mod wire;

pub use backend::{
    BackendStages, Collaborators, FrameRenderer, RenderBackend, Statistics, VideoEncoder,
    VideoSink,
};
pub use channel::{ChannelError, PollTimings, ReadStatus};
pub use listener::{ListenerError, SessionListener, SharedResourceSet};
pub use pipeline::{EncodedUnit, FrameOutcome, FramePipeline, FrameTimings, SessionStats};
pub use pose::{PoseCorrelator, PoseHistory, PoseLog, PoseRecord};
pub use scheduler::EncodeScheduler;
pub use service::{EncoderConfig, EncoderHandle, EncoderService, SessionEnd, SessionError};
pub use wire::{
    HandshakePacket, ImageCreateInfo, PoseMatrix, PresentNotification, ProtocolViolation,
};
