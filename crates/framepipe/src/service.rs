//! Encoder thread lifecycle
//!
//! `EncoderService::start` binds the rendezvous socket and spawns the
//! `encoder` thread, which serves one producer session at a time:
//!
//! 1. accept (cancellable), then close the listener so nobody else queues up
//! 2. handshake and shared resources
//! 3. open render/encode stages, run the frame loop
//! 4. teardown: connection closed, socket path already unlinked
//!
//! Failures inside a session end that session only. With `restart_sessions`
//! the thread binds again and waits for the next producer; listener failures
//! end the thread and come back from `join`.
//!
//! `EncoderHandle` is the administrative surface. It only touches atomics and
//! the listening socket, so any thread may call it at any time.

use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use frameconf::FrameConfig;
use nix::sys::socket::{shutdown, Shutdown};
use tracing::{debug, error, info};

use crate::backend::{Collaborators, RenderBackend};
use crate::channel::{ChannelError, PollTimings};
use crate::listener::{self, ListenerError, SessionListener};
use crate::pipeline::FramePipeline;
use crate::scheduler::EncodeScheduler;
use crate::wire::ProtocolViolation;

/// Anything that ends a connected session early
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("render backend setup failed: {0:#}")]
    Backend(anyhow::Error),

    #[error("render failed: {0:#}")]
    Render(anyhow::Error),

    #[error("encode failed: {0:#}")]
    Encode(anyhow::Error),
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// `stop()` was called.
    Cancelled,
    /// The producer hung up.
    Disconnected,
    Failed(SessionError),
}

impl From<Result<(), SessionError>> for SessionEnd {
    fn from(result: Result<(), SessionError>) -> Self {
        match result {
            Ok(()) => SessionEnd::Cancelled,
            Err(SessionError::Channel(ChannelError::Disconnected)) => SessionEnd::Disconnected,
            Err(err) => SessionEnd::Failed(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub socket_path: PathBuf,
    pub timings: PollTimings,
    pub keyframe_interval: Option<Duration>,
    /// Listen again after a session ends on its own.
    pub restart_sessions: bool,
}

impl EncoderConfig {
    /// Defaults for everything but the socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timings: PollTimings::default(),
            keyframe_interval: Some(Duration::from_secs(2)),
            restart_sessions: true,
        }
    }

    pub fn from_config(config: &FrameConfig) -> Self {
        Self {
            socket_path: config.paths.socket_path(),
            timings: PollTimings::from_config(&config.pipeline),
            keyframe_interval: config.pipeline.keyframe_interval(),
            restart_sessions: config.pipeline.restart_sessions,
        }
    }
}

struct SessionState {
    connected: AtomicBool,
    exiting: AtomicBool,
    listener: Mutex<Option<Arc<UnixListener>>>,
    socket_path: PathBuf,
}

impl SessionState {
    fn publish_listener(&self, listener: &SessionListener) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(listener.shutdown_handle());
    }

    fn clear_listener(&self) {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Cloneable control surface for a running encoder.
#[derive(Clone)]
pub struct EncoderHandle {
    state: Arc<SessionState>,
    scheduler: Arc<EncodeScheduler>,
}

impl EncoderHandle {
    /// Ask the encoder thread to exit. Idempotent.
    ///
    /// Shuts the listening socket down and unlinks its path right away; the
    /// thread notices within one poll interval.
    pub fn stop(&self) {
        if !self.state.exiting.swap(true, Ordering::AcqRel) {
            info!("stopping encoder");
        }

        let listener = self
            .state
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            if let Err(e) = shutdown(listener.as_raw_fd(), Shutdown::Both) {
                debug!("listener shutdown: {}", e);
            }
        }
        let _ = std::fs::remove_file(&self.state.socket_path);
    }

    pub fn on_packet_loss(&self) {
        self.scheduler.on_packet_loss();
    }

    pub fn force_keyframe(&self) {
        self.scheduler.insert_idr();
    }

    /// A producer finished the handshake and handed over its resources.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn is_exiting(&self) -> bool {
        self.state.exiting.load(Ordering::Acquire)
    }

    pub fn socket_path(&self) -> &Path {
        &self.state.socket_path
    }
}

/// Owner of the encoder thread. Dropping it stops and joins the thread.
pub struct EncoderService {
    handle: EncoderHandle,
    thread: Option<JoinHandle<Result<(), ListenerError>>>,
}

impl EncoderService {
    /// Bind the socket and start serving producers.
    ///
    /// Bind failures are returned here rather than from the thread.
    pub fn start(
        config: EncoderConfig,
        backend: Box<dyn RenderBackend>,
        collaborators: Collaborators,
    ) -> Result<Self, ListenerError> {
        let first = SessionListener::bind(&config.socket_path)?;

        let state = Arc::new(SessionState {
            connected: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            listener: Mutex::new(None),
            socket_path: config.socket_path.clone(),
        });
        state.publish_listener(&first);

        let scheduler = Arc::new(EncodeScheduler::new(config.keyframe_interval));
        let handle = EncoderHandle {
            state: Arc::clone(&state),
            scheduler: Arc::clone(&scheduler),
        };

        let worker = EncoderWorker {
            config,
            backend,
            collaborators,
            state,
            scheduler,
        };

        let thread = thread::Builder::new()
            .name("encoder".to_string())
            .spawn(move || worker.run(first))
            .map_err(|e| ListenerError::ThreadSpawn(e.to_string()))?;

        info!("encoder listening on {}", handle.socket_path().display());

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EncoderHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Wait for the encoder thread to finish.
    ///
    /// Does not stop it; call `stop` first (possibly from another thread).
    pub fn join(mut self) -> Result<(), ListenerError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ListenerError::ThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for EncoderService {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.stop();
            let _ = thread.join();
        }
    }
}

struct EncoderWorker {
    config: EncoderConfig,
    backend: Box<dyn RenderBackend>,
    collaborators: Collaborators,
    state: Arc<SessionState>,
    scheduler: Arc<EncodeScheduler>,
}

impl EncoderWorker {
    fn run(mut self, first: SessionListener) -> Result<(), ListenerError> {
        let mut next = Some(first);

        loop {
            let listener = match next.take() {
                Some(listener) => listener,
                None => {
                    let listener = SessionListener::bind(&self.config.socket_path)?;
                    self.state.publish_listener(&listener);
                    listener
                }
            };

            let end = self.serve_one(listener);
            self.state.connected.store(false, Ordering::Release);

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Disconnected => info!("producer disconnected"),
                SessionEnd::Failed(err) => error!("error in encoder thread: {}", err),
            }

            if self.state.exiting.load(Ordering::Acquire) || !self.config.restart_sessions {
                break;
            }
            info!("waiting for the next producer");
        }

        info!("encoder thread exiting");
        Ok(())
    }

    /// Accept one producer and serve it. The listener is closed and its path
    /// unlinked as soon as the producer is accepted.
    fn serve_one(&mut self, listener: SessionListener) -> SessionEnd {
        let accepted = listener.accept(&self.config.timings, &self.state.exiting);
        self.state.clear_listener();
        drop(listener);

        let stream = match accepted {
            Ok(Some(stream)) => stream,
            Ok(None) => return SessionEnd::Cancelled,
            Err(err) => return SessionEnd::Failed(err.into()),
        };
        debug!("producer connected, waiting for handshake");

        self.run_session(&stream).into()
    }

    fn run_session(&mut self, stream: &UnixStream) -> Result<(), SessionError> {
        let cancel = &self.state.exiting;
        let timings = &self.config.timings;

        let Some((packet, resources)) = listener::handshake(stream, timings, cancel)? else {
            return Ok(());
        };

        info!(
            "producer pid {} ({}) on {}: {}x{} format {}, {} images",
            packet.source_pid,
            listener::producer_cmdline(packet.source_pid).as_deref().unwrap_or("unknown"),
            packet.device_name,
            packet.image.width,
            packet.image.height,
            packet.image.format,
            packet.num_images
        );
        self.state.connected.store(true, Ordering::Release);

        let stages = self
            .backend
            .open(&packet, resources)
            .map_err(SessionError::Backend)?;
        self.scheduler.reset(Instant::now());

        let mut pipeline =
            FramePipeline::new(stages, &self.collaborators, Arc::clone(&self.scheduler));
        let result = pipeline.run(stream, timings, cancel);

        info!("session ended: {}", pipeline.stats());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_config_from_defaults() {
        let mut config = FrameConfig::default();
        config.paths.socket_path = Some(PathBuf::from("/tmp/test-alvr-ipc"));
        config.pipeline.keyframe_interval_ms = 0;

        let encoder = EncoderConfig::from_config(&config);
        assert_eq!(encoder.socket_path, PathBuf::from("/tmp/test-alvr-ipc"));
        assert_eq!(encoder.keyframe_interval, None);
        assert_eq!(encoder.timings, PollTimings::default());
        assert!(encoder.restart_sessions);
    }

    #[test]
    fn test_session_end_classification() {
        assert!(matches!(SessionEnd::from(Ok(())), SessionEnd::Cancelled));
        assert!(matches!(
            SessionEnd::from(Err(ChannelError::Disconnected.into())),
            SessionEnd::Disconnected
        ));
        assert!(matches!(
            SessionEnd::from(Err(ProtocolViolation::MissingResources.into())),
            SessionEnd::Failed(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_session_error_display_keeps_context() {
        let err = SessionError::Render(
            anyhow::anyhow!("device lost").context("waiting on semaphore"),
        );
        assert_eq!(
            err.to_string(),
            "render failed: waiting on semaphore: device lost"
        );
    }
}
