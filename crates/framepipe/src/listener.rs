//! Rendezvous socket and session handshake
//!
//! The producer connects to a well-known Unix stream socket, writes one
//! `HandshakePacket`, then sends a single byte carrying its shared resource
//! descriptors as SCM_RIGHTS ancillary data. Only one producer is served at a
//! time; the listener lives for one session and is rebound for the next.

use std::fs::{self, File};
use std::io::{IoSliceMut, Read};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::socket::{
    bind, listen, recvmsg, socket, AddressFamily, Backlog, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use tracing::{debug, warn};

use crate::channel::{self, ChannelError, PollTimings, ReadStatus};
use crate::service::SessionError;
use crate::wire::{HandshakePacket, ProtocolViolation, HANDSHAKE_SIZE, MAX_SHARED_RESOURCES};

const LISTEN_BACKLOG: i32 = 1024;

/// Errors that keep the encoder from listening at all
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] Errno),

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to listen on {path}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to configure listener: {0}")]
    Configure(#[source] std::io::Error),

    #[error("failed to spawn encoder thread: {0}")]
    ThreadSpawn(String),

    #[error("encoder thread panicked")]
    ThreadPanicked,
}

/// Descriptors the producer shares with the encoder for one session.
///
/// Closed exactly once, when the set (or whatever took ownership of the
/// descriptors) is dropped.
#[derive(Debug)]
pub struct SharedResourceSet {
    descriptors: Vec<OwnedFd>,
}

impl SharedResourceSet {
    /// Wrap received descriptors. A handshake must share at least one and at
    /// most `MAX_SHARED_RESOURCES`.
    pub fn from_descriptors(descriptors: Vec<OwnedFd>) -> Result<Self, ProtocolViolation> {
        if descriptors.is_empty() {
            return Err(ProtocolViolation::MissingResources);
        }
        if descriptors.len() > MAX_SHARED_RESOURCES {
            return Err(ProtocolViolation::TooManyResources(descriptors.len()));
        }
        Ok(Self { descriptors })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnedFd> {
        self.descriptors.iter()
    }

    pub fn into_descriptors(self) -> Vec<OwnedFd> {
        self.descriptors
    }
}

/// Listening endpoint for one session. Dropping it unlinks the socket path.
pub struct SessionListener {
    listener: Arc<UnixListener>,
    path: PathBuf,
}

impl SessionListener {
    /// Bind `path`, replacing whatever stale socket is left there.
    pub fn bind(path: &Path) -> Result<Self, ListenerError> {
        let _ = fs::remove_file(path);

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(ListenerError::Socket)?;

        let addr = UnixAddr::new(path).map_err(|source| ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        bind(fd.as_raw_fd(), &addr).map_err(|source| ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        let listened = Backlog::new(LISTEN_BACKLOG).and_then(|backlog| listen(&fd, backlog));
        if let Err(source) = listened {
            let _ = fs::remove_file(path);
            return Err(ListenerError::Listen {
                path: path.to_path_buf(),
                source,
            });
        }

        let listener = UnixListener::from(fd);
        listener
            .set_nonblocking(true)
            .map_err(ListenerError::Configure)?;

        debug!("listening on {}", path.display());
        Ok(Self {
            listener: Arc::new(listener),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared reference to the listening socket so another thread can shut
    /// it down while the encoder thread polls it.
    pub fn shutdown_handle(&self) -> Arc<UnixListener> {
        Arc::clone(&self.listener)
    }

    pub fn accept(
        &self,
        timings: &PollTimings,
        cancel: &AtomicBool,
    ) -> Result<Option<UnixStream>, ChannelError> {
        channel::accept_with_timeout(&self.listener, timings, cancel)
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Receive the producer's shared resources.
///
/// Reads the single payload byte that carries them; the stream must already
/// be readable.
pub fn receive_resources(stream: &UnixStream) -> Result<SharedResourceSet, SessionError> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut control = nix::cmsg_space!([RawFd; MAX_SHARED_RESOURCES]);

    let msg = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut control),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(ChannelError::Recv)?;

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        warn!(
            "producer sent more than {} descriptors, extras were discarded",
            MAX_SHARED_RESOURCES
        );
    }

    let mut descriptors = Vec::with_capacity(MAX_SHARED_RESOURCES);
    for cmsg in msg.cmsgs().map_err(ChannelError::Recv)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us and
            // nothing else refers to them.
            descriptors.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if descriptors.is_empty() && msg.bytes == 0 {
        return Err(ChannelError::Disconnected.into());
    }

    Ok(SharedResourceSet::from_descriptors(descriptors)?)
}

/// Read and validate the handshake, then collect the shared resources.
///
/// The handshake is rejected before any descriptor is received, so a
/// malformed producer never hands us resources we would have to clean up.
/// Returns `None` when cancelled.
pub fn handshake(
    stream: &UnixStream,
    timings: &PollTimings,
    cancel: &AtomicBool,
) -> Result<Option<(HandshakePacket, SharedResourceSet)>, SessionError> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    if channel::read_exactly(stream, &mut buf, timings, cancel)? == ReadStatus::Cancelled {
        return Ok(None);
    }

    let packet = HandshakePacket::decode(&buf)?;
    packet.validate()?;

    if !channel::wait_readable(stream.as_fd(), timings, cancel)? {
        return Ok(None);
    }
    let resources = receive_resources(stream)?;

    debug!(
        "handshake from pid {}: {} images, {} shared resources",
        packet.source_pid,
        packet.num_images,
        resources.len()
    );
    Ok(Some((packet, resources)))
}

/// Command line of a local process, space separated. Best effort.
pub fn producer_cmdline(pid: i32) -> Option<String> {
    if pid <= 0 {
        return None;
    }

    let mut raw = Vec::new();
    File::open(format!("/proc/{}/cmdline", pid))
        .and_then(|mut f| f.read_to_end(&mut raw))
        .ok()?;

    let args: Vec<_> = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect();

    if args.is_empty() {
        None
    } else {
        Some(args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ImageCreateInfo;
    use nix::sys::socket::{sendmsg, ControlMessage};
    use std::io::{IoSlice, Write};
    use std::time::Duration;

    fn timings() -> PollTimings {
        PollTimings {
            read_interval: Duration::from_micros(100),
            accept_interval: Duration::from_millis(5),
            stall_warning: None,
        }
    }

    fn packet() -> HandshakePacket {
        HandshakePacket {
            num_images: 3,
            device_name: "gpu0".to_string(),
            image: ImageCreateInfo::image_2d(44, 1920, 1080, 0x17),
            memory_index: 1,
            source_pid: std::process::id() as i32,
        }
    }

    fn send_resources(stream: &UnixStream, files: &[File]) {
        let fds: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
        let payload = [0u8; 1];
        let iov = [IoSlice::new(&payload)];
        let rights = [ControlMessage::ScmRights(&fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
        sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None).unwrap();
    }

    fn temp_files(n: usize) -> Vec<File> {
        (0..n).map(|_| tempfile::tempfile().unwrap()).collect()
    }

    #[test]
    fn test_bind_replaces_stale_socket_and_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alvr-ipc");
        fs::write(&path, b"stale").unwrap();

        let listener = SessionListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path);
        UnixStream::connect(&path).unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("alvr-ipc");
        let err = SessionListener::bind(&path).err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[test]
    fn test_handshake_collects_resources() {
        let (mut producer, consumer) = UnixStream::pair().unwrap();
        producer.write_all(&packet().encode()).unwrap();
        send_resources(&producer, &temp_files(3));

        let cancel = AtomicBool::new(false);
        let (received, resources) = handshake(&consumer, &timings(), &cancel)
            .unwrap()
            .expect("handshake should complete");

        assert_eq!(received, packet());
        assert_eq!(resources.len(), 3);
    }

    #[test]
    fn test_reserved_field_rejected_before_descriptors_are_read() {
        let (mut producer, consumer) = UnixStream::pair().unwrap();
        let mut bad = packet();
        bad.image.next = 0x1000;
        producer.write_all(&bad.encode()).unwrap();
        send_resources(&producer, &temp_files(2));

        let cancel = AtomicBool::new(false);
        let err = handshake(&consumer, &timings(), &cancel).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolViolation::ReservedField {
                field: "image.next",
                ..
            })
        ));

        // descriptors are still queued on the socket
        let resources = receive_resources(&consumer).unwrap();
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn test_handshake_without_descriptors_is_violation() {
        let (mut producer, consumer) = UnixStream::pair().unwrap();
        producer.write_all(&packet().encode()).unwrap();
        send_resources(&producer, &[]);

        let cancel = AtomicBool::new(false);
        let err = handshake(&consumer, &timings(), &cancel).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolViolation::MissingResources)
        ));
    }

    #[test]
    fn test_handshake_hangup_after_packet() {
        let (mut producer, consumer) = UnixStream::pair().unwrap();
        producer.write_all(&packet().encode()).unwrap();
        drop(producer);

        let cancel = AtomicBool::new(false);
        let err = handshake(&consumer, &timings(), &cancel).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Channel(ChannelError::Disconnected)
        ));
    }

    #[test]
    fn test_handshake_cancelled() {
        let (_producer, consumer) = UnixStream::pair().unwrap();
        let cancel = AtomicBool::new(true);
        assert!(handshake(&consumer, &timings(), &cancel).unwrap().is_none());
    }

    #[test]
    fn test_resource_set_bounds() {
        assert!(matches!(
            SharedResourceSet::from_descriptors(Vec::new()),
            Err(ProtocolViolation::MissingResources)
        ));

        let seven: Vec<OwnedFd> = temp_files(7).into_iter().map(OwnedFd::from).collect();
        assert!(matches!(
            SharedResourceSet::from_descriptors(seven),
            Err(ProtocolViolation::TooManyResources(7))
        ));
    }

    #[test]
    fn test_own_cmdline_is_readable() {
        let cmdline = producer_cmdline(std::process::id() as i32).unwrap();
        assert!(!cmdline.is_empty());
        assert!(producer_cmdline(0).is_none());
    }
}
