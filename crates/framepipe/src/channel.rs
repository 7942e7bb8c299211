//! Polling reads over the producer socket
//!
//! The encoder thread never blocks on a descriptor without a timeout: every
//! wait is a `ppoll` with a short, fixed timespec so the cancellation flag is
//! looked at again within one poll interval.
//!
//! - `read_exactly` fills a buffer completely or returns `Cancelled`.
//! - `read_latest` fills the buffer, then keeps overwriting it while more
//!   records are already queued. Stale frames are discarded, never served.
//! - `accept_with_timeout` waits for a producer on the listening socket using
//!   the longer accept interval.

use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use tracing::warn;

/// Poll granularity for the encoder thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimings {
    /// Wait per poll while reading producer records.
    pub read_interval: Duration,
    /// Wait per poll while no producer is connected.
    pub accept_interval: Duration,
    /// Warn once per read that sees no bytes for this long.
    pub stall_warning: Option<Duration>,
}

impl Default for PollTimings {
    fn default() -> Self {
        Self {
            read_interval: Duration::from_micros(100),
            accept_interval: Duration::from_millis(15),
            stall_warning: Some(Duration::from_secs(2)),
        }
    }
}

impl PollTimings {
    pub fn from_config(config: &frameconf::PipelineConfig) -> Self {
        Self {
            read_interval: config.read_poll_interval(),
            accept_interval: config.accept_poll_interval(),
            stall_warning: config.stall_warning(),
        }
    }
}

/// Error type for socket reads after a session is established
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("poll failed: {0}")]
    Poll(#[source] Errno),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("recvmsg failed: {0}")]
    Recv(#[source] Errno),

    #[error("producer disconnected")]
    Disconnected,
}

/// How a blocking read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer holds a full record; `records` counts how many were consumed
    /// to get there (more than one when a backlog was coalesced).
    Complete { records: usize },
    /// Cancellation was requested; the buffer content is undefined.
    Cancelled,
}

/// Wait until `fd` is readable or `timeout` passes.
///
/// A hung-up peer counts as readable so the following read can observe EOF.
fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, ChannelError> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match ppoll(&mut fds, Some(TimeSpec::from_duration(timeout)), None) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(ChannelError::Poll(errno)),
    }
}

/// Wait until `fd` is readable. Returns `false` if cancelled first.
pub(crate) fn wait_readable(
    fd: BorrowedFd<'_>,
    timings: &PollTimings,
    cancel: &AtomicBool,
) -> Result<bool, ChannelError> {
    while !cancel.load(Ordering::Acquire) {
        if poll_readable(fd, timings.read_interval)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fill `buf` completely, polling with `timings.read_interval`.
///
/// Partial reads accumulate; a zero-byte read means the producer hung up.
pub fn read_exactly<C>(
    channel: &C,
    buf: &mut [u8],
    timings: &PollTimings,
    cancel: &AtomicBool,
) -> Result<ReadStatus, ChannelError>
where
    C: AsFd,
    for<'c> &'c C: Read,
{
    let mut filled = 0;
    let started = Instant::now();
    let mut stall_reported = false;

    while filled < buf.len() {
        if cancel.load(Ordering::Acquire) {
            return Ok(ReadStatus::Cancelled);
        }

        if !poll_readable(channel.as_fd(), timings.read_interval)? {
            if let Some(limit) = timings.stall_warning {
                if filled == 0 && !stall_reported && started.elapsed() >= limit {
                    warn!(
                        "no producer data for {:?}, still waiting",
                        started.elapsed()
                    );
                    stall_reported = true;
                }
            }
            continue;
        }

        let mut reader = channel;
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ChannelError::Disconnected),
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                return Err(ChannelError::Disconnected)
            }
            Err(e) => return Err(ChannelError::Read(e)),
        }
    }

    Ok(ReadStatus::Complete { records: 1 })
}

/// Read one record, then keep replacing it while more are already queued.
///
/// On return `buf` holds the newest complete record the producer has sent.
pub fn read_latest<C>(
    channel: &C,
    buf: &mut [u8],
    timings: &PollTimings,
    cancel: &AtomicBool,
) -> Result<ReadStatus, ChannelError>
where
    C: AsFd,
    for<'c> &'c C: Read,
{
    if read_exactly(channel, buf, timings, cancel)? == ReadStatus::Cancelled {
        return Ok(ReadStatus::Cancelled);
    }

    let mut records = 1;
    while !cancel.load(Ordering::Acquire) {
        if !poll_readable(channel.as_fd(), Duration::ZERO)? {
            break;
        }
        match read_exactly(channel, buf, timings, cancel)? {
            ReadStatus::Complete { .. } => records += 1,
            ReadStatus::Cancelled => return Ok(ReadStatus::Cancelled),
        }
    }

    Ok(ReadStatus::Complete { records })
}

/// Wait for a producer connection until one arrives or `cancel` is set.
///
/// The listener must be non-blocking so spurious readiness (or a connection
/// that vanished before accept) just polls again.
pub fn accept_with_timeout(
    listener: &UnixListener,
    timings: &PollTimings,
    cancel: &AtomicBool,
) -> Result<Option<UnixStream>, ChannelError> {
    while !cancel.load(Ordering::Acquire) {
        if !poll_readable(listener.as_fd(), timings.accept_interval)? {
            continue;
        }
        if cancel.load(Ordering::Acquire) {
            break;
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false).map_err(ChannelError::Accept)?;
                return Ok(Some(stream));
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => return Err(ChannelError::Accept(e)),
        }
    }

    Ok(None)
}
