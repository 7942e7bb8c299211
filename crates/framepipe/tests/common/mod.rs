//! Shared helpers for the session integration tests
//!
//! A scripted producer on a real Unix socket, plus collaborators that record
//! every call so tests can assert on order and arguments.

#![allow(dead_code)]

use std::fs::File;
use std::io::{IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framepipe::{
    BackendStages, Collaborators, EncodedUnit, FrameRenderer, HandshakePacket, ImageCreateInfo,
    PoseHistory, PoseMatrix, PoseRecord, PresentNotification, RenderBackend, SharedResourceSet,
    Statistics, VideoEncoder, VideoSink,
};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `TIMEOUT` passes.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn handshake_packet(device: &str, width: u32, height: u32) -> HandshakePacket {
    HandshakePacket {
        num_images: 3,
        device_name: device.to_string(),
        image: ImageCreateInfo::image_2d(44, width, height, 0x17),
        memory_index: 1,
        source_pid: std::process::id() as i32,
    }
}

/// Pose whose x translation encodes the target timestamp for `XAsTimestamp`.
pub fn pose_for(target_ts: u64) -> PoseMatrix {
    let mut pose = PoseMatrix::IDENTITY;
    pose.0[0][3] = target_ts as f32;
    pose
}

pub fn notification(frame: u32, target_ts: u64) -> PresentNotification {
    PresentNotification {
        image: frame % 3,
        frame,
        semaphore_value: frame as u64,
        pose: pose_for(target_ts),
    }
}

/// Scripted producer end of the rendezvous socket.
pub struct Producer {
    pub stream: UnixStream,
}

impl Producer {
    /// Connect, retrying while the service is (re)binding.
    pub fn connect(path: &Path) -> Producer {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return Producer { stream },
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("could not connect to {}: {}", path.display(), e),
            }
        }
    }

    pub fn send_handshake(&mut self, packet: &HandshakePacket, resources: usize) {
        self.stream.write_all(&packet.encode()).unwrap();
        let files: Vec<File> = (0..resources).map(|_| tempfile::tempfile().unwrap()).collect();
        send_resources(&self.stream, &files);
    }

    pub fn send(&mut self, notification: &PresentNotification) {
        self.stream.write_all(&notification.encode()).unwrap();
    }

    /// True once the service has closed its end.
    pub fn wait_closed(&mut self) -> bool {
        self.stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => true,
            Err(e) => e.kind() == std::io::ErrorKind::ConnectionReset,
            Ok(_) => false,
        }
    }
}

pub fn send_resources(stream: &UnixStream, files: &[File]) {
    let fds: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
    let payload = [0u8; 1];
    let iov = [IoSlice::new(&payload)];
    let rights = [ControlMessage::ScmRights(&fds)];
    let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
    sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None).unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open {
        device: String,
        width: u32,
        height: u32,
        resources: usize,
    },
    Bitrate(u64),
    Render(u32, u64),
    Push(u64, bool),
}

/// Shared call log for the recording collaborators.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    pub fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Open { .. }))
            .count()
    }

    pub fn renders(&self) -> Vec<(u32, u64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Render(image, value) => Some((image, value)),
                _ => None,
            })
            .collect()
    }

    pub fn pushes(&self) -> Vec<(u64, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Push(ts, force) => Some((ts, force)),
                _ => None,
            })
            .collect()
    }
}

pub struct RecordingBackend(pub Arc<Recorder>);

impl RenderBackend for RecordingBackend {
    fn open(
        &mut self,
        handshake: &HandshakePacket,
        resources: SharedResourceSet,
    ) -> anyhow::Result<BackendStages> {
        self.0.record(Call::Open {
            device: handshake.device_name.clone(),
            width: handshake.image.width,
            height: handshake.image.height,
            resources: resources.len(),
        });
        Ok(BackendStages {
            renderer: Box::new(RecordingRenderer(self.0.clone())),
            encoder: Box::new(RecordingEncoder {
                recorder: self.0.clone(),
                queued: None,
            }),
        })
    }
}

struct RecordingRenderer(Arc<Recorder>);

impl FrameRenderer for RecordingRenderer {
    fn render(&mut self, image: u32, semaphore_value: u64) -> anyhow::Result<()> {
        self.0.record(Call::Render(image, semaphore_value));
        Ok(())
    }
}

/// Yields one unit per pushed frame, tagged with the pushed timestamp.
struct RecordingEncoder {
    recorder: Arc<Recorder>,
    queued: Option<u64>,
}

impl VideoEncoder for RecordingEncoder {
    fn set_bitrate(&mut self, bits_per_second: u64) {
        self.recorder.record(Call::Bitrate(bits_per_second));
    }

    fn push_frame(&mut self, pts_ns: u64, force_keyframe: bool) -> anyhow::Result<()> {
        self.recorder.record(Call::Push(pts_ns, force_keyframe));
        self.queued = Some(pts_ns);
        Ok(())
    }

    fn pull_encoded(&mut self, unit: &mut EncodedUnit) -> anyhow::Result<bool> {
        match self.queued.take() {
            Some(pts) => {
                unit.append(&[0, 0, 0, 1, 0x41]);
                unit.set_pts(pts);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Pose x translation is the target timestamp; negative x has no match.
pub struct XAsTimestamp;

impl PoseHistory for XAsTimestamp {
    fn best_match(&self, pose: &PoseMatrix) -> Option<PoseRecord> {
        let x = pose.position()[0];
        (x >= 0.0).then(|| PoseRecord {
            target_timestamp_ns: x as u64,
            pose: *pose,
        })
    }
}

#[derive(Default)]
pub struct RecordingStats {
    pub marks: Mutex<Vec<(&'static str, u64, Instant)>>,
    pub outputs: Mutex<Vec<Duration>>,
}

impl Statistics for RecordingStats {
    fn report_present(&self, ts: u64, at: Instant) {
        self.marks.lock().unwrap().push(("present", ts, at));
    }

    fn report_composed(&self, ts: u64, at: Instant) {
        self.marks.lock().unwrap().push(("composed", ts, at));
    }

    fn encode_output(&self, latency: Duration) {
        self.outputs.lock().unwrap().push(latency);
    }

    fn current_bitrate_changed(&self) -> bool {
        false
    }

    fn current_bitrate_bps(&self) -> u64 {
        0
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(Vec<u8>, u64)>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn pts(&self) -> Vec<u64> {
        self.sent.lock().unwrap().iter().map(|(_, pts)| *pts).collect()
    }
}

impl VideoSink for RecordingSink {
    fn send_video(&self, data: &[u8], pts_ns: u64) {
        self.sent.lock().unwrap().push((data.to_vec(), pts_ns));
    }
}

/// Recording collaborators wired together.
pub struct Rig {
    pub recorder: Arc<Recorder>,
    pub stats: Arc<RecordingStats>,
    pub sink: Arc<RecordingSink>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            stats: Arc::new(RecordingStats::default()),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    pub fn backend(&self) -> Box<dyn RenderBackend> {
        Box::new(RecordingBackend(self.recorder.clone()))
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with(Arc::new(XAsTimestamp))
    }

    pub fn collaborators_with(&self, poses: Arc<dyn PoseHistory>) -> Collaborators {
        Collaborators {
            poses,
            stats: self.stats.clone(),
            sink: self.sink.clone(),
        }
    }
}
