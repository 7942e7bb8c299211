//! Producer wire format
//!
//! Two fixed-size little-endian records cross the rendezvous socket:
//!
//! ```text
//! HandshakePacket (368 bytes, once per session, x86_64 native layout)
//!     0  u32        image count
//!     4  [u8; 256]  device name, NUL padded
//!   260  4 bytes    padding
//!   264  88 bytes   ImageCreateInfo (see below)
//!   352  u64        memory type index
//!   360  i32        producer pid
//!   364  4 bytes    padding
//!
//! ImageCreateInfo (88 bytes, offsets relative to its start)
//!     0  u32  structure type
//!     8  u64  next pointer                 must be 0
//!    16  u32  flags, image type, format, width, height, depth,
//!             mip levels, array layers, samples, tiling, usage, sharing mode
//!    64  u32  queue family index count     must be 0
//!    72  u64  queue family indices pointer must be 0
//!    80  u32  initial layout
//!
//! PresentNotification (64 bytes, once per produced frame)
//!   u32       image slot
//!   u32       producer frame counter
//!   u64       timeline semaphore value
//!   [f32; 12] pose, row-major 3x4
//! ```
//!
//! Only value data crosses the socket. The pointer-shaped fields exist because
//! the producer fills in a graphics API struct; anything non-zero there means
//! the two sides disagree about the layout.

use bytes::{Buf, BufMut, BytesMut};

/// Maximum resource descriptors accompanying a handshake.
pub const MAX_SHARED_RESOURCES: usize = 6;

/// Fixed width of the device name field.
pub const DEVICE_NAME_LEN: usize = 256;

/// Structure type tag of an image create info.
pub const STRUCTURE_TYPE_IMAGE_CREATE_INFO: u32 = 14;

pub const IMAGE_CREATE_INFO_SIZE: usize = 88;
/// Offset of the image create info inside the handshake.
const IMAGE_OFFSET: usize = 264;
pub const HANDSHAKE_SIZE: usize = IMAGE_OFFSET + IMAGE_CREATE_INFO_SIZE + 8 + 8;
pub const PRESENT_NOTIFICATION_SIZE: usize = 4 + 4 + 8 + 12 * 4;

/// Ways a producer can break the session protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("record truncated: expected {expected} bytes, got {actual}")]
    TruncatedRecord { expected: usize, actual: usize },

    #[error("handshake field `{field}` must be zero over a socket, got {value:#x}")]
    ReservedField { field: &'static str, value: u64 },

    #[error("no resource descriptors in handshake control message")]
    MissingResources,

    #[error("too many resource descriptors: {0}")]
    TooManyResources(usize),
}

/// Device pose at render time, row-major 3x4.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseMatrix(pub [[f32; 4]; 3]);

impl PoseMatrix {
    pub const IDENTITY: PoseMatrix = PoseMatrix([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ]);

    pub fn from_flat(values: [f32; 12]) -> Self {
        let mut rows = [[0.0; 4]; 3];
        for (i, value) in values.into_iter().enumerate() {
            rows[i / 4][i % 4] = value;
        }
        Self(rows)
    }

    pub fn to_flat(&self) -> [f32; 12] {
        let mut flat = [0.0; 12];
        for (i, value) in self.0.iter().flatten().enumerate() {
            flat[i] = *value;
        }
        flat
    }

    /// Translation column.
    pub fn position(&self) -> [f32; 3] {
        [self.0[0][3], self.0[1][3], self.0[2][3]]
    }

    /// Largest element-wise difference to `other`.
    ///
    /// Infinite when either matrix has a non-finite element.
    pub fn max_abs_diff(&self, other: &PoseMatrix) -> f32 {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .try_fold(0.0f32, |max, diff| diff.is_finite().then(|| max.max(diff)))
            .unwrap_or(f32::INFINITY)
    }
}

/// Description of the shared image the producer renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageCreateInfo {
    pub s_type: u32,
    pub next: u64,
    pub flags: u32,
    pub image_type: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub tiling: u32,
    pub usage: u32,
    pub sharing_mode: u32,
    pub queue_family_index_count: u32,
    pub queue_family_indices: u64,
    pub initial_layout: u32,
}

impl ImageCreateInfo {
    /// A single-layer 2D image with the given format and size.
    pub fn image_2d(format: u32, width: u32, height: u32, usage: u32) -> Self {
        Self {
            s_type: STRUCTURE_TYPE_IMAGE_CREATE_INFO,
            image_type: 1,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage,
            ..Self::default()
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.s_type);
        buf.put_bytes(0, 4);
        buf.put_u64_le(self.next);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.image_type);
        buf.put_u32_le(self.format);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.depth);
        buf.put_u32_le(self.mip_levels);
        buf.put_u32_le(self.array_layers);
        buf.put_u32_le(self.samples);
        buf.put_u32_le(self.tiling);
        buf.put_u32_le(self.usage);
        buf.put_u32_le(self.sharing_mode);
        buf.put_u32_le(self.queue_family_index_count);
        buf.put_bytes(0, 4);
        buf.put_u64_le(self.queue_family_indices);
        buf.put_u32_le(self.initial_layout);
        buf.put_bytes(0, 4);
    }

    fn get(buf: &mut &[u8]) -> Self {
        let s_type = buf.get_u32_le();
        buf.advance(4);
        let next = buf.get_u64_le();
        let flags = buf.get_u32_le();
        let image_type = buf.get_u32_le();
        let format = buf.get_u32_le();
        let width = buf.get_u32_le();
        let height = buf.get_u32_le();
        let depth = buf.get_u32_le();
        let mip_levels = buf.get_u32_le();
        let array_layers = buf.get_u32_le();
        let samples = buf.get_u32_le();
        let tiling = buf.get_u32_le();
        let usage = buf.get_u32_le();
        let sharing_mode = buf.get_u32_le();
        let queue_family_index_count = buf.get_u32_le();
        buf.advance(4);
        let queue_family_indices = buf.get_u64_le();
        let initial_layout = buf.get_u32_le();
        buf.advance(4);

        Self {
            s_type,
            next,
            flags,
            image_type,
            format,
            width,
            height,
            depth,
            mip_levels,
            array_layers,
            samples,
            tiling,
            usage,
            sharing_mode,
            queue_family_index_count,
            queue_family_indices,
            initial_layout,
        }
    }
}

/// First record of every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub num_images: u32,
    pub device_name: String,
    pub image: ImageCreateInfo,
    pub memory_index: u64,
    pub source_pid: i32,
}

impl HandshakePacket {
    /// Encode to the fixed wire layout. Device names longer than the field
    /// are truncated so the terminating NUL always fits.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE);
        buf.put_u32_le(self.num_images);

        let mut name = [0u8; DEVICE_NAME_LEN];
        let bytes = self.device_name.as_bytes();
        let len = bytes.len().min(DEVICE_NAME_LEN - 1);
        name[..len].copy_from_slice(&bytes[..len]);
        buf.put_slice(&name);
        buf.put_bytes(0, IMAGE_OFFSET - buf.len());

        self.image.put(&mut buf);
        buf.put_u64_le(self.memory_index);
        buf.put_i32_le(self.source_pid);
        buf.put_bytes(0, 4);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolViolation> {
        if data.len() < HANDSHAKE_SIZE {
            return Err(ProtocolViolation::TruncatedRecord {
                expected: HANDSHAKE_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = &data[..HANDSHAKE_SIZE];
        let num_images = buf.get_u32_le();

        let name_field = &buf[..DEVICE_NAME_LEN];
        let name_len = name_field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(DEVICE_NAME_LEN);
        let device_name = String::from_utf8_lossy(&name_field[..name_len]).into_owned();
        buf.advance(IMAGE_OFFSET - 4);

        let image = ImageCreateInfo::get(&mut buf);
        let memory_index = buf.get_u64_le();
        let source_pid = buf.get_i32_le();

        Ok(Self {
            num_images,
            device_name,
            image,
            memory_index,
            source_pid,
        })
    }

    /// Reject handshakes carrying pointer-shaped data.
    pub fn validate(&self) -> Result<(), ProtocolViolation> {
        let reserved = [
            ("image.next", self.image.next),
            (
                "image.queue_family_index_count",
                self.image.queue_family_index_count as u64,
            ),
            ("image.queue_family_indices", self.image.queue_family_indices),
        ];

        for (field, value) in reserved {
            if value != 0 {
                return Err(ProtocolViolation::ReservedField { field, value });
            }
        }
        Ok(())
    }
}

/// "A frame is ready" record, sent at the producer's cadence.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PresentNotification {
    pub image: u32,
    pub frame: u32,
    pub semaphore_value: u64,
    pub pose: PoseMatrix,
}

impl PresentNotification {
    pub fn encode(&self) -> [u8; PRESENT_NOTIFICATION_SIZE] {
        let mut buf = BytesMut::with_capacity(PRESENT_NOTIFICATION_SIZE);
        buf.put_u32_le(self.image);
        buf.put_u32_le(self.frame);
        buf.put_u64_le(self.semaphore_value);
        for value in self.pose.to_flat() {
            buf.put_f32_le(value);
        }

        let mut out = [0u8; PRESENT_NOTIFICATION_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(data: &[u8; PRESENT_NOTIFICATION_SIZE]) -> Self {
        let mut buf = &data[..];
        let image = buf.get_u32_le();
        let frame = buf.get_u32_le();
        let semaphore_value = buf.get_u64_le();

        let mut flat = [0.0f32; 12];
        for value in flat.iter_mut() {
            *value = buf.get_f32_le();
        }

        Self {
            image,
            frame,
            semaphore_value,
            pose: PoseMatrix::from_flat(flat),
        }
    }
}
