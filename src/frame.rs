//! Wire frame layout and the fixed-size buffer exchanged between stages.
//!
//! ```text
//! offset  size  field
//! 0       4     magic_word     (0xF113)
//! 4       2     frame_counter  (cyclic u16)
//! 6       1     source_id
//! 7       1     payload_type   (0=U8, 1=I16, 2=I32, 3=F32, 127=unsupported)
//! 8       4     payload_size   (bytes)
//! 12      N     payload
//! ```
//!
//! All fields are little-endian and unpadded. Headers are encoded and decoded
//! field by field, never by reinterpreting memory as a struct.

use crate::error::FrameError;
use bytemuck::Pod;
use serde::{Deserialize, Serialize};

/// Stream-start sentinel carried by every valid frame.
pub const MAGIC_WORD: u32 = 0xF113;

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 12;

const MAGIC_OFFSET: usize = 0;
const COUNTER_OFFSET: usize = 4;
const SOURCE_OFFSET: usize = 6;
const TYPE_OFFSET: usize = 7;
const SIZE_OFFSET: usize = 8;

/// Sample encoding of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PayloadType {
    U8 = 0,
    I16 = 1,
    I32 = 2,
    F32 = 3,
    Unsupported = 127,
}

impl PayloadType {
    /// Decode a wire byte. Unknown values map to `Unsupported`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::U8,
            1 => Self::I16,
            2 => Self::I32,
            3 => Self::F32,
            _ => Self::Unsupported,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Bytes per element, or `None` for `Unsupported`.
    pub fn element_width(self) -> Option<usize> {
        match self {
            Self::U8 => Some(1),
            Self::I16 => Some(2),
            Self::I32 | Self::F32 => Some(4),
            Self::Unsupported => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic_word: u32,
    pub frame_counter: u16,
    pub source_id: u8,
    pub payload_type: PayloadType,
    pub payload_size: u32,
}

impl FrameHeader {
    /// Header with the standard magic word.
    pub fn new(frame_counter: u16, source_id: u8, payload_type: PayloadType, payload_size: u32) -> Self {
        Self {
            magic_word: MAGIC_WORD,
            frame_counter,
            source_id,
            payload_type,
            payload_size,
        }
    }

    pub fn decode(src: &[u8]) -> Result<Self, FrameError> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                len: src.len(),
                needed: HEADER_SIZE,
            });
        }

        Ok(Self {
            magic_word: read_u32(src, MAGIC_OFFSET),
            frame_counter: read_u16(src, COUNTER_OFFSET),
            source_id: src[SOURCE_OFFSET],
            payload_type: PayloadType::from_u8(src[TYPE_OFFSET]),
            payload_size: read_u32(src, SIZE_OFFSET),
        })
    }

    pub fn encode_into(&self, dst: &mut [u8]) -> Result<(), FrameError> {
        if dst.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                len: dst.len(),
                needed: HEADER_SIZE,
            });
        }

        dst[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&self.magic_word.to_le_bytes());
        dst[COUNTER_OFFSET..COUNTER_OFFSET + 2].copy_from_slice(&self.frame_counter.to_le_bytes());
        dst[SOURCE_OFFSET] = self.source_id;
        dst[TYPE_OFFSET] = self.payload_type.as_u8();
        dst[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&self.payload_size.to_le_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        // A fixed-size array always fits the header.
        let _ = self.encode_into(&mut bytes);
        bytes
    }
}

fn read_u32(src: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([src[offset], src[offset + 1], src[offset + 2], src[offset + 3]])
}

fn read_u16(src: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([src[offset], src[offset + 1]])
}

/// One frame: header followed by a payload region, allocated once.
///
/// Backing storage is word-aligned so the payload (which starts at byte 12)
/// can be viewed in place as `u8`, `i16`, `i32` or `f32`. The size never
/// changes after construction; the pipeline moves whole buffers between
/// stages with [`std::mem::swap`] instead of copying their contents.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    words: Vec<u32>,
    len: usize,
    element_width: usize,
}

impl FrameBuffer {
    /// Allocate a buffer for `element_count` elements of `element_width` bytes.
    /// The header's `payload_size` is set to the allocated payload size, which
    /// must fit in `u32` (`PipelineConfig::validate` enforces this).
    pub fn new(element_count: usize, element_width: usize) -> Self {
        let element_width = element_width.max(1);
        let payload = element_count * element_width;
        let len = HEADER_SIZE + payload;
        let mut buffer = Self {
            words: vec![0; len.div_ceil(4)],
            len,
            element_width,
        };
        buffer.set_payload_size(payload as u32);
        buffer
    }

    /// Allocate a buffer shaped for `payload_type` and tag its header with it.
    pub fn with_type(payload_type: PayloadType, element_count: usize) -> Self {
        let width = payload_type.element_width().unwrap_or(1);
        let mut buffer = Self::new(element_count, width);
        buffer.set_payload_type(payload_type);
        buffer
    }

    /// Allocate a canonical `f32` buffer.
    pub fn canonical(element_count: usize) -> Self {
        Self::with_type(PayloadType::F32, element_count)
    }

    /// Header plus payload, in bytes.
    pub fn total_size(&self) -> usize {
        self.len
    }

    /// Bytes allocated for the payload.
    pub fn payload_capacity(&self) -> usize {
        self.len - HEADER_SIZE
    }

    pub fn element_width(&self) -> usize {
        self.element_width
    }

    /// Elements that fit in the allocated payload.
    pub fn element_count(&self) -> usize {
        self.payload_capacity() / self.element_width
    }

    /// Whether this is a canonical float buffer whose header matches its allocation.
    pub fn is_canonical(&self) -> bool {
        self.payload_type() == PayloadType::F32
            && self.payload_size() as usize == self.payload_capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.as_bytes()[HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.as_bytes_mut()[HEADER_SIZE..]
    }

    /// Clear the payload, leaving the header untouched.
    pub fn zero_payload(&mut self) {
        self.payload_mut().fill(0);
    }

    /// View the payload as `T`, truncated to whole elements.
    ///
    /// `T` must not need more than 4-byte alignment.
    pub fn payload_as<T: Pod>(&self) -> &[T] {
        let payload = self.payload();
        let usable = payload.len() - payload.len() % std::mem::size_of::<T>();
        bytemuck::cast_slice(&payload[..usable])
    }

    /// Mutable counterpart of [`payload_as`](Self::payload_as).
    pub fn payload_as_mut<T: Pod>(&mut self) -> &mut [T] {
        let payload = self.payload_mut();
        let usable = payload.len() - payload.len() % std::mem::size_of::<T>();
        bytemuck::cast_slice_mut(&mut payload[..usable])
    }

    /// Payload viewed as `f32` samples.
    pub fn samples(&self) -> &[f32] {
        self.payload_as::<f32>()
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        self.payload_as_mut::<f32>()
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            magic_word: self.magic_word(),
            frame_counter: self.frame_counter(),
            source_id: self.source_id(),
            payload_type: self.payload_type(),
            payload_size: self.payload_size(),
        }
    }

    pub fn set_header(&mut self, header: &FrameHeader) {
        self.set_magic_word(header.magic_word);
        self.set_frame_counter(header.frame_counter);
        self.set_source_id(header.source_id);
        self.set_payload_type(header.payload_type);
        self.set_payload_size(header.payload_size);
    }

    pub fn magic_word(&self) -> u32 {
        read_u32(self.as_bytes(), MAGIC_OFFSET)
    }

    pub fn set_magic_word(&mut self, magic_word: u32) {
        self.as_bytes_mut()[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&magic_word.to_le_bytes());
    }

    pub fn frame_counter(&self) -> u16 {
        read_u16(self.as_bytes(), COUNTER_OFFSET)
    }

    pub fn set_frame_counter(&mut self, frame_counter: u16) {
        self.as_bytes_mut()[COUNTER_OFFSET..COUNTER_OFFSET + 2].copy_from_slice(&frame_counter.to_le_bytes());
    }

    pub fn source_id(&self) -> u8 {
        self.as_bytes()[SOURCE_OFFSET]
    }

    pub fn set_source_id(&mut self, source_id: u8) {
        self.as_bytes_mut()[SOURCE_OFFSET] = source_id;
    }

    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from_u8(self.as_bytes()[TYPE_OFFSET])
    }

    pub fn set_payload_type(&mut self, payload_type: PayloadType) {
        self.as_bytes_mut()[TYPE_OFFSET] = payload_type.as_u8();
    }

    pub fn payload_size(&self) -> u32 {
        read_u32(self.as_bytes(), SIZE_OFFSET)
    }

    pub fn set_payload_size(&mut self, payload_size: u32) {
        self.as_bytes_mut()[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&payload_size.to_le_bytes());
    }
}
