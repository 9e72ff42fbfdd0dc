//! Length-prefixed frames exchanged between ranks.
//!
//! `tag u8 | len u64 LE | payload | masked crc32(payload) u32 LE`

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher as Crc32;

use crate::TrainingError;

pub(crate) const TAG_HELLO: u8 = 1;
pub(crate) const TAG_WELCOME: u8 = 2;
pub(crate) const TAG_REJECT: u8 = 3;
pub(crate) const TAG_GRADIENTS: u8 = 4;
pub(crate) const TAG_GOODBYE: u8 = 5;
pub(crate) const TAG_PARAMETERS: u8 = 6;

const HEADER_LEN: usize = 1 + 8;
const MAX_PAYLOAD: u64 = 1 << 34;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u8, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    pub fn empty(tag: u8) -> Self {
        Self::new(tag, Vec::new())
    }

    pub fn hello(rank: usize, world_size: usize) -> Self {
        let mut payload = BytesMut::with_capacity(16);
        payload.put_u64_le(rank as u64);
        payload.put_u64_le(world_size as u64);
        Self::new(TAG_HELLO, payload.to_vec())
    }

    pub fn reject(reason: &str) -> Self {
        Self::new(TAG_REJECT, reason.as_bytes().to_vec())
    }

    /// Packs `values` little-endian under `tag`.
    pub fn floats(tag: u8, values: &[f32]) -> Self {
        let mut payload = BytesMut::with_capacity(values.len() * 4);
        for value in values {
            payload.put_f32_le(*value);
        }
        Self::new(tag, payload.to_vec())
    }

    /// `(rank, world_size)` announced by a joining peer.
    pub fn parse_hello(&self) -> Result<(usize, usize), TrainingError> {
        self.expect(TAG_HELLO)?;
        if self.payload.len() != 16 {
            return Err(TrainingError::rendezvous(format!(
                "hello frame carries {} bytes, expected 16",
                self.payload.len()
            )));
        }
        let mut payload = self.payload.as_slice();
        let rank = payload.get_u64_le() as usize;
        let world_size = payload.get_u64_le() as usize;
        Ok((rank, world_size))
    }

    pub fn read_floats_into(&self, tag: u8, out: &mut [f32]) -> Result<(), TrainingError> {
        self.expect(tag)?;
        if self.payload.len() != out.len() * 4 {
            return Err(TrainingError::rendezvous(format!(
                "{} frame carries {} bytes, expected {} values",
                tag_name(tag),
                self.payload.len(),
                out.len()
            )));
        }
        let mut payload = self.payload.as_slice();
        for value in out.iter_mut() {
            *value = payload.get_f32_le();
        }
        Ok(())
    }

    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn expect(&self, tag: u8) -> Result<(), TrainingError> {
        if self.tag != tag {
            return Err(TrainingError::rendezvous(format!(
                "unexpected frame {} (wanted {})",
                tag_name(self.tag),
                tag_name(tag)
            )));
        }
        Ok(())
    }
}

pub(crate) fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), TrainingError> {
    let mut buffer = BytesMut::with_capacity(HEADER_LEN + frame.payload.len() + 4);
    buffer.put_u8(frame.tag);
    buffer.put_u64_le(frame.payload.len() as u64);
    buffer.put_slice(&frame.payload);
    buffer.put_u32_le(masked_crc32(&frame.payload));

    writer
        .write_all(&buffer)
        .and_then(|_| writer.flush())
        .map_err(|err| {
            TrainingError::rendezvous(format!("failed to send {} frame: {err}", tag_name(frame.tag)))
        })
}

pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, TrainingError> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|err| TrainingError::rendezvous(format!("failed to read frame header: {err}")))?;
    let mut cursor = &header[..];
    let tag = cursor.get_u8();
    let len = cursor.get_u64_le();
    if len > MAX_PAYLOAD {
        return Err(TrainingError::rendezvous(format!(
            "frame payload of {len} bytes exceeds the limit"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut payload)
        .and_then(|_| reader.read_exact(&mut crc_bytes))
        .map_err(|err| {
            TrainingError::rendezvous(format!("failed to read {} frame: {err}", tag_name(tag)))
        })?;

    let expected = u32::from_le_bytes(crc_bytes);
    let actual = masked_crc32(&payload);
    if expected != actual {
        return Err(TrainingError::rendezvous(format!(
            "{} frame failed its checksum ({actual:#010x} != {expected:#010x})",
            tag_name(tag)
        )));
    }

    Ok(Frame { tag, payload })
}

pub(crate) fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn tag_name(tag: u8) -> &'static str {
    match tag {
        TAG_HELLO => "hello",
        TAG_WELCOME => "welcome",
        TAG_REJECT => "reject",
        TAG_GRADIENTS => "gradients",
        TAG_GOODBYE => "goodbye",
        TAG_PARAMETERS => "parameters",
        _ => "unknown",
    }
}
