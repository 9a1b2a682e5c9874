//! Panel wire protocol definitions and encoding.
//!
//! Frame layouts (multi-byte fields little-endian):
//! - Image:   `[0x02][unit][len:2][payload]`
//! - Header:  `[0x03][unit][session][total:4][window_size:2][window_count:2]`
//! - Window:  `[0x04][unit][session][index:2][len:2][payload][crc32:4]`
//! - Control: `[opcode][unit]`
//! - Ack (device to host): `[index:2][status:1]`
//!
//! Opcode values and ack semantics come from observed device behavior; the
//! vendor does not document them.

use crate::unit::UnitId;
use crate::{Error, Result};

/// Animation window size. The final window of a payload may be shorter.
pub const WINDOW_SIZE: usize = 12 * 1024;

/// Largest payload an image frame's 16-bit length field can carry.
pub const MAX_IMAGE_PAYLOAD: usize = u16::MAX as usize;

/// Ack index the device uses to acknowledge a session header.
pub const HEADER_ACK_INDEX: u16 = 0xFFFF;

/// Length of an ack notification.
pub const ACK_LEN: usize = 3;

/// Image frame header: opcode, unit, length.
pub const IMAGE_HEADER_LEN: usize = 4;

/// Window frame overhead: opcode, unit, session, index, length, crc.
pub const WINDOW_OVERHEAD: usize = 11;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Whole-image upload.
    Image = 0x02,
    /// Animation session header.
    AnimHeader = 0x03,
    /// Animation payload window.
    AnimWindow = 0x04,
    /// Abort/reset of an animation session.
    AnimAbort = 0x05,
    /// Screen off.
    PowerOff = 0x06,
    /// Screen on.
    PowerOn = 0x07,
    /// Blank the screen.
    Clear = 0x08,
}

/// Payload-less commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Clear,
    PowerOn,
    PowerOff,
    Abort,
}

impl ControlCommand {
    /// Returns the opcode carried by this command.
    pub fn opcode(self) -> Opcode {
        match self {
            ControlCommand::Clear => Opcode::Clear,
            ControlCommand::PowerOn => Opcode::PowerOn,
            ControlCommand::PowerOff => Opcode::PowerOff,
            ControlCommand::Abort => Opcode::AnimAbort,
        }
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCommand::Clear => write!(f, "clear"),
            ControlCommand::PowerOn => write!(f, "power-on"),
            ControlCommand::PowerOff => write!(f, "power-off"),
            ControlCommand::Abort => write!(f, "abort"),
        }
    }
}

/// Ack status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    ChecksumFail = 1,
    OutOfOrder = 2,
}

impl AckStatus {
    /// Converts a status byte to AckStatus.
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::ChecksumFail),
            2 => Ok(AckStatus::OutOfOrder),
            _ => Err(Error::Protocol(format!("unknown ack status {:#04x}", value))),
        }
    }
}

/// A decoded acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub window: u16,
    pub status: AckStatus,
}

impl Ack {
    pub fn new(window: u16, status: AckStatus) -> Self {
        Self { window, status }
    }

    /// Encodes the ack the way a device sends it.
    pub fn encode(&self) -> [u8; ACK_LEN] {
        let index = self.window.to_le_bytes();
        [index[0], index[1], self.status as u8]
    }
}

/// Builds an image frame for one unit.
pub fn encode_image_frame(unit: UnitId, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_IMAGE_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: MAX_IMAGE_PAYLOAD,
        });
    }

    let mut frame = Vec::with_capacity(IMAGE_HEADER_LEN + payload.len());
    frame.push(Opcode::Image as u8);
    frame.push(unit.as_u8());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Builds the header that opens an animation session.
pub fn encode_header(unit: UnitId, session: u8, total_len: u32, window_count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(13);
    frame.push(Opcode::AnimHeader as u8);
    frame.push(unit.as_u8());
    frame.push(session);
    frame.extend_from_slice(&total_len.to_le_bytes());
    frame.extend_from_slice(&(WINDOW_SIZE as u16).to_le_bytes());
    frame.extend_from_slice(&window_count.to_le_bytes());
    frame
}

/// Builds one animation window frame, trailed by the CRC32 of its payload.
pub fn encode_window(unit: UnitId, session: u8, index: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > WINDOW_SIZE {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: WINDOW_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(WINDOW_OVERHEAD + payload.len());
    frame.push(Opcode::AnimWindow as u8);
    frame.push(unit.as_u8());
    frame.push(session);
    frame.extend_from_slice(&index.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    Ok(frame)
}

/// Builds a payload-less control frame.
pub fn encode_control(command: ControlCommand, unit: UnitId) -> Vec<u8> {
    vec![command.opcode() as u8, unit.as_u8()]
}

/// Decodes an ack notification.
pub fn decode_ack(bytes: &[u8]) -> Result<Ack> {
    if bytes.len() != ACK_LEN {
        return Err(Error::Protocol(format!(
            "ack must be {} bytes, got {}: {:02X?}",
            ACK_LEN,
            bytes.len(),
            bytes
        )));
    }
    let window = u16::from_le_bytes([bytes[0], bytes[1]]);
    let status = AckStatus::from_byte(bytes[2])?;
    Ok(Ack { window, status })
}

/// Number of windows needed for a payload of `len` bytes.
pub fn window_count(len: usize) -> usize {
    len.div_ceil(WINDOW_SIZE)
}

/// Splits a payload into protocol windows.
pub fn windows(payload: &[u8]) -> std::slice::Chunks<'_, u8> {
    payload.chunks(WINDOW_SIZE)
}
