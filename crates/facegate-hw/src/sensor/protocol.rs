//! Framed request/response protocol spoken by the presence sensor.
//!
//! ```text
//! 55 AA 11 <len> <cmd> <data: len bytes> <checksum>
//! ```
//!
//! The checksum is the low byte of the sum of every preceding byte.

use super::SensorError;
use std::io::Read;

pub const HEADER: [u8; 3] = [0x55, 0xAA, 0x11];

pub const CMD_REQUEST: u8 = 0x20;
pub const CMD_RETURN_INFO: u8 = 0x29;
pub const CMD_RETURN_BLOCK: u8 = 0x2A;
pub const CMD_RETURN_ARROW: u8 = 0x2B;
pub const CMD_KNOCK: u8 = 0x2C;
pub const CMD_RETURN_OK: u8 = 0x2E;
pub const CMD_SAVE_PICTURE: u8 = 0x30;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub data: Vec<u8>,
}

impl Packet {
    /// Little-endian u16 at field `index` of the payload.
    pub fn field(&self, index: usize) -> Option<u16> {
        let bytes = self.data.get(index * 2..index * 2 + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn expect(self, command: u8) -> Result<Self, SensorError> {
        if self.command == command {
            Ok(self)
        } else {
            Err(SensorError::UnexpectedReply {
                expected: command,
                got: self.command,
            })
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode a request frame.
pub fn encode(command: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER.len() + 3 + data.len());
    frame.extend_from_slice(&HEADER);
    frame.push(data.len() as u8);
    frame.push(command);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));
    frame
}

/// Read and verify one frame.
pub fn read_packet<R: Read>(reader: &mut R) -> Result<Packet, SensorError> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;
    if head[..3] != HEADER {
        return Err(SensorError::BadHeader([head[0], head[1], head[2]]));
    }

    let len = head[3] as usize;
    let mut rest = vec![0u8; len + 1];
    reader.read_exact(&mut rest)?;

    let received = rest[len];
    let mut framed = head.to_vec();
    framed.extend_from_slice(&rest[..len]);
    let computed = checksum(&framed);
    if computed != received {
        return Err(SensorError::Checksum { computed, received });
    }

    rest.truncate(len);
    Ok(Packet {
        command: head[4],
        data: rest,
    })
}
