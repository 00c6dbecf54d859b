//! Presence sensor: an on-device face classifier polled for detections.
//!
//! The same framed protocol runs over either transport; only the link
//! differs. [`SensorTransport::open`] picks the link from configuration.

pub mod i2c;
pub mod protocol;
pub mod serial;

use protocol::{
    CMD_KNOCK, CMD_REQUEST, CMD_RETURN_ARROW, CMD_RETURN_BLOCK, CMD_RETURN_INFO, CMD_RETURN_OK,
    CMD_SAVE_PICTURE,
};
use serde::Deserialize;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Index of the ID field in a block payload (x, y, w, h, id).
const BLOCK_ID_FIELD: usize = 4;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("failed to open sensor link {link}: {source}")]
    Open {
        link: String,
        #[source]
        source: io::Error,
    },
    #[error("sensor I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad frame header {0:02x?}")]
    BadHeader([u8; 3]),
    #[error("frame checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },
    #[error("unexpected reply {got:#04x} (expected {expected:#04x})")]
    UnexpectedReply { expected: u8, got: u8 },
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

impl SensorError {
    /// Whether the offending frame was read to its end, leaving the link
    /// positioned at the next frame.
    fn frame_consumed(&self) -> bool {
        matches!(
            self,
            Self::Checksum { .. } | Self::UnexpectedReply { .. } | Self::Malformed(_)
        )
    }
}

/// Byte link to the sensor.
pub trait SensorLink: Read + Write {
    /// Drop whatever the sensor has sent that has not been read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl<L: SensorLink + ?Sized> SensorLink for Box<L> {
    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }
}

/// One detection reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEvent {
    pub object_id: i64,
    /// The sensor's own classifier recognized a learned face (ID > 0).
    pub trained: bool,
}

impl PresenceEvent {
    pub fn from_id(object_id: i64) -> Self {
        Self {
            object_id,
            trained: object_id > 0,
        }
    }
}

/// Trigger source for the gate.
pub trait PresenceSensor {
    /// One-time liveness check; `false` means the sensor never answered.
    fn handshake(&mut self) -> bool;

    /// Current detections, possibly none.
    fn poll(&mut self) -> Result<Vec<PresenceEvent>, SensorError>;

    /// Ask the sensor to write a snapshot to its own removable storage.
    fn save_picture(&mut self) -> Result<(), SensorError>;
}

/// Link selection, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SensorTransport {
    I2c {
        #[serde(default = "default_i2c_bus")]
        bus: String,
        #[serde(default = "default_i2c_address")]
        address: u16,
    },
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
}

fn default_i2c_bus() -> String {
    "/dev/i2c-1".to_string()
}

fn default_i2c_address() -> u16 {
    0x32
}

fn default_baud() -> u32 {
    9600
}

impl Default for SensorTransport {
    fn default() -> Self {
        Self::I2c {
            bus: default_i2c_bus(),
            address: default_i2c_address(),
        }
    }
}

impl SensorTransport {
    pub fn open(&self) -> Result<ProtocolSensor<Box<dyn SensorLink + Send>>, SensorError> {
        let link: Box<dyn SensorLink + Send> = match self {
            Self::I2c { bus, address } => Box::new(
                i2c::I2cLink::open(bus, *address)
                    .map_err(|source| SensorError::Open { link: bus.clone(), source })?,
            ),
            Self::Serial { port, baud } => Box::new(
                serial::SerialLink::open(port, *baud)
                    .map_err(|source| SensorError::Open { link: port.clone(), source })?,
            ),
        };
        Ok(ProtocolSensor::new(link))
    }
}

/// Sensor speaking the framed protocol over any byte link.
pub struct ProtocolSensor<L> {
    link: L,
}

impl<L: SensorLink> ProtocolSensor<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    fn request(&mut self, command: u8) -> Result<protocol::Packet, SensorError> {
        self.link.write_all(&protocol::encode(command, &[]))?;
        self.link.flush()?;
        self.read_packet()
    }

    fn read_packet(&mut self) -> Result<protocol::Packet, SensorError> {
        protocol::read_packet(&mut self.link).map_err(|e| self.resync(e))
    }

    /// Once framing is lost, drop pending input so the next request starts
    /// on a frame boundary.
    fn resync(&mut self, error: SensorError) -> SensorError {
        if !error.frame_consumed() {
            if let Err(e) = self.link.discard_input() {
                tracing::warn!(error = %e, "failed to discard sensor input");
            }
        }
        error
    }

    fn read_blocks(&mut self, count: u16) -> Result<Vec<PresenceEvent>, SensorError> {
        let mut events = Vec::with_capacity(count as usize);
        // A bad frame mid-reply is reported only after the remaining frames
        // are read, so the link stays aligned for the next poll.
        let mut first_error = None;
        for _ in 0..count {
            match self.read_packet().and_then(parse_block) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) if e.frame_consumed() => {
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(events),
        }
    }
}

fn parse_block(packet: protocol::Packet) -> Result<Option<PresenceEvent>, SensorError> {
    match packet.command {
        CMD_RETURN_BLOCK => {
            let id = packet
                .field(BLOCK_ID_FIELD)
                .ok_or(SensorError::Malformed("block frame too short"))?;
            Ok(Some(PresenceEvent::from_id(i64::from(id))))
        }
        // Line-tracking results share the count but carry no face.
        CMD_RETURN_ARROW => Ok(None),
        other => Err(SensorError::UnexpectedReply {
            expected: CMD_RETURN_BLOCK,
            got: other,
        }),
    }
}

impl<L: SensorLink> PresenceSensor for ProtocolSensor<L> {
    fn handshake(&mut self) -> bool {
        match self.request(CMD_KNOCK).and_then(|p| p.expect(CMD_RETURN_OK)) {
            Ok(_) => {
                tracing::info!("sensor handshake ok");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "sensor handshake failed");
                false
            }
        }
    }

    fn poll(&mut self) -> Result<Vec<PresenceEvent>, SensorError> {
        let info = self.request(CMD_REQUEST)?;
        if info.command != CMD_RETURN_INFO {
            // Leftovers from an earlier reply; whatever follows is stale too.
            let error = SensorError::UnexpectedReply {
                expected: CMD_RETURN_INFO,
                got: info.command,
            };
            if let Err(e) = self.link.discard_input() {
                tracing::warn!(error = %e, "failed to discard sensor input");
            }
            return Err(error);
        }
        let count = info.field(0).ok_or(SensorError::Malformed("info frame too short"))?;

        let events = self.read_blocks(count)?;
        tracing::debug!(events = events.len(), "sensor polled");
        Ok(events)
    }

    fn save_picture(&mut self) -> Result<(), SensorError> {
        self.request(CMD_SAVE_PICTURE)?.expect(CMD_RETURN_OK)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::encode;
    use super::*;
    use std::io::Cursor;

    /// Replays scripted replies and captures everything written.
    struct ScriptedLink {
        replies: Cursor<Vec<u8>>,
        sent: Vec<u8>,
        discards: u32,
    }

    impl ScriptedLink {
        fn new(frames: &[Vec<u8>]) -> Self {
            Self {
                replies: Cursor::new(frames.concat()),
                sent: Vec::new(),
                discards: 0,
            }
        }
    }

    impl SensorLink for ScriptedLink {
        fn discard_input(&mut self) -> io::Result<()> {
            self.discards += 1;
            Ok(())
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn block(id: u16) -> Vec<u8> {
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&id.to_le_bytes());
        encode(CMD_RETURN_BLOCK, &data)
    }

    fn info(count: u16) -> Vec<u8> {
        let mut data = count.to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 8]);
        encode(CMD_RETURN_INFO, &data)
    }

    #[test]
    fn test_handshake_ok() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[encode(CMD_RETURN_OK, &[])]));
        assert!(sensor.handshake());
        assert_eq!(sensor.link.sent, encode(CMD_KNOCK, &[]));
    }

    #[test]
    fn test_handshake_silent_sensor() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[]));
        assert!(!sensor.handshake());
    }

    #[test]
    fn test_handshake_wrong_reply() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[info(0)]));
        assert!(!sensor.handshake());
    }

    #[test]
    fn test_poll_maps_ids_to_trained_flag() {
        let arrow = encode(CMD_RETURN_ARROW, &[0; 10]);
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[info(3), block(2), arrow, block(0)]));
        let events = sensor.poll().unwrap();
        assert_eq!(
            events,
            vec![
                PresenceEvent { object_id: 2, trained: true },
                PresenceEvent { object_id: 0, trained: false },
            ]
        );
    }

    #[test]
    fn test_poll_empty() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[info(0)]));
        assert!(sensor.poll().unwrap().is_empty());
    }

    #[test]
    fn test_poll_truncated_is_error() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[info(2), block(1)]));
        assert!(sensor.poll().is_err());
    }

    #[test]
    fn test_corrupt_block_does_not_desync_next_poll() {
        let mut corrupt = block(1);
        *corrupt.last_mut().unwrap() ^= 0xFF;
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[
            info(3),
            corrupt,
            block(2),
            block(3),
            info(0),
        ]));

        assert!(matches!(sensor.poll(), Err(SensorError::Checksum { .. })));
        assert!(sensor.poll().unwrap().is_empty());
        assert_eq!(sensor.link.discards, 0);
    }

    #[test]
    fn test_lost_framing_discards_pending_input() {
        let mut garbage = block(1);
        garbage[0] = 0x00;
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[info(2), garbage, block(2)]));
        assert!(matches!(sensor.poll(), Err(SensorError::BadHeader(_))));
        assert_eq!(sensor.link.discards, 1);
    }

    #[test]
    fn test_stale_block_instead_of_info_discards_input() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[block(4), info(0)]));
        assert!(matches!(
            sensor.poll(),
            Err(SensorError::UnexpectedReply { expected: CMD_RETURN_INFO, got: CMD_RETURN_BLOCK })
        ));
        assert_eq!(sensor.link.discards, 1);
    }

    #[test]
    fn test_save_picture() {
        let mut sensor = ProtocolSensor::new(ScriptedLink::new(&[encode(CMD_RETURN_OK, &[])]));
        sensor.save_picture().unwrap();
        assert_eq!(sensor.link.sent, encode(CMD_SAVE_PICTURE, &[]));
    }

    #[test]
    fn test_presence_event_trained_convention() {
        assert!(PresenceEvent::from_id(1).trained);
        assert!(!PresenceEvent::from_id(0).trained);
        assert!(!PresenceEvent::from_id(-4).trained);
    }

    #[test]
    fn test_transport_config_parsing() {
        #[derive(Deserialize)]
        struct Wrapper {
            sensor: SensorTransport,
        }
        let w: Wrapper = toml::from_str("[sensor]\nkind = \"serial\"\nport = \"/dev/ttyS0\"\n").unwrap();
        assert_eq!(
            w.sensor,
            SensorTransport::Serial { port: "/dev/ttyS0".into(), baud: 9600 }
        );
        let w: Wrapper = toml::from_str("[sensor]\nkind = \"i2c\"\n").unwrap();
        assert_eq!(w.sensor, SensorTransport::default());
    }
}
