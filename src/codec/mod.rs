pub mod decoder;
pub mod encoder;
mod properties;
mod types;

pub use properties::*;
pub use types::*;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_VERSION: u8 = 5;

/// Largest value a variable byte integer can hold.
pub const MAX_VARIABLE_INT: usize = 268_435_455;

/// Largest UTF-8 string or binary field, bounded by its two byte prefix.
pub const MAX_FIELD_LEN: usize = 65_535;

/// First byte, four byte remaining length and the largest possible body.
pub const MAX_PACKET_SIZE: usize = 1 + 4 + MAX_VARIABLE_INT;

pub(crate) mod connect_flags {
    pub const RESERVED: u8 = 0b0000_0001;
    pub const CLEAN_START: u8 = 0b0000_0010;
    pub const WILL_FLAG: u8 = 0b0000_0100;
    pub const WILL_QOS_1: u8 = 0b0000_1000;
    pub const WILL_QOS_2: u8 = 0b0001_0000;
    pub const WILL_RETAIN: u8 = 0b0010_0000;
    pub const PASSWORD_FLAG: u8 = 0b0100_0000;
    pub const USER_NAME_FLAG: u8 = 0b1000_0000;

    pub const WILL_QOS_SHIFT: u8 = 3;
}

/// Frames MQTT 5.0 packets on a byte stream.
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        MqttCodec::new()
    }
}

impl MqttCodec {
    pub fn new() -> Self {
        MqttCodec {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Limits the size of a whole packet, fixed header included, in both
    /// directions.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.min(MAX_PACKET_SIZE);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

fn log_properties(packet: &Packet) {
    let Some(properties) = packet.properties() else {
        return;
    };

    for (id, value) in properties {
        debug!(packet_type = %packet.packet_type(), property = ?id, ?value, "packet property");
    }
}

impl Decoder for MqttCodec {
    type Error = DecodeError;
    type Item = Packet;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decoder::decode_frame(buf, self.max_packet_size) {
            Ok(Some(packet)) => {
                trace!(packet_type = %packet.packet_type(), "decoded packet");
                log_properties(&packet);
                Ok(Some(packet))
            }
            Ok(None) => {
                debug!(buffered = buf.len(), "waiting for more data");
                Ok(None)
            }
            Err(err) => {
                warn!(%err, "failed to decode packet");
                Err(err)
            }
        }
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = EncodeError;

    fn encode(&mut self, packet: Packet, bytes: &mut BytesMut) -> Result<(), Self::Error> {
        let packed = encoder::pack(&packet)?;
        if packed.len() > self.max_packet_size {
            warn!(
                packet_type = %packet.packet_type(),
                size = packed.len(),
                max = self.max_packet_size,
                "refusing to send oversized packet"
            );
            return Err(EncodeError::PacketTooLarge {
                size: packed.len(),
                max: self.max_packet_size,
            });
        }

        trace!(packet_type = %packet.packet_type(), size = packed.len(), "encoded packet");
        log_properties(&packet);
        bytes.extend_from_slice(&packed);
        Ok(())
    }
}
