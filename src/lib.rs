//! Encoding and decoding of MQTT 5.0 control packets.
//!
//! Packets are plain values ([`Packet`] and the structs it wraps). They are
//! turned into bytes with [`encode_mqtt`] or [`pack`] and read back with
//! [`decode_mqtt`]. [`MqttCodec`] frames them on a byte stream through
//! `tokio_util::codec`.
//!
//! Only QoS 0 publishing is understood. CONNECT packets carrying a will are
//! rejected on decode.

mod codec;

pub use codec::decoder::{decode_mqtt, unpack_fixed_header, unpack_packet, unpack_packet_type};
pub use codec::encoder::{encode_mqtt, pack, pack_fixed_header, pack_properties};
pub use codec::*;
