use super::{
    connect_flags,
    properties::{allowed_properties, Properties, PropertyId, PropertyType, PropertyValue},
    types::{
        Connack, Connect, ConnectReasonCode, DecodeError, Disconnect, DisconnectReason,
        FixedHeader, MalformedPacket, Packet, PacketType, Puback, PubackReasonCode, Pubcomp,
        Publish, Pubrec, PubrecReasonCode, Pubrel, PubrelReasonCode, Suback, SubackReasonCode,
        Subscribe, Unsuback, UnsubackReasonCode, Unsubscribe,
    },
    MAX_PACKET_SIZE, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;

macro_rules! require_length {
    ($bytes: expr, $len: expr) => {{
        let remaining = $bytes.remaining();
        if remaining < $len {
            return Err(MalformedPacket::Truncated {
                needed: $len,
                remaining,
            });
        }
    }};
}

pub fn decode_u8(bytes: &mut Cursor<&[u8]>) -> Result<u8, MalformedPacket> {
    require_length!(bytes, 1);
    Ok(bytes.get_u8())
}

pub fn decode_u16(bytes: &mut Cursor<&[u8]>) -> Result<u16, MalformedPacket> {
    require_length!(bytes, 2);
    Ok(bytes.get_u16())
}

pub fn decode_u32(bytes: &mut Cursor<&[u8]>) -> Result<u32, MalformedPacket> {
    require_length!(bytes, 4);
    Ok(bytes.get_u32())
}

/// Reads at most four groups; a fifth continuation is malformed.
pub fn decode_variable_int(bytes: &mut Cursor<&[u8]>) -> Result<usize, MalformedPacket> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;

    for _ in 0..4 {
        let encoded_byte = decode_u8(bytes)?;

        value += ((encoded_byte & 0b0111_1111) as usize) * multiplier;

        multiplier *= 128;

        if encoded_byte & 0b1000_0000 == 0b0000_0000 {
            return Ok(value);
        }
    }

    Err(MalformedPacket::VariableIntTooLong)
}

fn take<'a>(bytes: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8], MalformedPacket> {
    require_length!(bytes, len);

    let buf: &'a [u8] = *bytes.get_ref();
    let position = bytes.position() as usize;
    let data = &buf[position..position + len];
    bytes.advance(len);

    Ok(data)
}

fn take_length_prefixed<'a>(bytes: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], MalformedPacket> {
    let len = decode_u16(bytes)? as usize;
    take(bytes, len)
}

pub fn decode_string(bytes: &mut Cursor<&[u8]>) -> Result<String, MalformedPacket> {
    let data = take_length_prefixed(bytes)?;
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|_| MalformedPacket::InvalidUtf8)
}

pub fn decode_binary_data(bytes: &mut Cursor<&[u8]>) -> Result<Bytes, MalformedPacket> {
    let data = take_length_prefixed(bytes)?;
    Ok(Bytes::copy_from_slice(data))
}

fn decode_property_value(
    value_type: PropertyType,
    bytes: &mut Cursor<&[u8]>,
) -> Result<PropertyValue, MalformedPacket> {
    let value = match value_type {
        PropertyType::Byte => PropertyValue::Byte(decode_u8(bytes)?),
        PropertyType::TwoByteInt => PropertyValue::TwoByteInt(decode_u16(bytes)?),
        PropertyType::FourByteInt => PropertyValue::FourByteInt(decode_u32(bytes)?),
        // Four groups hold at most 28 bits
        PropertyType::VariableInt => PropertyValue::VariableInt(decode_variable_int(bytes)? as u32),
        PropertyType::String => PropertyValue::String(decode_string(bytes)?),
        PropertyType::Binary => PropertyValue::Binary(decode_binary_data(bytes)?),
        PropertyType::StringPair => {
            let key = decode_string(bytes)?;
            let value = decode_string(bytes)?;
            PropertyValue::StringPair(key, value)
        }
    };

    Ok(value)
}

/// Reads a property block, accepting only identifiers in `allowed`.
///
/// Values are decoded from a view that ends at the declared block length,
/// so a value running past it fails as truncated.
pub fn unpack_properties(
    allowed: &[PropertyId],
    bytes: &mut Cursor<&[u8]>,
) -> Result<Properties, MalformedPacket> {
    let len = decode_variable_int(bytes)?;
    let mut block = Cursor::new(take(bytes, len)?);
    let mut properties = Properties::new();

    while block.has_remaining() {
        let id_byte = block.get_u8();
        let id = PropertyId::try_from(id_byte)
            .ok()
            .filter(|id| allowed.contains(id))
            .ok_or(MalformedPacket::PropertyNotAllowed(id_byte))?;

        if !id.is_repeatable() && properties.contains(id) {
            return Err(MalformedPacket::DuplicateProperty(id));
        }

        let value = decode_property_value(id.value_type(), &mut block)?;
        properties.put(id, value);
    }

    Ok(properties)
}

/// Resolves the high nibble of a fixed header's first byte. An unknown
/// type is handed back raw so the caller can report it.
pub fn unpack_packet_type(first_byte: u8) -> Result<PacketType, u8> {
    let value = (first_byte & 0b1111_0000) >> 4;
    PacketType::try_from(value).map_err(|_| value)
}

/// Parses the fixed header at the start of `buf`, or returns `None` while
/// it is still incomplete.
pub fn unpack_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>, MalformedPacket> {
    let mut bytes = Cursor::new(buf);
    if !bytes.has_remaining() {
        return Ok(None);
    }

    let first_byte = bytes.get_u8();
    let remaining_length = match decode_variable_int(&mut bytes) {
        Ok(len) => len,
        Err(MalformedPacket::Truncated { .. }) => return Ok(None),
        Err(err) => return Err(err),
    };

    Ok(Some(FixedHeader {
        first_byte,
        remaining_length,
        header_len: bytes.position() as usize,
    }))
}

pub fn unpack_connect(bytes: &mut Cursor<&[u8]>) -> Result<Connect, MalformedPacket> {
    let protocol_name = take_length_prefixed(bytes)?;
    if protocol_name != PROTOCOL_NAME.as_bytes() {
        return Err(MalformedPacket::InvalidProtocolName);
    }

    let protocol_version = decode_u8(bytes)?;
    if protocol_version != PROTOCOL_VERSION {
        return Err(MalformedPacket::UnsupportedProtocolVersion(protocol_version));
    }

    let flags = decode_u8(bytes)?;
    if flags & connect_flags::RESERVED != 0 {
        return Err(MalformedPacket::ReservedBitsSet {
            field: "connect flags",
            value: flags,
        });
    }

    if flags & connect_flags::WILL_FLAG != 0 {
        return Err(MalformedPacket::WillNotSupported);
    }

    // Will QoS and retain must be clear without a will
    let will_bits = connect_flags::WILL_QOS_1 | connect_flags::WILL_QOS_2 | connect_flags::WILL_RETAIN;
    if flags & will_bits != 0 {
        return Err(MalformedPacket::ReservedBitsSet {
            field: "connect flags",
            value: flags,
        });
    }

    let keep_alive = decode_u16(bytes)?;
    let properties = unpack_properties(allowed_properties(PacketType::Connect), bytes)?;

    // Start payload
    let client_id = decode_string(bytes)?;

    let user_name = if flags & connect_flags::USER_NAME_FLAG != 0 {
        Some(decode_string(bytes)?)
    } else {
        None
    };

    let password = if flags & connect_flags::PASSWORD_FLAG != 0 {
        Some(decode_binary_data(bytes)?)
    } else {
        None
    };

    Ok(Connect {
        clean_start: flags & connect_flags::CLEAN_START != 0,
        keep_alive,
        properties,
        client_id,
        will: None,
        user_name,
        password,
    })
}

pub fn unpack_connack(bytes: &mut Cursor<&[u8]>) -> Result<Connack, MalformedPacket> {
    let flags = decode_u8(bytes)?;
    if flags & 0b1111_1110 != 0 {
        return Err(MalformedPacket::ReservedBitsSet {
            field: "connect acknowledge flags",
            value: flags,
        });
    }

    let reason_code_byte = decode_u8(bytes)?;
    let reason_code = ConnectReasonCode::try_from(reason_code_byte)
        .map_err(|_| MalformedPacket::InvalidReasonCode(reason_code_byte))?;

    let properties = unpack_properties(allowed_properties(PacketType::Connack), bytes)?;

    Ok(Connack {
        session_present: flags & 0b0000_0001 == 0b0000_0001,
        reason_code,
        properties,
    })
}

/// `flags` is the low nibble of the fixed header; `bytes` must end where
/// the packet ends since the payload runs to the end.
pub fn unpack_publish(flags: u8, bytes: &mut Cursor<&[u8]>) -> Result<Publish, MalformedPacket> {
    let qos = (flags & 0b0000_0110) >> 1;
    if qos != 0 {
        return Err(MalformedPacket::QosNotSupported(qos));
    }

    let retain = flags & 0b0000_0001 == 0b0000_0001;

    let topic = decode_string(bytes)?;
    let properties = unpack_properties(allowed_properties(PacketType::Publish), bytes)?;

    let payload_size = bytes.remaining();
    let payload = Bytes::copy_from_slice(take(bytes, payload_size)?);

    Ok(Publish {
        retain,
        topic,
        properties,
        payload,
    })
}

// Reason code and properties are both optional; a missing reason code
// means success.
fn unpack_publish_ack(
    packet_type: PacketType,
    bytes: &mut Cursor<&[u8]>,
) -> Result<(u16, u8, Properties), MalformedPacket> {
    let packet_id = decode_u16(bytes)?;

    if !bytes.has_remaining() {
        return Ok((packet_id, 0, Properties::new()));
    }

    let reason_code = decode_u8(bytes)?;
    let properties = if bytes.has_remaining() {
        unpack_properties(allowed_properties(packet_type), bytes)?
    } else {
        Properties::new()
    };

    Ok((packet_id, reason_code, properties))
}

pub fn unpack_puback(bytes: &mut Cursor<&[u8]>) -> Result<Puback, MalformedPacket> {
    let (packet_id, reason_code_byte, properties) = unpack_publish_ack(PacketType::Puback, bytes)?;
    let reason_code = PubackReasonCode::try_from(reason_code_byte)
        .map_err(|_| MalformedPacket::InvalidReasonCode(reason_code_byte))?;

    Ok(Puback {
        packet_id,
        reason_code,
        properties,
    })
}

pub fn unpack_pubrec(bytes: &mut Cursor<&[u8]>) -> Result<Pubrec, MalformedPacket> {
    let (packet_id, reason_code_byte, properties) = unpack_publish_ack(PacketType::Pubrec, bytes)?;
    let reason_code = PubrecReasonCode::try_from(reason_code_byte)
        .map_err(|_| MalformedPacket::InvalidReasonCode(reason_code_byte))?;

    Ok(Pubrec {
        packet_id,
        reason_code,
        properties,
    })
}

pub fn unpack_pubrel(bytes: &mut Cursor<&[u8]>) -> Result<Pubrel, MalformedPacket> {
    let (packet_id, reason_code_byte, properties) = unpack_publish_ack(PacketType::Pubrel, bytes)?;
    let reason_code = PubrelReasonCode::try_from(reason_code_byte)
        .map_err(|_| MalformedPacket::InvalidReasonCode(reason_code_byte))?;

    Ok(Pubrel {
        packet_id,
        reason_code,
        properties,
    })
}

pub fn unpack_pubcomp(bytes: &mut Cursor<&[u8]>) -> Result<Pubcomp, MalformedPacket> {
    let (packet_id, reason_code_byte, properties) =
        unpack_publish_ack(PacketType::Pubcomp, bytes)?;
    let reason_code = PubrelReasonCode::try_from(reason_code_byte)
        .map_err(|_| MalformedPacket::InvalidReasonCode(reason_code_byte))?;

    Ok(Pubcomp {
        packet_id,
        reason_code,
        properties,
    })
}

pub fn unpack_subscribe(bytes: &mut Cursor<&[u8]>) -> Result<Subscribe, MalformedPacket> {
    let packet_id = decode_u16(bytes)?;
    let properties = unpack_properties(allowed_properties(PacketType::Subscribe), bytes)?;

    let mut topic_filters = vec![];

    while bytes.has_remaining() {
        let topic_filter = decode_string(bytes)?;
        let options_byte = decode_u8(bytes)?;

        let maximum_qos = options_byte & 0b0000_0011;
        let retain_handling = (options_byte & 0b0011_0000) >> 4;
        if options_byte & 0b1100_0000 != 0 || maximum_qos == 3 || retain_handling == 3 {
            return Err(MalformedPacket::ReservedBitsSet {
                field: "subscription options",
                value: options_byte,
            });
        }

        topic_filters.push(topic_filter);
    }

    // [MQTT-3.8.3-2] At least one topic filter
    if topic_filters.is_empty() {
        return Err(MalformedPacket::NoTopicFilters);
    }

    Ok(Subscribe {
        packet_id,
        properties,
        topic_filters,
    })
}

pub fn unpack_suback(bytes: &mut Cursor<&[u8]>) -> Result<Suback, MalformedPacket> {
    let packet_id = decode_u16(bytes)?;
    let properties = unpack_properties(allowed_properties(PacketType::Suback), bytes)?;

    let mut reason_codes = vec![];
    while bytes.has_remaining() {
        let next_byte = bytes.get_u8();
        let reason_code = SubackReasonCode::try_from(next_byte)
            .map_err(|_| MalformedPacket::InvalidReasonCode(next_byte))?;
        reason_codes.push(reason_code);
    }

    Ok(Suback {
        packet_id,
        properties,
        reason_codes,
    })
}

pub fn unpack_unsubscribe(bytes: &mut Cursor<&[u8]>) -> Result<Unsubscribe, MalformedPacket> {
    let packet_id = decode_u16(bytes)?;
    let properties = unpack_properties(allowed_properties(PacketType::Unsubscribe), bytes)?;

    let mut topic_filters = vec![];
    while bytes.has_remaining() {
        topic_filters.push(decode_string(bytes)?);
    }

    // [MQTT-3.10.3-2] At least one topic filter
    if topic_filters.is_empty() {
        return Err(MalformedPacket::NoTopicFilters);
    }

    Ok(Unsubscribe {
        packet_id,
        properties,
        topic_filters,
    })
}

pub fn unpack_unsuback(bytes: &mut Cursor<&[u8]>) -> Result<Unsuback, MalformedPacket> {
    let packet_id = decode_u16(bytes)?;
    let properties = unpack_properties(allowed_properties(PacketType::Unsuback), bytes)?;

    let mut reason_codes = vec![];
    while bytes.has_remaining() {
        let next_byte = bytes.get_u8();
        let reason_code = UnsubackReasonCode::try_from(next_byte)
            .map_err(|_| MalformedPacket::InvalidReasonCode(next_byte))?;
        reason_codes.push(reason_code);
    }

    Ok(Unsuback {
        packet_id,
        properties,
        reason_codes,
    })
}

/// Reason code and properties are optional; an empty body is a normal
/// disconnection.
pub fn unpack_disconnect(bytes: &mut Cursor<&[u8]>) -> Result<Disconnect, MalformedPacket> {
    if !bytes.has_remaining() {
        return Ok(Disconnect::default());
    }

    let reason = DisconnectReason::from_byte(decode_u8(bytes)?);
    let properties = if bytes.has_remaining() {
        unpack_properties(allowed_properties(PacketType::Disconnect), bytes)?
    } else {
        Properties::new()
    };

    Ok(Disconnect { reason, properties })
}

fn check_fixed_flags(packet_type: PacketType, flags: u8) -> Result<(), MalformedPacket> {
    match packet_type.fixed_flags() {
        Some(expected) if flags != expected => {
            Err(MalformedPacket::InvalidFlags { packet_type, flags })
        }
        _ => Ok(()),
    }
}

/// Decodes one packet body, everything after the fixed header.
pub fn unpack_packet(
    packet_type: PacketType,
    flags: u8,
    body: &[u8],
) -> Result<Packet, MalformedPacket> {
    check_fixed_flags(packet_type, flags)?;

    let mut bytes = Cursor::new(body);

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(unpack_connect(&mut bytes)?),
        PacketType::Connack => Packet::Connack(unpack_connack(&mut bytes)?),
        PacketType::Publish => Packet::Publish(unpack_publish(flags, &mut bytes)?),
        PacketType::Puback => Packet::Puback(unpack_puback(&mut bytes)?),
        PacketType::Pubrec => Packet::Pubrec(unpack_pubrec(&mut bytes)?),
        PacketType::Pubrel => Packet::Pubrel(unpack_pubrel(&mut bytes)?),
        PacketType::Pubcomp => Packet::Pubcomp(unpack_pubcomp(&mut bytes)?),
        PacketType::Subscribe => Packet::Subscribe(unpack_subscribe(&mut bytes)?),
        PacketType::Suback => Packet::Suback(unpack_suback(&mut bytes)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(unpack_unsubscribe(&mut bytes)?),
        PacketType::Unsuback => Packet::Unsuback(unpack_unsuback(&mut bytes)?),
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect(unpack_disconnect(&mut bytes)?),
    };

    if bytes.has_remaining() {
        return Err(MalformedPacket::TrailingBytes(bytes.remaining()));
    }

    Ok(packet)
}

/// Most buffer space reserved ahead of bytes that have not arrived yet.
const READ_CHUNK_SIZE: usize = 8 * 1024;

pub(crate) fn decode_frame(
    bytes: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<Packet>, DecodeError> {
    let Some(header) = unpack_fixed_header(&bytes[..])? else {
        return Ok(None);
    };

    let packet_type = header
        .packet_type()
        .map_err(DecodeError::UnsupportedPacketType)?;
    check_fixed_flags(packet_type, header.flags())?;

    let packet_len = header.packet_len();
    if packet_len > max_packet_size {
        return Err(DecodeError::PacketTooLarge {
            size: packet_len,
            max: max_packet_size,
        });
    }

    if bytes.len() < packet_len {
        // Grow towards the announced size one chunk at a time
        bytes.reserve((packet_len - bytes.len()).min(READ_CHUNK_SIZE));
        return Ok(None);
    }

    let frame = bytes.split_to(packet_len);
    let packet = unpack_packet(packet_type, header.flags(), &frame[header.header_len..])?;

    Ok(Some(packet))
}

/// Decodes the packet at the front of `bytes` and consumes it. Returns
/// `None`, leaving `bytes` untouched, until the whole packet is buffered.
pub fn decode_mqtt(bytes: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
    decode_frame(bytes, MAX_PACKET_SIZE)
}

#[cfg(test)]
mod tests {
    use super::super::{encoder::*, properties::*, types::*};
    use super::*;

    fn malformed(result: Result<Option<Packet>, DecodeError>) -> MalformedPacket {
        match result {
            Err(DecodeError::Malformed(err)) => err,
            other => panic!("expected malformed packet, got {:?}", other),
        }
    }

    fn decode_slice(buf: &[u8]) -> Result<Option<Packet>, DecodeError> {
        decode_mqtt(&mut BytesMut::from(buf))
    }

    #[test]
    fn test_invalid_remaining_length() {
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&[136, 1, 0, 36, 0, 0]); // Discovered from fuzz test

        assert_eq!(
            malformed(decode_mqtt(&mut bytes)),
            MalformedPacket::InvalidFlags {
                packet_type: PacketType::Subscribe,
                flags: 0b1000
            }
        );
    }

    #[test]
    fn test_header_only_input_reserves_bounded_space() {
        // PUBLISH announcing the largest possible body
        let mut bytes = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0x7F][..]);

        assert_eq!(decode_mqtt(&mut bytes).unwrap(), None);
        assert_eq!(bytes.len(), 5);
        assert!(
            bytes.capacity() <= 5 + READ_CHUNK_SIZE * 2,
            "reserved {} bytes",
            bytes.capacity()
        );

        // Feeding the body in pieces still yields the packet
        let packed = pack_publish(&Publish::new("t", vec![7u8; 20_000])).unwrap();
        let mut bytes = BytesMut::new();
        for chunk in packed.chunks(1000) {
            assert_eq!(decode_mqtt(&mut bytes).unwrap(), None);
            bytes.extend_from_slice(chunk);
        }
        let Some(Packet::Publish(publish)) = decode_mqtt(&mut bytes).unwrap() else {
            panic!("expected publish");
        };
        assert_eq!(publish.payload.len(), 20_000);
    }

    #[test]
    fn test_decode_variable_int() {
        fn normal_test(encoded_variable_int: &[u8], expected_variable_int: usize) {
            let mut bytes = Cursor::new(encoded_variable_int);
            match decode_variable_int(&mut bytes) {
                Ok(val) => assert_eq!(val, expected_variable_int),
                Err(err) => panic!("Error decoding variable int: {:?}", err),
            }
            assert!(!bytes.has_remaining());
        }

        // Digits 1
        normal_test(&[0x00], 0);
        normal_test(&[0x7F], 127);

        // Digits 2
        normal_test(&[0x80, 0x01], 128);
        normal_test(&[0xFF, 0x7F], 16383);

        // Digits 3
        normal_test(&[0x80, 0x80, 0x01], 16384);
        normal_test(&[0xFF, 0xFF, 0x7F], 2097151);

        // Digits 4
        normal_test(&[0x80, 0x80, 0x80, 0x01], 2097152);
        normal_test(&[0xFF, 0xFF, 0xFF, 0x7F], 268435455);
    }

    #[test]
    fn test_decode_variable_int_crash() {
        let number: u32 = u32::MAX;
        let bytes = number.to_be_bytes();
        let result = decode_variable_int(&mut Cursor::new(&bytes[..]));

        assert_eq!(result, Err(MalformedPacket::VariableIntTooLong));
    }

    #[test]
    fn test_decode_variable_int_truncated() {
        let result = decode_variable_int(&mut Cursor::new(&[0x80, 0x80][..]));
        assert_eq!(
            result,
            Err(MalformedPacket::Truncated {
                needed: 1,
                remaining: 0
            })
        );
    }

    #[test]
    fn test_fixed_header_never_reads_past_four_length_bytes() {
        let result = decode_slice(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(malformed(result), MalformedPacket::VariableIntTooLong);
    }

    #[test]
    fn test_unpack_fixed_header() {
        assert_eq!(unpack_fixed_header(&[]), Ok(None));
        assert_eq!(unpack_fixed_header(&[0x82]), Ok(None));
        assert_eq!(unpack_fixed_header(&[0x82, 0x80]), Ok(None));

        let header = unpack_fixed_header(&[0x82, 0xC1, 0x02, 0x00]).unwrap().unwrap();
        assert_eq!(header.packet_type(), Ok(PacketType::Subscribe));
        assert_eq!(header.flags(), 0b0010);
        assert_eq!(header.remaining_length, 321);
        assert_eq!(header.header_len, 3);
        assert_eq!(header.packet_len(), 324);
    }

    #[test]
    fn test_unpack_packet_type_passes_unknown_through() {
        assert_eq!(unpack_packet_type(0x10), Ok(PacketType::Connect));
        assert_eq!(unpack_packet_type(0xE0), Ok(PacketType::Disconnect));
        assert_eq!(unpack_packet_type(0x00), Err(0));
        assert_eq!(unpack_packet_type(0xF0), Err(15));

        // AUTH is reported with its number
        assert!(matches!(
            decode_slice(&[0xF0, 0x00]),
            Err(DecodeError::UnsupportedPacketType(15))
        ));
    }

    #[test]
    fn test_decode_string() {
        let mut bytes = Cursor::new(&[0, 3, b'a', b'/', b'b', 0xAA][..]);
        assert_eq!(decode_string(&mut bytes), Ok("a/b".to_string()));
        assert_eq!(bytes.remaining(), 1);

        let mut bytes = Cursor::new(&[0, 2, 0xC3, 0x28][..]);
        assert_eq!(decode_string(&mut bytes), Err(MalformedPacket::InvalidUtf8));

        let mut bytes = Cursor::new(&[0, 10, b'a'][..]);
        assert_eq!(
            decode_string(&mut bytes),
            Err(MalformedPacket::Truncated {
                needed: 10,
                remaining: 1
            })
        );

        // Binary data skips UTF-8 validation
        let mut bytes = Cursor::new(&[0, 2, 0xC3, 0x28][..]);
        assert_eq!(
            decode_binary_data(&mut bytes).unwrap(),
            Bytes::from_static(&[0xC3, 0x28])
        );
    }

    #[test]
    fn test_decode_string_at_length_limit() {
        let mut buf = vec![0xFF, 0xFF];
        buf.extend(std::iter::repeat(b'z').take(65535));
        let decoded = decode_string(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(decoded.len(), 65535);
    }

    #[test]
    fn test_unpack_properties() {
        let buf = [
            10, // length
            35, 0, 4, // topic alias
            38, 0, 1, b'k', 0, 1, b'v', // user property
            0xEE, // beyond the block
        ];
        let mut bytes = Cursor::new(&buf[..]);
        let properties =
            unpack_properties(allowed_properties(PacketType::Publish), &mut bytes).unwrap();

        assert_eq!(properties.topic_alias(), Some(4));
        assert_eq!(properties.user_properties().collect::<Vec<_>>(), vec![("k", "v")]);
        assert_eq!(bytes.remaining(), 1);
    }

    #[test]
    fn test_unpack_properties_rejects_unknown_and_disallowed() {
        let allowed = allowed_properties(PacketType::Publish);

        // Not a property identifier at all
        let mut bytes = Cursor::new(&[2, 0x05, 0][..]);
        assert_eq!(
            unpack_properties(allowed, &mut bytes),
            Err(MalformedPacket::PropertyNotAllowed(0x05))
        );

        // Session expiry is fine in CONNECT but not in PUBLISH
        let mut bytes = Cursor::new(&[5, 17, 0, 0, 0, 1][..]);
        assert_eq!(
            unpack_properties(allowed, &mut bytes),
            Err(MalformedPacket::PropertyNotAllowed(17))
        );
    }

    #[test]
    fn test_unpack_properties_duplicates() {
        let allowed = allowed_properties(PacketType::Publish);

        let mut bytes = Cursor::new(&[6, 35, 0, 1, 35, 0, 2][..]);
        assert_eq!(
            unpack_properties(allowed, &mut bytes),
            Err(MalformedPacket::DuplicateProperty(PropertyId::TopicAlias))
        );

        let mut bytes = Cursor::new(&[4, 11, 1, 11, 2][..]);
        let properties = unpack_properties(allowed, &mut bytes).unwrap();
        assert_eq!(
            properties
                .get_all(PropertyId::SubscriptionIdentifier)
                .collect::<Vec<_>>(),
            vec![&PropertyValue::VariableInt(1), &PropertyValue::VariableInt(2)]
        );
    }

    #[test]
    fn test_unpack_properties_value_overruns_block() {
        // Block claims 2 bytes, four byte value inside
        let buf = [2, 2, 0, 0, 0, 0, 0];
        let result = unpack_properties(
            allowed_properties(PacketType::Publish),
            &mut Cursor::new(&buf[..]),
        );
        assert_eq!(
            result,
            Err(MalformedPacket::Truncated {
                needed: 4,
                remaining: 1
            })
        );

        // Block length past the buffer
        let result = unpack_properties(
            allowed_properties(PacketType::Publish),
            &mut Cursor::new(&[9, 35, 0][..]),
        );
        assert!(matches!(result, Err(MalformedPacket::Truncated { .. })));
    }

    #[test]
    fn test_decode_connect_rejects_bad_protocol() {
        let mut buf = pack_connect(&Connect::new("dev1")).unwrap().to_vec();
        buf[4] = b'X';
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::InvalidProtocolName
        );

        let mut buf = pack_connect(&Connect::new("dev1")).unwrap().to_vec();
        buf[8] = 4;
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::UnsupportedProtocolVersion(4)
        );
    }

    #[test]
    fn test_decode_connect_rejects_will() {
        let packet = Connect {
            will: Some(Will::new("t", "m", QoS::AtMostOnce)),
            ..Connect::new("dev1")
        };
        let buf = pack_connect(&packet).unwrap();
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::WillNotSupported
        );
    }

    #[test]
    fn test_decode_connect_rejects_reserved_flag() {
        let mut buf = pack_connect(&Connect::new("dev1")).unwrap().to_vec();
        buf[9] |= 0b0000_0001;
        assert!(matches!(
            malformed(decode_slice(&buf)),
            MalformedPacket::ReservedBitsSet { .. }
        ));
    }

    #[test]
    fn test_decode_connect_truncated_client_id() {
        let buf = [
            0x10, 16, // fixed header
            0, 4, b'M', b'Q', b'T', b'T', 5, 0x02, 0, 60, 0, // variable header
            0, 10, b'd', b'e', b'v', // client id claims 10 bytes
        ];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::Truncated {
                needed: 10,
                remaining: 3
            }
        );
    }

    #[test]
    fn test_decode_connack_rejects_unknown_reason() {
        let buf = [0x20, 3, 0, 6, 0];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::InvalidReasonCode(6)
        );

        // MQTT 3.1.1 refusal codes are understood
        let buf = [0x20, 3, 0, 1, 0];
        let Some(Packet::Connack(connack)) = decode_slice(&buf).unwrap() else {
            panic!("expected connack");
        };
        assert_eq!(
            connack.reason_code,
            ConnectReasonCode::V311UnacceptableProtocolVersion
        );

        let buf = [0x20, 3, 0b10, 0, 0];
        assert!(matches!(
            malformed(decode_slice(&buf)),
            MalformedPacket::ReservedBitsSet { .. }
        ));
    }

    #[test]
    fn test_decode_publish_rejects_qos() {
        let buf = [0x32, 6, 0, 1, b't', 0, 0, 1];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::QosNotSupported(1)
        );

        let buf = [0x34, 4, 0, 1, b't', 0];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::QosNotSupported(2)
        );

        let buf = [0x36, 4, 0, 1, b't', 0];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::QosNotSupported(3)
        );
    }

    #[test]
    fn test_decode_publish_empty_payload() {
        let buf = [0x31, 4, 0, 1, b't', 0];
        let packet = decode_slice(&buf).unwrap().unwrap();
        let Packet::Publish(publish) = packet else {
            panic!("expected publish");
        };
        assert!(publish.retain);
        assert!(publish.payload.is_empty());
    }

    #[test]
    fn test_decode_subscribe() {
        // Subscribe packet *without* Subscription Identifier
        let buf = [
            0x82, 0x0a, 0x00, 0x01, 0x00, 0x00, 0x04, 0x74, 0x65, 0x73, 0x74, 0x00,
        ];
        assert_eq!(
            decode_slice(&buf).unwrap().unwrap(),
            Packet::Subscribe(Subscribe::new("test", 1))
        );

        // Subscribe packet with Subscription Identifier
        let buf = [
            0x82, 0x0c, 0xff, 0xf6, 0x02, 0x0b, 0x01, 0x00, 0x04, 0x74, 0x65, 0x73, 0x74, 0x02,
        ];
        let Packet::Subscribe(subscribe) = decode_slice(&buf).unwrap().unwrap() else {
            panic!("expected subscribe");
        };
        assert_eq!(subscribe.packet_id, 65526);
        assert_eq!(subscribe.topic_filters, vec!["test".to_string()]);
        assert_eq!(
            subscribe.properties.get(PropertyId::SubscriptionIdentifier),
            Some(&PropertyValue::VariableInt(1))
        );
    }

    #[test]
    fn test_decode_subscribe_rejects_bad_options_and_empty() {
        let buf = [0x82, 7, 0, 1, 0, 0, 1, b't', 0b0100_0000];
        assert!(matches!(
            malformed(decode_slice(&buf)),
            MalformedPacket::ReservedBitsSet { .. }
        ));

        let buf = [0x82, 3, 0, 1, 0];
        assert_eq!(malformed(decode_slice(&buf)), MalformedPacket::NoTopicFilters);

        let buf = [0xA2, 3, 0, 1, 0];
        assert_eq!(malformed(decode_slice(&buf)), MalformedPacket::NoTopicFilters);
    }

    #[test]
    fn test_decode_rejects_wrong_fixed_flags() {
        // SUBSCRIBE must carry 0b0010
        let buf = [0x80, 7, 0, 1, 0, 0, 1, b't', 0];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::InvalidFlags {
                packet_type: PacketType::Subscribe,
                flags: 0
            }
        );

        let buf = [0xC1, 0];
        assert!(matches!(
            malformed(decode_slice(&buf)),
            MalformedPacket::InvalidFlags { .. }
        ));

        // Rejected from the fixed header alone, before the body arrives
        let buf = [0x62, 100];
        assert_eq!(decode_slice(&buf).unwrap(), None);
        let buf = [0x60, 100];
        assert_eq!(
            malformed(decode_slice(&buf)),
            MalformedPacket::InvalidFlags {
                packet_type: PacketType::Pubrel,
                flags: 0
            }
        );
    }

    #[test]
    fn test_decode_disconnect() {
        assert_eq!(
            decode_slice(&[0xE0, 0]).unwrap().unwrap(),
            Packet::Disconnect(Disconnect::new(DisconnectReasonCode::NormalDisconnection))
        );

        // reason code only
        assert_eq!(
            decode_slice(&[0xE0, 1, 142]).unwrap().unwrap(),
            Packet::Disconnect(Disconnect::new(DisconnectReasonCode::SessionTakenOver))
        );

        // unknown reason codes are kept
        assert_eq!(
            decode_slice(&[0xE0, 2, 99, 0]).unwrap().unwrap(),
            Packet::Disconnect(Disconnect::new(DisconnectReason::Unrecognized(99)))
        );
    }

    #[test]
    fn test_decode_puback_defaults() {
        let Packet::Puback(puback) = decode_slice(&[0x40, 2, 0, 5]).unwrap().unwrap() else {
            panic!("expected puback");
        };
        assert_eq!(puback.packet_id, 5);
        assert_eq!(puback.reason_code, PubackReasonCode::Success);
        assert!(puback.properties.is_empty());

        assert_eq!(
            malformed(decode_slice(&[0x50, 3, 0, 5, 146])),
            MalformedPacket::InvalidReasonCode(146)
        );
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        assert_eq!(
            malformed(decode_slice(&[0xC0, 1, 0])),
            MalformedPacket::TrailingBytes(1)
        );
        assert_eq!(
            malformed(decode_slice(&[0x20, 4, 0, 0, 0, 9])),
            MalformedPacket::TrailingBytes(1)
        );
    }

    #[test]
    fn test_decode_waits_for_whole_packet() {
        let packed = pack_publish(&Publish::new("a/b", "hello")).unwrap();

        for end in 0..packed.len() {
            let mut bytes = BytesMut::from(&packed[..end]);
            assert_eq!(decode_mqtt(&mut bytes).unwrap(), None);
            assert_eq!(bytes.len(), end);
        }
    }

    fn sample_value(id: PropertyId) -> PropertyValue {
        match id.value_type() {
            PropertyType::Byte => PropertyValue::Byte(1),
            PropertyType::TwoByteInt => PropertyValue::TwoByteInt(1),
            PropertyType::FourByteInt => PropertyValue::FourByteInt(1),
            PropertyType::VariableInt => PropertyValue::VariableInt(1),
            PropertyType::String => PropertyValue::String("s".into()),
            PropertyType::Binary => PropertyValue::Binary(vec![1].into()),
            PropertyType::StringPair => PropertyValue::StringPair("k".into(), "v".into()),
        }
    }

    #[test]
    fn test_property_allow_list_for_every_packet_type() {
        // Body bytes before and after the property block
        let layouts: [(PacketType, &[u8], &[u8]); 12] = [
            (
                PacketType::Connect,
                &[0, 4, b'M', b'Q', b'T', b'T', 5, 0x02, 0, 60],
                &[0, 1, b'c'],
            ),
            (PacketType::Connack, &[0, 0], &[]),
            (PacketType::Publish, &[0, 1, b't'], &[]),
            (PacketType::Puback, &[0, 1, 0], &[]),
            (PacketType::Pubrec, &[0, 1, 0], &[]),
            (PacketType::Pubrel, &[0, 1, 0], &[]),
            (PacketType::Pubcomp, &[0, 1, 0], &[]),
            (PacketType::Subscribe, &[0, 1], &[0, 1, b't', 0]),
            (PacketType::Suback, &[0, 1], &[]),
            (PacketType::Unsubscribe, &[0, 1], &[0, 1, b't']),
            (PacketType::Unsuback, &[0, 1], &[]),
            (PacketType::Disconnect, &[4], &[]),
        ];

        for (packet_type, before, after) in layouts {
            let allowed = allowed_properties(packet_type);
            let flags = packet_type.fixed_flags().unwrap_or(0);

            let id = PropertyId::ALL
                .into_iter()
                .find(|id| !allowed.contains(id))
                .unwrap();

            let mut properties = Properties::new();
            properties.insert(id, sample_value(id)).unwrap();
            let mut block = BytesMut::new();
            pack_properties(&properties, &mut block).unwrap();

            let mut body = before.to_vec();
            body.extend_from_slice(&block);
            body.extend_from_slice(after);
            assert_eq!(
                unpack_packet(packet_type, flags, &body),
                Err(MalformedPacket::PropertyNotAllowed(id as u8)),
                "{:?} accepted {:?}",
                packet_type,
                id
            );

            // The same layout with an allowed property decodes
            let allowed_id = allowed[0];
            let mut properties = Properties::new();
            properties.insert(allowed_id, sample_value(allowed_id)).unwrap();
            let mut block = BytesMut::new();
            pack_properties(&properties, &mut block).unwrap();

            let mut body = before.to_vec();
            body.extend_from_slice(&block);
            body.extend_from_slice(after);
            assert!(
                unpack_packet(packet_type, flags, &body).is_ok(),
                "{:?} rejected {:?}",
                packet_type,
                allowed_id
            );
        }
    }
}
