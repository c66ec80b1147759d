use super::{
    connect_flags,
    properties::{Properties, PropertyValue},
    types::{
        Connack, Connect, Disconnect, EncodeError, Packet, PacketType, Puback, Pubcomp, Publish,
        Pubrec, Pubrel, Suback, Subscribe, Unsuback, Unsubscribe,
    },
    MAX_FIELD_LEN, MAX_VARIABLE_INT, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};

pub fn encode_variable_int(value: usize, bytes: &mut BytesMut) -> Result<usize, EncodeError> {
    if value > MAX_VARIABLE_INT {
        return Err(EncodeError::VariableIntTooLarge(value));
    }

    let mut x = value;
    let mut byte_counter = 0;

    loop {
        let mut encoded_byte: u8 = (x % 128) as u8;
        x /= 128;

        if x > 0 {
            encoded_byte |= 128;
        }

        bytes.put_u8(encoded_byte);

        byte_counter += 1;

        if x == 0 {
            break;
        }
    }

    Ok(byte_counter)
}

pub fn encode_string(value: &str, bytes: &mut BytesMut) -> Result<(), EncodeError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(EncodeError::StringTooLong(value.len()));
    }

    bytes.put_u16(value.len() as u16);
    bytes.put_slice(value.as_bytes());
    Ok(())
}

pub fn encode_binary_data(value: &[u8], bytes: &mut BytesMut) -> Result<(), EncodeError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(EncodeError::BinaryTooLong(value.len()));
    }

    bytes.put_u16(value.len() as u16);
    bytes.put_slice(value);
    Ok(())
}

fn encode_property_value(value: &PropertyValue, bytes: &mut BytesMut) -> Result<(), EncodeError> {
    match value {
        PropertyValue::Byte(v) => bytes.put_u8(*v),
        PropertyValue::TwoByteInt(v) => bytes.put_u16(*v),
        PropertyValue::FourByteInt(v) => bytes.put_u32(*v),
        PropertyValue::VariableInt(v) => {
            encode_variable_int(*v as usize, bytes)?;
        }
        PropertyValue::String(v) => encode_string(v, bytes)?,
        PropertyValue::Binary(v) => encode_binary_data(v, bytes)?,
        PropertyValue::StringPair(key, value) => {
            encode_string(key, bytes)?;
            encode_string(value, bytes)?;
        }
    }

    Ok(())
}

/// Writes the property block: its length, then identifier and value for
/// each entry.
pub fn pack_properties(properties: &Properties, bytes: &mut BytesMut) -> Result<(), EncodeError> {
    let mut block = BytesMut::new();
    for (id, value) in properties {
        block.put_u8(*id as u8);
        encode_property_value(value, &mut block)?;
    }

    encode_variable_int(block.len(), bytes)?;
    bytes.put_slice(&block);
    Ok(())
}

pub fn pack_fixed_header(
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
    bytes: &mut BytesMut,
) -> Result<(), EncodeError> {
    if remaining_length > MAX_VARIABLE_INT {
        return Err(EncodeError::PacketTooLarge {
            size: remaining_length,
            max: MAX_VARIABLE_INT,
        });
    }

    let first_byte = ((packet_type as u8) << 4) | (flags & 0b0000_1111);
    bytes.put_u8(first_byte);
    encode_variable_int(remaining_length, bytes)?;
    Ok(())
}

fn finish(packet_type: PacketType, flags: u8, body: BytesMut) -> Result<Bytes, EncodeError> {
    let mut bytes = BytesMut::with_capacity(1 + 4 + body.len());
    pack_fixed_header(packet_type, flags, body.len(), &mut bytes)?;
    bytes.unsplit(body);
    Ok(bytes.freeze())
}

fn required_flags(packet_type: PacketType) -> u8 {
    packet_type.fixed_flags().unwrap_or(0)
}

pub fn pack_connect(packet: &Connect) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    encode_string(PROTOCOL_NAME, &mut body)?;
    body.put_u8(PROTOCOL_VERSION);

    let mut flags: u8 = 0;

    if packet.clean_start {
        flags |= connect_flags::CLEAN_START;
    }

    if let Some(will) = &packet.will {
        flags |= connect_flags::WILL_FLAG;
        flags |= ((will.qos as u8) << connect_flags::WILL_QOS_SHIFT)
            & (connect_flags::WILL_QOS_1 | connect_flags::WILL_QOS_2);

        if will.retain {
            flags |= connect_flags::WILL_RETAIN;
        }
    }

    if packet.password.is_some() {
        flags |= connect_flags::PASSWORD_FLAG;
    }

    if packet.user_name.is_some() {
        flags |= connect_flags::USER_NAME_FLAG;
    }

    body.put_u8(flags);
    body.put_u16(packet.keep_alive);
    pack_properties(&packet.properties, &mut body)?;

    encode_string(&packet.client_id, &mut body)?;

    if let Some(will) = &packet.will {
        pack_properties(&will.properties, &mut body)?;
        encode_string(&will.topic, &mut body)?;
        encode_binary_data(&will.message, &mut body)?;
    }

    if let Some(user_name) = &packet.user_name {
        encode_string(user_name, &mut body)?;
    }

    if let Some(password) = &packet.password {
        encode_binary_data(password, &mut body)?;
    }

    finish(PacketType::Connect, required_flags(PacketType::Connect), body)
}

pub fn pack_connack(packet: &Connack) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    body.put_u8(packet.session_present as u8);
    body.put_u8(packet.reason_code as u8);
    pack_properties(&packet.properties, &mut body)?;

    finish(PacketType::Connack, required_flags(PacketType::Connack), body)
}

pub fn pack_publish(packet: &Publish) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    encode_string(&packet.topic, &mut body)?;
    pack_properties(&packet.properties, &mut body)?;

    // This payload does not have a length prefix
    body.put_slice(&packet.payload);

    let flags = if packet.retain { 0b0000_0001 } else { 0b0000_0000 };
    finish(PacketType::Publish, flags, body)
}

// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout. Reason code and
// properties are left out when they hold nothing but defaults.
fn pack_publish_ack(
    packet_type: PacketType,
    packet_id: u16,
    reason_code: u8,
    properties: &Properties,
) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);

    if reason_code != 0 || !properties.is_empty() {
        body.put_u8(reason_code);

        if !properties.is_empty() {
            pack_properties(properties, &mut body)?;
        }
    }

    finish(packet_type, required_flags(packet_type), body)
}

pub fn pack_puback(packet: &Puback) -> Result<Bytes, EncodeError> {
    pack_publish_ack(
        PacketType::Puback,
        packet.packet_id,
        packet.reason_code as u8,
        &packet.properties,
    )
}

pub fn pack_pubrec(packet: &Pubrec) -> Result<Bytes, EncodeError> {
    pack_publish_ack(
        PacketType::Pubrec,
        packet.packet_id,
        packet.reason_code as u8,
        &packet.properties,
    )
}

pub fn pack_pubrel(packet: &Pubrel) -> Result<Bytes, EncodeError> {
    pack_publish_ack(
        PacketType::Pubrel,
        packet.packet_id,
        packet.reason_code as u8,
        &packet.properties,
    )
}

pub fn pack_pubcomp(packet: &Pubcomp) -> Result<Bytes, EncodeError> {
    pack_publish_ack(
        PacketType::Pubcomp,
        packet.packet_id,
        packet.reason_code as u8,
        &packet.properties,
    )
}

pub fn pack_subscribe(packet: &Subscribe) -> Result<Bytes, EncodeError> {
    // [MQTT-3.8.3-2] At least one topic filter
    if packet.topic_filters.is_empty() {
        return Err(EncodeError::NoTopicFilters);
    }

    let mut body = BytesMut::new();
    body.put_u16(packet.packet_id);
    pack_properties(&packet.properties, &mut body)?;

    for topic_filter in &packet.topic_filters {
        encode_string(topic_filter, &mut body)?;

        // Subscription options: QoS 0, no flags, send retained at subscribe
        body.put_u8(0b0000_0000);
    }

    finish(PacketType::Subscribe, required_flags(PacketType::Subscribe), body)
}

pub fn pack_suback(packet: &Suback) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    body.put_u16(packet.packet_id);
    pack_properties(&packet.properties, &mut body)?;

    for code in &packet.reason_codes {
        body.put_u8(*code as u8);
    }

    finish(PacketType::Suback, required_flags(PacketType::Suback), body)
}

pub fn pack_unsubscribe(packet: &Unsubscribe) -> Result<Bytes, EncodeError> {
    // [MQTT-3.10.3-2] At least one topic filter
    if packet.topic_filters.is_empty() {
        return Err(EncodeError::NoTopicFilters);
    }

    let mut body = BytesMut::new();
    body.put_u16(packet.packet_id);
    pack_properties(&packet.properties, &mut body)?;

    for topic_filter in &packet.topic_filters {
        encode_string(topic_filter, &mut body)?;
    }

    finish(
        PacketType::Unsubscribe,
        required_flags(PacketType::Unsubscribe),
        body,
    )
}

pub fn pack_unsuback(packet: &Unsuback) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    body.put_u16(packet.packet_id);
    pack_properties(&packet.properties, &mut body)?;

    for code in &packet.reason_codes {
        body.put_u8(*code as u8);
    }

    finish(PacketType::Unsuback, required_flags(PacketType::Unsuback), body)
}

pub fn pack_disconnect(packet: &Disconnect) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    body.put_u8(packet.reason.to_byte());
    pack_properties(&packet.properties, &mut body)?;

    finish(
        PacketType::Disconnect,
        required_flags(PacketType::Disconnect),
        body,
    )
}

pub fn pack_pingreq() -> Result<Bytes, EncodeError> {
    finish(PacketType::Pingreq, 0, BytesMut::new())
}

pub fn pack_pingresp() -> Result<Bytes, EncodeError> {
    finish(PacketType::Pingresp, 0, BytesMut::new())
}

/// Encodes a whole packet, fixed header included.
pub fn pack(packet: &Packet) -> Result<Bytes, EncodeError> {
    match packet {
        Packet::Connect(p) => pack_connect(p),
        Packet::Connack(p) => pack_connack(p),
        Packet::Publish(p) => pack_publish(p),
        Packet::Puback(p) => pack_puback(p),
        Packet::Pubrec(p) => pack_pubrec(p),
        Packet::Pubrel(p) => pack_pubrel(p),
        Packet::Pubcomp(p) => pack_pubcomp(p),
        Packet::Subscribe(p) => pack_subscribe(p),
        Packet::Suback(p) => pack_suback(p),
        Packet::Unsubscribe(p) => pack_unsubscribe(p),
        Packet::Unsuback(p) => pack_unsuback(p),
        Packet::Pingreq => pack_pingreq(),
        Packet::Pingresp => pack_pingresp(),
        Packet::Disconnect(p) => pack_disconnect(p),
    }
}

pub fn encode_mqtt(packet: &Packet, bytes: &mut BytesMut) -> Result<(), EncodeError> {
    let packed = pack(packet)?;
    bytes.extend_from_slice(&packed);
    Ok(())
}
