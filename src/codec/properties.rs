//! MQTT 5.0 properties: identifier-tagged values carried in the variable
//! header of most packets and in the will.
//!
//! [`PropertyId::value_type`] is the one table both the encoder and the
//! decoder consult, so a property can never be written with one wire type
//! and read back with another.

use super::types::{EncodeError, PacketType};
use bytes::Bytes;
use num_enum::TryFromPrimitive;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive)]
pub enum PropertyId {
    PayloadFormatIndicator = 1,
    MessageExpiryInterval = 2,
    ContentType = 3,
    ResponseTopic = 8,
    CorrelationData = 9,
    SubscriptionIdentifier = 11,
    SessionExpiryInterval = 17,
    AssignedClientIdentifier = 18,
    ServerKeepAlive = 19,
    AuthenticationMethod = 21,
    AuthenticationData = 22,
    RequestProblemInformation = 23,
    WillDelayInterval = 24,
    RequestResponseInformation = 25,
    ResponseInformation = 26,
    ServerReference = 28,
    ReasonString = 31,
    ReceiveMaximum = 33,
    TopicAliasMaximum = 34,
    TopicAlias = 35,
    MaximumQos = 36,
    RetainAvailable = 37,
    UserProperty = 38,
    MaximumPacketSize = 39,
    WildcardSubscriptionAvailable = 40,
    SubscriptionIdentifierAvailable = 41,
    SharedSubscriptionAvailable = 42,
}

/// Wire representation of a property value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PropertyType {
    Byte,
    TwoByteInt,
    FourByteInt,
    VariableInt,
    String,
    Binary,
    StringPair,
}

impl PropertyId {
    pub const ALL: [PropertyId; 27] = [
        PropertyId::PayloadFormatIndicator,
        PropertyId::MessageExpiryInterval,
        PropertyId::ContentType,
        PropertyId::ResponseTopic,
        PropertyId::CorrelationData,
        PropertyId::SubscriptionIdentifier,
        PropertyId::SessionExpiryInterval,
        PropertyId::AssignedClientIdentifier,
        PropertyId::ServerKeepAlive,
        PropertyId::AuthenticationMethod,
        PropertyId::AuthenticationData,
        PropertyId::RequestProblemInformation,
        PropertyId::WillDelayInterval,
        PropertyId::RequestResponseInformation,
        PropertyId::ResponseInformation,
        PropertyId::ServerReference,
        PropertyId::ReasonString,
        PropertyId::ReceiveMaximum,
        PropertyId::TopicAliasMaximum,
        PropertyId::TopicAlias,
        PropertyId::MaximumQos,
        PropertyId::RetainAvailable,
        PropertyId::UserProperty,
        PropertyId::MaximumPacketSize,
        PropertyId::WildcardSubscriptionAvailable,
        PropertyId::SubscriptionIdentifierAvailable,
        PropertyId::SharedSubscriptionAvailable,
    ];

    pub const fn value_type(self) -> PropertyType {
        match self {
            PropertyId::PayloadFormatIndicator
            | PropertyId::RequestProblemInformation
            | PropertyId::RequestResponseInformation
            | PropertyId::MaximumQos
            | PropertyId::RetainAvailable
            | PropertyId::WildcardSubscriptionAvailable
            | PropertyId::SubscriptionIdentifierAvailable
            | PropertyId::SharedSubscriptionAvailable => PropertyType::Byte,
            PropertyId::ServerKeepAlive
            | PropertyId::ReceiveMaximum
            | PropertyId::TopicAliasMaximum
            | PropertyId::TopicAlias => PropertyType::TwoByteInt,
            PropertyId::MessageExpiryInterval
            | PropertyId::SessionExpiryInterval
            | PropertyId::WillDelayInterval
            | PropertyId::MaximumPacketSize => PropertyType::FourByteInt,
            PropertyId::SubscriptionIdentifier => PropertyType::VariableInt,
            PropertyId::ContentType
            | PropertyId::ResponseTopic
            | PropertyId::AssignedClientIdentifier
            | PropertyId::AuthenticationMethod
            | PropertyId::ResponseInformation
            | PropertyId::ServerReference
            | PropertyId::ReasonString => PropertyType::String,
            PropertyId::CorrelationData | PropertyId::AuthenticationData => PropertyType::Binary,
            PropertyId::UserProperty => PropertyType::StringPair,
        }
    }

    /// Whether the property may occur more than once in one block.
    pub const fn is_repeatable(self) -> bool {
        matches!(
            self,
            PropertyId::UserProperty | PropertyId::SubscriptionIdentifier
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInt(u16),
    FourByteInt(u32),
    VariableInt(u32),
    String(String),
    Binary(Bytes),
    StringPair(String, String),
}

impl PropertyValue {
    pub fn value_type(&self) -> PropertyType {
        match self {
            PropertyValue::Byte(_) => PropertyType::Byte,
            PropertyValue::TwoByteInt(_) => PropertyType::TwoByteInt,
            PropertyValue::FourByteInt(_) => PropertyType::FourByteInt,
            PropertyValue::VariableInt(_) => PropertyType::VariableInt,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Binary(_) => PropertyType::Binary,
            PropertyValue::StringPair(..) => PropertyType::StringPair,
        }
    }
}

/// Properties of one packet, in wire order.
///
/// Repeatable properties accumulate; any other property keeps only the
/// value inserted last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(PropertyId, PropertyValue)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Adds a property, rejecting a value whose type does not match the id.
    pub fn insert(&mut self, id: PropertyId, value: PropertyValue) -> Result<(), EncodeError> {
        let expected = id.value_type();
        if value.value_type() != expected {
            return Err(EncodeError::PropertyTypeMismatch { id, expected });
        }

        self.put(id, value);
        Ok(())
    }

    /// Callers guarantee `value` matches `id.value_type()`.
    pub(crate) fn put(&mut self, id: PropertyId, value: PropertyValue) {
        if !id.is_repeatable() {
            if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == id) {
                entry.1 = value;
                return;
            }
        }

        self.entries.push((id, value));
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.entries.iter().any(|(k, _)| *k == id)
    }

    /// First value stored under `id`.
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.get_all(id).next()
    }

    pub fn get_all(&self, id: PropertyId) -> impl Iterator<Item = &PropertyValue> {
        self.entries
            .iter()
            .filter(move |(k, _)| *k == id)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PropertyId, PropertyValue)> {
        self.entries.iter()
    }

    pub fn topic_alias(&self) -> Option<u16> {
        match self.get(PropertyId::TopicAlias) {
            Some(PropertyValue::TwoByteInt(alias)) => Some(*alias),
            _ => None,
        }
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.get_all(PropertyId::UserProperty)
            .filter_map(|value| match value {
                PropertyValue::StringPair(key, value) => Some((key.as_str(), value.as_str())),
                _ => None,
            })
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = &'a (PropertyId, PropertyValue);
    type IntoIter = std::slice::Iter<'a, (PropertyId, PropertyValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

const CONNECT_PROPERTIES: &[PropertyId] = &[
    PropertyId::SessionExpiryInterval,
    PropertyId::AuthenticationMethod,
    PropertyId::AuthenticationData,
    PropertyId::RequestProblemInformation,
    PropertyId::RequestResponseInformation,
    PropertyId::ReceiveMaximum,
    PropertyId::TopicAliasMaximum,
    PropertyId::UserProperty,
    PropertyId::MaximumPacketSize,
];

const CONNACK_PROPERTIES: &[PropertyId] = &[
    PropertyId::SessionExpiryInterval,
    PropertyId::AssignedClientIdentifier,
    PropertyId::ServerKeepAlive,
    PropertyId::AuthenticationMethod,
    PropertyId::AuthenticationData,
    PropertyId::ResponseInformation,
    PropertyId::ServerReference,
    PropertyId::ReasonString,
    PropertyId::ReceiveMaximum,
    PropertyId::TopicAliasMaximum,
    PropertyId::MaximumQos,
    PropertyId::RetainAvailable,
    PropertyId::UserProperty,
    PropertyId::MaximumPacketSize,
    PropertyId::WildcardSubscriptionAvailable,
    PropertyId::SubscriptionIdentifierAvailable,
    PropertyId::SharedSubscriptionAvailable,
];

const PUBLISH_PROPERTIES: &[PropertyId] = &[
    PropertyId::PayloadFormatIndicator,
    PropertyId::MessageExpiryInterval,
    PropertyId::ContentType,
    PropertyId::ResponseTopic,
    PropertyId::CorrelationData,
    PropertyId::SubscriptionIdentifier,
    PropertyId::TopicAlias,
    PropertyId::UserProperty,
];

// PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK and UNSUBACK
const ACK_PROPERTIES: &[PropertyId] = &[PropertyId::ReasonString, PropertyId::UserProperty];

const SUBSCRIBE_PROPERTIES: &[PropertyId] =
    &[PropertyId::SubscriptionIdentifier, PropertyId::UserProperty];

const UNSUBSCRIBE_PROPERTIES: &[PropertyId] = &[PropertyId::UserProperty];

const DISCONNECT_PROPERTIES: &[PropertyId] = &[
    PropertyId::SessionExpiryInterval,
    PropertyId::ReasonString,
    PropertyId::UserProperty,
    PropertyId::ServerReference,
];

/// Property identifiers a packet of `packet_type` may carry.
pub fn allowed_properties(packet_type: PacketType) -> &'static [PropertyId] {
    match packet_type {
        PacketType::Connect => CONNECT_PROPERTIES,
        PacketType::Connack => CONNACK_PROPERTIES,
        PacketType::Publish => PUBLISH_PROPERTIES,
        PacketType::Puback
        | PacketType::Pubrec
        | PacketType::Pubrel
        | PacketType::Pubcomp
        | PacketType::Suback
        | PacketType::Unsuback => ACK_PROPERTIES,
        PacketType::Subscribe => SUBSCRIBE_PROPERTIES,
        PacketType::Unsubscribe => UNSUBSCRIBE_PROPERTIES,
        PacketType::Disconnect => DISCONNECT_PROPERTIES,
        PacketType::Pingreq | PacketType::Pingresp => &[],
    }
}
