use super::properties::{Properties, PropertyId, PropertyType};
use bytes::Bytes;
use num_enum::TryFromPrimitive;
use std::fmt;

/// Every way an incoming packet can violate the wire format.
///
/// A peer that sends any of these must be disconnected, see
/// [`MalformedPacket::reason_code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("expected {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("variable byte integer is longer than 4 bytes")]
    VariableIntTooLong,
    #[error("property identifier {0:#04x} is not allowed in this packet")]
    PropertyNotAllowed(u8),
    #[error("property {0:?} appears more than once")]
    DuplicateProperty(PropertyId),
    #[error("invalid reason code {0}")]
    InvalidReasonCode(u8),
    #[error("protocol name is not \"MQTT\"")]
    InvalidProtocolName,
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),
    #[error("reserved bits set in {field}: {value:#010b}")]
    ReservedBitsSet { field: &'static str, value: u8 },
    #[error("will message is not supported")]
    WillNotSupported,
    #[error("publish with QoS {0} is not supported")]
    QosNotSupported(u8),
    #[error("invalid fixed header flags {flags:#06b} for {packet_type:?}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },
    #[error("packet carries no topic filters")]
    NoTopicFilters,
    #[error("{0} unexpected bytes after packet body")]
    TrailingBytes(usize),
}

impl MalformedPacket {
    /// The reason code to disconnect a peer with after this failure.
    pub fn reason_code(&self) -> DisconnectReasonCode {
        DisconnectReasonCode::MalformedPacket
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] MalformedPacket),
    #[error("unsupported packet type {}", packet_type_name(*(.0)))]
    UnsupportedPacketType(u8),
    #[error("packet of {size} bytes exceeds the maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, DecodeError::Malformed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("string of {0} bytes does not fit a two byte length prefix")]
    StringTooLong(usize),
    #[error("binary data of {0} bytes does not fit a two byte length prefix")]
    BinaryTooLong(usize),
    #[error("{0} does not fit a variable byte integer")]
    VariableIntTooLarge(usize),
    #[error("packet carries no topic filters")]
    NoTopicFilters,
    #[error("property {id:?} takes a {expected:?} value")]
    PropertyTypeMismatch { id: PropertyId, expected: PropertyType },
    #[error("packet of {size} bytes exceeds the maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// The flags nibble this packet type must carry, or `None` for PUBLISH
    /// whose flags hold DUP, QoS and RETAIN.
    pub fn fixed_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => {
                Some(0b0000_0010)
            }
            _ => Some(0b0000_0000),
        }
    }
}

impl PacketType {
    fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::Puback => "PUBACK",
            PacketType::Pubrec => "PUBREC",
            PacketType::Pubrel => "PUBREL",
            PacketType::Pubcomp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::Suback => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::Unsuback => "UNSUBACK",
            PacketType::Pingreq => "PINGREQ",
            PacketType::Pingresp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }
}

/// Renders as `NAME(n)`, e.g. `PUBLISH(3)`.
impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Names a raw packet type number, `UNKNOWN(n)` when it has no type.
pub fn packet_type_name(value: u8) -> String {
    match PacketType::try_from(value) {
        Ok(packet_type) => packet_type.to_string(),
        Err(_) => format!("UNKNOWN({})", value),
    }
}

/// The first two fields of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub first_byte: u8,
    pub remaining_length: usize,
    /// Bytes taken by the first byte and the remaining length field.
    pub header_len: usize,
}

impl FixedHeader {
    /// Resolves the packet type nibble; an unknown value is handed back raw.
    pub fn packet_type(&self) -> Result<PacketType, u8> {
        super::decoder::unpack_packet_type(self.first_byte)
    }

    pub fn flags(&self) -> u8 {
        self.first_byte & 0b0000_1111
    }

    pub fn packet_len(&self) -> usize {
        self.header_len + self.remaining_length
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,  // QoS 0
    AtLeastOnce = 1, // QoS 1
    ExactlyOnce = 2, // QoS 2
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum ConnectReasonCode {
    Success = 0,
    // MQTT 3.1.1 return codes, sent by servers that refuse version 5
    V311UnacceptableProtocolVersion = 1,
    V311IdentifierRejected = 2,
    V311ServerUnavailable = 3,
    V311BadUserNameOrPassword = 4,
    V311NotAuthorized = 5,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    UnsupportedProtocolVersion = 132,
    ClientIdentifierNotValid = 133,
    BadUserNameOrPassword = 134,
    NotAuthorized = 135,
    ServerUnavailable = 136,
    ServerBusy = 137,
    Banned = 138,
    BadAuthenticationMethod = 140,
    TopicNameInvalid = 144,
    PacketTooLarge = 149,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QosNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    ConnectionRateExceeded = 159,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum DisconnectReasonCode {
    NormalDisconnection = 0,
    DisconnectWithWillMessage = 4,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    ServerBusy = 137,
    ServerShuttingDown = 139,
    BadAuthenticationMethod = 140,
    KeepAliveTimeout = 141,
    SessionTakenOver = 142,
    TopicFilterInvalid = 143,
    TopicNameInvalid = 144,
    ReceiveMaximumExceeded = 147,
    TopicAliasInvalid = 148,
    PacketTooLarge = 149,
    MessageRateTooHigh = 150,
    QuotaExceeded = 151,
    AdministrativeAction = 152,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QosNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    SharedSubscriptionNotSupported = 158,
    ConnectionRateExceeded = 159,
    MaximumConnectTime = 160,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

/// DISCONNECT reason as read off the wire.
///
/// Disconnect reasons are advisory, so a code outside
/// [`DisconnectReasonCode`] is kept rather than rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Known(DisconnectReasonCode),
    Unrecognized(u8),
}

impl DisconnectReason {
    pub fn from_byte(value: u8) -> Self {
        match DisconnectReasonCode::try_from(value) {
            Ok(code) => DisconnectReason::Known(code),
            Err(_) => DisconnectReason::Unrecognized(value),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            DisconnectReason::Known(code) => code as u8,
            DisconnectReason::Unrecognized(value) => value,
        }
    }
}

impl Default for DisconnectReason {
    fn default() -> Self {
        DisconnectReason::Known(DisconnectReasonCode::NormalDisconnection)
    }
}

impl From<DisconnectReasonCode> for DisconnectReason {
    fn from(code: DisconnectReasonCode) -> Self {
        DisconnectReason::Known(code)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum PubackReasonCode {
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum PubrecReasonCode {
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

/// Shared by PUBREL and PUBCOMP.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum PubrelReasonCode {
    Success = 0,
    PacketIdentifierNotFound = 146,
}

pub type PubcompReasonCode = PubrelReasonCode;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum SubackReasonCode {
    GrantedQoSZero = 0,
    GrantedQoSOne = 1,
    GrantedQoSTwo = 2,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    SharedSubscriptionsNotSupported = 158,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum UnsubackReasonCode {
    Success = 0,
    NoSubscriptionExisted = 17,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
}

// Payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl Will {
    pub fn new(topic: impl Into<String>, message: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos,
            retain: false,
            properties: Properties::new(),
        }
    }
}

// Control Packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    // Variable header
    pub clean_start: bool,
    pub keep_alive: u16,
    pub properties: Properties,

    // Payload
    pub client_id: String,
    /// Encoded, but a CONNECT carrying a will is rejected on decode.
    pub will: Option<Will>,
    pub user_name: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            clean_start: false,
            keep_alive: 0,
            properties: Properties::new(),
            client_id: client_id.into(),
            will: None,
            user_name: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connack {
    // Variable header
    pub session_present: bool,
    pub reason_code: ConnectReasonCode,
    pub properties: Properties,
}

/// QoS 0 PUBLISH; it carries no packet identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    // Fixed header
    pub retain: bool,

    // Variable header
    pub topic: String,
    pub properties: Properties,

    // Payload
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            retain: false,
            topic: topic.into(),
            properties: Properties::new(),
            payload: payload.into(),
        }
    }

    pub fn with_topic_alias(mut self, topic_alias: Option<u16>) -> Self {
        if let Some(alias) = topic_alias {
            self.properties.put(
                PropertyId::TopicAlias,
                super::properties::PropertyValue::TwoByteInt(alias),
            );
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puback {
    // Variable header
    pub packet_id: u16,
    pub reason_code: PubackReasonCode,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubrec {
    // Variable header
    pub packet_id: u16,
    pub reason_code: PubrecReasonCode,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubrel {
    // Variable header
    pub packet_id: u16,
    pub reason_code: PubrelReasonCode,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubcomp {
    // Variable header
    pub packet_id: u16,
    pub reason_code: PubcompReasonCode,
    pub properties: Properties,
}

/// Every filter is written with subscription options byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    // Variable header
    pub packet_id: u16,
    pub properties: Properties,

    // Payload
    pub topic_filters: Vec<String>,
}

impl Subscribe {
    pub fn new(topic_filter: impl Into<String>, packet_id: u16) -> Self {
        Self {
            packet_id,
            properties: Properties::new(),
            topic_filters: vec![topic_filter.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    // Variable header
    pub packet_id: u16,
    pub properties: Properties,

    // Payload
    pub reason_codes: Vec<SubackReasonCode>,
}

impl Suback {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            properties: Properties::new(),
            reason_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    // Variable header
    pub packet_id: u16,
    pub properties: Properties,

    // Payload
    pub topic_filters: Vec<String>,
}

impl Unsubscribe {
    pub fn new(topic_filter: impl Into<String>, packet_id: u16) -> Self {
        Self {
            packet_id,
            properties: Properties::new(),
            topic_filters: vec![topic_filter.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsuback {
    // Variable header
    pub packet_id: u16,
    pub properties: Properties,

    // Payload
    pub reason_codes: Vec<UnsubackReasonCode>,
}

impl Unsuback {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            properties: Properties::new(),
            reason_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disconnect {
    // Variable header
    pub reason: DisconnectReason,
    pub properties: Properties,
}

impl Disconnect {
    pub fn new(reason: impl Into<DisconnectReason>) -> Self {
        Self {
            reason: reason.into(),
            properties: Properties::new(),
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(Puback),
    Pubrec(Pubrec),
    Pubrel(Pubrel),
    Pubcomp(Pubcomp),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect(Disconnect),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback(_) => PacketType::Puback,
            Packet::Pubrec(_) => PacketType::Pubrec,
            Packet::Pubrel(_) => PacketType::Pubrel,
            Packet::Pubcomp(_) => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback(_) => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Properties of packets that carry a property block.
    pub fn properties(&self) -> Option<&Properties> {
        match self {
            Packet::Connect(p) => Some(&p.properties),
            Packet::Connack(p) => Some(&p.properties),
            Packet::Publish(p) => Some(&p.properties),
            Packet::Puback(p) => Some(&p.properties),
            Packet::Pubrec(p) => Some(&p.properties),
            Packet::Pubrel(p) => Some(&p.properties),
            Packet::Pubcomp(p) => Some(&p.properties),
            Packet::Subscribe(p) => Some(&p.properties),
            Packet::Suback(p) => Some(&p.properties),
            Packet::Unsubscribe(p) => Some(&p.properties),
            Packet::Unsuback(p) => Some(&p.properties),
            Packet::Disconnect(p) => Some(&p.properties),
            Packet::Pingreq | Packet::Pingresp => None,
        }
    }

    pub fn fixed_header_flags(&self) -> u8 {
        match self {
            Packet::Publish(publish) => {
                // QoS bits stay clear, only QoS 0 is produced
                if publish.retain {
                    0b0000_0001
                } else {
                    0b0000_0000
                }
            }
            other => other.packet_type().fixed_flags().unwrap_or(0),
        }
    }
}

macro_rules! impl_from_packet {
    ($($variant: ident),+) => {
        $(
            impl From<$variant> for Packet {
                fn from(packet: $variant) -> Self {
                    Packet::$variant(packet)
                }
            }
        )+
    };
}

impl_from_packet!(
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Disconnect
);
