//! Message types of the ESPHome native API.
//!
//! Every message travelling on an API connection is identified by a numeric type and
//! carries a protobuf payload. [`RawMessage`] is the undecoded form produced by the frame
//! codecs, [`ProtoMessage`] the decoded one.

mod messages;
mod object_id;

pub use self::messages::*;
pub use self::object_id::{entity_key, object_id};

use bytes::Bytes;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("malformed {} payload", .message_type.name())]
    Decode {
        message_type: MessageType,
        source: prost::DecodeError,
    },
}

macro_rules! api_messages {
    ($( $id:literal => $name:ident, )+) => {
        /// Numeric message identifiers, as found in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum MessageType {
            $( $name = $id, )+
        }

        impl MessageType {
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )+
                }
            }
        }

        impl TryFrom<u16> for MessageType {
            type Error = Error;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $( $id => Ok(Self::$name), )+
                    other => Err(Error::UnknownMessageType(other)),
                }
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum ProtoMessage {
            $( $name($name), )+
        }

        impl ProtoMessage {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $( Self::$name(_) => MessageType::$name, )+
                }
            }

            pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, Error> {
                match message_type {
                    $(
                        MessageType::$name => <$name as prost::Message>::decode(payload)
                            .map(Self::$name)
                            .map_err(|source| Error::Decode { message_type, source }),
                    )+
                }
            }

            /// Serializes the protobuf payload, without any framing.
            pub fn encode_payload(&self) -> Bytes {
                match self {
                    $( Self::$name(msg) => Bytes::from(prost::Message::encode_to_vec(msg)), )+
                }
            }
        }

        $(
            impl From<$name> for ProtoMessage {
                fn from(msg: $name) -> Self {
                    Self::$name(msg)
                }
            }
        )+
    };
}

api_messages! {
    1 => HelloRequest,
    2 => HelloResponse,
    3 => ConnectRequest,
    4 => ConnectResponse,
    5 => DisconnectRequest,
    6 => DisconnectResponse,
    7 => PingRequest,
    8 => PingResponse,
    9 => DeviceInfoRequest,
    10 => DeviceInfoResponse,
    11 => ListEntitiesRequest,
    12 => ListEntitiesBinarySensorResponse,
    15 => ListEntitiesLightResponse,
    16 => ListEntitiesSensorResponse,
    17 => ListEntitiesSwitchResponse,
    18 => ListEntitiesTextSensorResponse,
    19 => ListEntitiesDoneResponse,
    20 => SubscribeStatesRequest,
    21 => BinarySensorStateResponse,
    24 => LightStateResponse,
    25 => SensorStateResponse,
    26 => SwitchStateResponse,
    27 => TextSensorStateResponse,
    28 => SubscribeLogsRequest,
    29 => SubscribeLogsResponse,
    32 => LightCommandRequest,
    33 => SwitchCommandRequest,
    34 => SubscribeHomeassistantServicesRequest,
    36 => GetTimeRequest,
    37 => GetTimeResponse,
    38 => SubscribeHomeAssistantStatesRequest,
    61 => ListEntitiesButtonResponse,
    62 => ButtonCommandRequest,
}

impl From<MessageType> for u16 {
    fn from(message_type: MessageType) -> Self {
        message_type as u16
    }
}

/// A message as carried by a frame: its type id and the undecoded protobuf payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_type: u16,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(message_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    pub fn decode(&self) -> Result<ProtoMessage, Error> {
        let message_type = MessageType::try_from(self.message_type)?;
        ProtoMessage::decode(message_type, &self.payload)
    }
}

impl From<&ProtoMessage> for RawMessage {
    fn from(msg: &ProtoMessage) -> Self {
        Self {
            message_type: u16::from(msg.message_type()),
            payload: msg.encode_payload(),
        }
    }
}

impl From<ProtoMessage> for RawMessage {
    fn from(msg: ProtoMessage) -> Self {
        Self::from(&msg)
    }
}
