//! Server and client sides of the ESPHome native API.
//!
//! The server half ([`EspHomeServer`]) lets a process pose as an ESPHome device: it
//! answers the connection setup (hello, password, device info, ping, disconnect), lists
//! entities, streams their states and reports commands. The client half ([`ApiClient`])
//! drives such a device. Both speak the plaintext and the Noise encrypted framings.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod entity;
pub mod noise;
pub mod server;

pub use esphome_api_proto as proto;

pub use self::client::{ApiClient, ApiConnectionInfo, ClientConnection};
pub use self::config::DeviceConfig;
pub use self::entity::{Command, Entity, EntityState};
pub use self::noise::NoisePsk;
pub use self::server::{EspHomeServer, ServerEvent, ServerHandle};

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Proto(#[from] proto::Error),
    #[error("invalid frame preamble 0x{0:02X}")]
    BadPreamble(u8),
    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("encryption is required")]
    RequiresEncryption,
    #[error("encryption is not enabled on this device")]
    EncryptionNotEnabled,
    #[error("invalid encryption key: {0}")]
    InvalidKey(&'static str),
    #[error("unsupported encryption protocol {0}")]
    UnsupportedEncryption(u8),
    #[error("expected server name {expected:?}, got {actual:?}")]
    ServerNameMismatch { expected: String, actual: String },
    #[error("handshake MAC failure")]
    HandshakeMacFailure,
    #[error("handshake rejected by peer: {0}")]
    HandshakeRejected(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("failed to decrypt frame")]
    Decryption,
    #[error("invalid password")]
    InvalidPassword,
    #[error("message {0} requires authentication")]
    AuthenticationRequired(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("peer requested disconnection")]
    DisconnectRequested,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected message {0}")]
    UnexpectedMessage(&'static str),
    #[error("duplicate entity key {0}")]
    DuplicateEntityKey(u32),
    #[error("unknown entity key {0}")]
    UnknownEntityKey(u32),
    #[error("entity {key} is a {expected}, not a {actual}")]
    EntityKindMismatch {
        key: u32,
        expected: &'static str,
        actual: &'static str,
    },
}

// `io::Error` is not `Clone`; its kind and message are kept.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Proto(e) => Error::Proto(e.clone()),
            Error::BadPreamble(preamble) => Error::BadPreamble(*preamble),
            Error::FrameTooLarge { size, max } => Error::FrameTooLarge { size: *size, max: *max },
            Error::MalformedFrame(what) => Error::MalformedFrame(*what),
            Error::RequiresEncryption => Error::RequiresEncryption,
            Error::EncryptionNotEnabled => Error::EncryptionNotEnabled,
            Error::InvalidKey(what) => Error::InvalidKey(*what),
            Error::UnsupportedEncryption(protocol) => Error::UnsupportedEncryption(*protocol),
            Error::ServerNameMismatch { expected, actual } => Error::ServerNameMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Error::HandshakeMacFailure => Error::HandshakeMacFailure,
            Error::HandshakeRejected(reason) => Error::HandshakeRejected(reason.clone()),
            Error::Handshake(reason) => Error::Handshake(reason.clone()),
            Error::Decryption => Error::Decryption,
            Error::InvalidPassword => Error::InvalidPassword,
            Error::AuthenticationRequired(message) => Error::AuthenticationRequired(*message),
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::DisconnectRequested => Error::DisconnectRequested,
            Error::Timeout(what) => Error::Timeout(*what),
            Error::UnexpectedMessage(message) => Error::UnexpectedMessage(*message),
            Error::DuplicateEntityKey(key) => Error::DuplicateEntityKey(*key),
            Error::UnknownEntityKey(key) => Error::UnknownEntityKey(*key),
            Error::EntityKindMismatch { key, expected, actual } => Error::EntityKindMismatch {
                key: *key,
                expected: *expected,
                actual: *actual,
            },
        }
    }
}

impl Error {
    /// Errors caused by a peer going away or probing the port rather than by a fault.
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::DisconnectRequested => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Errors caused by a peer that does not satisfy the device's access policy.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Error::RequiresEncryption
                | Error::EncryptionNotEnabled
                | Error::HandshakeMacFailure
                | Error::InvalidPassword
                | Error::AuthenticationRequired(_)
        )
    }
}
