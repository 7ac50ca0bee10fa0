//! Noise handshake (`Noise_NNpsk0_25519_ChaChaPoly_SHA256`) as spoken by ESPHome devices.
//!
//! ```text
//! client                                   server
//!   | -- hello frame (empty) ------------->  |
//!   | -- 0x00 | noise message ------------>  |
//!   | <------------ 0x01 | name \0 [mac \0]  |
//!   | <------------------ 0x00 | noise msg   |
//! ```
//!
//! A server failing to authenticate the client answers `0x01 | reason` instead of the
//! last message.

use core::fmt;
use core::str::FromStr;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use bytes::BytesMut;
use futures_util::{SinkExt as _, StreamExt as _};
use noise_protocol::patterns::noise_nn_psk0;
use noise_protocol::{ErrorKind, HandshakeState};
use noise_rust_crypto::{ChaCha20Poly1305, Sha256, X25519};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::Error;
use crate::codec::{Cipher, MessageCodec, NoiseFrameCodec};

pub const PROLOGUE: &[u8] = b"NoiseAPIInit\0\0";

/// Encryption protocol announced in the server hello.
pub const NOISE_PROTOCOL: u8 = 0x01;

pub const HANDSHAKE_MAC_FAILURE: &str = "Handshake MAC failure";

const HANDSHAKE_OK: u8 = 0x00;
const HANDSHAKE_ERROR: u8 = 0x01;

type Handshake = HandshakeState<X25519, ChaCha20Poly1305, Sha256>;

/// Pre-shared key of an encrypted device, usually written as base64.
#[derive(Clone, PartialEq, Eq)]
pub struct NoisePsk([u8; 32]);

impl NoisePsk {
    pub fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }
}

impl FromStr for NoisePsk {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64_STANDARD
            .decode(s.trim())
            .map_err(|_| Error::InvalidKey("not valid base64"))?;

        let key = <[u8; 32]>::try_from(decoded.as_slice()).map_err(|_| Error::InvalidKey("expected 32 bytes"))?;

        Ok(Self(key))
    }
}

impl fmt::Debug for NoisePsk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoisePsk(<redacted>)")
    }
}

/// Identity announced by the server before the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub name: String,
    pub mac_address: Option<String>,
}

impl ServerHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.name.len() + self.mac_address.as_ref().map_or(0, String::len));

        out.push(NOISE_PROTOCOL);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);

        if let Some(mac_address) = &self.mac_address {
            out.extend_from_slice(mac_address.as_bytes());
            out.push(0);
        }

        out
    }

    /// Parses a server hello frame.
    ///
    /// A frame whose name is not NUL-terminated is a rejection sent in place of the hello,
    /// reported as [`Error::HandshakeRejected`].
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        let (&protocol, rest) = frame
            .split_first()
            .ok_or(Error::MalformedFrame("empty server hello"))?;

        if protocol != NOISE_PROTOCOL {
            return Err(Error::UnsupportedEncryption(protocol));
        }

        let Some(name_end) = rest.iter().position(|&b| b == 0) else {
            return Err(Error::HandshakeRejected(String::from_utf8_lossy(rest).into_owned()));
        };

        let name = String::from_utf8_lossy(&rest[..name_end]).into_owned();

        let rest = &rest[name_end + 1..];
        let mac_address = rest
            .iter()
            .position(|&b| b == 0)
            .map(|mac_end| String::from_utf8_lossy(&rest[..mac_end]).into_owned());

        Ok(Self { name, mac_address })
    }
}

/// Cipher states resulting from a completed handshake.
pub struct NoiseCiphers {
    pub encrypt: Cipher,
    pub decrypt: Cipher,
}

impl fmt::Debug for NoiseCiphers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoiseCiphers(<redacted>)")
    }
}

impl NoiseCiphers {
    pub fn into_codec(self) -> MessageCodec {
        MessageCodec::noise(self.encrypt, self.decrypt)
    }
}

fn new_handshake(initiator: bool, psk: &NoisePsk) -> Handshake {
    let mut handshake = Handshake::new(noise_nn_psk0(), initiator, PROLOGUE, None, None, None, None);
    handshake.push_psk(psk.as_bytes());
    handshake
}

async fn next_frame<S>(framed: &mut Framed<S, NoiseFrameCodec>) -> Result<BytesMut, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.next().await.ok_or(Error::ConnectionClosed)?
}

/// Sends `0x01 | reason` in a Noise frame, the way a device refuses a client.
pub async fn send_rejection<S>(framed: &mut Framed<S, NoiseFrameCodec>, reason: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut packet = Vec::with_capacity(1 + reason.len());
    packet.push(HANDSHAKE_ERROR);
    packet.extend_from_slice(reason.as_bytes());

    framed.send(packet.as_slice()).await
}

/// Runs the responder side of the handshake.
#[instrument(skip_all)]
pub async fn accept<S>(
    framed: &mut Framed<S, NoiseFrameCodec>,
    psk: &NoisePsk,
    hello: &ServerHello,
) -> Result<NoiseCiphers, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_hello = next_frame(framed).await?;
    trace!(len = client_hello.len(), "Received client hello");

    framed.send(hello.encode().as_slice()).await?;

    let request = next_frame(framed).await?;
    let (&status, message) = request
        .split_first()
        .ok_or(Error::MalformedFrame("empty handshake request"))?;

    if status != HANDSHAKE_OK {
        return Err(Error::MalformedFrame("unexpected handshake request status"));
    }

    let mut handshake = new_handshake(false, psk);

    if let Err(e) = handshake.read_message_vec(message) {
        if matches!(e.kind(), ErrorKind::Decryption) {
            send_rejection(framed, HANDSHAKE_MAC_FAILURE).await?;
            return Err(Error::HandshakeMacFailure);
        }

        return Err(Error::Handshake(format!("{e:?}")));
    }

    let response = handshake
        .write_message_vec(&[])
        .map_err(|e| Error::Handshake(format!("{e:?}")))?;

    let mut packet = Vec::with_capacity(1 + response.len());
    packet.push(HANDSHAKE_OK);
    packet.extend_from_slice(&response);
    framed.send(packet.as_slice()).await?;

    let (decrypt, encrypt) = handshake.get_ciphers();

    debug!("Noise handshake completed");

    Ok(NoiseCiphers { encrypt, decrypt })
}

/// Runs the initiator side of the handshake.
///
/// When `expected_name` is set, a server announcing another name is refused.
#[instrument(skip_all)]
pub async fn initiate<S>(
    framed: &mut Framed<S, NoiseFrameCodec>,
    psk: &NoisePsk,
    expected_name: Option<&str>,
) -> Result<(NoiseCiphers, ServerHello), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = new_handshake(true, psk);

    let request = handshake
        .write_message_vec(&[])
        .map_err(|e| Error::Handshake(format!("{e:?}")))?;

    let mut packet = Vec::with_capacity(1 + request.len());
    packet.push(HANDSHAKE_OK);
    packet.extend_from_slice(&request);

    framed.feed(&b""[..]).await?;
    framed.send(packet.as_slice()).await?;

    let hello = ServerHello::decode(&next_frame(framed).await?)?;
    trace!(name = %hello.name, "Received server hello");

    if let Some(expected_name) = expected_name
        && hello.name != expected_name
    {
        return Err(Error::ServerNameMismatch {
            expected: expected_name.to_owned(),
            actual: hello.name,
        });
    }

    let response = next_frame(framed).await?;
    let (&status, message) = response
        .split_first()
        .ok_or(Error::MalformedFrame("empty handshake response"))?;

    if status != HANDSHAKE_OK {
        return Err(Error::HandshakeRejected(String::from_utf8_lossy(message).into_owned()));
    }

    handshake.read_message_vec(message).map_err(|e| match e.kind() {
        ErrorKind::Decryption => Error::HandshakeMacFailure,
        _ => Error::Handshake(format!("{e:?}")),
    })?;

    let (encrypt, decrypt) = handshake.get_ciphers();

    debug!(server = %hello.name, "Noise handshake completed");

    Ok((NoiseCiphers { encrypt, decrypt }, hello))
}
