//! Frame codecs for the two ESPHome API transports.
//!
//! Plaintext frames are `0x00 | varint size | varint type | payload`. Noise frames are
//! `0x01 | u16 BE size | payload`; once the handshake is done, each Noise frame carries a
//! ChaCha20-Poly1305 ciphertext of `u16 BE type | u16 BE length | data`.

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use noise_protocol::CipherState;
use noise_rust_crypto::ChaCha20Poly1305;
use tokio_util::codec::{Decoder, Encoder};

use crate::Error;
use crate::proto::{ProtoMessage, RawMessage};

pub const PLAINTEXT_PREAMBLE: u8 = 0x00;
pub const NOISE_PREAMBLE: u8 = 0x01;

/// Upper bound on plaintext payloads.
pub const MAX_PLAINTEXT_PAYLOAD: usize = 1024 * 1024; // 1 MiB

const NOISE_HEADER_SIZE: usize = 3;
const ENCRYPTED_HEADER_SIZE: usize = 4;
const AEAD_TAG_SIZE: usize = 16;
const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024; // 8 kiB

pub type Cipher = CipherState<ChaCha20Poly1305>;

/// Raw Noise frames, used as-is during the handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoiseFrameCodec;

impl Decoder for NoiseFrameCodec {
    type Item = BytesMut;

    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&preamble) = src.first() else {
            return Ok(None);
        };

        if preamble != NOISE_PREAMBLE {
            return Err(Error::BadPreamble(preamble));
        }

        if src.len() < NOISE_HEADER_SIZE {
            return Ok(None);
        }

        let size = usize::from(u16::from_be_bytes([src[1], src[2]]));
        let frame_size = NOISE_HEADER_SIZE + size;

        if src.len() < frame_size {
            let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, frame_size - src.len());
            src.reserve(additional);
            return Ok(None);
        }

        src.advance(NOISE_HEADER_SIZE);

        Ok(Some(src.split_to(size)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_eof(self, src)
    }
}

impl Encoder<&[u8]> for NoiseFrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = u16::try_from(item.len()).map_err(|_| Error::FrameTooLarge {
            size: item.len(),
            max: usize::from(u16::MAX),
        })?;

        dst.reserve(NOISE_HEADER_SIZE + item.len());
        dst.put_u8(NOISE_PREAMBLE);
        dst.put_u16(size);
        dst.put_slice(item);

        Ok(())
    }
}

/// API messages over either transport.
///
/// An encrypted codec owns one cipher state per direction, so a single instance must be
/// used for both reading and writing (e.g. through `Framed`).
pub struct MessageCodec {
    transport: Transport,
}

enum Transport {
    Plaintext,
    Noise { encrypt: Box<Cipher>, decrypt: Box<Cipher> },
}

impl MessageCodec {
    pub fn plaintext() -> Self {
        Self {
            transport: Transport::Plaintext,
        }
    }

    pub fn noise(encrypt: Cipher, decrypt: Cipher) -> Self {
        Self {
            transport: Transport::Noise {
                encrypt: Box::new(encrypt),
                decrypt: Box::new(decrypt),
            },
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.transport, Transport::Noise { .. })
    }
}

impl core::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("encrypted", &self.is_encrypted())
            .finish_non_exhaustive()
    }
}

impl Decoder for MessageCodec {
    type Item = RawMessage;

    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.transport {
            Transport::Plaintext => decode_plaintext(src),
            Transport::Noise { decrypt, .. } => {
                let Some(frame) = NoiseFrameCodec.decode(src)? else {
                    return Ok(None);
                };

                let plaintext = decrypt.decrypt_vec(&frame).map_err(|_| Error::Decryption)?;

                decode_encrypted_message(&plaintext).map(Some)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_eof(self, src)
    }
}

/// A peer hanging up in the middle of a frame is reported as an unexpected EOF.
fn decode_eof<D>(decoder: &mut D, src: &mut BytesMut) -> Result<Option<D::Item>, Error>
where
    D: Decoder<Error = Error>,
{
    match decoder.decode(src)? {
        Some(item) => Ok(Some(item)),
        None if src.is_empty() => Ok(None),
        None => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
    }
}

impl Encoder<RawMessage> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.transport {
            Transport::Plaintext => encode_plaintext(&item, dst),
            Transport::Noise { encrypt, .. } => {
                let data_len = u16::try_from(item.payload.len())
                    .ok()
                    .filter(|len| usize::from(*len) + ENCRYPTED_HEADER_SIZE + AEAD_TAG_SIZE <= usize::from(u16::MAX))
                    .ok_or(Error::FrameTooLarge {
                        size: item.payload.len(),
                        max: usize::from(u16::MAX) - ENCRYPTED_HEADER_SIZE - AEAD_TAG_SIZE,
                    })?;

                let mut plaintext = Vec::with_capacity(ENCRYPTED_HEADER_SIZE + item.payload.len());
                plaintext.put_u16(item.message_type);
                plaintext.put_u16(data_len);
                plaintext.put_slice(&item.payload);

                let ciphertext = encrypt.encrypt_vec(&plaintext);

                NoiseFrameCodec.encode(ciphertext.as_slice(), dst)
            }
        }
    }
}

impl Encoder<ProtoMessage> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: ProtoMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(RawMessage::from(&item), dst)
    }
}

fn decode_plaintext(src: &mut BytesMut) -> Result<Option<RawMessage>, Error> {
    let Some(&preamble) = src.first() else {
        return Ok(None);
    };

    match preamble {
        PLAINTEXT_PREAMBLE => {}
        NOISE_PREAMBLE => return Err(Error::RequiresEncryption),
        other => return Err(Error::BadPreamble(other)),
    }

    let Some((size, size_len)) = peek_varint(&src[1..])? else {
        return Ok(None);
    };

    let size = usize::try_from(size).map_err(|_| Error::MalformedFrame("payload size overflow"))?;
    if size > MAX_PLAINTEXT_PAYLOAD {
        return Err(Error::FrameTooLarge {
            size,
            max: MAX_PLAINTEXT_PAYLOAD,
        });
    }

    let Some((message_type, type_len)) = peek_varint(&src[1 + size_len..])? else {
        return Ok(None);
    };

    let message_type = u16::try_from(message_type).map_err(|_| Error::MalformedFrame("message type overflow"))?;

    let header_size = 1 + size_len + type_len;
    let frame_size = header_size + size;

    if src.len() < frame_size {
        let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, frame_size - src.len());
        src.reserve(additional);
        return Ok(None);
    }

    src.advance(header_size);
    let payload = src.split_to(size).freeze();

    Ok(Some(RawMessage { message_type, payload }))
}

fn encode_plaintext(item: &RawMessage, dst: &mut BytesMut) -> Result<(), Error> {
    if item.payload.len() > MAX_PLAINTEXT_PAYLOAD {
        return Err(Error::FrameTooLarge {
            size: item.payload.len(),
            max: MAX_PLAINTEXT_PAYLOAD,
        });
    }

    // Preamble plus two varints of at most 3 bytes each for these bounds.
    dst.reserve(7 + item.payload.len());
    dst.put_u8(PLAINTEXT_PREAMBLE);
    prost::encoding::encode_varint(item.payload.len() as u64, dst);
    prost::encoding::encode_varint(u64::from(item.message_type), dst);
    dst.put_slice(&item.payload);

    Ok(())
}

fn decode_encrypted_message(plaintext: &[u8]) -> Result<RawMessage, Error> {
    if plaintext.len() < ENCRYPTED_HEADER_SIZE {
        return Err(Error::MalformedFrame("encrypted message shorter than its header"));
    }

    let message_type = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    let data_len = usize::from(u16::from_be_bytes([plaintext[2], plaintext[3]]));
    let data = &plaintext[ENCRYPTED_HEADER_SIZE..];

    if data.len() != data_len {
        return Err(Error::MalformedFrame("encrypted message length mismatch"));
    }

    Ok(RawMessage {
        message_type,
        payload: Bytes::copy_from_slice(data),
    })
}

/// Reads a protobuf varint from the start of `buf`, returning the value and its encoded length.
///
/// `Ok(None)` means the varint is not complete yet.
fn peek_varint(buf: &[u8]) -> Result<Option<(u32, usize)>, Error> {
    const MAX_VARINT32_LEN: usize = 5;

    let mut value: u64 = 0;

    for (idx, byte) in buf.iter().take(MAX_VARINT32_LEN).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * idx);

        if byte & 0x80 == 0 {
            let value = u32::try_from(value).map_err(|_| Error::MalformedFrame("varint overflow"))?;
            return Ok(Some((value, idx + 1)));
        }
    }

    if buf.len() >= MAX_VARINT32_LEN {
        Err(Error::MalformedFrame("varint too long"))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::proto::HelloResponse;
    use futures_util::StreamExt as _;
    use proptest::prelude::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio_util::codec::FramedRead;

    /// Hands out the bytes in chunks of the given sizes, then whatever is left.
    struct MockAsyncReader {
        raw_msg: Vec<u8>,
        chunks: Vec<usize>,
    }

    impl AsyncRead for MockAsyncReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if buf.remaining() > 0 {
                let chunk = if self.chunks.is_empty() {
                    usize::MAX
                } else {
                    self.chunks.remove(0)
                };
                let amount = buf.remaining().min(self.raw_msg.len()).min(chunk);
                buf.put_slice(&self.raw_msg[0..amount]);
                self.raw_msg.drain(0..amount);
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }

    fn hello_response(name: &str) -> ProtoMessage {
        ProtoMessage::HelloResponse(HelloResponse {
            api_version_major: 1,
            api_version_minor: 1,
            server_info: "Test Server".to_owned(),
            name: name.to_owned(),
        })
    }

    fn encode(codec: &mut MessageCodec, msg: ProtoMessage) -> Vec<u8> {
        let mut dst = BytesMut::new();
        codec.encode(msg, &mut dst).unwrap();
        dst.to_vec()
    }

    #[test]
    fn plaintext_hello_response() {
        let frame = encode(&mut MessageCodec::plaintext(), hello_response("Test Server"));

        let mut expected = vec![0, 30, 2, 8, 1, 16, 1, 26, 11];
        expected.extend_from_slice(b"Test Server");
        expected.extend_from_slice(&[34, 11]);
        expected.extend_from_slice(b"Test Server");

        assert_eq!(frame, expected);
    }

    #[test]
    fn plaintext_size_uses_multi_byte_varint() {
        let name = format!("Test Server with a {}long String", "very ".repeat(18));
        let frame = encode(&mut MessageCodec::plaintext(), hello_response(&name));

        // 19 bytes of fixed fields plus the name.
        let payload_len = 19 + name.len();
        assert!(payload_len >= 128);
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], u8::try_from(payload_len & 0x7F).unwrap() | 0x80);
        assert_eq!(frame[2], u8::try_from(payload_len >> 7).unwrap());
        assert_eq!(frame[3], 2);
        assert_eq!(frame.len(), 4 + payload_len);
    }

    #[test]
    fn encrypted_hello_response() {
        let key = [0u8; 32];
        let mut codec = MessageCodec::noise(Cipher::new(&key, 1), Cipher::new(&key, 0));

        let frame = encode(&mut codec, hello_response("Test Server"));

        let expected: &[u8] = &[
            1, 0, 50, // preamble and size
            83, 7, 229, 250, 66, 254, 9, 179, 47, 152, 53, 33, 20, 42, 219, 183, 37, 236, 193, 141, 151, 211, 72, 91,
            58, 43, 66, 142, 231, 254, 199, 68, 238, 115, 218, 97, 216, 136, 154, 178, 100, 72, 12, 2, 175, 160, 139,
            112, 115, 123,
        ];
        assert_eq!(frame, expected);
    }

    #[test]
    fn encrypted_frame_decodes_with_matching_cipher() {
        let key = [7u8; 32];
        let mut sender = MessageCodec::noise(Cipher::new(&key, 0), Cipher::new(&[1; 32], 0));
        let mut receiver = MessageCodec::noise(Cipher::new(&[1; 32], 0), Cipher::new(&key, 0));

        let mut buf = BytesMut::new();
        sender.encode(hello_response("a"), &mut buf).unwrap();
        sender.encode(hello_response("b"), &mut buf).unwrap();

        let first = receiver.decode(&mut buf).unwrap().unwrap();
        let second = receiver.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.decode().unwrap(), hello_response("a"));
        assert_eq!(second.decode().unwrap(), hello_response("b"));
        assert!(buf.is_empty());
    }

    #[test]
    fn encrypted_frame_with_wrong_key_fails() {
        let mut sender = MessageCodec::noise(Cipher::new(&[7; 32], 0), Cipher::new(&[7; 32], 0));
        let mut receiver = MessageCodec::noise(Cipher::new(&[8; 32], 0), Cipher::new(&[8; 32], 0));

        let mut buf = BytesMut::new();
        sender.encode(hello_response("a"), &mut buf).unwrap();

        assert!(matches!(receiver.decode(&mut buf), Err(Error::Decryption)));
    }

    #[test]
    fn plaintext_codec_detects_noise_peer() {
        let mut buf = BytesMut::from(&[1u8, 0, 0][..]);
        assert!(matches!(
            MessageCodec::plaintext().decode(&mut buf),
            Err(Error::RequiresEncryption)
        ));
    }

    #[test]
    fn bad_preambles() {
        let mut buf = BytesMut::from(&[0x16u8, 3, 1][..]);
        assert!(matches!(
            MessageCodec::plaintext().decode(&mut buf),
            Err(Error::BadPreamble(0x16))
        ));

        let mut buf = BytesMut::from(&[0u8, 0, 7][..]);
        assert!(matches!(NoiseFrameCodec.decode(&mut buf), Err(Error::BadPreamble(0))));
    }

    #[test]
    fn oversized_plaintext_frame_is_rejected() {
        // 0x80 0x80 0x80 0x01 == 2 MiB
        let mut buf = BytesMut::from(&[0u8, 0x80, 0x80, 0x80, 0x01, 1][..]);
        assert!(matches!(
            MessageCodec::plaintext().decode(&mut buf),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = MessageCodec::plaintext();

        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 0x82]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x01, 7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn noise_frames() {
        let mut buf = BytesMut::new();
        NoiseFrameCodec.encode(&b"hello"[..], &mut buf).unwrap();
        NoiseFrameCodec.encode(&b""[..], &mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 0, 5, b'h', b'e', b'l', b'l', b'o', 1, 0, 0]);

        assert_eq!(&NoiseFrameCodec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert!(NoiseFrameCodec.decode(&mut buf).unwrap().unwrap().is_empty());
        assert!(NoiseFrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn noise_frame_too_large() {
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        let mut buf = BytesMut::new();
        assert!(matches!(
            NoiseFrameCodec.encode(payload.as_slice(), &mut buf),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn hello_request_from_stream() {
        let raw_msg = vec![
            0, 19, 1, 0x0a, 0x0d, b'a', b'i', b'o', b'e', b's', b'p', b'h', b'o', b'm', b'e', b'a', b'p', b'i', 0x10,
            0x01, 0x18, 0x0a,
        ];

        let reader = MockAsyncReader {
            raw_msg,
            chunks: vec![1, 1, 1, 5],
        };
        let mut framed_reader = FramedRead::new(reader, MessageCodec::plaintext());
        let frame = framed_reader.next().await.unwrap().unwrap();

        let ProtoMessage::HelloRequest(hello) = frame.decode().unwrap() else {
            panic!("unexpected message");
        };
        assert_eq!(hello.client_info, "aioesphomeapi");
        assert_eq!(hello.api_version_major, 1);
        assert_eq!(hello.api_version_minor, 10);
        assert!(framed_reader.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_a_benign_eof() {
        let reader = MockAsyncReader {
            raw_msg: vec![0, 5, 1],
            chunks: Vec::new(),
        };
        let mut framed_reader = FramedRead::new(reader, MessageCodec::plaintext());

        let error = framed_reader.next().await.unwrap().unwrap_err();
        assert!(matches!(&error, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert!(error.is_benign_disconnect());
    }

    proptest! {
        #[test]
        fn plaintext_frames_survive_arbitrary_chunking(
            names in proptest::collection::vec("[a-z ]{0,200}", 1..5),
            chunks in proptest::collection::vec(1usize..64, 0..32),
        ) {
            let mut codec = MessageCodec::plaintext();
            let mut raw_msg = Vec::new();
            for name in &names {
                raw_msg.extend(encode(&mut codec, hello_response(name)));
            }

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded: Vec<RawMessage> = runtime.block_on(async {
                FramedRead::new(MockAsyncReader { raw_msg, chunks }, MessageCodec::plaintext())
                    .map(|frame| frame.unwrap())
                    .collect()
                    .await
            });

            prop_assert_eq!(decoded.len(), names.len());
            for (frame, name) in decoded.iter().zip(&names) {
                prop_assert_eq!(frame.decode().unwrap(), hello_response(name));
            }
        }
    }
}
