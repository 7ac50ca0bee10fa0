//! Server side of a single API connection.
//!
//! [`ApiConnection::accept`] negotiates the transport, then runs a read task and a write
//! task. The connection setup messages are answered by the read task itself; everything
//! else is handed to the owner through [`ApiConnection::recv`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

use crate::Error;
use crate::codec::{MessageCodec, NOISE_PREAMBLE, NoiseFrameCodec, PLAINTEXT_PREAMBLE};
use crate::config::DeviceConfig;
use crate::noise;
use crate::proto::{
    ConnectResponse, DisconnectRequest, DisconnectResponse, PingResponse, ProtoMessage, RawMessage,
};

pub const ONLY_ENCRYPTION_ENABLED: &str = "Only key encryption is enabled";
pub const NO_ENCRYPTION_ALLOWED: &str = "No encrypted communication allowed";

const OUTBOUND_QUEUE_SIZE: usize = 64;
const INCOMING_QUEUE_SIZE: usize = 64;

/// How long a refused peer gets to close its side before the socket is dropped.
const REJECTION_LINGER: Duration = Duration::from_secs(1);

pub(crate) type ApiFramed = Framed<TcpStream, MessageCodec>;

pub(crate) enum Outbound {
    Message(ProtoMessage),
    Close,
}

/// An accepted API connection, ready to exchange messages.
///
/// Dropping it closes the connection.
pub struct ApiConnection {
    peer_addr: SocketAddr,
    encrypted: bool,
    outbound: mpsc::Sender<Outbound>,
    incoming: mpsc::Receiver<ProtoMessage>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ApiConnection {
    /// Negotiates the transport with a freshly accepted peer and starts the I/O tasks.
    pub async fn accept(stream: TcpStream, config: Arc<DeviceConfig>) -> Result<Self, Error> {
        let peer_addr = stream.peer_addr()?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "set_nodelay on TcpStream failed");
        }

        let mut peeked = [0; 1];
        let n_read = stream.peek(&mut peeked).await?;

        if n_read == 0 {
            return Err(Error::ConnectionClosed);
        }

        let framed = match (peeked[0], &config.encryption_key) {
            (PLAINTEXT_PREAMBLE, None) => Framed::new(stream, MessageCodec::plaintext()),
            (PLAINTEXT_PREAMBLE, Some(_)) => {
                reject(Framed::new(stream, NoiseFrameCodec), ONLY_ENCRYPTION_ENABLED).await?;
                return Err(Error::RequiresEncryption);
            }
            (NOISE_PREAMBLE, None) => {
                reject(Framed::new(stream, NoiseFrameCodec), NO_ENCRYPTION_ALLOWED).await?;
                return Err(Error::EncryptionNotEnabled);
            }
            (NOISE_PREAMBLE, Some(psk)) => {
                let mut framed = Framed::new(stream, NoiseFrameCodec);
                let ciphers = noise::accept(&mut framed, psk, &config.server_hello()).await?;
                framed.map_codec(|_| ciphers.into_codec())
            }
            (other, _) => return Err(Error::BadPreamble(other)),
        };

        let encrypted = framed.codec().is_encrypted();
        debug!(encrypted, "Connection established");

        let (sink, stream) = framed.split::<ProtoMessage>();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(
            {
                let shutdown = shutdown.clone();
                async move {
                    let result = write_loop(sink, outbound_rx, &shutdown).await;
                    shutdown.cancel();

                    if let Err(e) = result {
                        log_connection_error(&e);
                    }
                }
            }
            .in_current_span(),
        );

        let reader = ServerReader {
            config,
            authenticated: false,
            outbound: outbound_tx.clone(),
            incoming: incoming_tx,
        };

        tasks.spawn(
            {
                let shutdown = shutdown.clone();
                async move {
                    let result = reader.run(stream, &shutdown).await;
                    shutdown.cancel();

                    match result {
                        Ok(()) => debug!("Connection closed"),
                        Err(e) => log_connection_error(&e),
                    }
                }
            }
            .in_current_span(),
        );

        tasks.close();

        Ok(Self {
            peer_addr,
            encrypted,
            outbound: outbound_tx,
            incoming: incoming_rx,
            shutdown,
            tasks,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Next message not handled by the connection itself, or `None` once closed.
    pub async fn recv(&mut self) -> Option<ProtoMessage> {
        self.incoming.recv().await
    }

    pub async fn send(&self, message: impl Into<ProtoMessage>) -> Result<(), Error> {
        self.outbound
            .send(Outbound::Message(message.into()))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Asks the client to disconnect, then closes the connection once queued messages are written.
    ///
    /// Await [`ApiConnection::closed`] to know when the request was flushed.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.send(DisconnectRequest {}).await?;
        self.outbound
            .send(Outbound::Close)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the read and write tasks have both finished.
    pub async fn closed(&self) {
        self.tasks.wait().await;
    }
}

impl Drop for ApiConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ServerReader {
    config: Arc<DeviceConfig>,
    authenticated: bool,
    outbound: mpsc::Sender<Outbound>,
    incoming: mpsc::Sender<ProtoMessage>,
}

impl ServerReader {
    async fn run(mut self, mut stream: SplitStream<ApiFramed>, shutdown: &CancellationToken) -> Result<(), Error> {
        self.authenticated = self.config.password.is_none();

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                () = shutdown.cancelled() => return Ok(()),
            };

            let Some(frame) = frame else {
                debug!("Peer closed the connection");
                return Ok(());
            };

            let Some(message) = decode_or_skip(frame?)? else {
                continue;
            };

            trace!(message = message.message_type().name(), "Received message");

            match message {
                ProtoMessage::HelloRequest(hello) => {
                    info!(
                        client_info = %hello.client_info,
                        api_version = format!("{}.{}", hello.api_version_major, hello.api_version_minor),
                        "Client hello"
                    );
                    self.reply(self.config.hello_response()).await?;
                }
                ProtoMessage::ConnectRequest(connect) => {
                    if self.config.check_password(&connect.password) {
                        self.authenticated = true;
                        self.reply(ConnectResponse { invalid_password: false }).await?;
                    } else {
                        self.reply(ConnectResponse { invalid_password: true }).await?;
                        self.close().await;
                        return Err(Error::InvalidPassword);
                    }
                }
                ProtoMessage::PingRequest(_) => self.reply(PingResponse {}).await?,
                ProtoMessage::DeviceInfoRequest(_) => self.reply(self.config.device_info()).await?,
                ProtoMessage::DisconnectRequest(_) => {
                    debug!("Client requested disconnection");
                    self.reply(DisconnectResponse {}).await?;
                    self.close().await;
                    return Ok(());
                }
                ProtoMessage::DisconnectResponse(_) => {
                    self.close().await;
                    return Ok(());
                }
                ProtoMessage::PingResponse(_) => {}
                message if !self.authenticated => {
                    let name = message.message_type().name();
                    self.close().await;
                    return Err(Error::AuthenticationRequired(name));
                }
                message => {
                    if self.incoming.send(message).await.is_err() {
                        debug!("Connection owner is gone");
                        self.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn reply(&self, message: impl Into<ProtoMessage>) -> Result<(), Error> {
        self.outbound
            .send(Outbound::Message(message.into()))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&self) {
        let _ = self.outbound.send(Outbound::Close).await;
    }
}

/// Decodes a frame, skipping message types this implementation does not know.
pub(crate) fn decode_or_skip(raw: RawMessage) -> Result<Option<ProtoMessage>, Error> {
    match raw.decode() {
        Ok(message) => Ok(Some(message)),
        Err(crate::proto::Error::UnknownMessageType(message_type)) => {
            debug!(message_type, "Skipping unsupported message");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Drains the outbound queue into the sink until told to close, then shuts the write side down.
///
/// The caller cancels `shutdown` once this returns.
pub(crate) async fn write_loop(
    mut sink: SplitSink<ApiFramed, ProtoMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            () = shutdown.cancelled() => None,
        };

        match next {
            Some(Outbound::Message(message)) => {
                trace!(message = message.message_type().name(), "Sending message");
                sink.send(message).await?;
            }
            Some(Outbound::Close) | None => break,
        }
    }

    sink.close().await
}

/// Refuses a peer with a Noise-framed reason, then waits briefly for it to hang up.
///
/// Whatever the peer already sent is drained after the write side is shut, so closing
/// does not reset the connection before the reason is read.
async fn reject<S>(mut framed: Framed<S, NoiseFrameCodec>, reason: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    noise::send_rejection(&mut framed, reason).await?;
    framed.close().await?;

    let mut stream = framed.into_inner();
    let _ = tokio::time::timeout(REJECTION_LINGER, tokio::io::copy(&mut stream, &mut tokio::io::sink())).await;

    Ok(())
}

pub(crate) fn log_connection_error(e: &Error) {
    if e.is_benign_disconnect() {
        debug!(error = format!("{e:#}"), "Client disconnected");
    } else if e.is_refusal() {
        warn!(error = format!("{e:#}"), "Client refused");
    } else {
        error!(error = format!("{e:#}"), "API connection failure");
    }
}
