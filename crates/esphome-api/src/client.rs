//! Client side of the native API, as used by home automation hubs.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::SplitStream;
use futures_util::StreamExt as _;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use typed_builder::TypedBuilder;

use crate::Error;
use crate::codec::{MessageCodec, NoiseFrameCodec};
use crate::connection::{ApiFramed, Outbound, decode_or_skip, write_loop};
use crate::entity::{Command, Entity, EntityState};
use crate::noise::{self, NoisePsk};
use crate::proto::{
    ButtonCommandRequest, ConnectRequest, DeviceInfoRequest, DeviceInfoResponse, DisconnectRequest,
    DisconnectResponse, GetTimeResponse, HelloRequest, LightCommandRequest, ListEntitiesRequest, LogLevel,
    PingRequest, PingResponse, ProtoMessage, SubscribeLogsRequest, SubscribeLogsResponse, SubscribeStatesRequest,
    SwitchCommandRequest,
};
use crate::server::DEFAULT_PORT;

/// API version this client announces.
pub const CLIENT_API_VERSION: (u32, u32) = (1, 10);

const INCOMING_QUEUE_SIZE: usize = 256;
const OUTBOUND_QUEUE_SIZE: usize = 64;
const SUBSCRIPTION_QUEUE_SIZE: usize = 64;

/// Connection parameters for a device.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ApiClient {
    #[builder(setter(into))]
    host: String,
    #[builder(default = DEFAULT_PORT)]
    port: u16,
    #[builder(default, setter(strip_option, into))]
    password: Option<String>,
    #[builder(default, setter(strip_option))]
    noise_psk: Option<NoisePsk>,
    #[builder(default = "esphome-api".to_owned(), setter(into))]
    client_info: String,
    /// Refuse an encrypted device announcing another name.
    #[builder(default, setter(strip_option, into))]
    expected_name: Option<String>,
    #[builder(default = Duration::from_secs(30))]
    request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

/// What the device told about itself while connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConnectionInfo {
    pub api_version: ApiVersion,
    pub server_info: String,
    pub name: String,
    pub log_name: String,
}

impl ApiClient {
    /// Opens the transport and exchanges hellos; with `login`, also authenticates.
    #[instrument("client", skip(self), fields(host = %self.host, port = self.port))]
    pub async fn connect(&self, login: bool) -> Result<ClientConnection, Error> {
        let stream = tokio::time::timeout(self.request_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| Error::Timeout("TCP connection"))??;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "set_nodelay on TcpStream failed");
        }

        let framed = match &self.noise_psk {
            Some(psk) => {
                let mut framed = Framed::new(stream, NoiseFrameCodec);
                let handshake = noise::initiate(&mut framed, psk, self.expected_name.as_deref());
                let (ciphers, _) = tokio::time::timeout(self.request_timeout, handshake)
                    .await
                    .map_err(|_| Error::Timeout("Noise handshake"))??;
                framed.map_codec(|_| ciphers.into_codec())
            }
            None => Framed::new(stream, MessageCodec::plaintext()),
        };

        let mut connection = ClientConnection::start(framed, self.request_timeout);

        let hello = HelloRequest {
            client_info: self.client_info.clone(),
            api_version_major: CLIENT_API_VERSION.0,
            api_version_minor: CLIENT_API_VERSION.1,
        };

        let hello = connection
            .request(hello, "HelloResponse", |message| match message {
                ProtoMessage::HelloResponse(hello) => Some(hello),
                _ => None,
            })
            .await?;

        connection.info = ApiConnectionInfo {
            api_version: ApiVersion {
                major: hello.api_version_major,
                minor: hello.api_version_minor,
            },
            log_name: format!("{} @ {}", hello.name, self.host),
            server_info: hello.server_info,
            name: hello.name,
        };

        if login {
            let connect = ConnectRequest {
                password: self.password.clone().unwrap_or_default(),
            };

            let response = connection
                .request(connect, "ConnectResponse", |message| match message {
                    ProtoMessage::ConnectResponse(response) => Some(response),
                    _ => None,
                })
                .await?;

            if response.invalid_password {
                connection.close();
                return Err(Error::InvalidPassword);
            }
        }

        info!(device = %connection.info.log_name, "Connected");

        Ok(connection)
    }
}

/// An established client connection.
///
/// Server pings, time requests and disconnect requests are answered in the background.
/// Dropping the connection closes it without notifying the device.
pub struct ClientConnection {
    info: ApiConnectionInfo,
    outbound: mpsc::Sender<Outbound>,
    incoming: broadcast::Sender<ProtoMessage>,
    shutdown: CancellationToken,
    failure: Arc<Mutex<Option<Error>>>,
    request_timeout: Duration,
}

impl ClientConnection {
    fn start(framed: ApiFramed, request_timeout: Duration) -> Self {
        let (sink, stream) = framed.split::<ProtoMessage>();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (incoming_tx, _) = broadcast::channel(INCOMING_QUEUE_SIZE);
        let shutdown = CancellationToken::new();
        let failure = Arc::new(Mutex::new(None));

        tokio::spawn(
            {
                let shutdown = shutdown.clone();
                let failure = Arc::clone(&failure);
                async move {
                    if let Err(e) = write_loop(sink, outbound_rx, &shutdown).await {
                        debug!(error = format!("{e:#}"), "Write loop failed");
                        failure.lock().get_or_insert(e);
                    }

                    shutdown.cancel();
                }
            }
            .in_current_span(),
        );

        tokio::spawn(
            {
                let shutdown = shutdown.clone();
                let failure = Arc::clone(&failure);
                let outbound = outbound_tx.clone();
                let incoming = incoming_tx.clone();
                async move {
                    if let Err(e) = read_loop(stream, outbound, incoming, &shutdown).await {
                        debug!(error = format!("{e:#}"), "Read loop ended");
                        failure.lock().get_or_insert(e);
                    }

                    shutdown.cancel();
                }
            }
            .in_current_span(),
        );

        Self {
            info: ApiConnectionInfo {
                api_version: ApiVersion { major: 0, minor: 0 },
                server_info: String::new(),
                name: String::new(),
                log_name: String::new(),
            },
            outbound: outbound_tx,
            incoming: incoming_tx,
            shutdown,
            failure,
            request_timeout,
        }
    }

    pub fn info(&self) -> &ApiConnectionInfo {
        &self.info
    }

    pub fn api_version(&self) -> ApiVersion {
        self.info.api_version
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn server_info(&self) -> &str {
        &self.info.server_info
    }

    /// `"{device name} @ {host}"`, the way hubs name a device in their logs.
    pub fn log_name(&self) -> &str {
        &self.info.log_name
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the connection is closed, with the reason it closed.
    ///
    /// [`Error::DisconnectRequested`] means the device asked for it; [`Error::ConnectionClosed`]
    /// that the device hung up or that this side closed.
    pub async fn closed(&self) -> Error {
        self.shutdown.cancelled().await;
        self.failure()
    }

    pub async fn device_info(&self) -> Result<DeviceInfoResponse, Error> {
        self.request(DeviceInfoRequest {}, "DeviceInfoResponse", |message| match message {
            ProtoMessage::DeviceInfoResponse(info) => Some(info),
            _ => None,
        })
        .await
    }

    /// Lists every entity, in the order the device announces them.
    pub async fn list_entities(&self) -> Result<Vec<Entity>, Error> {
        let mut incoming = self.incoming.subscribe();
        self.send(ListEntitiesRequest {}).await?;

        let collect = async {
            let mut entities = Vec::new();

            loop {
                match self.next_incoming(&mut incoming).await? {
                    ProtoMessage::ListEntitiesDoneResponse(_) => return Ok::<_, Error>(entities),
                    message => {
                        if let Ok(entity) = Entity::try_from(message) {
                            entities.push(entity);
                        }
                    }
                }
            }
        };

        tokio::time::timeout(self.request_timeout, collect)
            .await
            .map_err(|_| Error::Timeout("ListEntitiesDoneResponse"))?
    }

    /// Subscribes to state updates; the device first sends the current state of each entity.
    pub async fn subscribe_states(&self) -> Result<mpsc::Receiver<EntityState>, Error> {
        let rx = self.forward(|message| EntityState::try_from(message).ok());
        self.send(SubscribeStatesRequest {}).await?;
        Ok(rx)
    }

    pub async fn subscribe_logs(
        &self,
        level: LogLevel,
        dump_config: bool,
    ) -> Result<mpsc::Receiver<SubscribeLogsResponse>, Error> {
        let rx = self.forward(|message| match message {
            ProtoMessage::SubscribeLogsResponse(log) => Some(log),
            _ => None,
        });

        self.send(SubscribeLogsRequest {
            level: level as i32,
            dump_config,
        })
        .await?;

        Ok(rx)
    }

    pub async fn switch_command(&self, key: u32, state: bool) -> Result<(), Error> {
        self.command(Command::Switch(SwitchCommandRequest { key, state })).await
    }

    pub async fn button_command(&self, key: u32) -> Result<(), Error> {
        self.command(Command::Button(ButtonCommandRequest { key })).await
    }

    pub async fn light_command(&self, command: LightCommandRequest) -> Result<(), Error> {
        self.command(Command::Light(command)).await
    }

    pub async fn command(&self, command: Command) -> Result<(), Error> {
        self.send(command).await
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.request(PingRequest {}, "PingResponse", |message| match message {
            ProtoMessage::PingResponse(response) => Some(response),
            _ => None,
        })
        .await
        .map(|_| ())
    }

    /// Asks the device to close the connection and waits for its acknowledgement.
    pub async fn disconnect(self) -> Result<(), Error> {
        let result = self
            .request(DisconnectRequest {}, "DisconnectResponse", |message| match message {
                ProtoMessage::DisconnectResponse(response) => Some(response),
                _ => None,
            })
            .await;

        self.close();

        result.map(|_| ())
    }

    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
        self.shutdown.cancel();
    }

    pub async fn send(&self, message: impl Into<ProtoMessage>) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(self.failure());
        }

        self.outbound
            .send(Outbound::Message(message.into()))
            .await
            .map_err(|_| self.failure())
    }

    /// Sends `message` and waits for the first incoming message `select` accepts.
    pub async fn request<T, F>(
        &self,
        message: impl Into<ProtoMessage>,
        expected: &'static str,
        mut select: F,
    ) -> Result<T, Error>
    where
        F: FnMut(ProtoMessage) -> Option<T>,
    {
        let mut incoming = self.incoming.subscribe();
        self.send(message).await?;

        let wait = async {
            loop {
                if let Some(response) = select(self.next_incoming(&mut incoming).await?) {
                    return Ok::<_, Error>(response);
                }
            }
        };

        tokio::time::timeout(self.request_timeout, wait)
            .await
            .map_err(|_| Error::Timeout(expected))?
    }

    async fn next_incoming(&self, incoming: &mut broadcast::Receiver<ProtoMessage>) -> Result<ProtoMessage, Error> {
        loop {
            tokio::select! {
                biased;
                message = incoming.recv() => match message {
                    Ok(message) => return Ok(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dropped incoming messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(self.failure()),
                },
                () = self.shutdown.cancelled() => return Err(self.failure()),
            }
        }
    }

    /// Spawns a task feeding the messages `filter` keeps into a channel.
    fn forward<T, F>(&self, mut filter: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: FnMut(ProtoMessage) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_SIZE);
        let mut incoming = self.incoming.subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        message = incoming.recv() => message,
                        () = shutdown.cancelled() => break,
                    };

                    match message {
                        Ok(message) => {
                            if let Some(item) = filter(message)
                                && tx.send(item).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscription lagging behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            .in_current_span(),
        );

        rx
    }

    fn failure(&self) -> Error {
        self.failure.lock().clone().unwrap_or(Error::ConnectionClosed)
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("log_name", &self.info.log_name)
            .field("api_version", &self.info.api_version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    mut stream: SplitStream<ApiFramed>,
    outbound: mpsc::Sender<Outbound>,
    incoming: broadcast::Sender<ProtoMessage>,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let reply = |message: ProtoMessage| {
        let outbound = outbound.clone();
        async move {
            outbound
                .send(Outbound::Message(message))
                .await
                .map_err(|_| Error::ConnectionClosed)
        }
    };

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = shutdown.cancelled() => return Ok(()),
        };

        let Some(frame) = frame else {
            debug!("Device closed the connection");
            return Ok(());
        };

        let Some(message) = decode_or_skip(frame?)? else {
            continue;
        };

        trace!(message = message.message_type().name(), "Received message");

        match message {
            ProtoMessage::PingRequest(_) => reply(PingResponse {}.into()).await?,
            ProtoMessage::GetTimeRequest(_) => {
                let epoch_seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .ok()
                    .and_then(|elapsed| u32::try_from(elapsed.as_secs()).ok())
                    .unwrap_or_default();
                reply(GetTimeResponse { epoch_seconds }.into()).await?;
            }
            ProtoMessage::DisconnectRequest(_) => {
                debug!("Device requested disconnection");
                reply(DisconnectResponse {}.into()).await?;
                let _ = outbound.send(Outbound::Close).await;
                return Err(Error::DisconnectRequested);
            }
            message => {
                // No receiver simply means nobody waits for this message.
                let _ = incoming.send(message);
            }
        }
    }
}
