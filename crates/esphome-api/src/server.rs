//! A device exposing entities over the native API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

use crate::Error;
use crate::config::DeviceConfig;
use crate::connection::{ApiConnection, log_connection_error};
use crate::entity::{Command, Entity, EntityState};
use crate::proto::{ListEntitiesDoneResponse, LogLevel, ProtoMessage, SubscribeLogsResponse};

/// Port ESPHome devices listen on.
pub const DEFAULT_PORT: u16 = 6053;

const UPDATE_QUEUE_SIZE: usize = 256;
const EVENT_QUEUE_SIZE: usize = 64;
const CONNECTIONS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected { peer_addr: SocketAddr },
    Disconnected { peer_addr: SocketAddr },
    Command { peer_addr: SocketAddr, command: Command },
}

#[derive(Debug, Clone)]
enum Update {
    State(EntityState),
    Log(SubscribeLogsResponse),
}

struct Shared {
    config: Arc<DeviceConfig>,
    entities: RwLock<Vec<Entity>>,
    states: Mutex<HashMap<u32, EntityState>>,
    updates: broadcast::Sender<Update>,
    events: mpsc::Sender<ServerEvent>,
    connections: AtomicUsize,
}

/// Emulated ESPHome device.
///
/// Entities are listed in the order they were added. Commands received from clients are
/// reported through the event receiver returned by [`EspHomeServer::new`]; applying them
/// (and publishing the resulting state) is up to the owner.
pub struct EspHomeServer {
    shared: Arc<Shared>,
}

impl EspHomeServer {
    pub fn new(config: DeviceConfig) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (updates, _) = broadcast::channel(UPDATE_QUEUE_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        let server = Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                entities: RwLock::new(Vec::new()),
                states: Mutex::new(HashMap::new()),
                updates,
                events: events_tx,
                connections: AtomicUsize::new(0),
            }),
        };

        (server, events_rx)
    }

    pub fn add_entity(&self, entity: Entity) -> Result<(), Error> {
        let mut entities = self.shared.entities.write();

        if entities.iter().any(|existing| existing.key() == entity.key()) {
            return Err(Error::DuplicateEntityKey(entity.key()));
        }

        entities.push(entity);

        Ok(())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.shared.entities.read().clone()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts API connections until `shutdown` is cancelled.
    ///
    /// On shutdown, connected clients are asked to disconnect.
    #[instrument("server", skip_all, fields(device = %self.shared.config.name))]
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), Error> {
        info!(addr = %listener.local_addr()?, "Serving native API");

        let tracker = TaskTracker::new();

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        error!(%error, "Failed to accept connection");
                        continue;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            let shared = Arc::clone(&self.shared);
            let shutdown = shutdown.clone();

            tracker.spawn(
                async move {
                    if let Err(e) = serve_connection(stream, peer_addr, &shared, &shutdown).await {
                        log_connection_error(&e);
                    }
                }
                .instrument(info_span!("api", client = %peer_addr)),
            );
        }

        tracker.close();

        if tokio::time::timeout(CONNECTIONS_SHUTDOWN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = tracker.len(), "Connections did not close in time");
        }

        info!("Server stopped");

        Ok(())
    }
}

/// Cloneable access to a running server's states.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Records the latest state of an entity and pushes it to subscribed clients.
    pub fn publish_state(&self, state: EntityState) -> Result<(), Error> {
        let key = state.key();

        {
            let entities = self.shared.entities.read();
            let entity = entities
                .iter()
                .find(|entity| entity.key() == key)
                .ok_or(Error::UnknownEntityKey(key))?;

            if entity.kind() != state.kind() {
                return Err(Error::EntityKindMismatch {
                    key,
                    expected: entity.kind().as_str(),
                    actual: state.kind().as_str(),
                });
            }
        }

        self.shared.states.lock().insert(key, state.clone());

        // Nobody is listening when no client is connected.
        let _ = self.shared.updates.send(Update::State(state));

        Ok(())
    }

    pub fn state(&self, key: u32) -> Option<EntityState> {
        self.shared.states.lock().get(&key).cloned()
    }

    /// Sends a log line to clients subscribed at `level` or above.
    pub fn publish_log(&self, level: LogLevel, message: impl Into<String>) {
        let log = SubscribeLogsResponse {
            level: level as i32,
            message: message.into().into_bytes(),
            send_failed: false,
        };

        let _ = self.shared.updates.send(Update::Log(log));
    }

    /// Number of clients past the transport negotiation and not yet disconnected.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let mut connection = ApiConnection::accept(stream, Arc::clone(&shared.config)).await?;
    let mut updates = shared.updates.subscribe();

    shared.connections.fetch_add(1, Ordering::AcqRel);
    let _ = shared.events.send(ServerEvent::Connected { peer_addr }).await;

    let result = connection_loop(&mut connection, &mut updates, shared, shutdown).await;

    shared.connections.fetch_sub(1, Ordering::AcqRel);
    let _ = shared.events.send(ServerEvent::Disconnected { peer_addr }).await;

    result
}

async fn connection_loop(
    connection: &mut ApiConnection,
    updates: &mut broadcast::Receiver<Update>,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let mut states_subscribed = false;
    let mut log_level: Option<i32> = None;

    loop {
        tokio::select! {
            message = connection.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };

                match message {
                    ProtoMessage::ListEntitiesRequest(_) => {
                        let entities = shared.entities.read().clone();
                        debug!(count = entities.len(), "Listing entities");

                        for entity in entities {
                            connection.send(entity).await?;
                        }

                        connection.send(ListEntitiesDoneResponse {}).await?;
                    }
                    ProtoMessage::SubscribeStatesRequest(_) => {
                        states_subscribed = true;

                        for state in current_states(shared) {
                            connection.send(state).await?;
                        }
                    }
                    ProtoMessage::SubscribeLogsRequest(request) => {
                        debug!(level = ?request.level(), "Client subscribed to logs");
                        log_level = Some(request.level);
                    }
                    ProtoMessage::SubscribeHomeassistantServicesRequest(_)
                    | ProtoMessage::SubscribeHomeAssistantStatesRequest(_) => {
                        debug!("Home Assistant subscriptions are not supported; ignoring");
                    }
                    message => match Command::try_from(message) {
                        Ok(command) => handle_command(command, connection.peer_addr(), shared).await,
                        Err(message) => debug!(message = message.message_type().name(), "Ignoring message"),
                    },
                }
            }
            update = updates.recv() => match update {
                Ok(Update::State(state)) if states_subscribed => connection.send(state).await?,
                Ok(Update::Log(log)) if log_level.is_some_and(|level| log.level <= level) => {
                    connection.send(log).await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection lagging behind state updates");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            () = shutdown.cancelled() => {
                debug!("Server shutting down; disconnecting client");
                let _ = connection.disconnect().await;

                if tokio::time::timeout(DISCONNECT_TIMEOUT, connection.closed()).await.is_err() {
                    warn!("Client did not close in time");
                    connection.close();
                }

                return Ok(());
            }
        }
    }
}

fn current_states(shared: &Shared) -> Vec<EntityState> {
    let entities = shared.entities.read();
    let states = shared.states.lock();

    entities
        .iter()
        .filter_map(|entity| states.get(&entity.key()).cloned())
        .collect()
}

async fn handle_command(command: Command, peer_addr: SocketAddr, shared: &Shared) {
    let accepted = shared.entities.read().iter().any(|entity| entity.accepts(&command));

    if !accepted {
        warn!(key = command.key(), "Command targets no matching entity");
        return;
    }

    debug!(?command, "Command received");

    let _ = shared.events.send(ServerEvent::Command { peer_addr, command }).await;
}
