//! Emulated ESPHome device for integration tests.
//!
//! Each subcommand selects an access profile; all profiles expose the same device.

#[macro_use]
extern crate tracing;

mod device;
mod fixtures;

use std::io::IsTerminal as _;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use esphome_api::server::DEFAULT_PORT;
use esphome_api::{EspHomeServer, NoisePsk};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::device::Device;
use crate::fixtures::{DEFAULT_ENCRYPTION_KEY, DEFAULT_PASSWORD};

#[derive(Debug, Parser)]
#[command(name = "esphome-test-server", version, about = "Emulated ESPHome device for integration tests")]
struct Cli {
    #[command(subcommand)]
    profile: Profile,

    /// Port to listen on.
    #[arg(long, env = "SERVER_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1", global = true)]
    bind: IpAddr,

    /// Milliseconds between two sensor updates.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..), global = true)]
    sensor_interval: u64,
}

#[derive(Debug, Subcommand)]
enum Profile {
    /// Plaintext device without password.
    Generic,
    /// Plaintext device requiring a password.
    Password {
        #[arg(long, default_value = DEFAULT_PASSWORD)]
        password: String,
    },
    /// Noise encrypted device.
    Encrypted {
        /// Base64 encoded pre-shared key.
        #[arg(long, default_value = DEFAULT_ENCRYPTION_KEY)]
        key: NoisePsk,
    },
}

impl Profile {
    fn name(&self) -> &'static str {
        match self {
            Profile::Generic => "generic",
            Profile::Password { .. } => "password",
            Profile::Encrypted { .. } => "encrypted",
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    rt.block_on(run(cli))
        .inspect_err(|error| error!(error = format!("{error:#}"), "Test server failed"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stdout().is_terminal())
        .with_writer(std::io::stdout)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        profile,
        port,
        bind,
        sensor_interval,
    } = cli;

    let profile_name = profile.name();

    let config = match profile {
        Profile::Generic => fixtures::device_config(None, None),
        Profile::Password { password } => fixtures::device_config(Some(password), None),
        Profile::Encrypted { key } => fixtures::device_config(None, Some(key)),
    };

    let (server, events) = EspHomeServer::new(config);

    for entity in fixtures::entities() {
        server.add_entity(entity).context("failed to register entity")?;
    }

    let handle = server.handle();

    for state in fixtures::initial_states() {
        handle.publish_state(state).context("failed to publish initial state")?;
    }

    let listener = TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;

    info!(profile = profile_name, addr = %listener.local_addr()?, "Test server started");

    let shutdown = CancellationToken::new();

    let server_task = tokio::spawn(server.serve(listener, shutdown.clone()));
    let device_task = tokio::spawn(Device::new(handle).run(
        events,
        Duration::from_millis(sensor_interval),
        shutdown.clone(),
    ));

    tokio::select! {
        result = build_signals_fut() => {
            result?;
            info!("Received stop signal");
        }
        () = shutdown.cancelled() => {}
    }

    shutdown.cancel();

    server_task.await.context("server task panicked")??;
    device_task.await.context("device task panicked")??;

    info!("Stopped");

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
