//! Lifecycle of an `esphome-test-server` process.
//!
//! [`TestServerConfig::spawn`] starts the binary and returns once its port accepts
//! connections. Both output streams are drained in the background: every line is echoed
//! to stderr with a `[SERVER]` prefix and recorded, so tests can wait for a log line and inspect
//! the full output after [`TestServer::shutdown`].

use std::net::{Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use crate::cli::{find_unused_port, test_server_tokio_cmd};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProfile {
    Generic,
    Password,
    Encrypted,
}

impl ServerProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerProfile::Generic => "generic",
            ServerProfile::Password => "password",
            ServerProfile::Encrypted => "encrypted",
        }
    }
}

#[derive(Debug, TypedBuilder)]
pub struct TestServerConfig {
    #[builder(default = ServerProfile::Generic)]
    profile: ServerProfile,
    /// An unused port is picked when unset.
    #[builder(default, setter(strip_option))]
    port: Option<u16>,
    /// Passed as `RUST_LOG`.
    #[builder(default = "debug".to_owned(), setter(into))]
    log_filter: String,
    #[builder(default, setter(strip_option))]
    sensor_interval: Option<Duration>,
    /// Appended after the profile subcommand.
    #[builder(default, setter(into))]
    args: Vec<String>,
    #[builder(default = Duration::from_secs(10))]
    startup_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    shutdown_timeout: Duration,
}

impl TestServerConfig {
    /// Starts the server and waits for its port to open.
    ///
    /// # Errors
    /// Fails when the process exits before its port opens, or when the port is not
    /// ready within the startup timeout.
    pub async fn spawn(self) -> anyhow::Result<TestServer> {
        let port = self.port.unwrap_or_else(find_unused_port);

        let mut cmd = test_server_tokio_cmd();
        cmd.arg(self.profile.as_str())
            .args(&self.args)
            .arg("--port")
            .arg(port.to_string());

        if let Some(interval) = self.sensor_interval {
            cmd.arg("--sensor-interval").arg(interval.as_millis().to_string());
        }

        let mut process = cmd
            .env("RUST_LOG", &self.log_filter)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start esphome-test-server")?;

        let stdout_lines = Arc::new(Mutex::new(Vec::new()));
        let stderr_lines = Arc::new(Mutex::new(Vec::new()));

        let stdout = process.stdout.take().context("failed to take stdout")?;
        let stderr = process.stderr.take().context("failed to take stderr")?;

        let mut server = TestServer {
            process,
            port,
            stdout: Arc::clone(&stdout_lines),
            stderr: Arc::clone(&stderr_lines),
            drains: vec![drain(stdout, stdout_lines), drain(stderr, stderr_lines)],
            shutdown_timeout: self.shutdown_timeout,
        };

        server.wait_until_ready(self.startup_timeout).await?;

        Ok(server)
    }
}

/// A running test server. Dropping it kills the process.
pub struct TestServer {
    process: Child,
    port: u16,
    stdout: Arc<Mutex<Vec<String>>>,
    stderr: Arc<Mutex<Vec<String>>>,
    drains: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

/// What a test server left behind once stopped.
#[derive(Debug)]
pub struct ServerOutput {
    pub status: ExitStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ServerOutput {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.iter().chain(self.stderr.iter()).map(String::as_str)
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.lines().any(|line| line.contains(pattern))
    }
}

impl TestServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Output lines recorded so far, stdout first.
    pub fn logs(&self) -> Vec<String> {
        let mut logs = self.stdout.lock().clone();
        logs.extend(self.stderr.lock().iter().cloned());
        logs
    }

    /// Waits until a recorded line contains `pattern`, and returns it.
    ///
    /// # Errors
    /// Returns an error if no such line shows up within `timeout`.
    pub async fn wait_for_log(&self, pattern: &str, timeout: Duration) -> anyhow::Result<String> {
        self.wait_for_line(|line| line.contains(pattern), timeout)
            .await
            .with_context(|| format!("no log line containing {pattern:?}"))
    }

    /// Waits until a recorded line satisfies `predicate`, and returns it.
    ///
    /// # Errors
    /// Returns an error if no such line shows up within `timeout`.
    pub async fn wait_for_line<F>(&self, predicate: F, timeout: Duration) -> anyhow::Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let start = Instant::now();

        loop {
            if let Some(line) = self.logs().into_iter().find(|line| predicate(line)) {
                return Ok(line);
            }

            if start.elapsed() > timeout {
                anyhow::bail!("no matching log line within {timeout:?}");
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stops the server, gracefully first, and collects its output.
    ///
    /// The process is killed if it does not exit within the shutdown timeout.
    pub async fn shutdown(mut self) -> anyhow::Result<ServerOutput> {
        self.request_stop();

        let status = match tokio::time::timeout(self.shutdown_timeout, self.process.wait()).await {
            Ok(status) => status.context("failed to wait for esphome-test-server")?,
            Err(_) => {
                eprintln!("[SERVER] did not stop within {:?}; killing it", self.shutdown_timeout);
                self.process.kill().await.context("failed to kill esphome-test-server")?;
                self.process.wait().await.context("failed to reap esphome-test-server")?
            }
        };

        Ok(self.take_output(status).await)
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let start = Instant::now();

        loop {
            if let Some(status) = self.process.try_wait().context("failed to poll esphome-test-server")? {
                let output = self.take_output(status).await;
                anyhow::bail!(
                    "esphome-test-server exited early ({}) before opening port {}:\n{}",
                    output.status,
                    self.port,
                    output.lines().collect::<Vec<_>>().join("\n")
                );
            }

            if tokio::net::TcpStream::connect(self.address()).await.is_ok() {
                return Ok(());
            }

            if start.elapsed() > timeout {
                let _ = self.process.start_kill();
                anyhow::bail!("port {} did not become ready within {timeout:?}", self.port);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    fn request_stop(&mut self) {
        let Some(pid) = self.process.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return;
        };

        // SAFETY: `kill` has no memory safety requirements; the pid belongs to our child process, not reaped yet.
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };

        if ret != 0 {
            let _ = self.process.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) {
        let _ = self.process.start_kill();
    }

    async fn take_output(&mut self, status: ExitStatus) -> ServerOutput {
        for drain in self.drains.drain(..) {
            let _ = tokio::time::timeout(self.shutdown_timeout, drain).await;
        }

        ServerOutput {
            status,
            stdout: self.stdout.lock().clone(),
            stderr: self.stderr.lock().clone(),
        }
    }
}

fn drain<R>(reader: R, lines: Arc<Mutex<Vec<String>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();

            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_owned();
                    eprintln!("[SERVER] {line}");
                    lines.lock().push(line);
                }
            }
        }
    })
}
