use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static TEST_SERVER_BIN_PATH: LazyLock<std::path::PathBuf> = LazyLock::new(|| {
    escargot::CargoBuild::new()
        .manifest_path("../esphome-test-server/Cargo.toml")
        .bin("esphome-test-server")
        .current_release()
        .current_target()
        .run()
        .expect("build esphome-test-server")
        .path()
        .to_path_buf()
});

pub fn test_server_assert_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(&*TEST_SERVER_BIN_PATH);
    cmd.env("RUST_BACKTRACE", "0");
    cmd.env_remove("SERVER_PORT");
    cmd
}

pub fn test_server_tokio_cmd() -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&*TEST_SERVER_BIN_PATH);
    cmd.env("RUST_BACKTRACE", "0");
    cmd.env_remove("SERVER_PORT");
    cmd
}

pub fn assert_stdout_eq(output: &assert_cmd::assert::Assert, expected: expect_test::Expect) {
    let stdout = std::str::from_utf8(&output.get_output().stdout).unwrap();
    expected.assert_eq(stdout);
}

pub fn find_unused_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Waits for a TCP port on localhost to accept connections.
///
/// Polls every 50ms until the connection succeeds or `timeout` elapses.
///
/// # Errors
/// Returns an error if the port is not ready within the timeout.
pub async fn wait_for_tcp_port(port: u16, timeout: Duration) -> anyhow::Result<()> {
    let poll_interval = Duration::from_millis(50);
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            anyhow::bail!("port {port} did not become ready within {timeout:?}");
        }

        match tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(_) => return Ok(()),
            Err(_) => tokio::time::sleep(poll_interval).await,
        }
    }
}
