use std::time::Duration;

use esphome_api::proto::LogLevel;
use testsuite::test_server::TestServerConfig;

use super::client;

const BUTTON_KEY: u32 = 0;

#[tokio::test]
async fn button_press_reaches_the_server() -> anyhow::Result<()> {
    let server = TestServerConfig::builder().build().spawn().await?;

    let connection = client(&server).connect(true).await?;
    let mut logs = connection.subscribe_logs(LogLevel::Debug, false).await?;

    // Once listed, the log subscription has been handled.
    connection.list_entities().await?;

    connection.button_command(BUTTON_KEY).await?;

    server.wait_for_log("Button pressed", Duration::from_secs(5)).await?;

    let log = tokio::time::timeout(Duration::from_secs(5), logs.recv())
        .await?
        .expect("log subscription closed");
    assert_eq!(log.level(), LogLevel::Info);
    assert_eq!(String::from_utf8_lossy(&log.message), "Button pressed");

    Ok(())
}
