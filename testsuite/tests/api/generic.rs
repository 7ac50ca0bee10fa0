use testsuite::test_server::TestServerConfig;

use super::{assert_test_entities, client};

#[tokio::test]
async fn hello_device_info_and_entities() -> anyhow::Result<()> {
    let server = TestServerConfig::builder().build().spawn().await?;

    let connection = client(&server).connect(false).await?;

    assert_eq!(connection.api_version().major, 1);
    assert_eq!(connection.api_version().minor, 42);
    assert_eq!(connection.server_info(), "test_server_info");
    assert_eq!(connection.log_name(), "test_device @ 127.0.0.1");

    let device_info = connection.device_info().await?;
    assert_eq!(device_info.name, "test_device");
    assert_eq!(device_info.friendly_name, "friendly_test_device");
    assert_eq!(device_info.bluetooth_mac_address, "B0:00:00:00:00:00");
    assert_eq!(device_info.mac_address, "00:00:00:00:00:01");
    assert_eq!(device_info.manufacturer, "Test Inc.");
    assert_eq!(device_info.model, "Test Model");
    assert_eq!(device_info.suggested_area, "Test Area");
    assert!(!device_info.uses_password);
    assert!(!device_info.api_encryption_supported);

    let entities = connection.list_entities().await?;
    assert_test_entities(&entities);

    connection.ping().await?;
    connection.disconnect().await?;

    let output = server.shutdown().await?;
    assert!(output.status.success(), "{output:?}");

    Ok(())
}

#[tokio::test]
async fn several_clients_at_once() -> anyhow::Result<()> {
    let server = TestServerConfig::builder().build().spawn().await?;

    let first = client(&server).connect(true).await?;
    let second = client(&server).connect(true).await?;

    let (first_entities, second_entities) = tokio::try_join!(first.list_entities(), second.list_entities())?;
    assert_eq!(first_entities, second_entities);

    first.disconnect().await?;
    second.ping().await?;

    Ok(())
}
