use std::time::Duration;

use esphome_api::{EntityState, Error, NoisePsk};
use testsuite::test_server::{ServerProfile, TestServerConfig};

use super::{TEST_PSK, assert_test_entities, client, encrypted_client, next_state};

fn encrypted_server() -> TestServerConfig {
    TestServerConfig::builder()
        .profile(ServerProfile::Encrypted)
        // Keeps the sensor at its initial value for the whole test.
        .sensor_interval(Duration::from_secs(600))
        .build()
}

#[tokio::test]
async fn encrypted_session() -> anyhow::Result<()> {
    let server = encrypted_server().spawn().await?;

    let connection = encrypted_client(&server, TEST_PSK).connect(false).await?;

    assert_eq!(connection.api_version().major, 1);
    assert_eq!(connection.api_version().minor, 42);
    assert_eq!(connection.log_name(), "test_device @ 127.0.0.1");

    let device_info = connection.device_info().await?;
    assert_eq!(device_info.name, "test_device");
    assert_eq!(device_info.friendly_name, "friendly_test_device");
    assert_eq!(device_info.manufacturer, "Test Inc.");
    assert!(device_info.api_encryption_supported);

    let entities = connection.list_entities().await?;
    assert_test_entities(&entities);

    let mut states = connection.subscribe_states().await?;
    let state = next_state(&mut states, |state| matches!(state, EntityState::Sensor(_))).await;
    assert_eq!(state, EntityState::sensor(2, 25.0));

    connection.disconnect().await?;

    Ok(())
}

#[tokio::test]
async fn plaintext_client_is_refused() -> anyhow::Result<()> {
    let server = encrypted_server().spawn().await?;

    let error = client(&server).connect(false).await.unwrap_err();
    assert!(matches!(error, Error::RequiresEncryption), "{error:?}");

    server.wait_for_log("encryption is required", Duration::from_secs(5)).await?;

    Ok(())
}

#[tokio::test]
async fn wrong_key_is_refused() -> anyhow::Result<()> {
    let server = encrypted_server().spawn().await?;

    let wrong_key = NoisePsk::new([0x42; 32]).to_base64();
    let error = encrypted_client(&server, &wrong_key).connect(false).await.unwrap_err();
    assert!(
        matches!(&error, Error::HandshakeRejected(reason) if reason == "Handshake MAC failure"),
        "{error:?}"
    );

    // The device keeps serving clients holding the right key.
    encrypted_client(&server, TEST_PSK).connect(false).await?.ping().await?;

    Ok(())
}

#[tokio::test]
async fn custom_key() -> anyhow::Result<()> {
    let key = NoisePsk::new([0x17; 32]).to_base64();

    let server = TestServerConfig::builder()
        .profile(ServerProfile::Encrypted)
        .args(vec!["--key".to_owned(), key.clone()])
        .build()
        .spawn()
        .await?;

    encrypted_client(&server, &key).connect(true).await?.ping().await?;
    assert!(encrypted_client(&server, TEST_PSK).connect(true).await.is_err());

    Ok(())
}
