use std::time::Duration;

use esphome_api::Error;
use rstest::rstest;
use testsuite::test_server::{ServerProfile, TestServerConfig};

use super::{assert_test_entities, client, password_client};

fn password_server() -> TestServerConfig {
    TestServerConfig::builder().profile(ServerProfile::Password).build()
}

#[rstest]
#[case::right_password("password", true)]
#[case::wrong_password("not the password", false)]
#[case::empty_password("", false)]
#[tokio::test]
async fn login(#[case] password: &str, #[case] accepted: bool) -> anyhow::Result<()> {
    let server = password_server().spawn().await?;

    let result = password_client(&server, password).connect(true).await;

    if accepted {
        let connection = result?;
        assert!(connection.device_info().await?.uses_password);
        assert_test_entities(&connection.list_entities().await?);
        connection.disconnect().await?;
    } else {
        let error = result.unwrap_err();
        assert!(matches!(error, Error::InvalidPassword), "{error:?}");
        server.wait_for_log("invalid password", Duration::from_secs(5)).await?;
    }

    Ok(())
}

#[tokio::test]
async fn unauthenticated_requests_are_cut_off() -> anyhow::Result<()> {
    let server = password_server().spawn().await?;

    let connection = client(&server).connect(false).await?;

    // Connection setup works without logging in.
    assert_eq!(connection.device_info().await?.name, "test_device");

    let error = connection.list_entities().await.unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed | Error::Io(_)), "{error:?}");

    server
        .wait_for_log("ListEntitiesRequest requires authentication", Duration::from_secs(5))
        .await?;

    Ok(())
}
