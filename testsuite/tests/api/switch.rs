use esphome_api::EntityState;
use testsuite::test_server::TestServerConfig;

use super::{client, next_state};

const SWITCH_KEY: u32 = 1;

#[tokio::test]
async fn switch_commands_are_echoed() -> anyhow::Result<()> {
    let server = TestServerConfig::builder().build().spawn().await?;

    let connection = client(&server).connect(true).await?;
    let mut states = connection.subscribe_states().await?;

    let initial = next_state(&mut states, |state| state.key() == SWITCH_KEY).await;
    assert_eq!(initial, EntityState::switch(SWITCH_KEY, false));

    connection.switch_command(SWITCH_KEY, true).await?;
    let on = next_state(&mut states, |state| state.key() == SWITCH_KEY).await;
    assert_eq!(on, EntityState::switch(SWITCH_KEY, true));

    connection.switch_command(SWITCH_KEY, false).await?;
    let off = next_state(&mut states, |state| state.key() == SWITCH_KEY).await;
    assert_eq!(off, EntityState::switch(SWITCH_KEY, false));

    Ok(())
}

#[tokio::test]
async fn light_commands_update_the_light() -> anyhow::Result<()> {
    const LIGHT_KEY: u32 = 4;

    let server = TestServerConfig::builder().build().spawn().await?;

    let connection = client(&server).connect(true).await?;
    let mut states = connection.subscribe_states().await?;

    connection
        .light_command(esphome_api::proto::LightCommandRequest {
            key: LIGHT_KEY,
            has_state: true,
            state: true,
            has_brightness: true,
            brightness: 0.5,
            ..Default::default()
        })
        .await?;

    let state = next_state(&mut states, |state| matches!(state, EntityState::Light(light) if light.state)).await;
    let EntityState::Light(light) = state else {
        unreachable!()
    };
    assert_eq!(light.brightness, 0.5);

    Ok(())
}
