use std::time::Duration;

use esphome_api::EntityState;
use testsuite::test_server::TestServerConfig;

use super::{client, next_state};

const SENSOR_KEY: u32 = 2;

#[tokio::test]
async fn sensor_values_rise() -> anyhow::Result<()> {
    let server = TestServerConfig::builder()
        .sensor_interval(Duration::from_millis(100))
        .build()
        .spawn()
        .await?;

    let connection = client(&server).connect(true).await?;
    let mut states = connection.subscribe_states().await?;

    let mut values = Vec::new();

    while values.len() < 4 {
        let state = next_state(&mut states, |state| state.key() == SENSOR_KEY).await;

        let EntityState::Sensor(sensor) = state else {
            panic!("unexpected state {state:?}");
        };

        assert!(!sensor.missing_state);
        values.push(sensor.state);
    }

    assert!(values[0] >= 25.0, "{values:?}");
    assert!(values.windows(2).all(|pair| pair[1] > pair[0]), "{values:?}");
    assert!(values.iter().all(|value| (value * 2.0).fract() == 0.0), "{values:?}");

    Ok(())
}
