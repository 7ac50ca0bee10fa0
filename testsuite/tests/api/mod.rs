//! Scenarios driving the test server through the API client.

mod button;
mod encrypted;
mod generic;
mod password;
mod sensor;
mod switch;

use std::time::Duration;

use esphome_api::proto::EntityCategory;
use esphome_api::{ApiClient, Entity, EntityState};
use testsuite::test_server::TestServer;
use tokio::sync::mpsc;

pub(crate) const TEST_PSK: &str = "px7tsbK3C7bpXHr2OevEV2ZMg/FrNBw2+O2pNPbedtA=";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const STATE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn client(server: &TestServer) -> ApiClient {
    ApiClient::builder()
        .host("127.0.0.1")
        .port(server.port())
        .request_timeout(REQUEST_TIMEOUT)
        .build()
}

pub(crate) fn password_client(server: &TestServer, password: &str) -> ApiClient {
    ApiClient::builder()
        .host("127.0.0.1")
        .port(server.port())
        .password(password)
        .request_timeout(REQUEST_TIMEOUT)
        .build()
}

pub(crate) fn encrypted_client(server: &TestServer, key: &str) -> ApiClient {
    ApiClient::builder()
        .host("127.0.0.1")
        .port(server.port())
        .noise_psk(key.parse().unwrap())
        .request_timeout(REQUEST_TIMEOUT)
        .build()
}

/// Receives states until one matches `predicate`.
pub(crate) async fn next_state(
    states: &mut mpsc::Receiver<EntityState>,
    mut predicate: impl FnMut(&EntityState) -> bool,
) -> EntityState {
    tokio::time::timeout(STATE_TIMEOUT, async {
        loop {
            let state = states.recv().await.expect("state subscription closed");

            if predicate(&state) {
                return state;
            }
        }
    })
    .await
    .expect("no matching state in time")
}

/// Checks the five entities every test server profile exposes.
pub(crate) fn assert_test_entities(entities: &[Entity]) {
    assert_eq!(entities.len(), 5, "{entities:#?}");

    let expected = [
        ("button", 0),
        ("switch", 1),
        ("sensor", 2),
        ("binary_sensor", 3),
        ("light", 4),
    ];

    for (entity, (kind, key)) in entities.iter().zip(expected) {
        assert_eq!(entity.kind().as_str(), kind);
        assert_eq!(entity.key(), key);
        assert_eq!(entity.name(), format!("test_{kind}"));
        assert_eq!(entity.object_id(), format!("test_{kind}_object_id"));
        assert_eq!(entity.unique_id(), format!("test_{kind}_unique_id"));
        assert_eq!(entity.icon(), format!("mdi:test-{}-icon", kind.replace('_', "-")));
    }

    for entity in entities {
        match entity {
            Entity::BinarySensor(listing) => {
                assert_eq!(listing.device_class, "test_binary_sensor_device_class");
                assert!(!listing.disabled_by_default);
                assert_eq!(listing.entity_category(), EntityCategory::None);
            }
            Entity::Button(listing) => {
                assert_eq!(listing.device_class, "test_button_device_class");
                assert!(!listing.disabled_by_default);
                assert_eq!(listing.entity_category(), EntityCategory::None);
            }
            Entity::Switch(listing) => {
                assert_eq!(listing.device_class, "test_switch_device_class");
                assert!(!listing.disabled_by_default);
                assert_eq!(listing.entity_category(), EntityCategory::None);
            }
            Entity::Sensor(listing) => {
                assert_eq!(listing.unit_of_measurement, "°C");
                assert_eq!(listing.accuracy_decimals, 2);
                assert!(!listing.disabled_by_default);
            }
            Entity::Light(listing) => {
                assert!(!listing.disabled_by_default);
                assert_eq!(listing.entity_category(), EntityCategory::None);
            }
            Entity::TextSensor(_) => panic!("unexpected text sensor"),
        }
    }
}
