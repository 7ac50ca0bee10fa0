//! Identity and entities of the emulated device.

use esphome_api::proto::{
    ColorMode, LightStateResponse, ListEntitiesBinarySensorResponse, ListEntitiesButtonResponse,
    ListEntitiesLightResponse, ListEntitiesSensorResponse, ListEntitiesSwitchResponse, SensorStateClass,
};
use esphome_api::{DeviceConfig, Entity, EntityState, NoisePsk};

pub(crate) const DEFAULT_PASSWORD: &str = "password";
pub(crate) const DEFAULT_ENCRYPTION_KEY: &str = "px7tsbK3C7bpXHr2OevEV2ZMg/FrNBw2+O2pNPbedtA=";

pub(crate) const BUTTON_KEY: u32 = 0;
pub(crate) const SWITCH_KEY: u32 = 1;
pub(crate) const SENSOR_KEY: u32 = 2;
pub(crate) const BINARY_SENSOR_KEY: u32 = 3;
pub(crate) const LIGHT_KEY: u32 = 4;

pub(crate) const INITIAL_SENSOR_VALUE: f32 = 25.0;

pub(crate) fn device_config(password: Option<String>, encryption_key: Option<NoisePsk>) -> DeviceConfig {
    DeviceConfig {
        password,
        encryption_key,
        ..DeviceConfig::builder()
            .name("test_device")
            .friendly_name("friendly_test_device")
            .mac_address("00:00:00:00:00:01")
            .bluetooth_mac_address("B0:00:00:00:00:00")
            .manufacturer("Test Inc.")
            .model("Test Model")
            .suggested_area("Test Area")
            .api_version_minor(42)
            .server_info("test_server_info")
            .build()
    }
}

/// Entities in the order they are listed to clients.
pub(crate) fn entities() -> Vec<Entity> {
    vec![
        Entity::Button(ListEntitiesButtonResponse {
            object_id: "test_button_object_id".to_owned(),
            key: BUTTON_KEY,
            name: "test_button".to_owned(),
            unique_id: "test_button_unique_id".to_owned(),
            icon: "mdi:test-button-icon".to_owned(),
            device_class: "test_button_device_class".to_owned(),
            ..Default::default()
        }),
        Entity::Switch(ListEntitiesSwitchResponse {
            object_id: "test_switch_object_id".to_owned(),
            key: SWITCH_KEY,
            name: "test_switch".to_owned(),
            unique_id: "test_switch_unique_id".to_owned(),
            icon: "mdi:test-switch-icon".to_owned(),
            device_class: "test_switch_device_class".to_owned(),
            ..Default::default()
        }),
        Entity::Sensor(ListEntitiesSensorResponse {
            object_id: "test_sensor_object_id".to_owned(),
            key: SENSOR_KEY,
            name: "test_sensor".to_owned(),
            unique_id: "test_sensor_unique_id".to_owned(),
            icon: "mdi:test-sensor-icon".to_owned(),
            unit_of_measurement: "°C".to_owned(),
            accuracy_decimals: 2,
            device_class: "temperature".to_owned(),
            state_class: SensorStateClass::Measurement as i32,
            ..Default::default()
        }),
        Entity::BinarySensor(ListEntitiesBinarySensorResponse {
            object_id: "test_binary_sensor_object_id".to_owned(),
            key: BINARY_SENSOR_KEY,
            name: "test_binary_sensor".to_owned(),
            unique_id: "test_binary_sensor_unique_id".to_owned(),
            icon: "mdi:test-binary-sensor-icon".to_owned(),
            device_class: "test_binary_sensor_device_class".to_owned(),
            ..Default::default()
        }),
        Entity::Light(ListEntitiesLightResponse {
            object_id: "test_light_object_id".to_owned(),
            key: LIGHT_KEY,
            name: "test_light".to_owned(),
            unique_id: "test_light_unique_id".to_owned(),
            icon: "mdi:test-light-icon".to_owned(),
            min_mireds: 153.0,
            max_mireds: 500.0,
            supported_color_modes: vec![ColorMode::OnOff as i32, ColorMode::Brightness as i32],
            ..Default::default()
        }),
    ]
}

pub(crate) fn initial_states() -> Vec<EntityState> {
    vec![
        EntityState::switch(SWITCH_KEY, false),
        EntityState::sensor(SENSOR_KEY, INITIAL_SENSOR_VALUE),
        EntityState::binary_sensor(BINARY_SENSOR_KEY, false),
        EntityState::Light(LightStateResponse {
            key: LIGHT_KEY,
            state: false,
            brightness: 1.0,
            color_mode: ColorMode::Brightness as i32,
            ..Default::default()
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_belongs_to_a_listed_entity() {
        let entities = entities();

        for state in initial_states() {
            let entity = entities.iter().find(|entity| entity.key() == state.key());
            assert_eq!(entity.map(Entity::kind), Some(state.kind()));
        }
    }

    #[test]
    fn keys_are_unique() {
        let mut keys: Vec<_> = entities().iter().map(Entity::key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn profiles_share_the_identity() {
        let config = device_config(Some(DEFAULT_PASSWORD.to_owned()), None);

        let info = config.device_info();
        assert_eq!(info.friendly_name, "friendly_test_device");
        assert!(info.uses_password);
        assert_eq!(config.hello_response().api_version_minor, 42);
    }
}
