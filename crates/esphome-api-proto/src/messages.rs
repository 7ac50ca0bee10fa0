//! Protobuf definitions mirroring ESPHome's `api.proto`.
//!
//! Only the messages needed by the connection layer and the entity kinds supported by
//! this workspace are declared. Field numbers must stay in sync with upstream.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EntityCategory {
    None = 0,
    Config = 1,
    Diagnostic = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SensorStateClass {
    None = 0,
    Measurement = 1,
    TotalIncreasing = 2,
    Total = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SensorLastResetType {
    None = 0,
    Never = 1,
    Auto = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ColorMode {
    Unknown = 0,
    OnOff = 1,
    LegacyBrightness = 2,
    Brightness = 3,
    White = 7,
    ColorTemperature = 11,
    ColdWarmWhite = 19,
    Rgb = 35,
    RgbWhite = 39,
    RgbColorTemperature = 47,
    RgbColdWarmWhite = 51,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LogLevel {
    None = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Config = 4,
    Debug = 5,
    Verbose = 6,
    VeryVerbose = 7,
}

// == Connection == //

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub client_info: String,
    #[prost(uint32, tag = "2")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "3")]
    pub api_version_minor: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloResponse {
    #[prost(uint32, tag = "1")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "2")]
    pub api_version_minor: u32,
    #[prost(string, tag = "3")]
    pub server_info: String,
    #[prost(string, tag = "4")]
    pub name: String,
}

/// Password login, named `AuthenticationRequest` in recent ESPHome releases.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub password: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ConnectResponse {
    #[prost(bool, tag = "1")]
    pub invalid_password: bool,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DisconnectRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DisconnectResponse {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PingRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PingResponse {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DeviceInfoRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceInfoResponse {
    #[prost(bool, tag = "1")]
    pub uses_password: bool,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub mac_address: String,
    #[prost(string, tag = "4")]
    pub esphome_version: String,
    #[prost(string, tag = "5")]
    pub compilation_time: String,
    #[prost(string, tag = "6")]
    pub model: String,
    #[prost(bool, tag = "7")]
    pub has_deep_sleep: bool,
    #[prost(string, tag = "8")]
    pub project_name: String,
    #[prost(string, tag = "9")]
    pub project_version: String,
    #[prost(uint32, tag = "10")]
    pub webserver_port: u32,
    #[prost(uint32, tag = "11")]
    pub legacy_bluetooth_proxy_version: u32,
    #[prost(string, tag = "12")]
    pub manufacturer: String,
    #[prost(string, tag = "13")]
    pub friendly_name: String,
    #[prost(uint32, tag = "14")]
    pub legacy_voice_assistant_version: u32,
    #[prost(uint32, tag = "15")]
    pub bluetooth_proxy_feature_flags: u32,
    #[prost(string, tag = "16")]
    pub suggested_area: String,
    #[prost(uint32, tag = "17")]
    pub voice_assistant_feature_flags: u32,
    #[prost(string, tag = "18")]
    pub bluetooth_mac_address: String,
    #[prost(bool, tag = "19")]
    pub api_encryption_supported: bool,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct GetTimeRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct GetTimeResponse {
    #[prost(fixed32, tag = "1")]
    pub epoch_seconds: u32,
}

// == Entity listing == //

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ListEntitiesRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ListEntitiesDoneResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesBinarySensorResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(string, tag = "5")]
    pub device_class: String,
    #[prost(bool, tag = "6")]
    pub is_status_binary_sensor: bool,
    #[prost(bool, tag = "7")]
    pub disabled_by_default: bool,
    #[prost(string, tag = "8")]
    pub icon: String,
    #[prost(enumeration = "EntityCategory", tag = "9")]
    pub entity_category: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesLightResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(bool, tag = "5")]
    pub legacy_supports_brightness: bool,
    #[prost(bool, tag = "6")]
    pub legacy_supports_rgb: bool,
    #[prost(bool, tag = "7")]
    pub legacy_supports_white_value: bool,
    #[prost(bool, tag = "8")]
    pub legacy_supports_color_temperature: bool,
    #[prost(float, tag = "9")]
    pub min_mireds: f32,
    #[prost(float, tag = "10")]
    pub max_mireds: f32,
    #[prost(string, repeated, tag = "11")]
    pub effects: Vec<String>,
    #[prost(enumeration = "ColorMode", repeated, tag = "12")]
    pub supported_color_modes: Vec<i32>,
    #[prost(bool, tag = "13")]
    pub disabled_by_default: bool,
    #[prost(string, tag = "14")]
    pub icon: String,
    #[prost(enumeration = "EntityCategory", tag = "15")]
    pub entity_category: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesSensorResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(string, tag = "5")]
    pub icon: String,
    #[prost(string, tag = "6")]
    pub unit_of_measurement: String,
    #[prost(int32, tag = "7")]
    pub accuracy_decimals: i32,
    #[prost(bool, tag = "8")]
    pub force_update: bool,
    #[prost(string, tag = "9")]
    pub device_class: String,
    #[prost(enumeration = "SensorStateClass", tag = "10")]
    pub state_class: i32,
    #[prost(enumeration = "SensorLastResetType", tag = "11")]
    pub legacy_last_reset_type: i32,
    #[prost(bool, tag = "12")]
    pub disabled_by_default: bool,
    #[prost(enumeration = "EntityCategory", tag = "13")]
    pub entity_category: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesSwitchResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(string, tag = "5")]
    pub icon: String,
    #[prost(bool, tag = "6")]
    pub assumed_state: bool,
    #[prost(bool, tag = "7")]
    pub disabled_by_default: bool,
    #[prost(enumeration = "EntityCategory", tag = "8")]
    pub entity_category: i32,
    #[prost(string, tag = "9")]
    pub device_class: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesTextSensorResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(string, tag = "5")]
    pub icon: String,
    #[prost(bool, tag = "6")]
    pub disabled_by_default: bool,
    #[prost(enumeration = "EntityCategory", tag = "7")]
    pub entity_category: i32,
    #[prost(string, tag = "8")]
    pub device_class: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListEntitiesButtonResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(string, tag = "5")]
    pub icon: String,
    #[prost(bool, tag = "6")]
    pub disabled_by_default: bool,
    #[prost(enumeration = "EntityCategory", tag = "7")]
    pub entity_category: i32,
    #[prost(string, tag = "8")]
    pub device_class: String,
}

// == States == //

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SubscribeStatesRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct BinarySensorStateResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bool, tag = "2")]
    pub state: bool,
    #[prost(bool, tag = "3")]
    pub missing_state: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LightStateResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bool, tag = "2")]
    pub state: bool,
    #[prost(float, tag = "3")]
    pub brightness: f32,
    #[prost(float, tag = "4")]
    pub red: f32,
    #[prost(float, tag = "5")]
    pub green: f32,
    #[prost(float, tag = "6")]
    pub blue: f32,
    #[prost(float, tag = "7")]
    pub white: f32,
    #[prost(float, tag = "8")]
    pub color_temperature: f32,
    #[prost(string, tag = "9")]
    pub effect: String,
    #[prost(float, tag = "10")]
    pub color_brightness: f32,
    #[prost(enumeration = "ColorMode", tag = "11")]
    pub color_mode: i32,
    #[prost(float, tag = "12")]
    pub cold_white: f32,
    #[prost(float, tag = "13")]
    pub warm_white: f32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SensorStateResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(float, tag = "2")]
    pub state: f32,
    #[prost(bool, tag = "3")]
    pub missing_state: bool,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SwitchStateResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bool, tag = "2")]
    pub state: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TextSensorStateResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(string, tag = "2")]
    pub state: String,
    #[prost(bool, tag = "3")]
    pub missing_state: bool,
}

// == Commands == //

#[derive(Clone, PartialEq, prost::Message)]
pub struct LightCommandRequest {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bool, tag = "2")]
    pub has_state: bool,
    #[prost(bool, tag = "3")]
    pub state: bool,
    #[prost(bool, tag = "4")]
    pub has_brightness: bool,
    #[prost(float, tag = "5")]
    pub brightness: f32,
    #[prost(bool, tag = "6")]
    pub has_rgb: bool,
    #[prost(float, tag = "7")]
    pub red: f32,
    #[prost(float, tag = "8")]
    pub green: f32,
    #[prost(float, tag = "9")]
    pub blue: f32,
    #[prost(bool, tag = "10")]
    pub has_white: bool,
    #[prost(float, tag = "11")]
    pub white: f32,
    #[prost(bool, tag = "12")]
    pub has_color_temperature: bool,
    #[prost(float, tag = "13")]
    pub color_temperature: f32,
    #[prost(bool, tag = "14")]
    pub has_transition_length: bool,
    #[prost(uint32, tag = "15")]
    pub transition_length: u32,
    #[prost(bool, tag = "16")]
    pub has_flash_length: bool,
    #[prost(uint32, tag = "17")]
    pub flash_length: u32,
    #[prost(bool, tag = "18")]
    pub has_effect: bool,
    #[prost(string, tag = "19")]
    pub effect: String,
    #[prost(bool, tag = "20")]
    pub has_color_brightness: bool,
    #[prost(float, tag = "21")]
    pub color_brightness: f32,
    #[prost(bool, tag = "22")]
    pub has_color_mode: bool,
    #[prost(enumeration = "ColorMode", tag = "23")]
    pub color_mode: i32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SwitchCommandRequest {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bool, tag = "2")]
    pub state: bool,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ButtonCommandRequest {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
}

// == Logs and Home Assistant subscriptions == //

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SubscribeLogsRequest {
    #[prost(enumeration = "LogLevel", tag = "1")]
    pub level: i32,
    #[prost(bool, tag = "2")]
    pub dump_config: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeLogsResponse {
    #[prost(enumeration = "LogLevel", tag = "1")]
    pub level: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub message: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub send_failed: bool,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SubscribeHomeassistantServicesRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SubscribeHomeAssistantStatesRequest {}
