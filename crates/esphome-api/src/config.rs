//! Device identity and access policy, and the setup messages derived from them.

use typed_builder::TypedBuilder;

use crate::noise::{NoisePsk, ServerHello};
use crate::proto::{DeviceInfoResponse, HelloResponse};

pub const DEFAULT_ESPHOME_VERSION: &str = "2025.4.0";
pub const DEFAULT_SERVER_INFO: &str = "Rust: esphome-native-api";

/// Identity and access settings of an emulated ESPHome device.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DeviceConfig {
    #[builder(setter(into))]
    pub name: String,
    /// Falls back to `name` when unset.
    #[builder(default, setter(strip_option, into))]
    pub friendly_name: Option<String>,
    #[builder(default, setter(into))]
    pub mac_address: String,
    #[builder(default, setter(into))]
    pub model: String,
    #[builder(default, setter(into))]
    pub manufacturer: String,
    #[builder(default, setter(into))]
    pub suggested_area: String,
    #[builder(default, setter(into))]
    pub bluetooth_mac_address: String,
    #[builder(default, setter(into))]
    pub project_name: String,
    #[builder(default, setter(into))]
    pub project_version: String,
    #[builder(default, setter(into))]
    pub compilation_time: String,
    #[builder(default = DEFAULT_ESPHOME_VERSION.to_owned(), setter(into))]
    pub esphome_version: String,
    #[builder(default = 1)]
    pub api_version_major: u32,
    #[builder(default = 10)]
    pub api_version_minor: u32,
    #[builder(default = DEFAULT_SERVER_INFO.to_owned(), setter(into))]
    pub server_info: String,
    /// Clients must send this password in a `ConnectRequest` before anything else.
    #[builder(default, setter(strip_option, into))]
    pub password: Option<String>,
    /// Enables the Noise transport; plaintext clients are then refused.
    #[builder(default, setter(strip_option))]
    pub encryption_key: Option<NoisePsk>,
    #[builder(default)]
    pub webserver_port: u32,
    #[builder(default)]
    pub bluetooth_proxy_feature_flags: u32,
    #[builder(default)]
    pub voice_assistant_feature_flags: u32,
}

impl DeviceConfig {
    pub fn friendly_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.name)
    }

    pub fn hello_response(&self) -> HelloResponse {
        HelloResponse {
            api_version_major: self.api_version_major,
            api_version_minor: self.api_version_minor,
            server_info: self.server_info.clone(),
            name: self.name.clone(),
        }
    }

    pub fn device_info(&self) -> DeviceInfoResponse {
        DeviceInfoResponse {
            uses_password: self.password.is_some(),
            name: self.name.clone(),
            mac_address: self.mac_address.clone(),
            esphome_version: self.esphome_version.clone(),
            compilation_time: self.compilation_time.clone(),
            model: self.model.clone(),
            has_deep_sleep: false,
            project_name: self.project_name.clone(),
            project_version: self.project_version.clone(),
            webserver_port: self.webserver_port,
            legacy_bluetooth_proxy_version: 0,
            manufacturer: self.manufacturer.clone(),
            friendly_name: self.friendly_name().to_owned(),
            legacy_voice_assistant_version: 0,
            bluetooth_proxy_feature_flags: self.bluetooth_proxy_feature_flags,
            suggested_area: self.suggested_area.clone(),
            voice_assistant_feature_flags: self.voice_assistant_feature_flags,
            bluetooth_mac_address: self.bluetooth_mac_address.clone(),
            api_encryption_supported: self.encryption_key.is_some(),
        }
    }

    pub fn server_hello(&self) -> ServerHello {
        ServerHello {
            name: self.name.clone(),
            mac_address: Some(self.mac_address.clone()).filter(|mac| !mac.is_empty()),
        }
    }

    pub(crate) fn check_password(&self, candidate: &str) -> bool {
        match &self.password {
            Some(password) => password == candidate,
            None => true,
        }
    }
}
