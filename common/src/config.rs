use serde::{Deserialize, Serialize};

use crate::sun::SolarCalculator;

pub const DEFAULT_TIMEZONE: &str = "Europe/Budapest";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            latitude: 47.896_076,
            longitude: 20.380_324,
            elevation: 0.0,
        }
    }
}

impl Location {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            self.latitude = defaults.latitude;
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            self.longitude = defaults.longitude;
        }
        if !self.elevation.is_finite() || self.elevation < 0.0 {
            self.elevation = 0.0;
        }
    }

    pub fn solar_calculator(&self) -> SolarCalculator {
        SolarCalculator::new(self.latitude, self.longitude, self.elevation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    /// Empty disables the cloud bridge.
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub device_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            device_id: "homelink".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn cloud_enabled(&self) -> bool {
        !self.mqtt_host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub tcp_port: u16,
    pub http_port: u16,
    pub reply_timeout_ms: u64,
    pub mailbox_depth: usize,
    pub alarm_capacity: usize,
    pub timezone: String,
    pub location: Location,
    pub network: NetworkConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tcp_port: 3333,
            http_port: 8080,
            reply_timeout_ms: 1_000,
            mailbox_depth: 8,
            alarm_capacity: 16,
            timezone: DEFAULT_TIMEZONE.to_string(),
            location: Location::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.reply_timeout_ms = self.reply_timeout_ms.clamp(100, 10_000);
        self.mailbox_depth = self.mailbox_depth.clamp(1, 64);
        self.alarm_capacity = self.alarm_capacity.clamp(1, 64);
        if self.timezone.trim().is_empty() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
        if self.network.device_id.trim().is_empty() {
            self.network.device_id = NetworkConfig::default().device_id;
        }
        self.location.sanitize();
    }
}
