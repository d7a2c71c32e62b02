use serde::{Deserialize, Serialize};

/// Station credentials for the upstream network.
///
/// A pair with either field empty is treated as absent everywhere it is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

impl NetworkCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningState {
    Unconfigured,
    AccessPointActive,
    Connecting,
    Connected,
    /// Reserved for a bounded retry policy; the unbounded policy never enters it.
    ConnectionFailed,
}

impl ProvisioningState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::AccessPointActive => "ACCESS_POINT_ACTIVE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
        }
    }

    pub fn serves_portal(self) -> bool {
        matches!(self, Self::AccessPointActive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Acceleration {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One tick's worth of transducer output, in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub acceleration: Acceleration,
}

impl SensorReading {
    /// Values in telemetry point order.
    pub fn values(&self) -> [f32; 4] {
        [
            self.temperature_c,
            self.acceleration.x,
            self.acceleration.y,
            self.acceleration.z,
        ]
    }
}
