use serde::{Deserialize, Serialize};

pub const CREDENTIALS_NAMESPACE: &str = "wifi-config";
pub const CREDENTIALS_SSID_KEY: &str = "ssid";
pub const CREDENTIALS_PASSWORD_KEY: &str = "password";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    pub tick_interval_ms: u64,
    pub connect_retry_interval_ms: u64,
    pub restart_ack_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            connect_retry_interval_ms: 1_000,
            restart_ack_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningConfig {
    pub ap_ssid: String,
    pub portal_port: u16,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "ESP32_Config".to_string(),
            portal_port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataServerConfig {
    pub port: u16,
    pub namespace_index: u16,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            port: 4840,
            namespace_index: 1,
        }
    }
}

/// Analog front end used by the temperature transducer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AdcConfig {
    pub reference_volts: f32,
    pub resolution: f32,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            reference_volts: 3.3,
            resolution: 4095.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MotionBusConfig {
    pub address: u8,
    pub baudrate_khz: u32,
}

impl Default for MotionBusConfig {
    fn default() -> Self {
        Self {
            address: 0x68,
            baudrate_khz: 400,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub server: DataServerConfig,
    #[serde(default)]
    pub adc: AdcConfig,
    #[serde(default)]
    pub motion: MotionBusConfig,
}

impl NodeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.timing.tick_interval_ms = self.timing.tick_interval_ms.clamp(10, 60_000);
        self.timing.connect_retry_interval_ms =
            self.timing.connect_retry_interval_ms.clamp(100, 60_000);
        self.timing.restart_ack_delay_ms = self.timing.restart_ack_delay_ms.min(30_000);

        if self.provisioning.ap_ssid.trim().is_empty() || self.provisioning.ap_ssid.len() > 32 {
            self.provisioning.ap_ssid = ProvisioningConfig::default().ap_ssid;
        }
        if self.provisioning.portal_port == 0 {
            self.provisioning.portal_port = ProvisioningConfig::default().portal_port;
        }

        if self.server.port == 0 {
            self.server.port = DataServerConfig::default().port;
        }
        // Namespace 0 belongs to the server's standard nodes.
        if self.server.namespace_index == 0 {
            self.server.namespace_index = DataServerConfig::default().namespace_index;
        }

        let adc = &mut self.adc;
        if !(adc.reference_volts.is_finite() && adc.reference_volts > 0.0) {
            adc.reference_volts = AdcConfig::default().reference_volts;
        }
        if !(adc.resolution.is_finite() && adc.resolution >= 1.0) {
            adc.resolution = AdcConfig::default().resolution;
        }

        self.motion.baudrate_khz = self.motion.baudrate_khz.clamp(10, 1_000);
    }
}
