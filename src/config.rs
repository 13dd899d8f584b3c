//! Configuration management for the CAPI gateway

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::media::companding::Law;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapiConfig {
    pub general: GeneralConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub lines: Vec<LineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    /// Companding law on the bearer channels.
    pub law: AudioLaw,
    /// Prefix applied to national caller numbers.
    pub national_prefix: String,
    /// Prefix applied to international caller numbers.
    pub international_prefix: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: "capi-gateway".to_string(),
            description: "CAPI 2.0 ISDN gateway".to_string(),
            law: AudioLaw::Alaw,
            national_prefix: "0".to_string(),
            international_prefix: "00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dispatch-loop poll timeout, milliseconds.
    pub poll_interval_ms: u64,
    /// Request/confirmation wait, milliseconds.
    pub confirmation_timeout_ms: u64,
    /// LISTEN_REQ info mask; 0xffff includes early B3 signaling.
    pub info_mask: u32,
    /// LISTEN_REQ CIP mask selecting the services to accept.
    pub cip_mask: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30,
            confirmation_timeout_ms: 2000,
            info_mask: 0xffff,
            cip_mask: 0x1fff_03ff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

/// Address routing mode of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsdnMode {
    /// Complete called number delivered in the SETUP.
    #[serde(rename = "msn")]
    Msn,
    /// Called digits collected after the SETUP; the configured number is
    /// a prefix that is stripped from the destination.
    #[serde(rename = "did")]
    Did,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioLaw {
    #[serde(rename = "alaw")]
    Alaw,
    #[serde(rename = "ulaw")]
    Ulaw,
}

impl From<AudioLaw> for Law {
    fn from(law: AudioLaw) -> Law {
        match law {
            AudioLaw::Alaw => Law::ALaw,
            AudioLaw::Ulaw => Law::ULaw,
        }
    }
}

/// Fax tone handling for a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaxDetect {
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "incoming")]
    Incoming,
    #[serde(rename = "outgoing")]
    Outgoing,
    #[serde(rename = "both")]
    Both,
}

impl FaxDetect {
    pub fn wants(&self, outgoing: bool) -> bool {
        matches!(
            (self, outgoing),
            (FaxDetect::Both, _) | (FaxDetect::Incoming, false) | (FaxDetect::Outgoing, true)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    pub name: String,
    /// Number of B channels this section provides.
    pub devices: u16,
    /// Adapter ports the line may use.
    pub controllers: Vec<u8>,
    /// Comma-separated accepted numbers; "*" accepts anything.
    pub incoming_msn: String,
    pub isdn_mode: IsdnMode,
    /// Route the call before the called number is complete.
    pub immediate: bool,
    /// Dial group for group selectors.
    pub group: u32,
    /// Prefix prepended to caller ids.
    pub prefix: String,
    pub rx_gain: f32,
    pub tx_gain: f32,
    pub echo_squelch: bool,
    pub echo_squelch_ratio: f32,
    pub echo_effective_window: usize,
    pub echo_cancel: bool,
    /// Echo canceller option bits (disable-tone handling).
    pub echo_cancel_option: u16,
    /// Echo canceller tail length, milliseconds; 0 selects the maximum.
    pub echo_cancel_tail: u16,
    /// Facility selector of the canceller, adapter specific.
    pub echo_cancel_selector: u16,
    /// Use the adapter's DTMF detector.
    pub dtmf_detect: bool,
    pub fax_detect: FaxDetect,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            name: "isdn".to_string(),
            devices: 2,
            controllers: vec![1],
            incoming_msn: "*".to_string(),
            isdn_mode: IsdnMode::Msn,
            immediate: false,
            group: 0,
            prefix: String::new(),
            rx_gain: 1.0,
            tx_gain: 1.0,
            echo_squelch: false,
            echo_squelch_ratio: crate::media::pipeline::ECHO_TXRX_RATIO,
            echo_effective_window: crate::media::pipeline::ECHO_EFFECTIVE_TX_WINDOW,
            echo_cancel: true,
            echo_cancel_option: 0x0004,
            echo_cancel_tail: 0,
            echo_cancel_selector: 0x0008,
            dtmf_detect: true,
            fax_detect: FaxDetect::Off,
        }
    }
}

impl LineConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn msn_list(&self) -> Vec<&str> {
        self.incoming_msn
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl Default for CapiConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            lines: vec![LineConfig::default()],
        }
    }
}

impl CapiConfig {
    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let cfg: CapiConfig = settings.try_deserialize()?;
        Ok(cfg)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("CAPI_GATEWAY").separator("__"))
            .build()?;
        let cfg: CapiConfig = settings.try_deserialize()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(Error::parse("at least one line section is required"));
        }
        for line in &self.lines {
            if line.name.is_empty() {
                return Err(Error::parse("line name must not be empty"));
            }
            if line.devices == 0 {
                return Err(Error::parse(format!(
                    "line '{}': devices must be at least 1",
                    line.name
                )));
            }
            if line.controllers.is_empty() {
                return Err(Error::parse(format!(
                    "line '{}': at least one controller required",
                    line.name
                )));
            }
            if line.controllers.iter().any(|&c| c == 0 || c > 30) {
                return Err(Error::parse(format!(
                    "line '{}': controller numbers must be in 1..=30",
                    line.name
                )));
            }
            if line.msn_list().is_empty() {
                return Err(Error::parse(format!(
                    "line '{}': incoming_msn must not be empty",
                    line.name
                )));
            }
            if !(0.0..=8.0).contains(&line.rx_gain) || !(0.0..=8.0).contains(&line.tx_gain) {
                return Err(Error::parse(format!(
                    "line '{}': gains must be within 0.0..=8.0",
                    line.name
                )));
            }
            if line.echo_squelch_ratio <= 0.0 {
                return Err(Error::parse(format!(
                    "line '{}': echo_squelch_ratio must be positive",
                    line.name
                )));
            }
            if line.echo_effective_window == 0
                || line.echo_effective_window > crate::media::pipeline::ECHO_TX_WINDOW
            {
                return Err(Error::parse(format!(
                    "line '{}': echo_effective_window must be in 1..={}",
                    line.name,
                    crate::media::pipeline::ECHO_TX_WINDOW
                )));
            }
        }
        if self.engine.poll_interval_ms == 0 || self.engine.poll_interval_ms > 1000 {
            return Err(Error::parse("poll_interval_ms must be in 1..=1000"));
        }
        if self.engine.confirmation_timeout_ms == 0 {
            return Err(Error::parse("confirmation_timeout_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CapiConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_gain() {
        let mut config = CapiConfig::default_config();
        config.lines[0].rx_gain = 42.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_devices() {
        let mut config = CapiConfig::default_config();
        config.lines[0].devices = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let config = CapiConfig::default_config();
        let serialized = toml::to_string_pretty(&config).unwrap();

        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(serialized.as_bytes()).unwrap();

        let loaded = CapiConfig::load_from_file(file.path()).unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.lines.len(), config.lines.len());
        assert_eq!(loaded.lines[0].name, config.lines[0].name);
        assert_eq!(
            loaded.engine.confirmation_timeout_ms,
            config.engine.confirmation_timeout_ms
        );
    }

    #[test]
    fn test_msn_list_splits_and_trims() {
        let mut line = LineConfig::default();
        line.incoming_msn = "1234, 5678 ,*".to_string();
        assert_eq!(line.msn_list(), vec!["1234", "5678", "*"]);
    }

    #[test]
    fn test_fax_detect_direction() {
        assert!(FaxDetect::Both.wants(true));
        assert!(FaxDetect::Both.wants(false));
        assert!(FaxDetect::Incoming.wants(false));
        assert!(!FaxDetect::Incoming.wants(true));
        assert!(!FaxDetect::Off.wants(false));
    }
}
