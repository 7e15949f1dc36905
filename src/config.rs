use crate::billing::PricingRules;
use crate::error::ConfigError;
use serde_derive::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "edata.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl HomeAssistantConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MeterConfig {
    pub username: String,
    pub password: String,
    pub cups: String,
    #[serde(default)]
    pub scups: Option<String>,
    #[serde(default)]
    pub authorized_nif: Option<String>,
    #[serde(default)]
    pub surplus: bool,
    /// Enables the cost streams
    #[serde(default)]
    pub billing: Option<PricingRules>,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".storage")
}

fn default_update_interval_minutes() -> u64 {
    60
}

fn default_months_back() -> u32 {
    12
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_update_interval_minutes")]
    pub update_interval_minutes: u64,
    /// Oldest month fetched from the provider, counted back from today
    #[serde(default = "default_months_back")]
    pub months_back: u32,
    #[serde(default)]
    pub recreate_statistics: bool,
    #[serde(default)]
    pub datadis_url: Option<String>,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            home_assistant: HomeAssistantConfig::default(),
            storage_dir: default_storage_dir(),
            update_interval_minutes: default_update_interval_minutes(),
            months_back: default_months_back(),
            recreate_statistics: false,
            datadis_url: None,
            meters: Vec::new(),
        }
    }
}

impl Config {
    /// Loads `EDATA_CONFIG` (or `edata.toml`) and applies environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = env::var("EDATA_CONFIG").ok();
        let path = explicit
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if explicit.is_some() || Path::new(&path).exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_toml(&text)?
        } else {
            Self::default()
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overrides taken from the environment through `var`
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("HA_URL").filter(|u| !u.is_empty()) {
            self.home_assistant.url = url;
        }
        if let Some(token) = var("HA_TOKEN").filter(|t| !t.is_empty()) {
            self.home_assistant.token = token;
        }
        self.home_assistant.url = self.home_assistant.url.trim_end_matches('/').to_string();

        if parse_bool_safe(var("EDATA_RECREATE")) {
            self.recreate_statistics = true;
        }
        if parse_bool_safe(var("EDATA_DEBUG")) {
            self.debug = true;
        }

        if self.meters.is_empty() {
            if let (Some(username), Some(password), Some(cups)) = (
                var("EDATA_USERNAME"),
                var("EDATA_PASSWORD"),
                var("EDATA_CUPS"),
            ) {
                self.meters.push(MeterConfig {
                    username,
                    password,
                    cups,
                    scups: None,
                    authorized_nif: var("EDATA_AUTHORIZED_NIF"),
                    surplus: parse_bool_safe(var("EDATA_SURPLUS")),
                    billing: None,
                });
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.meters.is_empty() {
            return Err(ConfigError::NoMeters);
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_minutes.max(1) * 60)
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
pub fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_bool_safe() {
        assert!(!parse_bool_safe(None));
        assert!(!parse_bool_safe(Some("".to_string())));

        assert!(parse_bool_safe(Some("true".to_string())));
        assert!(parse_bool_safe(Some("TrUe".to_string())));

        assert!(!parse_bool_safe(Some("FALSE".to_string())));

        // Anything else is false
        assert!(!parse_bool_safe(Some("yes".to_string())));
        assert!(!parse_bool_safe(Some("1".to_string())));
    }

    #[test]
    fn test_toml_with_billing() {
        let config = Config::from_toml(
            r#"
            debug = true
            storage_dir = "/data/.storage"

            [home_assistant]
            url = "http://homeassistant.local:8123"
            token = "abc"

            [[meters]]
            username = "12345678Z"
            password = "secret"
            cups = "ES0031405512345678EV"
            surplus = true

            [meters.billing]
            p1_kwh_eur = 0.2
            p2_kwh_eur = 0.15
            p3_kwh_eur = 0.1
            "#,
        )
        .unwrap();

        assert!(config.debug);
        assert_eq!(config.update_interval_minutes, 60);
        assert_eq!(config.months_back, 12);
        assert_eq!(config.storage_dir, PathBuf::from("/data/.storage"));
        assert!(config.home_assistant.is_configured());
        let meter = &config.meters[0];
        assert!(meter.surplus);
        let billing = meter.billing.as_ref().unwrap();
        assert_eq!(billing.p2_kwh_eur, 0.15);
        assert_eq!(billing.p1_kw_year_eur, 30.67266);
        assert_eq!(billing.iva_tax, 1.05);
    }

    #[test]
    fn test_env_overrides_and_single_meter_fallback() {
        let mut config = Config::default();
        config.apply_env(vars(&[
            ("HA_URL", "http://ha:8123/"),
            ("HA_TOKEN", "token"),
            ("EDATA_RECREATE", "True"),
            ("EDATA_USERNAME", "user"),
            ("EDATA_PASSWORD", "pass"),
            ("EDATA_CUPS", "ES0031405512345678EV"),
        ]));

        assert_eq!(config.home_assistant.url, "http://ha:8123");
        assert_eq!(config.home_assistant.token, "token");
        assert!(config.recreate_statistics);
        assert_eq!(config.meters.len(), 1);
        assert_eq!(config.meters[0].cups, "ES0031405512345678EV");
        assert!(config.meters[0].billing.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_meters_is_an_error() {
        let mut config = Config::default();
        config.apply_env(vars(&[("EDATA_USERNAME", "user")]));
        assert!(matches!(config.validate(), Err(ConfigError::NoMeters)));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("meters = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
