use crate::attributes::Attributes;
use crate::config::HomeAssistantConfig;
use crate::meter::MeterStatus;
use crate::streams::DOMAIN;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// Publishes meter summaries as Home Assistant sensor states
pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(config: &HomeAssistantConfig) -> Self {
        Self {
            endpoint_url: config.url.trim_end_matches('/').to_string(),
            auth_token: config.token.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn sensor_id(scups: &str) -> String {
        format!("sensor.{}_{}", DOMAIN, scups.to_ascii_lowercase())
    }

    /// Writes the meter status as state and the summary as attributes
    pub async fn publish_meter(
        &self,
        scups: &str,
        status: MeterStatus,
        attributes: &Attributes,
    ) -> Result<HASensor, anyhow::Error> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        let entity_id = Self::sensor_id(scups);
        let body = serde_json::json!({
            "state": status,
            "attributes": attributes,
        });
        let result = self
            .client
            .post(format!("{}/api/states/{}", self.endpoint_url, entity_id))
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    pub last_changed: String,
    #[serde(default)]
    pub last_reported: String,
    pub last_updated: String,
}
