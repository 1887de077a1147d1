use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{BalancerError, Result};

/// Maps a client address to a region name.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct GeoAnswer {
    region: String,
}

/// Queries `GET {service_url}/{ip}` and reads the `region` field of the JSON answer.
pub struct HttpGeoLocator {
    client: reqwest::Client,
    service_url: String,
}

impl HttpGeoLocator {
    pub fn new(service_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create geo-routing client: {}", e))?;

        Ok(Self {
            client,
            service_url: service_url.into(),
        })
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    async fn locate(&self, ip: IpAddr) -> Result<String> {
        let url = format!("{}/{}", self.service_url.trim_end_matches('/'), ip);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BalancerError::Upstream(format!(
                "Geo-routing service answered {}",
                response.status()
            )));
        }

        let answer: GeoAnswer = response.json().await?;
        debug!("Geo-routing placed {} in {}", ip, answer.region);
        Ok(answer.region)
    }
}
