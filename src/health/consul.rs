//! Consul HTTP implementation of [`HealthSource`].
//!
//! All watch queries run as stale-allowed blocking reads: the previous
//! `X-Consul-Index` is passed back as `index` and the agent holds the
//! request until something changes or `wait` elapses.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AgentInfo, HealthCheck, HealthError, HealthSource, HealthStatus, ServiceCatalog};

#[derive(Debug, Clone)]
pub struct ConsulHealth {
    client: reqwest::Client,
    base_url: String,
    token: String,
    datacenter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiHealthCheck {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(rename = "ServiceName", default)]
    service_name: String,
    #[serde(rename = "Output", default)]
    output: String,
}

impl From<ApiHealthCheck> for HealthCheck {
    fn from(api: ApiHealthCheck) -> Self {
        // Anything we don't recognize (e.g. maintenance mode) is treated
        // as critical rather than silently healthy.
        let status = HealthStatus::parse(&api.status).unwrap_or(HealthStatus::Critical);
        HealthCheck {
            node: api.node,
            check_id: api.check_id,
            name: api.name,
            status,
            service_id: api.service_id,
            service_name: api.service_name,
            output: api.output,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiNodeService {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCatalogNode {
    #[serde(rename = "Services", default)]
    services: HashMap<String, ApiNodeService>,
}

#[derive(Debug, Deserialize)]
struct ApiNode {
    #[serde(rename = "Node")]
    node: String,
}

impl ConsulHealth {
    /// Build an adapter against the agent at `address`. A bare
    /// `host:port` is treated as http.
    pub fn new(address: &str, token: &str, datacenter: Option<String>) -> Self {
        let base_url = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
            datacenter,
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(format!("{}{}", self.base_url, path));
        if !self.token.is_empty() {
            builder = builder.header("X-Consul-Token", &self.token);
        }
        if let Some(dc) = &self.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, HealthError> {
        let response = builder
            .send()
            .await
            .map_err(|e| HealthError::Network(e.to_string()))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(response)
        } else {
            Err(HealthError::Remote(format!(
                "unexpected status {} from {}",
                response.status(),
                response.url()
            )))
        }
    }

    /// Stale-allowed blocking read returning the parsed body and the next
    /// wait index.
    async fn blocking_get<T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(T, u64), HealthError> {
        let builder = self.request(path).query(&[
            ("index", index.to_string()),
            ("wait", format!("{}s", wait.as_secs())),
            ("stale", String::new()),
        ]);
        let response = self.send(builder).await?;
        let next_index = consul_index(&response).unwrap_or(index);
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((T::default(), next_index));
        }
        let value = response
            .json()
            .await
            .map_err(|e| HealthError::Decode(e.to_string()))?;
        Ok((value, next_index))
    }
}

fn consul_index(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("X-Consul-Index")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[async_trait]
impl HealthSource for ConsulHealth {
    async fn node_checks(
        &self,
        node: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<HealthCheck>, u64), HealthError> {
        let (checks, next): (Vec<ApiHealthCheck>, u64) = self
            .blocking_get(&format!("/v1/health/node/{}", node), index, wait)
            .await?;
        Ok((checks.into_iter().map(HealthCheck::from).collect(), next))
    }

    async fn service_checks(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<HealthCheck>, u64), HealthError> {
        let (checks, next): (Vec<ApiHealthCheck>, u64) = self
            .blocking_get(&format!("/v1/health/checks/{}", service), index, wait)
            .await?;
        Ok((checks.into_iter().map(HealthCheck::from).collect(), next))
    }

    async fn list_services(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<(ServiceCatalog, u64), HealthError> {
        self.blocking_get("/v1/catalog/services", index, wait).await
    }

    async fn node_services(
        &self,
        node: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(ServiceCatalog, u64), HealthError> {
        let (catalog, next): (Option<ApiCatalogNode>, u64) = self
            .blocking_get(&format!("/v1/catalog/node/{}", node), index, wait)
            .await?;
        let mut services = ServiceCatalog::new();
        if let Some(catalog) = catalog {
            // Several registrations of one service merge their tags.
            for registration in catalog.services.into_values() {
                services
                    .entry(registration.service)
                    .or_default()
                    .extend(registration.tags);
            }
        }
        Ok((services, next))
    }

    async fn list_nodes(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<String>, u64), HealthError> {
        let (nodes, next): (Vec<ApiNode>, u64) =
            self.blocking_get("/v1/catalog/nodes", index, wait).await?;
        Ok((nodes.into_iter().map(|n| n.node).collect(), next))
    }

    async fn node_service_tags(
        &self,
        node: &str,
        service: &str,
    ) -> Result<Option<Vec<String>>, HealthError> {
        let response = self
            .send(self.request(&format!("/v1/catalog/node/{}", node)))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let catalog: Option<ApiCatalogNode> = response
            .json()
            .await
            .map_err(|e| HealthError::Decode(e.to_string()))?;
        let Some(catalog) = catalog else {
            return Ok(None);
        };
        Ok(catalog
            .services
            .into_values()
            .find(|s| s.service == service)
            .map(|s| s.tags))
    }

    async fn agent_info(&self) -> Result<AgentInfo, HealthError> {
        let response = self.send(self.request("/v1/agent/self")).await?;
        let info: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HealthError::Decode(e.to_string()))?;
        let config = &info["Config"];
        let node_name = config["NodeName"]
            .as_str()
            .ok_or_else(|| HealthError::Decode("missing Config.NodeName".to_string()))?
            .to_string();
        let datacenter = config["Datacenter"]
            .as_str()
            .ok_or_else(|| HealthError::Decode("missing Config.Datacenter".to_string()))?
            .to_string();
        Ok(AgentInfo {
            node_name,
            datacenter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_maps_to_critical() {
        let api = ApiHealthCheck {
            node: "node1".to_string(),
            check_id: "c1".to_string(),
            name: "check".to_string(),
            status: "maintenance".to_string(),
            service_id: String::new(),
            service_name: String::new(),
            output: String::new(),
        };
        let check = HealthCheck::from(api);
        assert_eq!(check.status, HealthStatus::Critical);
    }

    #[test]
    fn test_address_normalization() {
        let health = ConsulHealth::new("localhost:8500", "", None);
        assert_eq!(health.base_url, "http://localhost:8500");

        let health = ConsulHealth::new("https://consul:8501/", "", None);
        assert_eq!(health.base_url, "https://consul:8501");
    }
}
