//! Consul HTTP implementation of [`KvStore`].
//!
//! Locks are built on Consul sessions: a session is created per
//! acquisition, attached to the lock key with `?acquire`, and kept alive by
//! a background renewal task. Losing the session (failed renewals, agent
//! revocation) surfaces through the handle's lost notification.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{KvError, KvStore, LockHandle};

const SESSION_TTL: &str = "30s";
const SESSION_RENEW_INTERVAL: Duration = Duration::from_secs(5);
const LOCK_WATCH_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ConsulKv {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct KvPairMeta {
    #[allow(dead_code)]
    #[serde(rename = "Session", default)]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

impl ConsulKv {
    /// Build an adapter against the agent at `address`. A bare
    /// `host:port` is treated as http.
    pub fn new(address: &str, token: &str) -> Self {
        let base_url = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.header("X-Consul-Token", &self.token)
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, KvError> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| KvError::Network(e.to_string()))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(response)
        } else {
            Err(KvError::Remote(format!(
                "unexpected status {} from {}",
                response.status(),
                response.url()
            )))
        }
    }

    async fn create_session(&self, key: &str) -> Result<String, KvError> {
        let url = format!("{}/v1/session/create", self.base_url);
        let body = serde_json::json!({
            "Name": format!("consul-alerting/{}", key),
            "TTL": SESSION_TTL,
            "LockDelay": "1s",
            "Behavior": "release",
        });
        let response = self.send(self.client.put(&url).json(&body)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(KvError::Session("session endpoint not found".to_string()));
        }
        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        Ok(created.id)
    }

    async fn destroy_session(&self, session: &str) {
        let url = format!("{}/v1/session/destroy/{}", self.base_url, session);
        if let Err(e) = self.send(self.client.put(&url)).await {
            tracing::warn!(session, error = %e, "Error destroying session");
        }
    }

    /// Attempt `?acquire`; Consul answers a bare `true`/`false`.
    async fn try_acquire(&self, key: &str, session: &str) -> Result<bool, KvError> {
        let url = format!("{}?acquire={}", self.kv_url(key), session);
        let response = self.send(self.client.put(&url)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        Ok(body.trim() == "true")
    }

    /// Blocking query on the lock key, returning once the holder session
    /// clears or the wait time elapses.
    async fn wait_for_holder(&self, key: &str, index: u64) -> Result<u64, KvError> {
        let response = self
            .send(self.client.get(self.kv_url(key)).query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", LOCK_WATCH_WAIT.as_secs())),
            ]))
            .await?;
        let next_index = parse_consul_index(&response).unwrap_or(index);
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(next_index);
        }
        // The pair's Session field is all we care about here; ignore the rest.
        let _pairs: Vec<KvPairMeta> = response
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        Ok(next_index)
    }

    /// Renew the session once. `Ok(false)` means the session is gone.
    async fn renew_session(&self, session: &str) -> Result<bool, KvError> {
        let url = format!("{}/v1/session/renew/{}", self.base_url, session);
        let response = self.send(self.client.put(&url)).await?;
        Ok(response.status() != reqwest::StatusCode::NOT_FOUND)
    }

    fn spawn_keepalive(
        &self,
        session: String,
        lost_tx: watch::Sender<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(SESSION_RENEW_INTERVAL).await;
                match client.renew_session(&session).await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        tracing::warn!(session = %session, "Session no longer exists, lock lost");
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(session = %session, error = %e, "Error renewing session");
                        // Enough misses to exceed the session TTL.
                        if failures >= 5 {
                            let _ = lost_tx.send(true);
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn parse_consul_index(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("X-Consul-Index")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[async_trait]
impl KvStore for ConsulKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let response = self
            .send(self.client.get(self.kv_url(key)).query(&[("raw", "")]))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| KvError::Network(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.send(self.client.put(self.kv_url(key)).body(value))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.send(self.client.delete(self.kv_url(key))).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let response = self
            .send(self.client.get(self.kv_url(prefix)).query(&[("keys", "")]))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        response
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<Option<LockHandle>, KvError> {
        let session = self.create_session(key).await?;
        let mut index = 0u64;
        loop {
            if cancel.is_cancelled() {
                self.destroy_session(&session).await;
                return Ok(None);
            }
            match self.try_acquire(key, &session).await {
                Ok(true) => {
                    let (lost_tx, lost_rx) = watch::channel(false);
                    let keepalive = self.spawn_keepalive(session.clone(), lost_tx);
                    return Ok(Some(LockHandle::new(key, session, lost_rx, Some(keepalive))));
                }
                Ok(false) => {
                    // Held by someone else; watch the key until it frees up,
                    // keeping our own session alive in the meantime.
                    let wait = self.wait_for_holder(key, index);
                    tokio::select! {
                        result = wait => match result {
                            Ok(next) => index = next,
                            Err(e) => {
                                self.destroy_session(&session).await;
                                return Err(e);
                            }
                        },
                        _ = cancel.cancelled() => {
                            self.destroy_session(&session).await;
                            return Ok(None);
                        }
                    }
                    match self.renew_session(&session).await {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(KvError::Session(
                                "session expired while waiting for lock".to_string(),
                            ))
                        }
                        Err(e) => {
                            tracing::warn!(session = %session, error = %e, "Error renewing session while waiting for lock");
                        }
                    }
                }
                Err(e) => {
                    self.destroy_session(&session).await;
                    return Err(e);
                }
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), KvError> {
        let url = format!("{}?release={}", self.kv_url(handle.key()), handle.session());
        let result = self.send(self.client.put(&url)).await;
        self.destroy_session(handle.session()).await;
        result.map(|_| ())
    }
}
