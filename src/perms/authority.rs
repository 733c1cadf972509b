use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::PermError;
use crate::perms::types::{CheckRequest, CheckResponse, MetaRequest, MetaResponse};
use crate::settings;

/// Three-valued answer of an external authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    True,
    False,
    Undefined,
}

impl Tristate {
    pub fn as_bool(self) -> bool {
        matches!(self, Tristate::True)
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

/// A permissions system outside this process that, once discovered, owns every
/// decision. Metadata methods return `None` when the authority has nothing set.
#[async_trait]
pub trait ExternalAuthority: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, identity: Uuid, permission: &str) -> Result<Tristate, PermError>;

    async fn prefix(&self, identity: Uuid) -> Result<Option<String>, PermError>;

    async fn suffix(&self, identity: Uuid) -> Result<Option<String>, PermError>;

    async fn primary_group(&self, identity: Uuid) -> Result<Option<String>, PermError>;
}

/// Authority backed by another deployment's HTTP read API.
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PermError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        // No trailing slash so paths can be appended directly
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Succeeds when the remote answers its health endpoint with a 2xx.
    pub async fn probe(&self) -> Result<(), PermError> {
        let url = format!("{}/healthz", self.base_url);
        self.client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }

    async fn meta(&self, identity: Uuid) -> Result<MetaResponse, PermError> {
        let url = format!("{}/v1/meta", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&MetaRequest { identity })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[async_trait]
impl ExternalAuthority for HttpAuthority {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn check(&self, identity: Uuid, permission: &str) -> Result<Tristate, PermError> {
        let url = format!("{}/v1/check", self.base_url);
        let resp: CheckResponse = self
            .client
            .post(&url)
            .json(&CheckRequest {
                identity,
                permission: permission.to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.allowed.into())
    }

    async fn prefix(&self, identity: Uuid) -> Result<Option<String>, PermError> {
        Ok(non_empty(self.meta(identity).await?.prefix))
    }

    async fn suffix(&self, identity: Uuid) -> Result<Option<String>, PermError> {
        Ok(non_empty(self.meta(identity).await?.suffix))
    }

    async fn primary_group(&self, identity: Uuid) -> Result<Option<String>, PermError> {
        Ok(non_empty(self.meta(identity).await?.primary_group))
    }
}

/// Probe the configured authority once.
///
/// Any failure is logged and yields `None`; the caller then uses the built-in
/// resolver for the rest of the process lifetime.
pub async fn discover(cfg: &settings::Authority) -> Option<Arc<dyn ExternalAuthority>> {
    let url = cfg.url.as_deref()?;
    let timeout = Duration::from_millis(cfg.probe_timeout_ms);

    let authority = match HttpAuthority::new(url, timeout) {
        Ok(authority) => authority,
        Err(e) => {
            warn!(url, error = %e, "Failed to build authority client, using built-in permissions");
            return None;
        }
    };

    match authority.probe().await {
        Ok(()) => {
            info!(url = authority.base_url(), "External permissions authority active");
            Some(Arc::new(authority))
        }
        Err(e) => {
            warn!(url, error = %e, "External authority probe failed, using built-in permissions");
            None
        }
    }
}
