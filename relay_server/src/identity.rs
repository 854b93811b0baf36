//! Identity resolution.
//!
//! The handshake hands an opaque token to an external entitlement service
//! and gets back a role string. The service is a collaborator, not part of
//! the core, so it sits behind a trait; the production implementation is
//! an HTTPS GET, tests plug in a static table.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;

/// Entitlement endpoint queried with `?did=<token>`.
pub const ENTITLEMENT_URL: &str = "https://hub.relaymp.net/entitlement";

/// Role granted when the service reports no special entitlement.
pub const DEFAULT_ROLE: &str = "Member";

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves a token to a role string. An error or an empty role
    /// rejects the handshake.
    async fn resolve_role(&self, token: &str) -> anyhow::Result<String>;
}

/// Production resolver against the entitlement service.
pub struct BackendIdentity {
    http: reqwest::Client,
    endpoint: String,
}

impl BackendIdentity {
    pub fn new() -> Self {
        Self::with_endpoint(ENTITLEMENT_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        BackendIdentity {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for BackendIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for BackendIdentity {
    async fn resolve_role(&self, token: &str) -> anyhow::Result<String> {
        if token.is_empty() {
            anyhow::bail!("empty identity token");
        }
        let body = self
            .http
            .get(&self.endpoint)
            .query(&[("did", token)])
            .send()
            .await
            .context("entitlement request")?
            .error_for_status()
            .context("entitlement status")?
            .text()
            .await
            .context("entitlement body")?;
        parse_role(&body).context("entitlement response")
    }
}

/// The service answers with a JSON value: a role string, an array whose
/// first element is the role, or an empty array meaning no entitlement.
pub fn parse_role(body: &str) -> anyhow::Result<String> {
    let value: serde_json::Value =
        serde_json::from_str(body.trim()).context("malformed entitlement json")?;
    let role = match value {
        serde_json::Value::String(role) => role,
        serde_json::Value::Array(items) => match items.first() {
            None => DEFAULT_ROLE.to_string(),
            Some(serde_json::Value::String(role)) => role.clone(),
            Some(other) => anyhow::bail!("unexpected entitlement element: {other}"),
        },
        other => anyhow::bail!("unexpected entitlement value: {other}"),
    };
    Ok(role)
}

/// Fixed token table for tests and offline operation.
#[derive(Default)]
pub struct StaticIdentity {
    roles: HashMap<String, String>,
    fallback: Option<String>,
}

impl StaticIdentity {
    /// Resolves every token to the default role.
    pub fn permissive() -> Self {
        StaticIdentity {
            roles: HashMap::new(),
            fallback: Some(DEFAULT_ROLE.to_string()),
        }
    }

    pub fn with_role(mut self, token: &str, role: &str) -> Self {
        self.roles.insert(token.to_string(), role.to_string());
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve_role(&self, token: &str) -> anyhow::Result<String> {
        if let Some(role) = self.roles.get(token) {
            return Ok(role.clone());
        }
        self.fallback
            .clone()
            .ok_or_else(|| anyhow::anyhow!("unknown token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlement_shapes() {
        assert_eq!(parse_role("\"MDEV\"").unwrap(), "MDEV");
        assert_eq!(parse_role("[]").unwrap(), "Member");
        assert_eq!(parse_role("[\"Support\"]").unwrap(), "Support");
        assert!(parse_role("42").is_err());
        assert!(parse_role("not json").is_err());
    }

    #[tokio::test]
    async fn static_table_resolves() -> anyhow::Result<()> {
        let ids = StaticIdentity::permissive().with_role("tok-dev", "MDEV");
        assert_eq!(ids.resolve_role("tok-dev").await?, "MDEV");
        assert_eq!(ids.resolve_role("anyone").await?, "Member");
        Ok(())
    }
}
