//! Authenticated HTTP client to peer nodes, with a
//! connection/auth pool, the forwarded-header whitelist, and circuit-breaker
//! integration.

mod credential;
mod pool;

pub use credential::{Credential, CredentialPool, CredentialSource};
pub use pool::ConnectionPool;

use std::sync::Arc;
use std::time::Duration;

use agentmesh_breaker::{BreakerRegistry, CallPermit};
use agentmesh_core::error::CoreError;
use agentmesh_registry::{NodeRegistry, RegistryError};
use reqwest::Client;
use serde::Serialize;

/// Headers allowed to pass from an inbound request to a forwarded peer call
/// Anything else (cookies, host, content-length)
/// is dropped at the boundary.
pub const HEADER_CALLER_TOKEN: &str = "x-caller-token";
pub const HEADER_FORWARDED_FROM_NODE: &str = "x-forwarded-from-node";
pub const HEADER_TRACE_ID: &str = "x-trace-id";
pub const HEADER_LOCALE: &str = "x-locale";

pub const FORWARDED_HEADER_WHITELIST: &[&str] = &[
    HEADER_CALLER_TOKEN,
    HEADER_FORWARDED_FROM_NODE,
    HEADER_TRACE_ID,
    HEADER_LOCALE,
];

/// Filters an arbitrary header set down to the whitelist, in whitelist order.
pub fn filter_forwarded_headers(
    headers: &std::collections::HashMap<String, String>,
) -> Vec<(&'static str, String)> {
    FORWARDED_HEADER_WHITELIST
        .iter()
        .filter_map(|&name| headers.get(name).map(|v| (name, v.clone())))
        .collect()
}

pub struct ForwardResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Clock abstraction so tests can control "now" without the transport
/// reading the system clock directly (mirrors the breaker's design).
pub trait Clock: Send + Sync {
    fn now_unix_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as i64
    }
}

pub struct NodeTransport {
    http: Client,
    registry: Arc<NodeRegistry>,
    breakers: Arc<BreakerRegistry>,
    credentials: CredentialPool,
    credential_source: Arc<dyn CredentialSource>,
    pool: ConnectionPool,
    clock: Arc<dyn Clock>,
}

impl NodeTransport {
    pub fn new(
        registry: Arc<NodeRegistry>,
        breakers: Arc<BreakerRegistry>,
        credential_source: Arc<dyn CredentialSource>,
        pool: ConnectionPool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http: Client::new(),
            registry,
            breakers,
            credentials: CredentialPool::default(),
            credential_source,
            pool,
            clock,
        }
    }

    /// Forwards a request to `node_slug`. Always: rate limit check, then the
    /// breaker, then the connection pool, then the call itself.
    pub async fn forward<B: Serialize>(
        &self,
        node_slug: &str,
        path: &str,
        body: &B,
        headers: &std::collections::HashMap<String, String>,
    ) -> Result<ForwardResponse, CoreError> {
        let now = self.clock.now_unix_ms();

        self.registry
            .check_and_consume_rate_limit(node_slug, now)
            .map_err(|e| match e {
                RegistryError::RateLimited(node) => CoreError::TransientPeer {
                    node,
                    message: "rate limit exceeded".into(),
                },
                RegistryError::NotFound(node) => CoreError::TransientPeer {
                    node,
                    message: "unknown node".into(),
                },
            })?;

        let node = self
            .registry
            .get_by_slug(node_slug)
            .ok_or_else(|| CoreError::TransientPeer {
                node: node_slug.to_string(),
                message: "unknown node".into(),
            })?;

        let breaker = self.breakers.get_or_create(node_slug);
        let permit = breaker.acquire(now)?;

        let _slot = self.pool.acquire(node_slug).await;

        let result = self
            .attempt_with_retry(&node.base_url, path, body, headers, node_slug)
            .await;

        match &result {
            Ok(resp) if resp.status < 500 => breaker.record_success(permit, now),
            _ => breaker.record_failure(permit, now),
        }

        result
    }

    async fn attempt_with_retry<B: Serialize>(
        &self,
        base_url: &str,
        path: &str,
        body: &B,
        headers: &std::collections::HashMap<String, String>,
        node_slug: &str,
    ) -> Result<ForwardResponse, CoreError> {
        let mut attempted_refresh = false;
        loop {
            let credential = self
                .credentials
                .get_or_refresh(node_slug, self.credential_source.as_ref(), self.clock.now_unix_ms())
                .await?;

            let mut request = self
                .http
                .post(format!("{base_url}{path}"))
                .bearer_auth(&credential.token)
                .json(body);
            for (name, value) in filter_forwarded_headers(headers) {
                request = request.header(name, value);
            }

            let response = tokio::time::timeout(Duration::from_secs(30), request.send())
                .await
                .map_err(|_| CoreError::Timeout(Duration::from_secs(30)))?
                .map_err(|e| CoreError::TransientPeer {
                    node: node_slug.to_string(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if status.as_u16() == 401 && !attempted_refresh {
                attempted_refresh = true;
                self.credentials.invalidate(node_slug).await;
                continue;
            }
            if status.as_u16() == 401 {
                return Err(CoreError::Auth {
                    node: node_slug.to_string(),
                    message: "refresh did not restore authorization".into(),
                });
            }

            let status_code = status.as_u16();
            let json = response
                .json::<serde_json::Value>()
                .await
                .unwrap_or(serde_json::Value::Null);
            return Ok(ForwardResponse {
                status: status_code,
                body: json,
            });
        }
    }
}
