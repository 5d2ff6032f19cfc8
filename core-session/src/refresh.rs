//! Token exchange against the gateway.
//!
//! The refresh client only performs the exchange. Retrying, queueing and
//! deciding what a failure means for the session are the coordinator's job.

use async_trait::async_trait;
use bridge_traits::{Clock, HttpClient, HttpMethod, HttpRequest};
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::config::SessionConfig;
use core_runtime::logging::token_fingerprint;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::RefreshFailure;
use crate::types::{GraphQlRequest, GraphQlResponse, TokenGrant};

/// Lifetime assumed when the gateway omits an expiry.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

const MAX_EXPIRES_IN_SECS: i64 = 10 * 365 * 24 * 3600;

/// Epoch values above this are milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Exchanges a refresh token for a new credential pair.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RefreshClient: Send + Sync {
    /// Perform one exchange. No retries.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshFailure>;
}

/// [`RefreshClient`] that runs the configured refresh mutation.
///
/// The request is sent without an `Authorization` header: the refresh token
/// travels as the `refreshToken` variable.
pub struct GraphQlRefreshClient {
    http_client: Arc<dyn HttpClient>,
    endpoint: String,
    document: String,
    field: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl GraphQlRefreshClient {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            http_client: Arc::clone(&config.http_client),
            endpoint: config.gateway_url.to_string(),
            document: config.refresh_document.clone(),
            field: config.refresh_field.clone(),
            timeout: config.request_timeout,
            clock: Arc::clone(&config.clock),
        }
    }

    fn operation(&self, refresh_token: &str) -> GraphQlRequest {
        GraphQlRequest::new(self.document.clone())
            .variables(json!({ "refreshToken": refresh_token }))
    }

    fn parse_grant(&self, payload: &Value, presented: &str) -> Result<TokenGrant, RefreshFailure> {
        let access_token = payload
            .get("accessToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshFailure::MalformedResponse("missing accessToken".to_string()))?
            .to_string();

        // Gateways that do not rotate refresh tokens omit the field.
        let refresh_token = payload
            .get("refreshToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or(presented)
            .to_string();

        let expires_at = match payload.get("expiresAt") {
            Some(value) if !value.is_null() => parse_expiry(value).ok_or_else(|| {
                RefreshFailure::MalformedResponse(format!("unreadable expiresAt: {}", value))
            })?,
            _ => {
                let expires_in = payload
                    .get("expiresIn")
                    .and_then(Value::as_i64)
                    .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
                    .clamp(0, MAX_EXPIRES_IN_SECS);
                self.clock.now() + chrono::Duration::seconds(expires_in)
            }
        };

        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_at,
        })
    }
}

/// RFC 3339 string, epoch seconds or epoch milliseconds.
fn parse_expiry(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
                return Some(dt.with_timezone(&Utc));
            }
            raw.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

#[async_trait]
impl RefreshClient for GraphQlRefreshClient {
    #[instrument(skip_all, fields(token = %token_fingerprint(refresh_token)))]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshFailure> {
        let request = HttpRequest::new(HttpMethod::Post, self.endpoint.clone())
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .json(&self.operation(refresh_token))
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        if !response.is_success() {
            warn!(status = response.status, "Refresh rejected by gateway");
            return Err(RefreshFailure::Rejected(format!(
                "HTTP {}",
                response.status
            )));
        }

        let body: GraphQlResponse = response
            .json()
            .map_err(|e| RefreshFailure::MalformedResponse(e.to_string()))?;

        if let Some(first) = body.errors.first() {
            warn!(
                code = first.code().unwrap_or("none"),
                errors = body.errors.len(),
                "Refresh returned GraphQL errors"
            );
            return Err(RefreshFailure::Rejected(first.message.clone()));
        }

        let payload = body.field(&self.field).ok_or_else(|| {
            RefreshFailure::MalformedResponse(format!("missing data.{}", self.field))
        })?;

        let grant = self.parse_grant(payload, refresh_token)?;
        debug!(
            token = %token_fingerprint(&grant.access_token),
            expires_at = %grant.expires_at,
            "Refresh exchange succeeded"
        );
        Ok(grant)
    }
}
