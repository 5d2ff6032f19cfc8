//! Authenticated request pipeline.
//!
//! Every GraphQL operation goes through [`RequestPipeline::send`], which
//! attaches the current bearer token, recognises authentication failures
//! and replays the operation once after the coordinator has produced a
//! fresh token.

use bridge_traits::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use core_runtime::config::SessionConfig;
use core_runtime::logging::token_fingerprint;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::coordinator::RefreshCoordinator;
use crate::error::{Result, SessionError};
use crate::store::SessionStore;
use crate::types::{GraphQlRequest, GraphQlResponse};

/// Outcome of one HTTP round trip.
enum Attempt {
    Completed(GraphQlResponse),
    AuthFailure,
}

pub struct RequestPipeline {
    http_client: Arc<dyn HttpClient>,
    endpoint: String,
    timeout: Duration,
    auth_error_codes: Vec<String>,
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl RequestPipeline {
    pub fn new(
        config: &SessionConfig,
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http_client: Arc::clone(&config.http_client),
            endpoint: config.gateway_url.to_string(),
            timeout: config.request_timeout,
            auth_error_codes: config.auth_error_codes.clone(),
            store,
            coordinator,
        }
    }

    /// Send `operation` with the current credentials.
    ///
    /// An authentication failure triggers at most one refresh and one
    /// replay. GraphQL business errors are returned inside the response.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotAuthenticated`] if the gateway demanded
    ///   credentials and none were available
    /// - [`SessionError::RefreshFailed`] if the session could not be renewed
    ///   or the renewed token was rejected too
    /// - [`SessionError::SessionEnded`] if the session was logged out or
    ///   replaced by another login after the operation was sent
    /// - [`SessionError::Network`] / [`SessionError::Http`] passed through
    ///   from the first attempt without any refresh
    pub async fn send(&self, operation: &GraphQlRequest) -> Result<GraphQlResponse> {
        let span = info_span!(
            "gateway_request",
            request_id = %Uuid::new_v4(),
            operation = operation.label(),
        );
        self.send_with_recovery(operation).instrument(span).await
    }

    async fn send_with_recovery(&self, operation: &GraphQlRequest) -> Result<GraphQlResponse> {
        let (session, generation) = self.store.snapshot();
        let sent = session.access_token().map(str::to_owned);

        match self.attempt(operation, sent.as_deref()).await? {
            Attempt::Completed(response) => return Ok(response),
            Attempt::AuthFailure => {}
        }

        let Some(sent) = sent else {
            debug!("Gateway requires authentication and no session is active");
            return Err(SessionError::NotAuthenticated);
        };

        debug!(token = %token_fingerprint(&sent), "Authentication failed; waiting for a fresh token");
        let bundle = self.coordinator.ensure_fresh_token(Some(&sent)).await?;
        if self.store.snapshot().1 != generation {
            // The token belongs to a later session; never replay across users.
            debug!("Session changed since the operation was sent");
            return Err(SessionError::SessionEnded);
        }

        match self.attempt(operation, Some(bundle.access_token())).await? {
            Attempt::Completed(response) => Ok(response),
            Attempt::AuthFailure => {
                warn!(
                    token = %token_fingerprint(bundle.access_token()),
                    "Replay rejected after refresh"
                );
                self.coordinator.invalidate(bundle.access_token()).await;
                Err(SessionError::RefreshFailed(
                    "gateway rejected the refreshed credentials".to_string(),
                ))
            }
        }
    }

    async fn attempt(&self, operation: &GraphQlRequest, token: Option<&str>) -> Result<Attempt> {
        let mut request = HttpRequest::new(HttpMethod::Post, self.endpoint.clone())
            .header("Accept", "application/json")
            .timeout(self.timeout);
        if let Some(token) = token {
            request = request.bearer_token(token);
        }
        let request = request
            .json(operation)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| SessionError::Network(e.to_string()))?;

        self.classify(response)
    }

    fn classify(&self, response: HttpResponse) -> Result<Attempt> {
        if response.is_unauthorized() {
            return Ok(Attempt::AuthFailure);
        }

        let parsed = response.json::<GraphQlResponse>();
        if let Ok(body) = &parsed {
            if body.has_error_code(&self.auth_error_codes) {
                return Ok(Attempt::AuthFailure);
            }
        }

        if !response.is_success() {
            let body = response.text().unwrap_or_default();
            debug!(status = response.status, "Gateway returned an error status");
            return Err(SessionError::Http {
                status: response.status,
                body,
            });
        }

        parsed
            .map(Attempt::Completed)
            .map_err(|e| SessionError::Serialization(e.to_string()))
    }
}
