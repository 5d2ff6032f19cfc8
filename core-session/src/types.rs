use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Opaque user record returned by the gateway.
///
/// The core never interprets it beyond caching it with the credentials;
/// the host reads whatever fields its screens need.
///
/// # Examples
///
/// ```
/// use core_session::Identity;
/// use serde_json::json;
///
/// let identity = Identity::new(json!({ "id": "u-1", "roles": ["admin"] }));
/// assert_eq!(identity.field("id"), Some(&json!("u-1")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Value);

impl Identity {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// An identity with nothing known about the user.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Identity {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Result of a successful token exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Everything needed to make authenticated calls on behalf of one user.
///
/// Bundles are immutable. A refresh or identity update builds a new bundle
/// and swaps it in whole, so a reader never sees a new access token paired
/// with an old refresh token.
///
/// # Security
///
/// `Debug` redacts both tokens.
///
/// # Examples
///
/// ```
/// use core_session::{CredentialBundle, Identity};
/// use chrono::{Duration, Utc};
///
/// let bundle = CredentialBundle::new(
///     "at-1",
///     "rt-1",
///     Utc::now() + Duration::minutes(5),
///     Identity::empty(),
/// );
/// assert!(!format!("{:?}", bundle).contains("at-1"));
/// ```
#[derive(Clone, PartialEq)]
pub struct CredentialBundle {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    identity: Identity,
}

impl CredentialBundle {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        identity: Identity,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            identity,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// When the access token stops being accepted.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Successor bundle after a refresh. The identity carries over.
    pub fn renewed(&self, grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
            identity: self.identity.clone(),
        }
    }

    /// Same credentials with a different identity.
    pub fn with_identity(&self, identity: Identity) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    /// Whether the token expires within `margin` of `now`.
    pub fn is_expired_with_margin(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let Ok(margin) = chrono::Duration::from_std(margin) else {
            return true;
        };
        match now.checked_add_signed(margin) {
            Some(deadline) => deadline >= self.expires_at,
            None => true,
        }
    }

    /// Time left before expiry, `None` once expired.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok()
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("identity", &self.identity)
            .finish()
    }
}

/// The authentication state of one session store.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Session {
    #[default]
    Empty,
    Active(Arc<CredentialBundle>),
}

impl Session {
    pub fn is_active(&self) -> bool {
        matches!(self, Session::Active(_))
    }

    pub fn bundle(&self) -> Option<&Arc<CredentialBundle>> {
        match self {
            Session::Active(bundle) => Some(bundle),
            Session::Empty => None,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.bundle().map(|b| b.access_token())
    }
}

/// A GraphQL operation as sent over HTTP.
///
/// ```
/// use core_session::GraphQlRequest;
/// use serde_json::json;
///
/// let op = GraphQlRequest::new("query Listing($id: ID!) { listing(id: $id) { id } }")
///     .operation_name("Listing")
///     .variable("id", json!("l-42"));
/// assert_eq!(op.label(), "Listing");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub variables: Value,
}

impl GraphQlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: Value::Null,
        }
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Replace all variables.
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Set a single variable, keeping the others.
    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        if !self.variables.is_object() {
            self.variables = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.variables {
            map.insert(name.into(), value);
        }
        self
    }

    /// Name used in logs and spans.
    pub fn label(&self) -> &str {
        self.operation_name.as_deref().unwrap_or("anonymous")
    }
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        let mut extensions = match self.extensions.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        extensions.insert("code".to_string(), Value::String(code.into()));
        self.extensions = Some(Value::Object(extensions));
        self
    }

    /// `extensions.code`, if present.
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
    }
}

/// A GraphQL response body.
///
/// Business errors stay inside `errors`; only authentication failures are
/// intercepted by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether any error carries one of `codes`.
    pub fn has_error_code(&self, codes: &[String]) -> bool {
        self.errors
            .iter()
            .filter_map(GraphQlError::code)
            .any(|code| codes.iter().any(|c| c == code))
    }

    /// `data.<name>`, if present.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(name))
    }

    /// Deserialize `data`, turning GraphQL errors into [`SessionError::GraphQl`].
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        if !self.errors.is_empty() {
            return Err(SessionError::GraphQl(self.errors));
        }
        let data = self
            .data
            .ok_or_else(|| SessionError::Serialization("response has no data".to_string()))?;
        Ok(serde_json::from_value(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn bundle() -> CredentialBundle {
        CredentialBundle::new(
            "at-secret",
            "rt-secret",
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            Identity::new(json!({ "id": "u-1" })),
        )
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let debug = format!("{:?}", bundle());
        assert!(!debug.contains("at-secret"));
        assert!(!debug.contains("rt-secret"));
        assert!(debug.contains("[REDACTED]"));

        let grant = TokenGrant {
            access_token: "at-2".into(),
            refresh_token: "rt-2".into(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{:?}", grant).contains("at-2"));
    }

    #[test]
    fn test_renewed_keeps_identity() {
        let original = bundle();
        let expires = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
        let renewed = original.renewed(TokenGrant {
            access_token: "at-2".into(),
            refresh_token: "rt-2".into(),
            expires_at: expires,
        });

        assert_eq!(renewed.access_token(), "at-2");
        assert_eq!(renewed.refresh_token(), "rt-2");
        assert_eq!(renewed.expires_at(), expires);
        assert_eq!(renewed.identity(), original.identity());
        assert_eq!(original.access_token(), "at-secret");
    }

    #[test]
    fn test_with_identity_keeps_tokens() {
        let updated = bundle().with_identity(Identity::new(json!({ "id": "u-2" })));
        assert_eq!(updated.access_token(), "at-secret");
        assert_eq!(updated.identity().field("id"), Some(&json!("u-2")));
    }

    #[test]
    fn test_expiry_helpers() {
        let b = bundle();
        let now = b.expires_at() - chrono::Duration::seconds(90);

        assert!(!b.is_expired_with_margin(now, Duration::from_secs(60)));
        assert!(b.is_expired_with_margin(now, Duration::from_secs(90)));
        assert_eq!(b.time_until_expiry(now), Some(Duration::from_secs(90)));
        assert_eq!(
            b.time_until_expiry(b.expires_at() + chrono::Duration::seconds(1)),
            None
        );
    }

    #[test]
    fn test_request_serialization() {
        let op = GraphQlRequest::new("query Me { me { id } }").operation_name("Me");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, json!({ "query": "query Me { me { id } }", "operationName": "Me" }));

        let op = GraphQlRequest::new("query { x }")
            .variable("a", json!(1))
            .variable("b", json!("two"));
        assert_eq!(op.variables, json!({ "a": 1, "b": "two" }));
        assert_eq!(op.label(), "anonymous");
    }

    #[test]
    fn test_error_code() {
        let err: GraphQlError = serde_json::from_value(json!({
            "message": "token expired",
            "extensions": { "code": "UNAUTHENTICATED" }
        }))
        .unwrap();
        assert_eq!(err.code(), Some("UNAUTHENTICATED"));
        assert_eq!(GraphQlError::new("boom").code(), None);
        assert_eq!(GraphQlError::new("x").with_code("FORBIDDEN").code(), Some("FORBIDDEN"));
    }

    #[test]
    fn test_into_data() {
        #[derive(Deserialize)]
        struct Me {
            me: Value,
        }

        let ok: GraphQlResponse =
            serde_json::from_value(json!({ "data": { "me": { "id": "u-1" } } })).unwrap();
        let me: Me = ok.into_data().unwrap();
        assert_eq!(me.me["id"], "u-1");

        let failed = GraphQlResponse {
            data: None,
            errors: vec![GraphQlError::new("ticket not found")],
        };
        assert!(matches!(
            failed.into_data::<Value>(),
            Err(SessionError::GraphQl(errors)) if errors.len() == 1
        ));

        let empty = GraphQlResponse::default();
        assert!(matches!(
            empty.into_data::<Value>(),
            Err(SessionError::Serialization(_))
        ));
    }

    #[test]
    fn test_has_error_code() {
        let response = GraphQlResponse {
            data: None,
            errors: vec![
                GraphQlError::new("nope"),
                GraphQlError::new("expired").with_code("UNAUTHENTICATED"),
            ],
        };
        assert!(response.has_error_code(&["UNAUTHENTICATED".to_string()]));
        assert!(!response.has_error_code(&["FORBIDDEN".to_string()]));
    }

    #[test]
    fn test_session_accessors() {
        assert!(!Session::Empty.is_active());
        assert!(Session::Empty.access_token().is_none());

        let active = Session::Active(Arc::new(bundle()));
        assert!(active.is_active());
        assert_eq!(active.access_token(), Some("at-secret"));
    }
}
