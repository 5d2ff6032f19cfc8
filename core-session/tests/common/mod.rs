//! Fakes shared by the session integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{BridgeError, Clock, HttpClient, HttpRequest, HttpResponse, KeyValueStore};
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::config::SessionConfig;
use core_session::{RefreshClient, RefreshFailure, TokenGrant};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const GATEWAY_URL: &str = "https://gateway.example.com/graphql";

/// One request as seen by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub operation: Option<String>,
    pub bearer: Option<String>,
}

/// In-process GraphQL gateway that accepts a configurable set of tokens.
///
/// Anonymous requests succeed unless the operation is marked protected.
#[derive(Default)]
pub struct FakeGateway {
    accepted: Mutex<HashSet<String>>,
    protected: Mutex<HashSet<String>>,
    failing: Mutex<HashMap<String, u16>>,
    reject_with_401: Mutex<bool>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accept(&self, token: &str) {
        self.accepted.lock().unwrap().insert(token.to_string());
    }

    pub fn revoke(&self, token: &str) {
        self.accepted.lock().unwrap().remove(token);
    }

    pub fn protect(&self, operation: &str) {
        self.protected.lock().unwrap().insert(operation.to_string());
    }

    pub fn fail_operation(&self, operation: &str, status: u16) {
        self.failing
            .lock()
            .unwrap()
            .insert(operation.to_string(), status);
    }

    pub fn reject_with_401(&self) {
        *self.reject_with_401.lock().unwrap() = true;
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn bearers(&self) -> Vec<Option<String>> {
        self.seen().into_iter().map(|r| r.bearer).collect()
    }

    pub fn count_with(&self, token: &str) -> usize {
        self.seen()
            .iter()
            .filter(|r| r.bearer.as_deref() == Some(token))
            .count()
    }

    fn rejection(&self) -> BridgeResult<HttpResponse> {
        if *self.reject_with_401.lock().unwrap() {
            HttpResponse::from_json(401, &json!({ "message": "unauthorized" }))
        } else {
            HttpResponse::from_json(
                200,
                &json!({
                    "data": null,
                    "errors": [{ "message": "token expired", "extensions": { "code": "UNAUTHENTICATED" } }]
                }),
            )
        }
    }
}

#[async_trait]
impl HttpClient for FakeGateway {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let body: Value = request.json_body()?;
        let operation = body
            .get("operationName")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let bearer = request.bearer().map(str::to_owned);

        self.seen.lock().unwrap().push(SeenRequest {
            operation: operation.clone(),
            bearer: bearer.clone(),
        });

        let name = operation.clone().unwrap_or_default();
        if let Some(status) = self.failing.lock().unwrap().get(&name) {
            return HttpResponse::from_json(*status, &json!({ "message": "upstream failure" }));
        }

        match bearer {
            Some(token) if !self.accepted.lock().unwrap().contains(&token) => self.rejection(),
            None if self.protected.lock().unwrap().contains(&name) => self.rejection(),
            _ => HttpResponse::from_json(
                200,
                &json!({
                    "data": {
                        "echo": operation,
                        "me": { "id": "u-1", "name": "Ada" }
                    }
                }),
            ),
        }
    }
}

/// Refresh client whose exchanges block until permits are released.
pub struct GatedRefreshClient {
    gate: Semaphore,
    outcomes: Mutex<VecDeque<Result<TokenGrant, RefreshFailure>>>,
    presented: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl GatedRefreshClient {
    /// Blocks every exchange until [`release`](Self::release).
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            presented: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Never blocks.
    pub fn open() -> Arc<Self> {
        let client = Self::gated();
        client.release(Semaphore::MAX_PERMITS / 2);
        client
    }

    pub fn push_grant(&self, access: &str, refresh: &str, expires_at: DateTime<Utc>) {
        self.outcomes.lock().unwrap().push_back(Ok(TokenGrant {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_at,
        }));
    }

    pub fn push_failure(&self, failure: RefreshFailure) {
        self.outcomes.lock().unwrap().push_back(Err(failure));
    }

    pub fn release(&self, exchanges: usize) {
        self.gate.add_permits(exchanges);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().unwrap().clone()
    }

    /// Yield until `n` exchanges have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl RefreshClient for GatedRefreshClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.presented
            .lock()
            .unwrap()
            .push(refresh_token.to_string());

        self.gate
            .acquire()
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?
            .forget();

        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RefreshFailure::Transport("no outcome scripted".into())))
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// A store whose writes always fail.
pub struct BrokenStore;

#[async_trait]
impl KeyValueStore for BrokenStore {
    async fn get_string(&self, _key: &str) -> BridgeResult<Option<String>> {
        Err(BridgeError::Storage("disk unavailable".into()))
    }

    async fn set_string(&self, _key: &str, _value: &str) -> BridgeResult<()> {
        Err(BridgeError::Storage("disk unavailable".into()))
    }

    async fn remove(&self, _key: &str) -> BridgeResult<()> {
        Err(BridgeError::Storage("disk unavailable".into()))
    }
}

/// In-memory store whose batch writes hold when they carry a gated value.
pub struct GatedStore {
    inner: bridge_desktop::MemoryKeyValueStore,
    gated_value: String,
    gate: Semaphore,
    holding: AtomicUsize,
}

impl GatedStore {
    pub fn holding_writes_of(value: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: bridge_desktop::MemoryKeyValueStore::new(),
            gated_value: value.to_string(),
            gate: Semaphore::new(0),
            holding: AtomicUsize::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Yield until a gated write is waiting.
    pub async fn wait_until_holding(&self) {
        while self.holding.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl KeyValueStore for GatedStore {
    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        self.inner.get_string(key).await
    }

    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.inner.set_string(key, value).await
    }

    async fn remove(&self, key: &str) -> BridgeResult<()> {
        self.inner.remove(key).await
    }

    async fn set_many(&self, entries: &[(String, String)]) -> BridgeResult<()> {
        if entries.iter().any(|(_, v)| *v == self.gated_value) {
            self.holding.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|e| BridgeError::Storage(e.to_string()))?
                .forget();
        }
        self.inner.set_many(entries).await
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn config(
    gateway: Arc<FakeGateway>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
) -> SessionConfig {
    SessionConfig::builder()
        .gateway_url(GATEWAY_URL)
        .http_client(gateway)
        .store(store)
        .clock(clock)
        .lookup_identity_on_bootstrap(false)
        .build()
        .unwrap()
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
