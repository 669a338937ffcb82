//! ==============================================================================
//! session.rs - telemetry session seam + http reference transport
//! ==============================================================================
//!
//! purpose:
//!     the gateway never talks to the platform directly. it hands readings to a
//!     TelemetrySession and receives remote commands through a
//!     FeedUpdateHandler. this file defines both seams and ships one concrete
//!     transport so the binary runs end to end:
//!
//!     - outbound: HttpSession buffers readings in the ReadingStore and pushes
//!       each key group to the platform on publish()
//!     - inbound:  a small axum endpoint (POST /api/feed) that forwards remote
//!       readings to the handler (the control bridge)
//!
//! architecture:
//!
//!     scheduler / main ──add_reading──> ReadingStore (persistence_file)
//!                      ──publish─────> HttpSession ──POST──> platform
//!
//!     platform ──POST /api/feed──> feed_router ──handle_update──> ControlBridge
//!
//! relationships:
//!     - used by: main.rs, scheduler.rs, control.rs
//!     - uses: store.rs (outbound buffer), config.rs (credentials),
//!             registry.rs (attributes reported on connect)
//!
//! ==============================================================================

use crate::config::DeviceConfig;
use crate::error::SessionError;
use crate::reading::Reading;
use crate::registry::{Attribute, AttributeRegistry, Parameter, ParameterRegistry};
use crate::store::{ReadingStore, RemovalMode};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

// ==============================================================================
// seams
// ==============================================================================

/// connection to the device-messaging platform
#[async_trait]
pub trait TelemetrySession: Send + Sync {
    async fn connect(&self) -> Result<(), SessionError>;
    async fn disconnect(&self);
    /// buffer a reading for the next publish; false if it could not be buffered
    async fn add_reading(&self, reading: Reading) -> bool;
    /// flush buffered readings, returning how many were delivered
    async fn publish(&self) -> Result<usize, SessionError>;
}

/// receives remote readings, grouped by timestamp
pub trait FeedUpdateHandler: Send + Sync {
    fn handle_update(&self, device_key: &str, readings: &BTreeMap<u64, Vec<Reading>>);
}

// ==============================================================================
// http session
// ==============================================================================

pub struct HttpSession {
    device: DeviceConfig,
    store: Arc<ReadingStore>,
    client: reqwest::Client,
    attributes: Arc<AttributeRegistry>,
    parameters: Arc<ParameterRegistry>,
    connected: AtomicBool,
    // held for a whole publish; a second caller skips instead of queueing
    publish_lock: tokio::sync::Mutex<()>,
}

impl HttpSession {
    /// every platform request gives up after `request_timeout`
    pub fn new(
        device: DeviceConfig,
        store: Arc<ReadingStore>,
        request_timeout: Duration,
    ) -> Result<Self, SessionError> {
        if store.removal_mode() == RemovalMode::WholeGroup {
            tracing::warn!(
                "Store removes whole groups; readings added while publishing may be dropped"
            );
        }
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            device,
            store,
            client,
            attributes: Arc::new(AttributeRegistry::new()),
            parameters: Arc::new(ParameterRegistry::new()),
            connected: AtomicBool::new(false),
            publish_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// attributes and parameters reported to the platform on connect
    pub fn with_registries(
        mut self,
        attributes: Arc<AttributeRegistry>,
        parameters: Arc<ParameterRegistry>,
    ) -> Self {
        self.attributes = attributes;
        self.parameters = parameters;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn device_url(&self, resource: &str) -> String {
        format!(
            "{}/api/devices/{}/{}",
            base_url(&self.device.platform_host),
            self.device.device_key,
            resource
        )
    }

    async fn post<T>(&self, resource: &str, body: &T) -> Result<(), SessionError>
    where
        T: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(self.device_url(resource))
            .basic_auth(&self.device.device_key, Some(&self.device.device_password))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let key = resource.to_string();
            return Err(SessionError::Rejected { key, status: status.as_u16() });
        }
        Ok(())
    }

    /// nothing is sent when both registries are empty
    async fn report_attributes(&self) -> Result<usize, SessionError> {
        let attributes: Vec<Attribute> = self.attributes.get_all().into_values().collect();
        let parameters: Vec<Parameter> = self.parameters.get_all().into_values().collect();
        if attributes.is_empty() && parameters.is_empty() {
            return Ok(0);
        }
        let body = serde_json::json!({ "attributes": attributes, "parameters": parameters });
        self.post("attributes", &body).await?;
        Ok(attributes.len() + parameters.len())
    }

    /// run a store operation on the blocking pool
    async fn on_store<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        F: FnOnce(&ReadingStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || op(&store)).await?)
    }
}

#[async_trait]
impl TelemetrySession for HttpSession {
    async fn connect(&self) -> Result<(), SessionError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            "Connected to platform {} as {}",
            self.device.platform_host,
            self.device.device_key
        );

        match self.report_attributes().await {
            Ok(0) => {}
            Ok(reported) => tracing::debug!(reported, "reported device attributes"),
            Err(e) => tracing::warn!("Couldn't report device attributes: {}", e),
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _guard = self.publish_lock.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("Disconnected from platform");
    }

    async fn add_reading(&self, reading: Reading) -> bool {
        let reference = reading.reference.clone();
        match self.on_store(move |store| store.put(&reading.reference, &reading)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("Couldn't buffer reading '{}': {}", reference, e);
                false
            }
            Err(e) => {
                tracing::error!("Couldn't buffer reading '{}': {}", reference, e);
                false
            }
        }
    }

    async fn publish(&self) -> Result<usize, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        // the publish in flight (or the next one) drains whatever is buffered
        let Ok(_guard) = self.publish_lock.try_lock() else {
            tracing::debug!("publish already in progress, skipping");
            return Ok(0);
        };

        let mut delivered = 0;
        for key in self.on_store(|store| store.get_readings_keys()).await? {
            let readings = {
                let key = key.clone();
                self.on_store(move |store| store.get_readings(&key, usize::MAX)).await?
            };
            if readings.is_empty() {
                continue;
            }
            self.post("readings", &readings).await.map_err(|e| match e {
                SessionError::Rejected { status, .. } => {
                    SessionError::Rejected { key: key.clone(), status }
                }
                other => other,
            })?;

            let count = readings.len();
            self.on_store(move |store| store.remove_readings(&key, count)).await??;
            delivered += count;
        }

        if delivered > 0 {
            tracing::debug!(delivered, "published readings");
        }
        Ok(delivered)
    }
}

/// platform host as a url base, defaulting to https and without trailing slash
pub fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

// ==============================================================================
// inbound feed endpoint
// ==============================================================================

/// body of POST /api/feed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedUpdate {
    pub device_key: String,
    /// timestamp (ms) -> readings received at that time
    pub readings: BTreeMap<u64, Vec<Reading>>,
}

#[derive(Clone)]
pub struct FeedState {
    device_key: String,
    handler: Arc<dyn FeedUpdateHandler>,
    store: Arc<ReadingStore>,
}

impl FeedState {
    pub fn new(
        device_key: impl Into<String>,
        handler: Arc<dyn FeedUpdateHandler>,
        store: Arc<ReadingStore>,
    ) -> Self {
        Self { device_key: device_key.into(), handler, store }
    }
}

pub fn feed_router(state: FeedState) -> Router {
    Router::new()
        .route("/api/feed", post(feed_handler))
        .route("/api/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve_feed(listen: &str, state: FeedState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, feed_router(state)).await?;
    Ok(())
}

async fn feed_handler(
    State(state): State<FeedState>,
    Json(update): Json<FeedUpdate>,
) -> (StatusCode, Json<serde_json::Value>) {
    if update.device_key != state.device_key {
        tracing::warn!("Ignoring feed update for unknown device {}", update.device_key);
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"status": "error", "message": "unknown device"})),
        );
    }

    state.handler.handle_update(&update.device_key, &update.readings);
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// pending readings still waiting in the store
async fn status_handler(State(state): State<FeedState>) -> Json<serde_json::Value> {
    let store = state.store.clone();
    let (pending, keys) =
        tokio::task::spawn_blocking(move || (store.len(), store.get_readings_keys()))
            .await
            .unwrap_or_default();
    Json(serde_json::json!({"pending": pending, "keys": keys}))
}
