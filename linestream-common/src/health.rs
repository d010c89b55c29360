use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use time::OffsetDateTime;
use tracing::warn;

use crate::log::LogClient;

/// Liveness of the long running loops of a service.
///
/// Each loop registers a component with a deadline and must report healthy more often than
/// that deadline. The process is live when every registered component is; a component that
/// hasn't reported within its deadline is considered stalled.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but never reported
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its deadline
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy until now + deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(_) => warn!("poisoned health registry lock"),
        }
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component. The returned handle goes to the loop that must report.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Combined status of all the components. Unhealthy while nothing is registered.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned health registry lock");
            return HealthStatus::default();
        };
        let now = OffsetDateTime::now_utc();

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let current = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(current, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), current);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

/// Shared state of the health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub service: &'static str,
    pub log: Arc<dyn LogClient>,
    pub probe_timeout: Duration,
    pub liveness: HealthRegistry,
}

/// Whether the log answers a ping within `probe_timeout`.
pub async fn probe_log(log: &dyn LogClient, probe_timeout: Duration) -> bool {
    match tokio::time::timeout(probe_timeout, log.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!("log health probe failed: {}", error);
            false
        }
        Err(_) => {
            warn!("log health probe timed out after {:?}", probe_timeout);
            false
        }
    }
}

/// Add the index, readiness, liveness and log health endpoints to a router.
pub fn add_health_routes(router: Router, state: HealthState) -> Router {
    let health = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness))
        .route("/healthz", get(healthz))
        .with_state(state);

    router.merge(health)
}

async fn index(State(state): State<HealthState>) -> &'static str {
    state.service
}

async fn liveness(State(state): State<HealthState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn healthz(State(state): State<HealthState>) -> Response {
    if probe_log(state.log.as_ref(), state.probe_timeout).await {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Redis not available").into_response()
    }
}
