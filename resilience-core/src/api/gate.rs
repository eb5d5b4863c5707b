//! Degradation gate.
//!
//! Every request is stamped with a [`DegradedMode`] extension. While the
//! primary store is healthy, or for read-only verbs, requests pass. A degraded
//! mutation passes only if its path is allow-listed, and backup lifecycle
//! mutations additionally need an elevated role. Anything else gets a 503 with
//! `safeMode: true`.
//!
//! If the gate cannot evaluate health in time it applies the configured
//! [`FailurePolicy`], fail-open unless configured otherwise.

use super::error::ApiError;
use super::ApiState;
use crate::config::{FailurePolicy, GateConfig};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    Normal,
    Degraded,
}

/// Request extension readable by downstream handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradedMode(pub bool);

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Health evaluation exceeded {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    /// Degraded, allow-listed mutation.
    Allow,
    /// Degraded lifecycle mutation without an elevated role.
    Forbidden,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Operator,
    Elevated,
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Option<String>,
}

/// Path pattern. `*` matches one segment, or one-or-more when last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<String>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        Self {
            segments: split_path(pattern).map(String::from).collect(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = split_path(path).collect();
        for (i, segment) in self.segments.iter().enumerate() {
            let last = i + 1 == self.segments.len();
            match (segment.as_str(), parts.get(i)) {
                ("*", Some(_)) if last => return true,
                ("*", Some(_)) => continue,
                (expected, Some(actual)) if expected == *actual => continue,
                _ => return false,
            }
        }
        parts.len() == self.segments.len()
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub fn is_read_only(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

pub struct GatePolicy {
    allow_list: Vec<PathPattern>,
    lifecycle: Vec<PathPattern>,
    role_header: String,
    actor_header: String,
    elevated_roles: Vec<String>,
    operator_roles: Vec<String>,
    retry_after_secs: u64,
    evaluation_timeout: Duration,
    on_error: FailurePolicy,
}

impl GatePolicy {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            allow_list: config.allow_list.iter().map(|p| PathPattern::parse(p)).collect(),
            lifecycle: config.backup_lifecycle.iter().map(|p| PathPattern::parse(p)).collect(),
            role_header: config.role_header.to_ascii_lowercase(),
            actor_header: config.actor_header.to_ascii_lowercase(),
            elevated_roles: config.elevated_roles.clone(),
            operator_roles: config.operator_roles.clone(),
            retry_after_secs: config.retry_after_secs,
            evaluation_timeout: Duration::from_millis(config.evaluation_timeout_ms),
            on_error: config.on_evaluation_error,
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs
    }

    pub fn actor(&self, headers: &HeaderMap) -> Actor {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        let role = header(&self.role_header);
        let id = header(&self.actor_header)
            .or_else(|| role.clone())
            .unwrap_or_else(|| "anonymous".to_string());
        Actor { id, role }
    }

    pub fn has_access(&self, role: Option<&str>, access: Access) -> bool {
        let Some(role) = role else { return false };
        let roles = match access {
            Access::Operator => &self.operator_roles,
            Access::Elevated => &self.elevated_roles,
        };
        roles.iter().any(|r| r == role)
    }

    /// Resolve the caller and check it holds `access`.
    pub fn authorize(&self, headers: &HeaderMap, access: Access) -> Result<Actor, ApiError> {
        let actor = self.actor(headers);
        if actor.role.is_none() {
            return Err(ApiError::Unauthorized("Missing actor role".into()));
        }
        if !self.has_access(actor.role.as_deref(), access) {
            return Err(ApiError::Forbidden(format!(
                "Role '{}' may not perform this operation",
                actor.role.as_deref().unwrap_or_default()
            )));
        }
        Ok(actor)
    }

    pub fn decide(&self, mode: GateMode, method: &Method, path: &str, role: Option<&str>) -> GateDecision {
        if mode == GateMode::Normal || is_read_only(method) {
            return GateDecision::Pass;
        }
        if self.lifecycle.iter().any(|p| p.matches(path)) {
            return if self.has_access(role, Access::Elevated) {
                GateDecision::Allow
            } else {
                GateDecision::Forbidden
            };
        }
        if self.allow_list.iter().any(|p| p.matches(path)) {
            GateDecision::Allow
        } else {
            GateDecision::Reject
        }
    }

    fn fallback_mode(&self, error: &GateError) -> GateMode {
        let mode = match self.on_error {
            FailurePolicy::FailOpen => GateMode::Normal,
            FailurePolicy::FailClosed => GateMode::Degraded,
        };
        tracing::warn!(error = %error, policy = ?self.on_error, "Gate evaluation failed");
        mode
    }
}

async fn evaluate(state: &ApiState) -> Result<GateMode, GateError> {
    let timeout = state.gate.evaluation_timeout;
    match tokio::time::timeout(timeout, state.health.is_healthy()).await {
        Ok(true) => Ok(GateMode::Normal),
        Ok(false) => Ok(GateMode::Degraded),
        Err(_) => Err(GateError::Timeout(timeout)),
    }
}

pub async fn current_mode(state: &ApiState) -> GateMode {
    evaluate(state)
        .await
        .unwrap_or_else(|e| state.gate.fallback_mode(&e))
}

pub async fn degradation_gate(State(state): State<ApiState>, mut request: Request, next: Next) -> Response {
    let mode = current_mode(&state).await;
    request
        .extensions_mut()
        .insert(DegradedMode(mode == GateMode::Degraded));

    let role = state.gate.actor(request.headers()).role;
    let path = request.uri().path().to_string();
    match state.gate.decide(mode, request.method(), &path, role.as_deref()) {
        GateDecision::Pass => next.run(request).await,
        GateDecision::Allow => {
            tracing::debug!(method = %request.method(), path = %path, "Allow-listed mutation during safe mode");
            next.run(request).await
        }
        GateDecision::Forbidden => {
            tracing::warn!(method = %request.method(), path = %path, "Backup lifecycle mutation refused during safe mode");
            ApiError::Forbidden("Backup operations during safe mode require an elevated role".into()).into_response()
        }
        GateDecision::Reject => {
            tracing::info!(method = %request.method(), path = %path, "Mutation blocked by safe mode");
            ApiError::SafeMode {
                message: "Service is in safe mode: the primary data store is unavailable and writes are temporarily disabled"
                    .into(),
                retry_after_secs: state.gate.retry_after_secs,
            }
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn policy() -> GatePolicy {
        GatePolicy::from_config(&GateConfig::default())
    }

    #[test]
    fn test_pattern_matching() {
        let exact = PathPattern::parse("/api/ledger/transfers");
        assert!(exact.matches("/api/ledger/transfers"));
        assert!(exact.matches("/api/ledger/transfers/"));
        assert!(!exact.matches("/api/ledger/transfers/abc"));

        let tail = PathPattern::parse("/api/auth/*");
        assert!(tail.matches("/api/auth/login"));
        assert!(tail.matches("/api/auth/oauth/callback"));
        assert!(!tail.matches("/api/auth"));

        let middle = PathPattern::parse("/api/*/items");
        assert!(middle.matches("/api/orders/items"));
        assert!(!middle.matches("/api/orders/items/1"));
    }

    #[test]
    fn test_normal_mode_passes_everything() {
        let p = policy();
        assert_eq!(p.decide(GateMode::Normal, &Method::POST, "/products", None), GateDecision::Pass);
        assert_eq!(p.decide(GateMode::Normal, &Method::POST, "/backups/full", None), GateDecision::Pass);
    }

    #[test]
    fn test_degraded_decisions() {
        let p = policy();
        let d = GateMode::Degraded;
        assert_eq!(p.decide(d, &Method::GET, "/products", None), GateDecision::Pass);
        assert_eq!(p.decide(d, &Method::HEAD, "/products", None), GateDecision::Pass);
        assert_eq!(p.decide(d, &Method::POST, "/products", None), GateDecision::Reject);
        assert_eq!(p.decide(d, &Method::DELETE, "/products/p1", Some("admin")), GateDecision::Reject);
        assert_eq!(p.decide(d, &Method::POST, "/api/ledger/transfers", None), GateDecision::Allow);
        assert_eq!(p.decide(d, &Method::POST, "/api/auth/login", None), GateDecision::Allow);
    }

    #[test]
    fn test_lifecycle_needs_elevated_role_even_when_allow_listed() {
        let p = policy();
        let d = GateMode::Degraded;
        assert_eq!(p.decide(d, &Method::POST, "/backups/full", None), GateDecision::Forbidden);
        assert_eq!(p.decide(d, &Method::POST, "/backups/full", Some("operator")), GateDecision::Forbidden);
        assert_eq!(p.decide(d, &Method::POST, "/backups/full", Some("admin")), GateDecision::Allow);
        assert_eq!(p.decide(d, &Method::DELETE, "/backups/delete/abc", Some("admin")), GateDecision::Allow);
    }

    #[test]
    fn test_failure_policy_is_named() {
        let error = GateError::Timeout(Duration::from_millis(10));
        assert_eq!(policy().fallback_mode(&error), GateMode::Normal);

        let config = GateConfig {
            on_evaluation_error: FailurePolicy::FailClosed,
            ..GateConfig::default()
        };
        assert_eq!(GatePolicy::from_config(&config).fallback_mode(&error), GateMode::Degraded);
    }

    #[test]
    fn test_authorize() {
        let p = policy();
        let mut headers = HeaderMap::new();
        assert!(matches!(p.authorize(&headers, Access::Operator), Err(ApiError::Unauthorized(_))));

        headers.insert("x-actor-role", HeaderValue::from_static("operator"));
        assert!(p.authorize(&headers, Access::Operator).is_ok());
        assert!(matches!(p.authorize(&headers, Access::Elevated), Err(ApiError::Forbidden(_))));

        headers.insert("x-actor-role", HeaderValue::from_static("admin"));
        headers.insert("x-actor-id", HeaderValue::from_static("ops-42"));
        let actor = p.authorize(&headers, Access::Elevated).unwrap();
        assert_eq!(actor.id, "ops-42");
    }

    #[test]
    fn test_failure_policy() {
        let mut config = GateConfig::default();
        let err = GateError::Timeout(Duration::from_millis(5));
        assert_eq!(GatePolicy::from_config(&config).fallback_mode(&err), GateMode::Normal);
        config.on_evaluation_error = FailurePolicy::FailClosed;
        assert_eq!(GatePolicy::from_config(&config).fallback_mode(&err), GateMode::Degraded);
    }
}
