//! Bearer-token authorization
//!
//! A token maps to the set of route suffixes it may hit. `*` as a role
//! grants every route; the `*` token is the fallback for unknown or absent
//! tokens. With no config file supplied, authorization is disabled and
//! every request passes.

use crate::error::{Error, Result};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Prefix every control route lives under.
pub const BASE_PATH: &str = "/api";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthData {
    token_roles: HashMap<String, Vec<String>>,
    /// Human labels for tokens; informational only.
    #[allow(dead_code)]
    role_names: HashMap<String, String>,
}

pub struct AuthConfig {
    data: AuthData,
    enabled: bool,
}

impl AuthConfig {
    /// Load the token/role file; `None` disables authorization entirely.
    pub fn load(path: Option<&Path>) -> Result<Arc<Self>> {
        let Some(path) = path else {
            return Ok(Arc::new(Self {
                data: AuthData::default(),
                enabled: false,
            }));
        };

        let bytes = std::fs::read(path).map_err(|e| Error::Persist {
            path: path.to_path_buf(),
            message: format!("failed to read auth config: {e}"),
        })?;
        let data: AuthData = serde_json::from_slice(&bytes).map_err(|e| Error::Persist {
            path: path.to_path_buf(),
            message: format!("failed to parse auth config: {e}"),
        })?;

        Ok(Arc::new(Self {
            data,
            enabled: true,
        }))
    }

    /// Check a bearer token against a full route path.
    pub fn validate(&self, auth_header: Option<&str>, route: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let token = auth_header
            .and_then(|header| header.strip_prefix("Bearer "))
            .unwrap_or("*");
        let roles = match self.data.token_roles.get(token) {
            Some(roles) => roles,
            None => match self.data.token_roles.get("*") {
                Some(roles) => roles,
                None => return false,
            },
        };

        roles
            .iter()
            .any(|role| role == "*" || route == format!("{BASE_PATH}{role}"))
    }
}

/// Middleware guarding every control route.
pub async fn guard(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if auth.validate(header, request.uri().path()) {
        next.run(request).await
    } else {
        (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))).into_response()
    }
}
