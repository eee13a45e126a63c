//! Bearer-token gate.
//!
//! Requests present a JWT in the `Authorization` header. The gate extracts
//! claims and optionally enforces tenant consistency and expiry; it is a
//! policy layer in front of the authorization server that issued the token,
//! not a trust root of its own.

use crate::config::ServerConfig;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("malformed authorization header")]
    MalformedHeader,
    #[error("tenant in URL does not match tenant claim")]
    TenantMismatch,
    #[error("token rejected: {0}")]
    Invalid(String),
}

/// Verified identity attached to a request after the token gate.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    /// The raw token, re-used verbatim by the proxy handler.
    pub jwt: String,
    pub tenant: String,
    /// Value of the configured requestor claim.
    pub requestor: String,
    /// Group memberships, empty when the claim is absent.
    pub groups: Vec<String>,
    pub claims: Value,
}

/// Validate the `Authorization` header and extract claims.
///
/// Tenant consistency and expiry checks are each optional per configuration,
/// since an authorization server upstream should already have performed
/// them.
pub fn authorize(
    headers: &HeaderMap,
    tenant: &str,
    config: &ServerConfig,
) -> Result<RequestIdentity, AuthError> {
    let header = headers
        .get("authorization")
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;
    let jwt = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedHeader)?
        .trim();
    if jwt.is_empty() {
        return Err(AuthError::MalformedHeader);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = config.token_check_exp;
    if !config.token_check_exp {
        validation.required_spec_claims.clear();
    }
    let token = decode::<Value>(
        jwt,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AuthError::Invalid(e.to_string()))?;
    let claims = token.claims;

    if config.token_check_tenant {
        let claimed = claims
            .get(&config.tenant_claim_name)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if claimed != tenant {
            return Err(AuthError::TenantMismatch);
        }
    }

    let requestor = claims
        .get(&config.requestor_claim_name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AuthError::Invalid(format!("missing {} claim", config.requestor_claim_name))
        })?;
    let groups = claims
        .get("groups")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(RequestIdentity {
        jwt: jwt.to_string(),
        tenant: tenant.to_string(),
        requestor,
        groups,
        claims,
    })
}
