//! Bearer-token authentication.
//!
//! Generalizes the teacher's single shared daemon token into per-caller
//! `ApiKeyRecord`s: the raw key is hashed and looked up in the KV store,
//! never stored or logged in plaintext. A record carries its own scopes,
//! tier, and expiry, so one compromised key can be revoked without
//! affecting anyone else.

use std::sync::Arc;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::kv::KvStore;
use crate::models::{ApiKeyRecord, Scope};

#[derive(Clone)]
pub struct AuthState {
    pub kv: Arc<dyn KvStore>,
}

fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn key_record_lookup_key(hash: &str) -> String {
    format!("apikey:{}", hash)
}

pub async fn load_api_key(kv: &dyn KvStore, raw_key: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
    let hash = hash_key(raw_key);
    let raw = kv.get(&key_record_lookup_key(&hash)).await?;
    Ok(match raw {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    })
}

pub async fn touch_api_key(kv: &dyn KvStore, record: &mut ApiKeyRecord) -> anyhow::Result<()> {
    record.last_used_at = Some(chrono::Utc::now());
    let hash = &record.key_hash;
    let serialized = serde_json::to_string(record)?;
    kv.set(&key_record_lookup_key(hash), &serialized, None).await?;
    Ok(())
}

/// Extracted and attached to the request by [`require_auth`].
#[derive(Clone)]
pub struct AuthenticatedCaller {
    pub record: ApiKeyRecord,
}

impl AuthenticatedCaller {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.record.scopes.contains(&scope) || self.record.scopes.contains(&Scope::Admin)
    }
}

pub async fn require_auth(
    State(state): State<AuthState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let raw_key = header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized)?
        .trim();

    let mut record = load_api_key(state.kv.as_ref(), raw_key)
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::Unauthorized)?;

    if !record.is_valid_now() {
        return Err(AppError::Forbidden("API key revoked or expired".to_string()));
    }

    touch_api_key(state.kv.as_ref(), &mut record)
        .await
        .map_err(AppError::Internal)?;

    req.extensions_mut().insert(AuthenticatedCaller { record });
    Ok(next.run(req).await)
}
