//! Codex CLI credentials from `$CODEX_HOME/auth.json`.

use super::{non_empty, parse_jwt_payload, Credential, RefreshedTokens};
use crate::error::UsageError;
use crate::models::ProviderId;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::env;
use std::path::PathBuf;

pub const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";
const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Tokens older than this are refreshed even if not yet expired.
const REFRESH_AFTER_DAYS: i64 = 8;

/// Codex's data directory, honouring `CODEX_HOME`.
pub fn data_dir() -> PathBuf {
    if let Ok(codex_home) = env::var("CODEX_HOME") {
        let trimmed = codex_home.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codex")
}

pub fn credentials_path() -> PathBuf {
    data_dir().join("auth.json")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn parse(root: &Value) -> Result<Credential, UsageError> {
    if let Some(api_key) = non_empty(root.get("OPENAI_API_KEY")) {
        return Ok(Credential {
            is_api_key: true,
            ..Credential::bearer(ProviderId::Codex, api_key)
        });
    }

    let tokens = root.get("tokens").ok_or_else(|| {
        UsageError::Unauthenticated("Codex auth.json missing tokens. Run `codex` to log in.".into())
    })?;
    let access_token = non_empty(tokens.get("access_token")).ok_or_else(|| {
        UsageError::Unauthenticated("No access token. Run `codex` to authenticate.".to_string())
    })?;

    let expires_at = parse_jwt_payload(&access_token)
        .and_then(|claims| claims.get("exp").and_then(Value::as_i64))
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single());

    let last_refresh = non_empty(root.get("last_refresh"))
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(Credential {
        provider: ProviderId::Codex,
        access_token,
        refresh_token: non_empty(tokens.get("refresh_token")),
        expires_at,
        last_refresh,
        id_token: non_empty(tokens.get("id_token")),
        account_id: non_empty(tokens.get("account_id")),
        plan_hints: Vec::new(),
        is_api_key: false,
    })
}

pub fn is_stale(credential: &Credential, now: DateTime<Utc>) -> bool {
    credential
        .last_refresh
        .is_none_or(|at| now - at > Duration::days(REFRESH_AFTER_DAYS))
}

pub fn refresh_body(refresh_token: &str) -> Value {
    json!({
        "client_id": OAUTH_CLIENT_ID,
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
        "scope": "openid profile email",
    })
}

/// Write refreshed tokens into the parsed file, leaving other fields alone.
pub fn apply_refresh(root: &mut Value, tokens: &RefreshedTokens, now: DateTime<Utc>) {
    if !root.is_object() {
        *root = json!({});
    }
    let Some(object) = root.as_object_mut() else {
        return;
    };
    let stored = object.entry("tokens").or_insert_with(|| json!({}));
    if !stored.is_object() {
        *stored = json!({});
    }

    stored["access_token"] = json!(tokens.access_token);
    if let Some(refresh_token) = &tokens.refresh_token {
        stored["refresh_token"] = json!(refresh_token);
    }
    if let Some(id_token) = &tokens.id_token {
        stored["id_token"] = json!(id_token);
    }
    object.insert("last_refresh".to_string(), json!(now.to_rfc3339()));
}
