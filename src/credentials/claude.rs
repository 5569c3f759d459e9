//! Claude Code credentials from `~/.claude/.credentials.json`.

use super::{non_empty, Credential, RefreshedTokens};
use crate::error::UsageError;
use crate::models::ProviderId;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::env;
use std::path::PathBuf;

pub const TOKEN_ENDPOINT: &str = "https://platform.claude.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_KEY: &str = "claudeAiOauth";

/// Claude's data directory, honouring `CLAUDE_CONFIG_DIR`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var("CLAUDE_CONFIG_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn credentials_path() -> PathBuf {
    data_dir().join(".credentials.json")
}

pub fn parse(root: &Value) -> Result<Credential, UsageError> {
    let oauth = root.get(OAUTH_KEY).ok_or_else(|| {
        UsageError::Unauthenticated(
            "No OAuth credentials found. Run `claude` to authenticate.".to_string(),
        )
    })?;

    let access_token = non_empty(oauth.get("accessToken")).ok_or_else(|| {
        UsageError::Unauthenticated("No access token. Run `claude` to authenticate.".to_string())
    })?;

    let expires_at = oauth
        .get("expiresAt")
        .and_then(Value::as_i64)
        .filter(|ms| *ms > 0)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    let plan_hints = ["rateLimitTier", "subscriptionType"]
        .iter()
        .filter_map(|key| non_empty(oauth.get(*key)))
        .collect();

    Ok(Credential {
        provider: ProviderId::Claude,
        access_token,
        refresh_token: non_empty(oauth.get("refreshToken")),
        expires_at,
        last_refresh: None,
        id_token: None,
        account_id: None,
        plan_hints,
        is_api_key: false,
    })
}

pub fn refresh_body(refresh_token: &str) -> Value {
    json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
        "client_id": OAUTH_CLIENT_ID,
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
    let oauth = object
        .entry(OAUTH_KEY)
        .or_insert_with(|| json!({}));
    if !oauth.is_object() {
        *oauth = json!({});
    }

    oauth["accessToken"] = json!(tokens.access_token);
    if let Some(refresh_token) = &tokens.refresh_token {
        oauth["refreshToken"] = json!(refresh_token);
    }
    let expires_at = tokens
        .expires_in
        .filter(|s| s.is_finite() && *s > 0.0)
        .and_then(|s| Duration::try_milliseconds((s * 1000.0).round() as i64))
        .and_then(|lifetime| now.checked_add_signed(lifetime));
    match expires_at {
        Some(expires_at) => oauth["expiresAt"] = json!(expires_at.timestamp_millis()),
        None => {
            if let Some(expires_in) = tokens.expires_in {
                tracing::warn!(expires_in, "Ignoring out-of-range token lifetime");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials() {
        let root = json!({
            "claudeAiOauth": {
                "accessToken": "test-token-123",
                "refreshToken": "refresh-456",
                "expiresAt": 1234567890000i64,
                "subscriptionType": "pro",
                "rateLimitTier": "default_claude_max_5x"
            }
        });
        let credential = parse(&root).unwrap();
        assert_eq!(credential.access_token, "test-token-123");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh-456"));
        assert_eq!(
            credential.expires_at,
            Utc.timestamp_opt(1_234_567_890, 0).single()
        );
        assert_eq!(
            credential.plan_hints,
            vec!["default_claude_max_5x".to_string(), "pro".to_string()]
        );
    }

    #[test]
    fn test_parse_missing_oauth() {
        assert!(matches!(
            parse(&json!({})),
            Err(UsageError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_parse_blank_access_token() {
        let root = json!({ "claudeAiOauth": { "accessToken": "  " } });
        assert!(matches!(parse(&root), Err(UsageError::Unauthenticated(_))));
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token_when_not_rotated() {
        let mut root = json!({
            "claudeAiOauth": { "accessToken": "a", "refreshToken": "r", "scopes": ["x"] }
        });
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let tokens = RefreshedTokens {
            access_token: "b".into(),
            refresh_token: None,
            id_token: None,
            expires_in: Some(60.0),
        };
        apply_refresh(&mut root, &tokens, now);
        assert_eq!(root["claudeAiOauth"]["accessToken"], "b");
        assert_eq!(root["claudeAiOauth"]["refreshToken"], "r");
        assert_eq!(root["claudeAiOauth"]["scopes"][0], "x");
        assert_eq!(
            root["claudeAiOauth"]["expiresAt"],
            (now + Duration::seconds(60)).timestamp_millis()
        );
    }

    #[test]
    fn test_apply_refresh_ignores_unrepresentable_lifetime() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for expires_in in [1e300, f64::INFINITY, f64::NAN, 9.3e15] {
            let mut root = json!({
                "claudeAiOauth": { "accessToken": "a", "refreshToken": "r", "expiresAt": 5 }
            });
            let tokens = RefreshedTokens {
                access_token: "b".into(),
                refresh_token: Some("r2".into()),
                id_token: None,
                expires_in: Some(expires_in),
            };
            apply_refresh(&mut root, &tokens, now);
            assert_eq!(root["claudeAiOauth"]["accessToken"], "b");
            assert_eq!(root["claudeAiOauth"]["refreshToken"], "r2");
            assert_eq!(root["claudeAiOauth"]["expiresAt"], 5);
        }
    }
}
