//! Login, invite and signup exchanges against `/api/auth/cli/*`.
//!
//! Successful verification writes a fresh credential record; the previous
//! database selection survives only if the new database list still has it.

use crate::client::{ApiClient, ApiError};
use crate::credentials::{CredentialError, CredentialStore, DatabaseEntry, StoredCredentials};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

const AUTH_BASE: &str = "/api/auth/cli";
const DEFAULT_SESSION_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Authentication response did not include a token")]
    MissingToken,

    #[error("Logged in, but the session could not be saved: {0}")]
    Store(#[from] CredentialError),
}

pub async fn request_code(client: &ApiClient, email: &str) -> Result<Value, ApiError> {
    client.post(&format!("{AUTH_BASE}/request-code"), &json!({ "email": email }), None).await
}

pub async fn verify_code(
    client: &ApiClient,
    store: &CredentialStore,
    email: &str,
    code: &str,
) -> Result<StoredCredentials, AuthError> {
    let resp = client
        .post(&format!("{AUTH_BASE}/verify-code"), &json!({ "email": email, "code": code }), None)
        .await?;
    establish_session(store, &resp, email)
}

pub async fn verify_invite(
    client: &ApiClient,
    store: &CredentialStore,
    email: &str,
    invite_code: &str,
) -> Result<StoredCredentials, AuthError> {
    let resp = client
        .post(
            &format!("{AUTH_BASE}/verify-invite"),
            &json!({ "email": email, "invite_code": invite_code }),
            None,
        )
        .await?;
    establish_session(store, &resp, email)
}

pub async fn initiate_signup(
    client: &ApiClient,
    email: &str,
    name: Option<&str>,
    company: Option<&str>,
) -> Result<Value, ApiError> {
    let mut body = json!({ "email": email });
    if let Some(name) = name {
        body["name"] = json!(name);
    }
    if let Some(company) = company {
        body["company"] = json!(company);
    }
    client.post(&format!("{AUTH_BASE}/initiate-signup"), &body, None).await
}

pub async fn complete_signup(
    client: &ApiClient,
    store: &CredentialStore,
    email: &str,
    code: &str,
) -> Result<StoredCredentials, AuthError> {
    let resp = client
        .post(&format!("{AUTH_BASE}/complete-signup"), &json!({ "email": email, "code": code }), None)
        .await?;
    establish_session(store, &resp, email)
}

pub async fn trial_status(client: &ApiClient, email: &str) -> Result<Value, ApiError> {
    client
        .get_with_query(&format!("{AUTH_BASE}/trial-status"), &[("email", email)], None)
        .await
}

pub async fn validate_token(client: &ApiClient, token: &str) -> Result<Value, ApiError> {
    client.post(&format!("{AUTH_BASE}/validate-token"), &json!({}), Some(token)).await
}

fn establish_session(
    store: &CredentialStore,
    resp: &Value,
    email: &str,
) -> Result<StoredCredentials, AuthError> {
    let previous = store.load_unchecked().and_then(|c| c.selected_database);
    let creds = credentials_from_response(resp, email, previous, Utc::now())?;
    store.save(&creds)?;
    info!("authenticated as {} ({} databases)", creds.email, creds.databases.len());
    Ok(creds)
}

/// Builds the record to persist from a verify/complete response.
pub fn credentials_from_response(
    resp: &Value,
    email: &str,
    previous_selection: Option<String>,
    now: DateTime<Utc>,
) -> Result<StoredCredentials, AuthError> {
    let token = field(resp, "token").ok_or(AuthError::MissingToken)?.to_string();

    let databases: Vec<DatabaseEntry> = resp
        .get("databases")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|d| match d {
                    Value::String(name) => Some(DatabaseEntry::new(name.clone())),
                    other => match serde_json::from_value(other.clone()) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!("skipping unreadable database entry {other}: {e}");
                            None
                        }
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    let selected_database = previous_selection
        .filter(|sel| databases.iter().any(|d| &d.database_name == sel));

    Ok(StoredCredentials {
        token,
        email: field(resp, "email").unwrap_or(email).to_string(),
        role: field(resp, "role").map(String::from),
        databases,
        selected_database,
        expires_at: expiry_from(resp, now),
    })
}

/// Top-level string field, else the same key under `user`.
fn field<'a>(resp: &'a Value, key: &str) -> Option<&'a str> {
    resp.get(key)
        .or_else(|| resp.get("user").and_then(|u| u.get(key)))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn expiry_from(resp: &Value, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(raw) = resp.get("expires_at").and_then(Value::as_str) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return dt.with_timezone(&Utc);
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return naive.and_utc();
        }
    }
    if let Some(secs) = resp.get("expires_in").and_then(Value::as_i64) {
        return now + Duration::seconds(secs);
    }
    now + Duration::days(DEFAULT_SESSION_DAYS)
}
