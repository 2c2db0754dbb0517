use crate::auth;
use crate::client::ApiClient;
use crate::credentials::{CredentialStore, StoredCredentials};
use crate::format::format_result;
use crate::protocol::{tool_err, tool_json, tool_ok, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::registry::{self, ToolDescriptor, ToolKind};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Failures reported as JSON-RPC errors rather than tool replies.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown tool: '{0}'")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidParams { tool: String, reason: String },
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::UnknownTool(_) => METHOD_NOT_FOUND,
            DispatchError::InvalidParams { .. } => INVALID_PARAMS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: CredentialStore,
    client: ApiClient,
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

impl Dispatcher {
    pub fn new(store: CredentialStore, client: ApiClient) -> Self {
        Self { store, client }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, DispatchError> {
        let tool = registry::lookup(name).ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        let creds = if tool.requires_auth() {
            match self.store.load() {
                Some(c) => Some(c),
                None => {
                    info!("{name}: not authenticated");
                    return Ok(self.auth_required());
                }
            }
        } else {
            None
        };

        let args = tool.validate(args).map_err(|reason| DispatchError::InvalidParams {
            tool: name.to_string(),
            reason,
        })?;

        let reply = match (tool.kind, creds) {
            (ToolKind::Session, _) => self.session_tool(tool, &args).await,
            (ToolKind::Local, Some(creds)) => self.local_tool(tool, &args, &creds),
            (_, Some(creds)) => self.remote_tool(tool, &args, &creds).await,
            (_, None) => self.auth_required(),
        };
        Ok(reply)
    }

    fn timeout_for(&self, tool: &ToolDescriptor) -> Duration {
        match tool.kind {
            ToolKind::Pipeline => self.client.pipeline_timeout(),
            _ => self.client.default_timeout(),
        }
    }

    async fn remote_tool(&self, tool: &ToolDescriptor, args: &Value, creds: &StoredCredentials) -> Value {
        let database = match self.ensure_database(creds) {
            Some(db) => db,
            None => return no_database(),
        };

        let timeout = self.timeout_for(tool);
        info!("{} → {} on {database} (timeout {}s)", tool.name, tool.internal_name, timeout.as_secs());

        match self
            .client
            .call_tool(tool.internal_name, args, Some(&database), &creds.token, timeout)
            .await
        {
            Ok(result) => tool_ok(format_result(tool.name, &result)),
            Err(e) => {
                warn!("{} failed: {e}", tool.name);
                tool_err(e.to_string())
            }
        }
    }

    /// The selected database, auto-selecting and persisting the first one
    /// when nothing is selected yet.
    fn ensure_database(&self, creds: &StoredCredentials) -> Option<String> {
        if let Some(selected) = &creds.selected_database {
            return Some(selected.clone());
        }
        let first = creds.databases.first()?.database_name.clone();
        match self.store.select_database(&first) {
            Ok(name) => info!("auto-selected database {name}"),
            Err(e) => warn!("auto-selected database {first} but could not persist it: {e}"),
        }
        Some(first)
    }

    fn auth_required(&self) -> Value {
        let who = match self.store.stored_email() {
            Some(email) => format!(
                "Your session for {email} has expired.\n\nTo log in again:\n1. Call quarri_request_code with email \"{email}\""
            ),
            None => "No Quarri session found on this machine.\n\nTo log in:\n1. Ask the user for their email and call quarri_request_code with it".to_string(),
        };
        tool_err(format!(
            "Authentication required. {who}\n\
             2. Ask the user for the verification code sent to that email\n\
             3. Call quarri_verify_code with the email and code\n\n\
             Alternatively the user can run `quarri-mcp login --email <email>` in a terminal."
        ))
    }

    fn local_tool(&self, tool: &ToolDescriptor, args: &Value, creds: &StoredCredentials) -> Value {
        match tool.internal_name {
            "list_databases" => {
                let selected = creds.effective_database();
                if creds.databases.is_empty() {
                    return tool_ok("No databases are available for this account. Ask a workspace admin for access.");
                }
                let dbs: Vec<Value> = creds
                    .databases
                    .iter()
                    .map(|d| {
                        json!({
                            "database_name": d.database_name,
                            "display_name": d.display_name,
                            "access_level": d.access_level,
                            "selected": Some(d.database_name.as_str()) == selected,
                        })
                    })
                    .collect();
                tool_json(&json!({ "databases": dbs, "selected_database": selected }))
            }

            "select_database" => {
                let Some(name) = str_arg(args, "database_name") else {
                    return tool_err("Missing required argument: database_name");
                };
                match self.store.select_database(name) {
                    Ok(selected) => {
                        info!("selected database {selected}");
                        tool_json(&json!({ "success": true, "message": format!("Selected database: {selected}") }))
                    }
                    Err(e) => tool_err(
                        serde_json::to_string_pretty(&json!({ "success": false, "error": e.to_string() }))
                            .unwrap_or_else(|_| e.to_string()),
                    ),
                }
            }

            other => tool_err(format!("Unknown local tool: '{other}'")),
        }
    }

    async fn session_tool(&self, tool: &ToolDescriptor, args: &Value) -> Value {
        match tool.internal_name {
            "check_auth" => self.check_auth(args["validate"].as_bool().unwrap_or(false)).await,

            "request_code" => {
                let Some(email) = str_arg(args, "email") else {
                    return tool_err("Missing required argument: email");
                };
                match auth::request_code(&self.client, email).await {
                    Ok(_) => tool_ok(format!(
                        "Verification code sent to {email}. Ask the user for the code, then call quarri_verify_code."
                    )),
                    Err(e) => tool_err(e.to_string()),
                }
            }

            "verify_code" | "verify_invite" => {
                let code_key = if tool.internal_name == "verify_code" { "code" } else { "invite_code" };
                let (Some(email), Some(code)) = (str_arg(args, "email"), str_arg(args, code_key)) else {
                    return tool_err(format!("Missing required arguments: email, {code_key}"));
                };
                let result = if tool.internal_name == "verify_code" {
                    auth::verify_code(&self.client, &self.store, email, code).await
                } else {
                    auth::verify_invite(&self.client, &self.store, email, code).await
                };
                match result {
                    Ok(creds) => tool_ok(login_summary(&creds)),
                    Err(e) => tool_err(e.to_string()),
                }
            }

            "trial_status" => {
                let email = str_arg(args, "email").map(String::from).or_else(|| self.store.stored_email());
                let Some(email) = email else {
                    return tool_err("No email given and no previous login found. Pass the account email.");
                };
                match auth::trial_status(&self.client, &email).await {
                    Ok(status) => tool_json(&status),
                    Err(e) => tool_err(e.to_string()),
                }
            }

            "logout" => match self.store.clear() {
                Ok(()) => {
                    info!("logged out");
                    tool_json(&json!({ "success": true, "message": "Logged out. Local session removed." }))
                }
                Err(e) => tool_err(format!("Logout failed: {e}")),
            },

            other => tool_err(format!("Unknown session tool: '{other}'")),
        }
    }

    async fn check_auth(&self, validate: bool) -> Value {
        let Some(creds) = self.store.load() else {
            let mut status = json!({
                "authenticated": false,
                "message": "Not logged in. Use quarri_request_code and quarri_verify_code to log in."
            });
            if let Some(email) = self.store.stored_email() {
                status["email"] = json!(email);
                status["message"] = json!(format!(
                    "Session for {email} has expired. Call quarri_request_code with this email to log in again."
                ));
            }
            return tool_json(&status);
        };

        let mut status = json!({
            "authenticated": true,
            "email": creds.email,
            "role": creds.role,
            "expires_at": creds.expires_at.to_rfc3339(),
            "databases": creds.databases.iter().map(|d| &d.database_name).collect::<Vec<_>>(),
            "selected_database": creds.effective_database(),
        });
        if validate {
            match auth::validate_token(&self.client, &creds.token).await {
                Ok(_) => status["token_valid"] = json!(true),
                Err(e) => {
                    status["token_valid"] = json!(false);
                    status["validation_error"] = json!(e.to_string());
                }
            }
        }
        tool_json(&status)
    }
}

fn no_database() -> Value {
    tool_err(
        "No database selected and none are available for this account. \
         Call quarri_list_databases to see accessible databases, then quarri_select_database to pick one.",
    )
}

pub fn login_summary(creds: &StoredCredentials) -> String {
    let mut out = format!("Logged in as {}.", creds.email);
    if creds.databases.is_empty() {
        out.push_str(" No databases are available yet.");
        return out;
    }
    out.push_str(&format!(" {} database(s) available:", creds.databases.len()));
    for d in &creds.databases {
        match &d.display_name {
            Some(display) => out.push_str(&format!("\n- {} ({display})", d.database_name)),
            None => out.push_str(&format!("\n- {}", d.database_name)),
        }
    }
    if let Some(db) = creds.effective_database() {
        out.push_str(&format!("\nActive database: {db}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::credentials::tests::sample;
    use crate::protocol::{reply_is_error, reply_text};
    use chrono::Duration as ChronoDuration;
    use mockito::{Matcher, Server, ServerGuard};

    struct Harness {
        _dir: tempfile::TempDir,
        server: ServerGuard,
        dispatcher: Dispatcher,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new_async().await;
        let path = dir.path().join("credentials.json");
        let settings = Settings::new(server.url(), path.clone());
        let dispatcher = Dispatcher::new(CredentialStore::new(path), ApiClient::new(&settings).unwrap());
        Harness { _dir: dir, server, dispatcher }
    }

    impl Harness {
        fn login(&self, creds: &StoredCredentials) {
            self.dispatcher.store().save(creds).unwrap();
        }

        async fn no_calls(&mut self) -> NoCalls {
            let mut mocks = Vec::new();
            for method in ["GET", "POST"] {
                mocks.push(self.server.mock(method, Matcher::Any).expect(0).create_async().await);
            }
            NoCalls(mocks)
        }
    }

    struct NoCalls(Vec<mockito::Mock>);

    impl NoCalls {
        async fn assert_async(&self) {
            for m in &self.0 {
                m.assert_async().await;
            }
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found_without_network() {
        let mut h = harness().await;
        let guard = h.no_calls().await;

        let err = h.dispatcher.dispatch("quarri_drop_everything", &json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTool(_)));
        assert_eq!(err.code(), METHOD_NOT_FOUND);

        h.login(&sample(ChronoDuration::hours(1)));
        let err = h.dispatcher.dispatch("Quarri_Get_Schema", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), METHOD_NOT_FOUND);
        guard.assert_async().await;
    }

    #[tokio::test]
    async fn gated_tools_need_a_session_and_make_no_calls() {
        let mut h = harness().await;
        let guard = h.no_calls().await;

        for name in ["quarri_generate_sql", "quarri_analyze", "quarri_list_databases", "quarri_select_database"] {
            let reply = h.dispatcher.dispatch(name, &json!({})).await.unwrap();
            assert!(reply_is_error(&reply), "{name}");
            assert!(reply_text(&reply).contains("Authentication required"), "{name}");
            assert!(reply_text(&reply).contains("quarri_request_code"), "{name}");
        }
        guard.assert_async().await;
    }

    #[tokio::test]
    async fn expired_session_names_the_stored_email() {
        let mut h = harness().await;
        let guard = h.no_calls().await;
        h.login(&sample(ChronoDuration::minutes(-5)));

        let reply = h.dispatcher.dispatch("quarri_execute_sql", &json!({ "sql": "SELECT 1" })).await.unwrap();
        assert!(reply_is_error(&reply));
        assert!(reply_text(&reply).contains("ana@example.com"));
        guard.assert_async().await;
    }

    #[tokio::test]
    async fn select_database_scenario() {
        let h = harness().await;
        h.login(&sample(ChronoDuration::hours(1)));

        let reply = h
            .dispatcher
            .dispatch("quarri_select_database", &json!({ "database_name": "sales_db" }))
            .await
            .unwrap();
        assert!(!reply_is_error(&reply));
        let body: Value = serde_json::from_str(reply_text(&reply)).unwrap();
        assert_eq!(body, json!({ "success": true, "message": "Selected database: sales_db" }));

        let reply = h
            .dispatcher
            .dispatch("quarri_select_database", &json!({ "database_name": "Operations" }))
            .await
            .unwrap();
        assert!(reply_text(&reply).contains("Selected database: ops_db"));
        assert_eq!(h.dispatcher.store().get_selected_database().as_deref(), Some("ops_db"));
    }

    #[tokio::test]
    async fn select_unknown_database_is_error_reply() {
        let h = harness().await;
        h.login(&sample(ChronoDuration::hours(1)));

        let reply = h
            .dispatcher
            .dispatch("quarri_select_database", &json!({ "database_name": "hr" }))
            .await
            .unwrap();
        assert!(reply_is_error(&reply));
        assert!(reply_text(&reply).contains("\"success\": false"));
    }

    #[tokio::test]
    async fn first_database_is_auto_selected_and_persisted() {
        let mut h = harness().await;
        let m = h
            .server
            .mock("POST", "/api/cli/tool/get_schema")
            .match_header("authorization", "Bearer tok-123")
            .match_body(Matcher::Json(json!({ "args": {}, "database_name": "sales_db" })))
            .with_status(200)
            .with_body(r#"{"success":true,"schema":{"orders":[{"column_name":"id","data_type":"integer"}]}}"#)
            .create_async()
            .await;
        h.login(&sample(ChronoDuration::hours(1)));
        assert_eq!(h.dispatcher.store().load().unwrap().selected_database, None);

        let reply = h.dispatcher.dispatch("quarri_get_schema", &json!({})).await.unwrap();
        assert!(!reply_is_error(&reply));
        assert_eq!(reply_text(&reply), "- **orders**\n  - id (integer)");
        assert_eq!(h.dispatcher.store().load().unwrap().selected_database.as_deref(), Some("sales_db"));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn no_accessible_database_short_circuits() {
        let mut h = harness().await;
        let guard = h.no_calls().await;
        h.login(&StoredCredentials { databases: vec![], ..sample(ChronoDuration::hours(1)) });

        let reply = h.dispatcher.dispatch("quarri_generate_sql", &json!({ "question": "q" })).await.unwrap();
        assert!(reply_is_error(&reply));
        assert!(reply_text(&reply).contains("quarri_select_database"));
        guard.assert_async().await;
    }

    #[tokio::test]
    async fn backend_error_text_is_passed_through() {
        let mut h = harness().await;
        let _m = h
            .server
            .mock("POST", "/api/cli/tool/execute_sql")
            .with_status(500)
            .with_body(r#"{"success":false,"error":"column \"x\" does not exist"}"#)
            .create_async()
            .await;
        h.login(&StoredCredentials { selected_database: Some("ops_db".into()), ..sample(ChronoDuration::hours(1)) });

        let reply = h.dispatcher.dispatch("quarri_execute_sql", &json!({ "sql": "SELECT x" })).await.unwrap();
        assert!(reply_is_error(&reply));
        assert_eq!(reply_text(&reply), "column \"x\" does not exist");
    }

    #[tokio::test]
    async fn remote_call_gets_defaults_and_selected_database() {
        let mut h = harness().await;
        let m = h
            .server
            .mock("POST", "/api/cli/tool/execute_sql")
            .match_body(Matcher::Json(json!({
                "args": { "sql": "SELECT 1 AS one", "limit": 100 },
                "database_name": "ops_db"
            })))
            .with_status(200)
            .with_body(r#"{"success":true,"rows":[{"one":1}],"columns":["one"]}"#)
            .create_async()
            .await;
        h.login(&StoredCredentials { selected_database: Some("ops_db".into()), ..sample(ChronoDuration::hours(1)) });

        let reply = h.dispatcher.dispatch("quarri_execute_sql", &json!({ "sql": "SELECT 1 AS one" })).await.unwrap();
        assert_eq!(reply_text(&reply), "| one |\n| --- |\n| 1 |");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_the_call() {
        let mut h = harness().await;
        let guard = h.no_calls().await;
        h.login(&sample(ChronoDuration::hours(1)));

        let err = h
            .dispatcher
            .dispatch("quarri_analyze", &json!({ "question": "q", "analysis_type": "forecast" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), INVALID_PARAMS);
        guard.assert_async().await;
    }

    #[tokio::test]
    async fn pipelines_use_the_long_timeout() {
        let h = harness().await;
        let analyze = registry::lookup("quarri_analyze").unwrap();
        let schema = registry::lookup("quarri_get_schema").unwrap();
        assert_eq!(h.dispatcher.timeout_for(analyze), h.dispatcher.client().pipeline_timeout());
        assert_eq!(h.dispatcher.timeout_for(schema), h.dispatcher.client().default_timeout());
    }

    #[tokio::test]
    async fn check_auth_works_logged_out_and_in() {
        let mut h = harness().await;
        let guard = h.no_calls().await;

        let reply = h.dispatcher.dispatch("quarri_check_auth", &json!({})).await.unwrap();
        assert!(!reply_is_error(&reply));
        let body: Value = serde_json::from_str(reply_text(&reply)).unwrap();
        assert_eq!(body["authenticated"], false);

        h.login(&sample(ChronoDuration::hours(1)));
        let reply = h.dispatcher.dispatch("quarri_check_auth", &json!({})).await.unwrap();
        let body: Value = serde_json::from_str(reply_text(&reply)).unwrap();
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["selected_database"], "sales_db");
        guard.assert_async().await;
    }

    #[tokio::test]
    async fn verify_code_tool_logs_in_then_logout_clears() {
        let mut h = harness().await;
        let _m = h
            .server
            .mock("POST", "/api/auth/cli/verify-code")
            .with_status(200)
            .with_body(r#"{"success":true,"token":"t2","email":"ana@example.com","databases":[{"database_name":"sales_db","display_name":"Sales"}]}"#)
            .create_async()
            .await;

        let reply = h
            .dispatcher
            .dispatch("quarri_verify_code", &json!({ "email": "ana@example.com", "code": "111111" }))
            .await
            .unwrap();
        assert!(!reply_is_error(&reply));
        assert!(reply_text(&reply).contains("- sales_db (Sales)"));
        assert_eq!(h.dispatcher.store().load().unwrap().token, "t2");

        let reply = h.dispatcher.dispatch("quarri_logout", &json!({})).await.unwrap();
        assert!(!reply_is_error(&reply));
        assert!(h.dispatcher.store().load().is_none());
        let again = h.dispatcher.dispatch("quarri_logout", &json!({})).await.unwrap();
        assert!(!reply_is_error(&again));
    }

    #[tokio::test]
    async fn trial_status_uses_stale_email() {
        let mut h = harness().await;
        let m = h
            .server
            .mock("GET", "/api/auth/cli/trial-status")
            .match_query(Matcher::UrlEncoded("email".into(), "ana@example.com".into()))
            .with_status(200)
            .with_body(r#"{"success":true,"days_remaining":3}"#)
            .create_async()
            .await;
        h.login(&sample(ChronoDuration::hours(-1)));

        let reply = h.dispatcher.dispatch("quarri_trial_status", &json!({})).await.unwrap();
        assert!(reply_text(&reply).contains("\"days_remaining\": 3"));
        m.assert_async().await;
    }
}
