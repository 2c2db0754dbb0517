//! Static table of every tool this server exposes.

use crate::protocol::make_tool;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Handled locally; open without a session (login, status, logout).
    Session,
    /// Handled locally against the stored session.
    Local,
    /// Forwarded to the backend with the short timeout.
    Remote,
    /// Forwarded to the backend with the long pipeline timeout.
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn accepts(self, v: &Value) -> bool {
        match self {
            ParamType::String => v.is_string(),
            ParamType::Integer => v.is_i64() || v.is_u64(),
            ParamType::Number => v.is_number(),
            ParamType::Boolean => v.is_boolean(),
            ParamType::Array => v.is_array(),
            ParamType::Object => v.is_object(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    Str(&'static str),
    Int(i64),
    Bool(bool),
}

impl ParamDefault {
    fn to_value(self) -> Value {
        match self {
            ParamDefault::Str(s) => json!(s),
            ParamDefault::Int(i) => json!(i),
            ParamDefault::Bool(b) => json!(b),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
    pub enum_values: &'static [&'static str],
    pub default: Option<ParamDefault>,
}

impl ParamDef {
    const fn required(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self { name, ty, required: true, description, enum_values: &[], default: None }
    }

    const fn optional(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self { name, ty, required: false, description, enum_values: &[], default: None }
    }

    const fn default_to(mut self, default: ParamDefault) -> Self {
        self.default = Some(default);
        self
    }

    const fn one_of(mut self, values: &'static [&'static str]) -> Self {
        self.enum_values = values;
        self
    }

    fn schema(&self) -> Value {
        let mut prop = json!({ "type": self.ty.as_str(), "description": self.description });
        if !self.enum_values.is_empty() {
            prop["enum"] = json!(self.enum_values);
        }
        if let Some(d) = self.default {
            prop["default"] = d.to_value();
        }
        prop
    }
}

#[derive(Debug)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub internal_name: &'static str,
    pub kind: ToolKind,
    pub description: &'static str,
    pub params: &'static [ParamDef],
}

impl ToolDescriptor {
    pub fn requires_auth(&self) -> bool {
        self.kind != ToolKind::Session
    }

    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> =
            self.params.iter().map(|p| (p.name.to_string(), p.schema())).collect();
        let required: Vec<&str> =
            self.params.iter().filter(|p| p.required).map(|p| p.name).collect();
        make_tool(self.name, self.description, Value::Object(properties), &required)
    }

    /// Checks `args` against the declared parameters and returns a copy with
    /// defaults filled in. Undeclared keys pass through untouched.
    pub fn validate(&self, args: &Value) -> Result<Value, String> {
        let mut out = match args {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => return Err(format!("{}: arguments must be an object, got {other}", self.name)),
        };

        for p in self.params {
            match out.get(p.name) {
                None | Some(Value::Null) => {
                    if p.required {
                        return Err(format!("Missing required argument: {}", p.name));
                    }
                    if let Some(d) = p.default {
                        out.insert(p.name.to_string(), d.to_value());
                    }
                }
                Some(v) => {
                    if !p.ty.accepts(v) {
                        return Err(format!("Argument '{}' must be of type {}", p.name, p.ty.as_str()));
                    }
                    if !p.enum_values.is_empty()
                        && !v.as_str().is_some_and(|s| p.enum_values.contains(&s))
                    {
                        return Err(format!(
                            "Argument '{}' must be one of: {}",
                            p.name,
                            p.enum_values.join(", ")
                        ));
                    }
                }
            }
        }
        Ok(Value::Object(out))
    }
}

use ParamType::{Boolean, Integer, String as Str};

pub static TOOLS: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "quarri_check_auth",
        internal_name: "check_auth",
        kind: ToolKind::Session,
        description: "Check whether this machine holds a valid Quarri session. Reports the logged-in email, role, expiry, accessible databases and the selected database. Call this first when any other tool reports that authentication is required.",
        params: &[
            ParamDef::optional("validate", Boolean, "Also confirm the token with the Quarri backend.")
                .default_to(ParamDefault::Bool(false)),
        ],
    },
    ToolDescriptor {
        name: "quarri_request_code",
        internal_name: "request_code",
        kind: ToolKind::Session,
        description: "Start a login: email a one-time verification code to the user. Ask the user for the code, then call quarri_verify_code.",
        params: &[ParamDef::required("email", Str, "Email address registered with Quarri.")],
    },
    ToolDescriptor {
        name: "quarri_verify_code",
        internal_name: "verify_code",
        kind: ToolKind::Session,
        description: "Finish a login with the verification code the user received by email. Stores the session locally.",
        params: &[
            ParamDef::required("email", Str, "Email address the code was sent to."),
            ParamDef::required("code", Str, "The verification code from the email."),
        ],
    },
    ToolDescriptor {
        name: "quarri_verify_invite",
        internal_name: "verify_invite",
        kind: ToolKind::Session,
        description: "Redeem a team invite code and log in as the invited user. Stores the session locally.",
        params: &[
            ParamDef::required("email", Str, "Email address the invite was sent to."),
            ParamDef::required("invite_code", Str, "Invite code from the invitation email."),
        ],
    },
    ToolDescriptor {
        name: "quarri_trial_status",
        internal_name: "trial_status",
        kind: ToolKind::Session,
        description: "Show trial status (days remaining, plan) for an account. Defaults to the last logged-in email.",
        params: &[ParamDef::optional("email", Str, "Account email. Defaults to the stored login email.")],
    },
    ToolDescriptor {
        name: "quarri_logout",
        internal_name: "logout",
        kind: ToolKind::Session,
        description: "Remove the locally stored Quarri session.",
        params: &[],
    },
    ToolDescriptor {
        name: "quarri_list_databases",
        internal_name: "list_databases",
        kind: ToolKind::Local,
        description: "List the databases this account can query and show which one is selected.",
        params: &[],
    },
    ToolDescriptor {
        name: "quarri_select_database",
        internal_name: "select_database",
        kind: ToolKind::Local,
        description: "Select the database used by all query tools. Accepts the database name or its display name.",
        params: &[ParamDef::required("database_name", Str, "Database name or display name from quarri_list_databases.")],
    },
    ToolDescriptor {
        name: "quarri_get_schema",
        internal_name: "get_schema",
        kind: ToolKind::Remote,
        description: "Return tables and columns of the selected database. Call before writing SQL by hand.",
        params: &[ParamDef::optional("table_name", Str, "Restrict the result to one table.")],
    },
    ToolDescriptor {
        name: "quarri_generate_sql",
        internal_name: "generate_sql",
        kind: ToolKind::Remote,
        description: "Translate a natural-language question into SQL for the selected database without running it.",
        params: &[ParamDef::required("question", Str, "The question to answer, in plain language.")],
    },
    ToolDescriptor {
        name: "quarri_execute_sql",
        internal_name: "execute_sql",
        kind: ToolKind::Remote,
        description: "Run a read-only SQL query against the selected database and return the rows.",
        params: &[
            ParamDef::required("sql", Str, "The SQL statement to execute."),
            ParamDef::optional("limit", Integer, "Maximum number of rows to return.")
                .default_to(ParamDefault::Int(100)),
        ],
    },
    ToolDescriptor {
        name: "quarri_explain_sql",
        internal_name: "explain_sql",
        kind: ToolKind::Remote,
        description: "Explain in plain language what a SQL query does.",
        params: &[ParamDef::required("sql", Str, "The SQL statement to explain.")],
    },
    ToolDescriptor {
        name: "quarri_search_values",
        internal_name: "search_values",
        kind: ToolKind::Remote,
        description: "Find distinct values in a column that match a search term. Useful for resolving names and categories before filtering.",
        params: &[
            ParamDef::required("table_name", Str, "Table to search."),
            ParamDef::required("column_name", Str, "Column to search."),
            ParamDef::required("search_term", Str, "Text to match (case-insensitive, partial)."),
        ],
    },
    ToolDescriptor {
        name: "quarri_get_metrics",
        internal_name: "list_metrics",
        kind: ToolKind::Remote,
        description: "List the business metrics defined for the selected database.",
        params: &[],
    },
    ToolDescriptor {
        name: "quarri_get_statistics",
        internal_name: "calculate_statistics",
        kind: ToolKind::Remote,
        description: "Run a query and compute descriptive statistics over its numeric columns.",
        params: &[ParamDef::required("sql", Str, "Query whose result should be summarised.")],
    },
    ToolDescriptor {
        name: "quarri_query_agent",
        internal_name: "query_agent",
        kind: ToolKind::Pipeline,
        description: "Answer a question end to end: generate SQL, run it, repair it on failure and summarise the result. May take several minutes.",
        params: &[
            ParamDef::required("question", Str, "The question to answer, in plain language."),
            ParamDef::optional("max_iterations", Integer, "Upper bound on generate/repair rounds.")
                .default_to(ParamDefault::Int(5)),
        ],
    },
    ToolDescriptor {
        name: "quarri_analyze",
        internal_name: "run_analysis",
        kind: ToolKind::Pipeline,
        description: "Full analysis pipeline: SQL, data, statistics, insights and an optional chart. May take several minutes.",
        params: &[
            ParamDef::required("question", Str, "The analysis question."),
            ParamDef::optional("analysis_type", Str, "Kind of analysis to run.")
                .one_of(&["descriptive", "diagnostic", "trend", "comparison"])
                .default_to(ParamDefault::Str("descriptive")),
            ParamDef::optional("include_chart", Boolean, "Render a chart for the result.")
                .default_to(ParamDefault::Bool(true)),
        ],
    },
];

static INDEX: Lazy<HashMap<&'static str, &'static ToolDescriptor>> =
    Lazy::new(|| TOOLS.iter().map(|t| (t.name, t)).collect());

/// Exact, case-sensitive lookup by external name.
pub fn lookup(name: &str) -> Option<&'static ToolDescriptor> {
    INDEX.get(name).copied()
}

pub fn tool_list() -> Value {
    json!({ "tools": TOOLS.iter().map(ToolDescriptor::to_json).collect::<Vec<_>>() })
}
