use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, JqlError, classify_sql_error};
use crate::schema::{TableInfo, TableSchema};
use crate::value::{Record, Value};

/// Non-terminal states a result can report besides plain success/failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A destructive write was held back; resubmit with `confirm_token`.
    PendingConfirm,
}

/// The single output shape of every JQL entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected: Option<u64>,
    /// Generated identifier of a single insert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Generated identifiers of a batch insert, in input order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResultMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Per-step results of a transaction.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<QueryResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ExplainResult>,
}

/// Statement diagnostics attached when debugging is on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    pub sql: String,
    pub params: Vec<Value>,
    pub duration_ms: f64,
    pub rows_returned: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// The offending statement (`sql`, `params`) and other context.
    #[serde(default, skip_serializing_if = "Record::is_empty")]
    pub details: Record,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainResult {
    pub sql: String,
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl QueryResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::from_error(ResultError::new(code, message))
    }

    pub fn from_error(error: ResultError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_pending_confirm(&self) -> bool {
        self.status == Some(Status::PendingConfirm)
    }

    pub fn first(&self) -> Option<&Record> {
        self.data.first()
    }

    /// The failure, if any, as an error value.
    pub fn err(&self) -> Option<&ResultError> {
        self.error.as_ref()
    }

    /// Field lookup used by cross-step references: `id`, `affected`, `count`,
    /// then a column of the first returned row.
    pub fn lookup(&self, field: &str) -> Option<Value> {
        match field {
            "id" if self.id.is_some() => self.id.map(Value::Int),
            "affected" if self.affected.is_some() => {
                self.affected.and_then(|n| i64::try_from(n).ok()).map(Value::Int)
            }
            "count" if self.count.is_some() => self.count.map(Value::Int),
            _ => self.first().and_then(|row| row.get(field)).cloned(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl ResultError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            suggestion: None,
            details: Record::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attaches the statement that failed.
    pub fn with_statement(self, sql: &str, params: &[Value]) -> Self {
        self.with_detail("sql", sql)
            .with_detail("params", Value::Array(params.to_vec()))
    }
}

impl std::fmt::Display for ResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suggestion {
            Some(suggestion) => write!(f, "{} (suggestion: {})", self.message, suggestion),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ResultError {}

impl From<&JqlError> for ResultError {
    fn from(err: &JqlError) -> Self {
        let message = err.to_string();
        match err {
            JqlError::Parse(_) => Self::new(ErrorCode::ParseError, message),
            JqlError::Validation(_) => Self::new(ErrorCode::ValidationError, message),
            JqlError::Build(_) => Self::new(ErrorCode::BuildError, message),
            JqlError::UnresolvedReference(reference) => {
                Self::new(ErrorCode::UnresolvedReference, message)
                    .with_detail("reference", reference.to_string())
            }
            JqlError::Hook(_) => Self::new(ErrorCode::HookError, message),
            JqlError::Relation(_) => Self::new(ErrorCode::RelationError, message),
            JqlError::Timeout(_) => Self::new(ErrorCode::Timeout, message)
                .with_suggestion("Increase timeout or optimize query"),
            JqlError::Sqlx(source) | JqlError::Migration { source, .. } => {
                let (code, suggestion) = classify_sql_error(source);
                let error = Self::new(code, message);
                match suggestion {
                    Some(s) => error.with_suggestion(s),
                    None => error,
                }
            }
            JqlError::Message(_) => Self::new(ErrorCode::SqlError, message),
        }
    }
}

impl From<JqlError> for QueryResult {
    fn from(err: JqlError) -> Self {
        Self::from_error(ResultError::from(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Reference;

    #[test]
    fn success_serializes_without_empty_fields() {
        let mut res = QueryResult::ok();
        res.affected = Some(2);
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "affected": 2}));
    }

    #[test]
    fn failure_carries_code_and_statement() {
        let err = ResultError::new(ErrorCode::BuildError, "bad")
            .with_statement("SELECT ?", &[Value::Int(1)]);
        let res = QueryResult::from_error(err);
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "BUILD_ERROR");
        assert_eq!(json["error"]["details"]["sql"], "SELECT ?");
        assert_eq!(json["error"]["details"]["params"], serde_json::json!([1]));
    }

    #[test]
    fn lookup_prefers_id_then_affected_then_count_then_row() {
        let mut res = QueryResult::ok();
        let mut row = Record::new();
        row.insert("id".into(), Value::Int(99));
        row.insert("email".into(), Value::from("a@b.c"));
        res.data.push(row);
        assert_eq!(res.lookup("id"), Some(Value::Int(99)));
        res.id = Some(5);
        assert_eq!(res.lookup("id"), Some(Value::Int(5)));
        assert_eq!(res.lookup("email"), Some(Value::from("a@b.c")));
        assert_eq!(res.lookup("affected"), None);
        res.affected = Some(3);
        assert_eq!(res.lookup("affected"), Some(Value::Int(3)));
        assert_eq!(res.lookup("missing"), None);
    }

    #[test]
    fn errors_map_to_codes() {
        let res = QueryResult::from(JqlError::UnresolvedReference(Reference::new("u", "id")));
        let err = res.err().unwrap();
        assert_eq!(err.code, ErrorCode::UnresolvedReference);
        assert_eq!(err.details["reference"], Value::from("$u.id"));

        let res = QueryResult::from(JqlError::Sqlx(sqlx::Error::PoolTimedOut));
        assert_eq!(res.err().unwrap().code, ErrorCode::Timeout);
        assert!(res.err().unwrap().to_string().contains("suggestion"));
    }

    #[test]
    fn pending_confirm_is_not_success() {
        let res = QueryResult {
            status: Some(Status::PendingConfirm),
            ..QueryResult::failure(ErrorCode::ConfirmRequired, "confirm")
        };
        assert!(res.is_pending_confirm());
        assert!(!res.is_success());
        assert_eq!(
            serde_json::to_value(&res).unwrap()["status"],
            "pending_confirm"
        );
    }
}
