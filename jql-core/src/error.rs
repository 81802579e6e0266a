use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::migrator::MigrationAction;
use crate::value::Reference;

/// Errors raised while parsing, compiling or running JQL.
#[derive(Debug)]
pub enum JqlError {
    /// The document was not valid JQL JSON.
    Parse(serde_json::Error),
    /// A query is missing fields its action requires.
    Validation(String),
    /// A well-formed query could not be compiled.
    Build(String),
    /// A `$alias.field` value had nothing to resolve against.
    UnresolvedReference(Reference),
    /// A lifecycle hook rejected the operation.
    Hook(String),
    /// A relation could not be eager loaded.
    Relation(String),
    /// Underlying sqlx error.
    Sqlx(sqlx::Error),
    /// The statement did not finish in time.
    Timeout(Duration),
    /// A schema change failed part way through a plan.
    Migration {
        action: MigrationAction,
        table: String,
        source: sqlx::Error,
    },
    /// Generic message error.
    Message(String),
}

impl std::fmt::Display for JqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "failed to parse JQL: {}", err),
            Self::Validation(message) => write!(f, "{}", message),
            Self::Build(message) => write!(f, "{}", message),
            Self::UnresolvedReference(reference) => {
                write!(f, "unresolved reference {}", reference)
            }
            Self::Hook(message) => write!(f, "hook rejected operation: {}", message),
            Self::Relation(message) => write!(f, "{}", message),
            Self::Sqlx(err) => write!(f, "sqlx error: {}", err),
            Self::Timeout(limit) => write!(f, "operation timed out after {}ms", limit.as_millis()),
            Self::Migration {
                action,
                table,
                source,
            } => write!(f, "failed to execute {} on {}: {}", action, table, source),
            Self::Message(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for JqlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Sqlx(err) | Self::Migration { source: err, .. } => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for JqlError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sqlx(err)
    }
}

impl From<serde_json::Error> for JqlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err)
    }
}

/// Result alias for JQL operations.
pub type JqlResult<T> = Result<T, JqlError>;

/// Stable failure codes reported in [`crate::result::ResultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    ValidationError,
    BuildError,
    SqlError,
    DuplicateKey,
    FkViolation,
    InvalidColumn,
    TableNotFound,
    SyntaxError,
    Timeout,
    ConnectionError,
    ConfirmRequired,
    InvalidConfirmToken,
    HookError,
    RelationError,
    NoOperations,
    TxBeginError,
    TxOperationError,
    TxCommitError,
    UnsupportedTxAction,
    UnresolvedReference,
    UnknownAction,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::BuildError => "BUILD_ERROR",
            Self::SqlError => "SQL_ERROR",
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::FkViolation => "FK_VIOLATION",
            Self::InvalidColumn => "INVALID_COLUMN",
            Self::TableNotFound => "TABLE_NOT_FOUND",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConfirmRequired => "CONFIRM_REQUIRED",
            Self::InvalidConfirmToken => "INVALID_CONFIRM_TOKEN",
            Self::HookError => "HOOK_ERROR",
            Self::RelationError => "RELATION_ERROR",
            Self::NoOperations => "NO_OPERATIONS",
            Self::TxBeginError => "TX_BEGIN_ERROR",
            Self::TxOperationError => "TX_OPERATION_ERROR",
            Self::TxCommitError => "TX_COMMIT_ERROR",
            Self::UnsupportedTxAction => "UNSUPPORTED_TX_ACTION",
            Self::UnresolvedReference => "UNRESOLVED_REFERENCE",
            Self::UnknownAction => "UNKNOWN_ACTION",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a driver failure to a stable code and a remediation hint.
///
/// Advisory only: the caller never retries based on this.
pub fn classify_sql_error(err: &sqlx::Error) -> (ErrorCode, Option<&'static str>) {
    match err {
        sqlx::Error::PoolTimedOut => return timeout(),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            return connection();
        }
        _ => {}
    }

    let text = match err {
        sqlx::Error::Database(db) => db.message().to_owned(),
        other => other.to_string(),
    };
    classify_message(&text)
}

/// Text-pattern half of [`classify_sql_error`], usable on any driver message.
pub fn classify_message(text: &str) -> (ErrorCode, Option<&'static str>) {
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["duplicate key", "Duplicate entry", "unique constraint", "UNIQUE constraint"]) {
        (
            ErrorCode::DuplicateKey,
            Some("Use UPDATE instead of INSERT, or check unique constraint"),
        )
    } else if has(&["foreign key", "FOREIGN KEY"]) {
        (
            ErrorCode::FkViolation,
            Some("Ensure the referenced record exists"),
        )
    } else if has(&["no such column", "Unknown column", "has no column"])
        || (text.contains("column") && text.contains("does not exist"))
    {
        (ErrorCode::InvalidColumn, Some("Check column name spelling"))
    } else if has(&["no such table", "doesn't exist", "does not exist"]) {
        (ErrorCode::TableNotFound, Some("Run AutoSync to create table"))
    } else if has(&["syntax error", "SQL syntax", "near \""]) {
        (ErrorCode::SyntaxError, Some("Check JQL syntax"))
    } else if has(&["timeout", "timed out", "deadline exceeded"]) {
        timeout()
    } else if has(&["connection refused", "no connection"]) {
        connection()
    } else {
        (ErrorCode::SqlError, None)
    }
}

fn timeout() -> (ErrorCode, Option<&'static str>) {
    (
        ErrorCode::Timeout,
        Some("Increase timeout or optimize query"),
    )
}

fn connection() -> (ErrorCode, Option<&'static str>) {
    (
        ErrorCode::ConnectionError,
        Some("Check database connection"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_dialects_duplicate_message() {
        for msg in [
            "UNIQUE constraint failed: users.email",
            "duplicate key value violates unique constraint \"users_email_key\"",
            "Duplicate entry 'a@b.c' for key 'email'",
        ] {
            assert_eq!(classify_message(msg).0, ErrorCode::DuplicateKey, "{}", msg);
        }
    }

    #[test]
    fn column_errors_win_over_relation_wording() {
        let (code, hint) = classify_message("column \"nope\" of relation \"users\" does not exist");
        assert_eq!(code, ErrorCode::InvalidColumn);
        assert_eq!(hint, Some("Check column name spelling"));
        assert_eq!(
            classify_message("table users has no column named nope").0,
            ErrorCode::InvalidColumn
        );
    }

    #[test]
    fn missing_tables_get_sync_hint() {
        let (code, hint) = classify_message("no such table: ghosts");
        assert_eq!(code, ErrorCode::TableNotFound);
        assert_eq!(hint, Some("Run AutoSync to create table"));
        assert_eq!(
            classify_message("relation \"ghosts\" does not exist").0,
            ErrorCode::TableNotFound
        );
    }

    #[test]
    fn syntax_timeout_and_connection_patterns() {
        assert_eq!(
            classify_message("near \"SELEC\": syntax error").0,
            ErrorCode::SyntaxError
        );
        assert_eq!(classify_message("statement timeout").0, ErrorCode::Timeout);
        assert_eq!(
            classify_message("dial tcp: connection refused").0,
            ErrorCode::ConnectionError
        );
        assert_eq!(classify_message("something odd").0, ErrorCode::SqlError);
        assert_eq!(classify_message("something odd").1, None);
    }

    #[test]
    fn pool_errors_classified_without_text() {
        assert_eq!(classify_sql_error(&sqlx::Error::PoolTimedOut).0, ErrorCode::Timeout);
        assert_eq!(
            classify_sql_error(&sqlx::Error::PoolClosed).0,
            ErrorCode::ConnectionError
        );
    }

    #[test]
    fn error_codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::FkViolation).unwrap(),
            "\"FK_VIOLATION\""
        );
        assert_eq!(ErrorCode::TxOperationError.to_string(), "TX_OPERATION_ERROR");
    }
}
