use std::fmt::Display;

use sqlx::error::DatabaseError;
use sqlx::sqlite::SqliteError;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;
use warden_types::error::{ApiError, StatusCode};

use crate::migrations::MigrationError;

#[derive(Error, Debug)]
pub enum ErrorType {
    #[error("Internal error")]
    Storage(sqlx::Error),
    #[error("Internal error")]
    Migration(#[from] MigrationError),
    #[error("Internal error")]
    BadData(String),
    #[error("Unable to render ACL template")]
    Template(#[source] minijinja::Error),
    #[error("Unknown user `{0}`")]
    UnknownUser(Uuid),
    #[error("Unknown username `{0}`")]
    UnknownUsername(String),
    #[error("Unknown policy `{0}`")]
    UnknownPolicy(Uuid),
    #[error("Unknown group `{0}`")]
    UnknownGroup(Uuid),
    #[error("Unknown tenant `{0}`")]
    UnknownTenant(Uuid),
    #[error("Unknown token")]
    UnknownToken,
    #[error("Policy `{policy_uuid}` is not associated to user `{user_uuid}`")]
    UnknownUserPolicy { user_uuid: Uuid, policy_uuid: Uuid },
    #[error("The `{column}` `{value}` is already used by another {resource}")]
    Conflict {
        resource: &'static str,
        column: &'static str,
        value: String,
    },
    #[error("Policy `{0}` already exists")]
    DuplicatePolicy(String),
    #[error("Template `{0}` is already associated to this policy")]
    DuplicateTemplate(String),
    #[error("Invalid limit `{0}`")]
    InvalidLimit(String),
    #[error("Invalid offset `{0}`")]
    InvalidOffset(String),
    #[error("Invalid sort column `{0}`")]
    InvalidSortColumn(String),
    #[error("Invalid sort direction `{0}`")]
    InvalidSortDirection(String),
    #[error("Wrong username or password")]
    InvalidCredentials,
    #[error("Unauthorized authentication backend `{0}`")]
    UnauthorizedBackend(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("A resource with that identifier already exists")]
    UniqueConstraintViolation {
        #[source]
        error: sqlx::Error,
    },
    #[error("The resource update was not processable")]
    ForeignKeyViolation {
        #[source]
        error: sqlx::Error,
    },
}

#[derive(Error, Debug)]
pub struct Error {
    pub variant: ErrorType,
    pub span_trace: SpanTrace,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.variant, self.span_trace)
    }
}

impl Error {
    /// The message of the violated unique constraint, if this error is one.
    ///
    /// SQLite reports the offending columns in the error message
    /// (`UNIQUE constraint failed: auth_user.username`), which is what the
    /// repos key their conflict translation on.
    pub(crate) fn unique_constraint_message(&self) -> Option<String> {
        match &self.variant {
            ErrorType::UniqueConstraintViolation { error } => error
                .as_database_error()
                .map(|db_err| db_err.message().to_string()),
            _ => None,
        }
    }

    pub(crate) fn is_foreign_key_violation(&self) -> bool {
        matches!(self.variant, ErrorType::ForeignKeyViolation { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        #[allow(clippy::redundant_closure_for_method_calls)]
        if let Some(error_code) = err
            .as_database_error()
            .and_then(|db_err| db_err.try_downcast_ref::<SqliteError>())
        {
            if let Some(code) = error_code.code().map(|str| str.to_string()) {
                match &code[..] {
                    // FK constraint violation
                    "787" => {
                        return Self {
                            variant: ErrorType::ForeignKeyViolation { error: err },
                            span_trace: SpanTrace::capture(),
                        };
                    }
                    // UNIQUE constraint violation, on a primary key or any
                    // other unique column
                    "1555" | "2067" => {
                        return Self {
                            variant: ErrorType::UniqueConstraintViolation { error: err },
                            span_trace: SpanTrace::capture(),
                        };
                    }
                    _ => {}
                }
            }
        }
        Self {
            variant: ErrorType::Storage(err),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl From<MigrationError> for Error {
    fn from(err: MigrationError) -> Self {
        Self {
            variant: err.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl From<ErrorType> for Error {
    fn from(err: ErrorType) -> Self {
        Self {
            variant: err,
            span_trace: SpanTrace::capture(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status_code = match err.variant {
            ErrorType::Storage(_)
            | ErrorType::Migration(_)
            | ErrorType::BadData(_)
            | ErrorType::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::UnknownUser(_)
            | ErrorType::UnknownUsername(_)
            | ErrorType::UnknownPolicy(_)
            | ErrorType::UnknownGroup(_)
            | ErrorType::UnknownTenant(_)
            | ErrorType::UnknownToken
            | ErrorType::UnknownUserPolicy { .. } => StatusCode::NOT_FOUND,
            ErrorType::Conflict { .. }
            | ErrorType::DuplicatePolicy(_)
            | ErrorType::DuplicateTemplate(_)
            | ErrorType::UniqueConstraintViolation { .. } => StatusCode::CONFLICT,
            ErrorType::InvalidLimit(_)
            | ErrorType::InvalidOffset(_)
            | ErrorType::InvalidSortColumn(_)
            | ErrorType::InvalidSortDirection(_)
            | ErrorType::BadRequest(_) => StatusCode::BAD_REQUEST,
            ErrorType::InvalidCredentials | ErrorType::UnauthorizedBackend(_) => {
                StatusCode::UNAUTHORIZED
            }
            ErrorType::ForeignKeyViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };

        ApiError {
            error: err.variant.into(),
            status_code,
            span_trace: Some(err.span_trace),
        }
    }
}
