//! Error taxonomy for the sync service.
//!
//! Each layer carries its own `thiserror` enum; loop boundaries fall back to
//! `anyhow` so a failing (resource, class) pair or listing never takes the
//! whole cycle down.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Errors raised by the RETS protocol layer (client + parser).
#[derive(Debug, Error)]
pub enum RetsError {
    #[error("login rejected with reply code {reply_code}: {reply_text}")]
    LoginRejected { reply_code: i64, reply_text: String },

    #[error("login succeeded but no Set-Cookie header was returned")]
    NoCookie,

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed RETS response: {0}")]
    Malformed(String),

    #[error("RETS reply code {reply_code}: {reply_text}")]
    Protocol { reply_code: i64, reply_text: String },

    #[error("unauthorized query on class [{class}] in resource [{resource}]")]
    UnauthorizedQuery { resource: String, class: String },

    #[error("server did not advertise the {0} capability")]
    CapabilityMissing(String),

    #[error("session cache I/O failed: {0}")]
    SessionCache(#[from] std::io::Error),

    #[error("session cache serialization failed: {0}")]
    SessionJson(#[from] serde_json::Error),

    #[error("invalid capability URL: {0}")]
    Url(#[from] url::ParseError),
}

impl RetsError {
    /// True when the failure should add the pair to the lockout set rather
    /// than be retried next cycle.
    pub fn is_lockout(&self) -> bool {
        matches!(self, RetsError::UnauthorizedQuery { .. })
    }
}

/// DDL and table-management failures in the schema layer.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("DDL failed for table {table}: {source}")]
    Ddl {
        table: String,
        #[source]
        source: sea_orm::DbErr,
    },

    #[error("resource {resource} declares key field {key_field} but METADATA-TABLE does not contain it")]
    MissingKeyField { resource: String, key_field: String },
}

/// Failures in the photo fetch/derive/upload path.
#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("image decode failed for object {object_id}: {message}")]
    Decode { object_id: String, message: String },

    #[error("webp encode failed for object {object_id}: {message}")]
    Encode { object_id: String, message: String },

    #[error("object storage upload failed after {attempts} attempts: {message}")]
    Storage { attempts: u32, message: String },

    #[error("staging I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rets(#[from] RetsError),

    #[error("tracking table update failed: {0}")]
    Db(#[from] sea_orm::DbErr),
}

static COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"column '([^']+)'").expect("column regex"));
static VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"value: '([^']*)'").expect("value regex"));

/// Pull the offending column (and value, when the driver includes it) out of
/// a MySQL error message so row-level failures can be logged with context.
pub fn offending_column(driver_message: &str) -> Option<(String, Option<String>)> {
    let column = COLUMN_RE
        .captures(driver_message)
        .map(|c| c[1].to_string())?;
    let value = VALUE_RE
        .captures(driver_message)
        .map(|c| c[1].to_string());
    Some((column, value))
}
