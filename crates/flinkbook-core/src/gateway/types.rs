use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::Display;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenSessionRequest {
    pub name: Option<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Finished,
    Error,
    Canceled,
}

impl OperationStatus {
    /// Map a SQL Gateway status string onto the five states the client tracks.
    pub fn from_gateway(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "FINISHED" => Self::Finished,
            "ERROR" | "TIMEOUT" => Self::Error,
            "CANCELED" | "CANCELLED" | "CLOSED" => Self::Canceled,
            // INITIALIZED, PENDING and anything new
            _ => Self::Pending,
        }
    }

    /// Rows may be fetched once the statement is running or done.
    pub fn is_fetchable(self) -> bool {
        matches!(self, Self::Running | Self::Finished)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultKind {
    NotReady,
    Payload,
    EndOfStream,
    Other(String),
}

impl ResultKind {
    pub fn from_gateway(kind: &str) -> Self {
        match kind {
            "NOT_READY" => Self::NotReady,
            "PAYLOAD" => Self::Payload,
            "EOS" => Self::EndOfStream,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RowKind {
    #[default]
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub kind: RowKind,
    pub fields: Vec<serde_json::Value>,
}

impl Row {
    pub fn insert(fields: Vec<serde_json::Value>) -> Self {
        Self {
            kind: RowKind::Insert,
            fields,
        }
    }
}

/// One page of results at a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub kind: ResultKind,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub next_cursor: Option<u64>,
    pub job_id: Option<String>,
}

impl ResultPage {
    pub fn not_ready() -> Self {
        Self {
            kind: ResultKind::NotReady,
            columns: Vec::new(),
            rows: Vec::new(),
            next_cursor: None,
            job_id: None,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            kind: ResultKind::EndOfStream,
            ..Self::not_ready()
        }
    }

    pub fn payload(columns: Vec<Column>, rows: Vec<Row>, next_cursor: Option<u64>) -> Self {
        Self {
            kind: ResultKind::Payload,
            columns,
            rows,
            next_cursor,
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn has_rows(&self) -> bool {
        !self.rows.is_empty()
    }
}
