// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Error conditions which may occur when storing, projecting or applying avoid zones.
///
/// Wrapped library errors are reference-counted, so that the error stays [Clone]
/// and can be kept in [job status](crate::jobs::JobStatus).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed or incomplete configuration, version selector or setting.
    #[error("validation: {0}")]
    Validation(String),

    /// Unknown version or missing dataset.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition of a penalizer pass was not met; nothing was written.
    #[error("precheck failed: {0}")]
    Precheck(String),

    /// An artifact expected after the external preprocessing pipeline is missing.
    #[error("pipeline output missing: {}", .0.display())]
    PipelineIntegrity(PathBuf),

    /// A stage of the external preprocessing pipeline failed or timed out.
    #[error("pipeline: {0}")]
    Pipeline(String),

    /// Another penalizer pass is already in flight.
    #[error("a penalizer pass is already running")]
    Busy,

    #[error("io: {0}")]
    Io(#[from] Arc<io::Error>),

    #[error("json: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("xml: {0}")]
    Xml(#[from] Arc<quick_xml::Error>),
}

impl Error {
    /// Returns true for errors caused by the caller's input
    /// (which should map onto a rejected request), and false for internal failures.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(Arc::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
