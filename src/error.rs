//! Error types for a lock scan.
//!
//! Fatal failures abort the whole pass and surface as [`ScanError`].
//! Per-entry failures ([`ResolveError`]) are expected by the thousand on a
//! normal system and are always recovered by skipping the entry.

use std::fmt;

/// Pipeline stage that produced a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    HandleTable,
    TypeTable,
    DeviceMap,
    ObjectName,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HandleTable => "handle table",
            Self::TypeTable => "object type table",
            Self::DeviceMap => "device map",
            Self::ObjectName => "object name",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whole-pass failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The caller lacks the privilege required to read the table.
    #[error("{stage} query denied (status {status:#010x})")]
    QueryDenied { stage: Stage, status: u32 },

    /// The buffer grew past the configured byte or attempt limit.
    #[error("{stage} query needs {requested} bytes after {attempts} attempts (limit {limit} bytes)")]
    ResourceExhausted {
        stage: Stage,
        requested: usize,
        limit: usize,
        attempts: u32,
    },

    /// The OS returned a block that does not match the expected record layout.
    #[error("malformed {stage}: {reason}")]
    ParseError { stage: Stage, reason: String },

    /// Any other failure status from a table query.
    #[error("{stage} query failed (status {status:#010x})")]
    QueryFailed { stage: Stage, status: u32 },

    /// The pass was cancelled and the partial results were discarded.
    #[error("scan cancelled after {collected} resolved handles")]
    Cancelled { collected: usize },
}

impl ScanError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::QueryDenied { stage, .. }
            | Self::ResourceExhausted { stage, .. }
            | Self::ParseError { stage, .. }
            | Self::QueryFailed { stage, .. } => Some(*stage),
            Self::Cancelled { .. } => None,
        }
    }

    /// Whether running the same pass again later has a chance of succeeding.
    ///
    /// `QueryDenied` needs elevation and `ParseError` means the record layout
    /// assumptions do not hold on this OS build; neither goes away by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } | Self::QueryFailed { .. } | Self::Cancelled { .. } => {
                true
            }
            Self::QueryDenied { .. } | Self::ParseError { .. } => false,
        }
    }

    pub(crate) fn parse(stage: Stage, reason: impl Into<String>) -> Self {
        Self::ParseError {
            stage,
            reason: reason.into(),
        }
    }
}

/// Why a single handle could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleFailure {
    DuplicateFailed,
    UnsafeAccessMask,
    QueryFailed,
    TimedOut,
    Unnamed,
}

impl HandleFailure {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DuplicateFailed => "duplicate failed",
            Self::UnsafeAccessMask => "access mask may block name query",
            Self::QueryFailed => "name query failed",
            Self::TimedOut => "name query timed out",
            Self::Unnamed => "object has no name",
        }
    }
}

impl fmt::Display for HandleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-entry failure, recovered locally by skipping the entry.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("process {pid} is unavailable")]
    ProcessUnavailable { pid: u32 },

    #[error("handle {handle:#x} in process {pid} is unavailable: {reason}")]
    HandleUnavailable {
        pid: u32,
        handle: usize,
        reason: HandleFailure,
    },
}

/// Rejection of a [`FileHandleInfo`](crate::system::correlate::FileHandleInfo)
/// with a missing field.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    #[error("file path cannot be empty")]
    EmptyFilePath,
    #[error("NT path cannot be empty")]
    EmptyNtPath,
    #[error("handle type cannot be empty")]
    EmptyHandleType,
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
