/*
 *     Copyright 2023 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;

/// ErrorKind is the taxonomy of errors the scheduler and client exchange.
///
/// It is deliberately small and wire-stable: it is mapped to a `tonic::Code`
/// on the way out and read back on the way in, so both sides agree on the
/// same set of recoverable/non-recoverable classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// InvalidArgument is returned for validation failures. Never retried.
    InvalidArgument,

    /// NotFound is returned when a peer/task/host entity is missing.
    NotFound,

    /// Cycle is returned when adding an edge would introduce a cycle in the peer graph.
    Cycle,

    /// SameHost is returned when a candidate parent shares a host with its child.
    SameHost,

    /// NoCandidate is returned when the evaluator has no parent left to offer.
    NoCandidate,

    /// UploadExhausted is returned when a parent host has no free upload slot.
    UploadExhausted,

    /// PieceDigestMismatch is returned when a downloaded piece fails digest verification.
    PieceDigestMismatch,

    /// SchedulerReregister is returned when the scheduler has lost peer state.
    SchedulerReregister,

    /// BackToSourceExceeded is returned when a task's back-to-source counter hits its limit.
    BackToSourceExceeded,

    /// Timeout is returned for stream or piece-level timeouts.
    Timeout,

    /// Fatal is returned when a graph invariant has been violated.
    Fatal,

    /// Unavailable wraps an underlying transport/storage failure.
    Unavailable,
}

impl ErrorKind {
    /// is_retryable reports whether the scheduler core should reschedule on this error
    /// rather than fail the peer outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Cycle
                | ErrorKind::SameHost
                | ErrorKind::NoCandidate
                | ErrorKind::UploadExhausted
                | ErrorKind::PieceDigestMismatch
                | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::Cycle => "cycle",
            ErrorKind::SameHost => "same host",
            ErrorKind::NoCandidate => "no candidate",
            ErrorKind::UploadExhausted => "upload exhausted",
            ErrorKind::PieceDigestMismatch => "piece digest mismatch",
            ErrorKind::SchedulerReregister => "scheduler reregister",
            ErrorKind::BackToSourceExceeded => "back-to-source exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Unavailable => "unavailable",
        };
        write!(f, "{}", s)
    }
}

/// Error is the crate-wide error type returned by the scheduler and client core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{kind}: {message}")]
    Taxonomy { kind: ErrorKind, message: String },

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    TonicStatus(#[from] tonic::Status),

    #[error(transparent)]
    TonicTransport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error("send error: {0}")]
    SendError(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn taxonomy(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Taxonomy {
            kind,
            message: message.into(),
        }
    }

    /// kind returns the taxonomy kind of this error, if it carries one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Taxonomy { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().map(|k| k.is_retryable()).unwrap_or(false)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::SendError(err.to_string())
    }
}

/// From<Error> for tonic::Status so grpc handlers can propagate taxonomy errors
/// without losing the error code, matching the teacher's `map_err(|e| Status::internal(...))`
/// idiom but centralizing the kind -> code mapping in one place.
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            Error::Taxonomy { kind, message } => {
                let code = match kind {
                    ErrorKind::InvalidArgument => tonic::Code::InvalidArgument,
                    ErrorKind::NotFound => tonic::Code::NotFound,
                    ErrorKind::Cycle
                    | ErrorKind::SameHost
                    | ErrorKind::NoCandidate
                    | ErrorKind::UploadExhausted => tonic::Code::FailedPrecondition,
                    ErrorKind::PieceDigestMismatch => tonic::Code::DataLoss,
                    ErrorKind::SchedulerReregister => tonic::Code::Aborted,
                    ErrorKind::BackToSourceExceeded => tonic::Code::ResourceExhausted,
                    ErrorKind::Timeout => tonic::Code::DeadlineExceeded,
                    ErrorKind::Fatal => tonic::Code::Internal,
                    ErrorKind::Unavailable => tonic::Code::Unavailable,
                };
                tonic::Status::new(code, message.clone())
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Convenience constructors mirroring the spec's error taxonomy (§7).
pub fn invalid_argument(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::InvalidArgument, message)
}

pub fn not_found(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::NotFound, message)
}

pub fn cycle(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::Cycle, message)
}

pub fn same_host(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::SameHost, message)
}

pub fn no_candidate(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::NoCandidate, message)
}

pub fn upload_exhausted(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::UploadExhausted, message)
}

pub fn piece_digest_mismatch(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::PieceDigestMismatch, message)
}

pub fn back_to_source_exceeded(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::BackToSourceExceeded, message)
}

pub fn timeout(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::Timeout, message)
}

pub fn fatal(message: impl Into<String>) -> Error {
    Error::taxonomy(ErrorKind::Fatal, message)
}
