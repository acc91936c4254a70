// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Errors and error details returned by RPCs.
//!
//! This crate distinguishes between errors reported by the service itself
//! (which carry a [Status] and may be retryable), and errors raised on the
//! client side before or after the request (which never are).

use self::rpc::{Code, Status};

/// Status codes and status payloads attached to service errors.
pub mod rpc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The core error returned by all RPC wrappers in this crate.
///
/// Errors originate from multiple sources: the service may return an error
/// status, the transport may be unable to deliver the request, the
/// credentials may fail to produce authentication metadata, or the
/// configuration may be invalid.
///
/// Only errors carrying a [Status] (see [Error::status]) are candidates for
/// retries; all other errors indicate conditions that repeating the request
/// cannot fix, and the retry loop propagates them on first occurrence.
///
/// # Example
/// ```
/// use gapic_common::error::Error;
/// use gapic_common::error::rpc::{Code, Status};
/// let error = Error::service(Status::default().set_code(Code::NotFound));
/// assert_eq!(error.code(), Some(Code::NotFound));
/// ```
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
}

#[derive(Debug)]
enum ErrorKind {
    Service(Status),
    Authentication,
    Transport,
    InvalidArgument,
    Other,
}

impl Error {
    /// Creates an error with the status information returned by a service.
    pub fn service(status: Status) -> Self {
        Self {
            kind: ErrorKind::Service(status),
            source: None,
        }
    }

    /// Creates a service error preserving the transport-level error as the
    /// [source][std::error::Error::source].
    pub fn service_full<T: Into<BoxError>>(status: Status, source: T) -> Self {
        Self {
            kind: ErrorKind::Service(status),
            source: Some(source.into()),
        }
    }

    /// Creates an error for problems producing authentication metadata.
    pub fn authentication<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Authentication,
            source: Some(source.into()),
        }
    }

    /// Creates an error for problems sending or completing the request.
    pub fn transport<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Transport,
            source: Some(source.into()),
        }
    }

    /// Creates an error for invalid configuration or call arguments.
    ///
    /// These are raised synchronously, typically at construction time, and
    /// never deferred to the request path.
    pub fn invalid_argument<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            source: Some(source.into()),
        }
    }

    /// Creates an error for conditions that fit no other category.
    pub fn other<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Other,
            source: Some(source.into()),
        }
    }

    /// The status payload, if the service rejected the request.
    ///
    /// Errors without a status are never consulted against a retry policy;
    /// they propagate immediately.
    pub fn status(&self) -> Option<&Status> {
        match &self.kind {
            ErrorKind::Service(status) => Some(status),
            _ => None,
        }
    }

    /// The canonical status code, if the service rejected the request.
    pub fn code(&self) -> Option<Code> {
        self.status().map(|s| s.code)
    }

    /// The request failed before any authentication metadata was produced.
    pub fn is_authentication(&self) -> bool {
        matches!(self.kind, ErrorKind::Authentication)
    }

    /// The request could not be sent, or its response never completed.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport)
    }

    /// The client was misconfigured, or a call argument was invalid.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidArgument)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::Service(status) => {
                write!(f, "the service reported an error: {status}")
            }
            ErrorKind::Authentication => {
                write!(f, "cannot create the authentication metadata for the request")
            }
            ErrorKind::Transport => {
                write!(f, "the request could not be completed by the transport")
            }
            ErrorKind::InvalidArgument => {
                write!(f, "the client configuration or call arguments are invalid")
            }
            ErrorKind::Other => write!(f, "the RPC failed with an unclassified error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
