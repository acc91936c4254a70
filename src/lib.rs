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

//! Shared RPC execution runtime for generated API clients.
//!
//! Generated clients are thin wrappers: they format requests and then hand
//! them to this crate to actually perform the RPC. The interesting behavior
//! lives here:
//!
//! * [CallOptions][crate::call_options::CallOptions] configure a single
//!   logical call: timeout, custom metadata, and retry behavior.
//! * [RetryPolicy][crate::retry_policy::RetryPolicy] classifies errors by
//!   status code and computes truncated exponential backoff delays.
//! * [RpcCall][crate::rpc_call::RpcCall] drives the attempt loop: it computes
//!   an absolute deadline, invokes the transport, and retries transient
//!   failures until success, a permanent error, or deadline exhaustion.
//! * [ServiceStub][crate::service_stub::ServiceStub] owns the transport
//!   channel and credentials, and dispatches method calls through `RpcCall`.
//!
//! A logical RPC may be executed as several network attempts; the retry
//! machinery is transparent: callers observe either the final response or the
//! error from the last attempt, never a synthetic error type.

/// An alias of [std::result::Result] where the error is always [crate::error::Error].
///
/// This is the result type used by all functions wrapping RPCs.
pub type Result<T> = std::result::Result<T, crate::error::Error>;

/// The core error types used by generated clients.
pub mod error;

pub mod call_options;
pub mod retry_policy;
pub mod rpc_call;
pub mod service_stub;
