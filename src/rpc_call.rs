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

//! The attempt loop executing a logical RPC.
//!
//! An [RpcCall] wraps a transport callable and runs it until success, a
//! permanent error, or deadline exhaustion. One logical call may become
//! several network attempts; the retries are invisible to the caller, who
//! observes the final response or the error from the last attempt. The loop
//! never synthesizes its own timeout error.

use crate::Result;
use crate::call_options::{CallOptions, Metadata};
use crate::retry_policy::RetryDecision;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

/// The result of one successful transport attempt.
///
/// Most methods resolve directly to a response. Methods returning a
/// long-running operation resolve to an [RpcOperation], which the attempt
/// loop executes before reporting success; errors raised while executing the
/// operation are classified by the same retry policy as direct attempt
/// errors.
pub enum Invocation<T> {
    /// An immediate response, with the trailing metadata.
    Response(T, Metadata),
    /// A deferred result that must be executed to completion.
    Operation(RpcOperation<T>),
}

impl<T> std::fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(..) => f.debug_tuple("Response").finish(),
            Self::Operation(..) => f.debug_tuple("Operation").finish(),
        }
    }
}

/// A deferred attempt result, wrapping the future that resolves it.
pub struct RpcOperation<T> {
    execute: Pin<Box<dyn Future<Output = Result<(T, Metadata)>> + Send>>,
}

impl<T> RpcOperation<T> {
    pub fn new<F>(execute: F) -> Self
    where
        F: Future<Output = Result<(T, Metadata)>> + Send + 'static,
    {
        Self {
            execute: Box::pin(execute),
        }
    }

    /// Drives the operation to its final result.
    pub async fn execute(self) -> Result<(T, Metadata)> {
        self.execute.await
    }
}

/// The per-attempt view of the call configuration.
///
/// The deadline is absolute and shared by all attempts of one logical call;
/// each attempt converts it to the time it has left.
#[derive(Clone, Debug)]
pub struct AttemptOptions {
    deadline: Option<Instant>,
    metadata: Metadata,
}

impl AttemptOptions {
    /// The absolute deadline for the logical call, if a timeout was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The time remaining until the deadline. Zero once the deadline passed.
    pub fn timeout(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The metadata to send with this attempt.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Executes a logical RPC with timeouts and retries.
///
/// The wrapped callable performs one network attempt: it receives the request
/// and the [AttemptOptions], and resolves to an [Invocation] or an [Error].
/// `RpcCall` computes the absolute deadline once, then loops attempts
/// according to the [CallOptions]:
///
/// * Without a retry policy the callable runs exactly once.
/// * Errors without a [Status][crate::error::rpc::Status] propagate
///   immediately; no policy is consulted.
/// * When the deadline passes, the error from the last attempt propagates
///   as-is.
/// * Otherwise the policy classifies the error, and a retryable one leads to
///   a backoff sleep and a new attempt with a clone of the request.
///
/// # Example
/// ```
/// # use gapic_common::rpc_call::{AttemptOptions, Invocation, RpcCall};
/// # use gapic_common::call_options::CallOptions;
/// # use gapic_common::Result;
/// # tokio_test::block_on(async {
/// let mut call = RpcCall::new(async |request: String, _options: AttemptOptions| {
///     Ok::<_, gapic_common::error::Error>(Invocation::Response(request.len(), Default::default()))
/// });
/// let n = call.call("hello".to_string(), &CallOptions::default()).await?;
/// assert_eq!(n, 5);
/// # Ok::<(), gapic_common::error::Error>(()) });
/// ```
pub struct RpcCall<F> {
    stub_method: F,
}

impl<F> RpcCall<F> {
    pub fn new(stub_method: F) -> Self {
        Self { stub_method }
    }

    /// Executes the call and returns the response.
    pub async fn call<Request, Response>(
        &mut self,
        request: Request,
        options: &CallOptions,
    ) -> Result<Response>
    where
        F: AsyncFnMut(Request, AttemptOptions) -> Result<Invocation<Response>>,
        Request: Clone,
    {
        self.call_with(request, options, |response, _metadata| response)
            .await
    }

    /// Executes the call and passes the response and its trailing metadata
    /// through `handler`, returning the handler's value.
    pub async fn call_with<Request, Response, U, H>(
        &mut self,
        request: Request,
        options: &CallOptions,
        handler: H,
    ) -> Result<U>
    where
        F: AsyncFnMut(Request, AttemptOptions) -> Result<Invocation<Response>>,
        Request: Clone,
        H: FnMut(Response, Metadata) -> U,
    {
        self.call_with_sleep(request, options, handler, async |d| {
            tokio::time::sleep(d).await
        })
        .await
    }

    /// The full form: like [call_with][RpcCall::call_with] with an explicit
    /// backoff sleep primitive, so tests can intercept the delays.
    pub async fn call_with_sleep<Request, Response, U, H, S>(
        &mut self,
        request: Request,
        options: &CallOptions,
        mut handler: H,
        sleep: S,
    ) -> Result<U>
    where
        F: AsyncFnMut(Request, AttemptOptions) -> Result<Invocation<Response>>,
        Request: Clone,
        H: FnMut(Response, Metadata) -> U,
        S: AsyncFn(Duration),
    {
        // The deadline is computed once and bounds the whole loop, backoff
        // sleeps included.
        let deadline = options.timeout().map(|t| Instant::now() + t);
        let retry = options.retry_policy();
        let mut state = retry.map(|policy| policy.begin());
        loop {
            let attempt = AttemptOptions {
                deadline,
                metadata: options.metadata().clone(),
            };
            let error = match (self.stub_method)(request.clone(), attempt).await {
                Ok(Invocation::Response(response, metadata)) => {
                    return Ok(handler(response, metadata));
                }
                Ok(Invocation::Operation(operation)) => match operation.execute().await {
                    Ok((response, metadata)) => return Ok(handler(response, metadata)),
                    Err(e) => e,
                },
                Err(e) => e,
            };
            if error.status().is_none() {
                return Err(error);
            }
            let (Some(retry), Some(state)) = (retry, state.as_mut()) else {
                return Err(error);
            };
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(error);
            }
            match retry.decide(state, &error) {
                RetryDecision::Stop => return Err(error),
                RetryDecision::Continue(delay) => {
                    if let Some(delay) = delay {
                        tracing::debug!("retrying in {delay:?} after error: {error}");
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}
