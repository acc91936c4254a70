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

//! Per-call configuration for RPCs.

use crate::retry_policy::{CallRetryPolicy, RetryPolicy};
use std::time::Duration;

/// Request metadata sent alongside an RPC, as header name/value pairs.
pub type Metadata = std::collections::BTreeMap<String, String>;

/// The configuration for a single logical call.
///
/// Generated clients build one `CallOptions` per method invocation, merging
/// client defaults with caller overrides, and hand it to
/// [RpcCall][crate::rpc_call::RpcCall]. All fields are optional:
///
/// * `timeout` bounds the *logical* call including all retry attempts. The
///   absolute deadline is computed once at the start of the call.
/// * `metadata` is sent with every attempt.
/// * `retry_policy` decides which errors are retried; without one the call is
///   attempted exactly once.
///
/// `CallOptions` implements [serde::Deserialize], so it can be built from
/// mapping-shaped configuration. Unknown keys are ignored and durations are
/// expressed as (fractional) seconds:
///
/// ```
/// use gapic_common::call_options::CallOptions;
/// let options: CallOptions = serde_json::from_value(serde_json::json!({
///     "timeout": 30.0,
///     "retry_policy": { "retry_codes": ["UNAVAILABLE"] },
/// }))?;
/// assert_eq!(options.timeout(), Some(std::time::Duration::from_secs(30)));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
    metadata: Metadata,
    retry_policy: Option<CallRetryPolicy>,
}

impl CallOptions {
    /// Sets the timeout for the logical call, attempts and backoff included.
    pub fn set_timeout<T: Into<Duration>>(mut self, v: T) -> Self {
        self.timeout = Some(v.into());
        self
    }

    /// Sets the metadata sent with every attempt.
    pub fn set_metadata<T: Into<Metadata>>(mut self, v: T) -> Self {
        self.metadata = v.into();
        self
    }

    /// Sets the retry configuration.
    pub fn set_retry_policy<T: Into<CallRetryPolicy>>(mut self, v: T) -> Self {
        self.retry_policy = Some(v.into());
        self
    }

    /// The timeout for the logical call, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The metadata sent with every attempt.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The retry configuration, if any.
    pub fn retry_policy(&self) -> Option<&CallRetryPolicy> {
        self.retry_policy.as_ref()
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl<'de> serde::Deserialize<'de> for CallOptions {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let shape = Shape::deserialize(deserializer)?;
        let mut options = CallOptions::default();
        if let Some(v) = shape.timeout {
            if !v.is_finite() || v < 0.0 {
                return Err(serde::de::Error::custom(format!(
                    "timeout must be a finite, non-negative number of seconds, got {v}"
                )));
            }
            options.timeout = Some(Duration::from_secs_f64(v));
        }
        if let Some(v) = shape.metadata {
            options.metadata = v;
        }
        if let Some(v) = shape.retry_policy {
            options.retry_policy = Some(v.into());
        }
        Ok(options)
    }
}

#[derive(serde::Deserialize)]
struct Shape {
    timeout: Option<f64>,
    metadata: Option<Metadata>,
    retry_policy: Option<RetryPolicy>,
}
