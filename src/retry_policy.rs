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

//! Retry classification and backoff for RPC attempts.
//!
//! A [RetryPolicy] answers two questions for the attempt loop in
//! [rpc_call][crate::rpc_call]: *should this error be retried* (by status
//! code membership) and *how long to wait before the next attempt*
//! (truncated exponential backoff, no jitter). Policies are plain data and
//! hold no per-call state; the mutable backoff position lives in a
//! [RetryState] created by [RetryPolicy::begin] for each logical call.

use crate::error::Error;
use crate::error::rpc::Code;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// The default delay before the first retry attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// The default multiplier applied to the delay after each attempt.
pub const DEFAULT_MULTIPLIER: f64 = 1.3;

/// The default upper bound on the delay between attempts.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);

/// Declarative retry configuration: which status codes to retry and how to
/// back off between attempts.
///
/// All fields track presence. A policy built from partial configuration
/// remembers which fields were set explicitly, so [apply_defaults]
/// [RetryPolicy::apply_defaults] can layer a service-level policy under a
/// per-call one without clobbering explicit values. The effective-value
/// accessors ([initial_delay][RetryPolicy::initial_delay] and friends)
/// substitute the documented defaults for unset fields.
///
/// The delay sequence is deterministic: starting at the initial delay, each
/// retry multiplies the delay by the multiplier and truncates at the maximum.
/// With the defaults this yields 1s, 1.3s, 1.69s, 2.197s, ... capped at 15s.
///
/// # Example
/// ```
/// use gapic_common::retry_policy::RetryPolicy;
/// let policy = RetryPolicy::default()
///     .set_retry_code_names(["UNAVAILABLE", "deadline_exceeded"])
///     .set_initial_delay(std::time::Duration::from_millis(500));
/// assert_eq!(policy.retry_codes().len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryPolicy {
    retry_codes: Option<BTreeSet<Code>>,
    initial_delay: Option<Duration>,
    multiplier: Option<f64>,
    max_delay: Option<Duration>,
}

static EMPTY_CODES: BTreeSet<Code> = BTreeSet::new();

impl RetryPolicy {
    /// Sets the status codes considered retryable.
    pub fn set_retry_codes<I, C>(mut self, v: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Code>,
    {
        self.retry_codes = Some(v.into_iter().map(|c| c.into()).collect());
        self
    }

    /// Sets the retryable status codes from symbolic names.
    ///
    /// Names are matched case-insensitively. Unrecognized names are silently
    /// dropped, so configuration written against a newer code table degrades
    /// to retrying fewer codes rather than failing.
    pub fn set_retry_code_names<I>(mut self, v: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.retry_codes = Some(
            v.into_iter()
                .filter_map(|name| Code::try_from(name.as_ref()).ok())
                .collect(),
        );
        self
    }

    /// Sets the delay before the first retry attempt.
    pub fn set_initial_delay<T: Into<Duration>>(mut self, v: T) -> Self {
        self.initial_delay = Some(v.into());
        self
    }

    /// Sets the multiplier applied to the delay after each attempt.
    ///
    /// The multiplier must be finite and at least 1.0; other values are
    /// ignored and the default applies.
    pub fn set_multiplier<T: Into<f64>>(mut self, v: T) -> Self {
        self.multiplier = Some(v.into());
        self
    }

    /// Sets the upper bound on the delay between attempts.
    pub fn set_max_delay<T: Into<Duration>>(mut self, v: T) -> Self {
        self.max_delay = Some(v.into());
        self
    }

    /// The effective set of retryable status codes. Empty when unset.
    pub fn retry_codes(&self) -> &BTreeSet<Code> {
        self.retry_codes.as_ref().unwrap_or(&EMPTY_CODES)
    }

    /// The effective delay before the first retry attempt.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY)
    }

    /// The effective backoff multiplier. Always finite and at least 1.0.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
            .filter(|m| m.is_finite() && *m >= 1.0)
            .unwrap_or(DEFAULT_MULTIPLIER)
    }

    /// The effective upper bound on the delay between attempts.
    pub fn max_delay(&self) -> Duration {
        self.max_delay.unwrap_or(DEFAULT_MAX_DELAY)
    }

    /// Fills unset fields from `defaults`, leaving explicit values intact.
    ///
    /// Used to layer configuration: per-call policies are completed from the
    /// method-level policy, which in turn may be completed from the
    /// service-level one.
    pub fn apply_defaults(mut self, defaults: &RetryPolicy) -> Self {
        if self.retry_codes.is_none() {
            self.retry_codes = defaults.retry_codes.clone();
        }
        if self.initial_delay.is_none() {
            self.initial_delay = defaults.initial_delay;
        }
        if self.multiplier.is_none() {
            self.multiplier = defaults.multiplier;
        }
        if self.max_delay.is_none() {
            self.max_delay = defaults.max_delay;
        }
        self
    }

    /// Starts the backoff sequence for one logical call.
    pub fn begin(&self) -> RetryState {
        RetryState {
            current_delay: self.initial_delay(),
        }
    }

    /// Classifies `error` and, if retryable, returns the delay to sleep
    /// before the next attempt, advancing `state` to the following delay.
    pub fn decide(&self, state: &mut RetryState, error: &Error) -> RetryDecision {
        let retryable = error
            .code()
            .is_some_and(|code| self.retry_codes().contains(&code));
        if !retryable {
            return RetryDecision::Stop;
        }
        let delay = state.current_delay;
        let max_delay = self.max_delay();
        // multiplier() is finite and >= 1.0, so `scaled` is never NaN; an
        // overflow to infinity takes the max_delay branch.
        let scaled = delay.as_secs_f64() * self.multiplier();
        state.current_delay = if scaled < max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            max_delay
        };
        RetryDecision::Continue(Some(delay))
    }
}

/// The mutable position in a backoff sequence.
///
/// One state is created per logical call; concurrent calls sharing a policy
/// never share a state.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryState {
    current_delay: Duration,
}

impl RetryState {
    /// The delay the next retryable error will be assigned.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

/// The outcome of consulting a retry policy about an error.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    /// Retry, after sleeping the given delay. `None` means the policy does
    /// not prescribe a delay and the loop proceeds immediately.
    Continue(Option<Duration>),
    /// Do not retry; propagate the error.
    Stop,
}

impl RetryDecision {
    pub fn is_continue(&self) -> bool {
        matches!(self, RetryDecision::Continue(_))
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, RetryDecision::Stop)
    }
}

/// A caller-provided retry classifier.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// The retry configuration attached to a call: either a structured
/// [RetryPolicy] or a bare predicate.
///
/// Both shapes answer [decide][CallRetryPolicy::decide] uniformly, so the
/// attempt loop does not branch on which was supplied. Predicates carry no
/// backoff of their own; a `true` answer yields
/// [RetryDecision::Continue]`(None)`.
#[derive(Clone)]
pub enum CallRetryPolicy {
    Policy(RetryPolicy),
    Predicate(RetryPredicate),
}

impl CallRetryPolicy {
    /// Wraps a bare classification function.
    pub fn from_predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Starts the backoff sequence for one logical call.
    pub fn begin(&self) -> RetryState {
        match self {
            Self::Policy(policy) => policy.begin(),
            Self::Predicate(_) => RetryState {
                current_delay: Duration::ZERO,
            },
        }
    }

    /// Classifies `error`, advancing `state` when a structured policy is in
    /// use.
    pub fn decide(&self, state: &mut RetryState, error: &Error) -> RetryDecision {
        match self {
            Self::Policy(policy) => policy.decide(state, error),
            Self::Predicate(predicate) => {
                if predicate(error) {
                    RetryDecision::Continue(None)
                } else {
                    RetryDecision::Stop
                }
            }
        }
    }
}

impl std::fmt::Debug for CallRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Policy(policy) => f.debug_tuple("Policy").field(policy).finish(),
            Self::Predicate(_) => f.debug_tuple("Predicate").field(&"..").finish(),
        }
    }
}

impl From<RetryPolicy> for CallRetryPolicy {
    fn from(value: RetryPolicy) -> Self {
        Self::Policy(value)
    }
}

impl<'de> serde::Deserialize<'de> for RetryPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Unknown keys are ignored, and unknown code names or out-of-range
        // numbers are dropped rather than rejected.
        let shape = Shape::deserialize(deserializer)?;
        let mut policy = RetryPolicy::default();
        if let Some(codes) = shape.retry_codes {
            let codes = match codes {
                CodesShape::One(name) => vec![CodeShape::Name(name)],
                CodesShape::Many(codes) => codes,
            };
            policy.retry_codes = Some(
                codes
                    .into_iter()
                    .filter_map(|code| match code {
                        CodeShape::Number(v) if (0..=16).contains(&v) => Some(Code::from(v)),
                        CodeShape::Number(_) => None,
                        CodeShape::Name(name) => Code::try_from(name.as_str()).ok(),
                    })
                    .collect(),
            );
        }
        if let Some(v) = shape.initial_delay {
            policy.initial_delay = Some(seconds::<D>(v, "initial_delay")?);
        }
        if let Some(v) = shape.multiplier {
            if !v.is_finite() || v < 1.0 {
                return Err(serde::de::Error::custom(format!(
                    "multiplier must be a finite value >= 1.0, got {v}"
                )));
            }
            policy.multiplier = Some(v);
        }
        if let Some(v) = shape.max_delay {
            policy.max_delay = Some(seconds::<D>(v, "max_delay")?);
        }
        Ok(policy)
    }
}

fn seconds<'de, D>(value: f64, field: &'static str) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if !value.is_finite() || value < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "{field} must be a finite, non-negative number of seconds, got {value}"
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

#[derive(serde::Deserialize)]
struct Shape {
    retry_codes: Option<CodesShape>,
    initial_delay: Option<f64>,
    multiplier: Option<f64>,
    max_delay: Option<f64>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum CodesShape {
    One(String),
    Many(Vec<CodeShape>),
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum CodeShape {
    Number(i32),
    Name(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::rpc::Status;
    use anyhow::Result;
    use test_case::test_case;

    fn service_error(code: Code) -> Error {
        Error::service(Status::default().set_code(code))
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert!(policy.retry_codes().is_empty());
        assert_eq!(policy.initial_delay(), DEFAULT_INITIAL_DELAY);
        assert_eq!(policy.multiplier(), DEFAULT_MULTIPLIER);
        assert_eq!(policy.max_delay(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn builder() {
        let policy = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable, Code::Aborted])
            .set_initial_delay(Duration::from_millis(500))
            .set_multiplier(2.0)
            .set_max_delay(Duration::from_secs(60));
        assert!(policy.retry_codes().contains(&Code::Unavailable));
        assert!(policy.retry_codes().contains(&Code::Aborted));
        assert_eq!(policy.initial_delay(), Duration::from_millis(500));
        assert_eq!(policy.multiplier(), 2.0);
        assert_eq!(policy.max_delay(), Duration::from_secs(60));
    }

    #[test_case(["UNAVAILABLE", "DEADLINE_EXCEEDED"], [Code::Unavailable, Code::DeadlineExceeded]; "canonical names")]
    #[test_case(["unavailable", "Deadline_Exceeded"], [Code::Unavailable, Code::DeadlineExceeded]; "mixed case")]
    #[test_case(["UNAVAILABLE", "NOT_A_CODE"], [Code::Unavailable]; "unknown names dropped")]
    fn code_names<const N: usize, const M: usize>(names: [&str; N], want: [Code; M]) {
        let policy = RetryPolicy::default().set_retry_code_names(names);
        let want: BTreeSet<_> = want.into_iter().collect();
        assert_eq!(policy.retry_codes(), &want);
    }

    #[test]
    fn duplicate_codes_collapse() {
        let policy = RetryPolicy::default().set_retry_code_names(["UNAVAILABLE", "unavailable"]);
        assert_eq!(policy.retry_codes().len(), 1);
    }

    #[test]
    fn decide_backoff_sequence() {
        let policy = RetryPolicy::default().set_retry_codes([Code::Unavailable]);
        let error = service_error(Code::Unavailable);
        let mut state = policy.begin();

        // The expected sequence follows the same recurrence as the
        // implementation to avoid f64 rounding mismatches.
        let mut want = policy.initial_delay();
        for _ in 0..8 {
            let decision = policy.decide(&mut state, &error);
            assert_eq!(decision, RetryDecision::Continue(Some(want)));
            want = std::cmp::min(want.mul_f64(policy.multiplier()), policy.max_delay());
        }
    }

    #[test]
    fn decide_documented_delays() {
        let policy = RetryPolicy::default().set_retry_codes([Code::Unavailable]);
        let error = service_error(Code::Unavailable);
        let mut state = policy.begin();
        let tolerance = 1e-9;
        for want in [1.0, 1.3, 1.69, 2.197] {
            match policy.decide(&mut state, &error) {
                RetryDecision::Continue(Some(delay)) => {
                    assert!(
                        (delay.as_secs_f64() - want).abs() < tolerance,
                        "delay={delay:?} want={want}"
                    );
                }
                other => panic!("expected a delay, got {other:?}"),
            }
        }
    }

    #[test]
    fn decide_caps_at_max_delay() {
        let policy = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable])
            .set_initial_delay(Duration::from_secs(10))
            .set_multiplier(2.0)
            .set_max_delay(Duration::from_secs(15));
        let error = service_error(Code::Unavailable);
        let mut state = policy.begin();
        assert_eq!(
            policy.decide(&mut state, &error),
            RetryDecision::Continue(Some(Duration::from_secs(10)))
        );
        for _ in 0..4 {
            assert_eq!(
                policy.decide(&mut state, &error),
                RetryDecision::Continue(Some(Duration::from_secs(15)))
            );
        }
    }

    #[test_case(-1.0; "negative")]
    #[test_case(0.5; "below one")]
    #[test_case(f64::NAN; "nan")]
    #[test_case(f64::INFINITY; "infinite")]
    fn decide_ignores_invalid_multiplier(multiplier: f64) {
        let policy = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable])
            .set_multiplier(multiplier);
        assert_eq!(policy.multiplier(), DEFAULT_MULTIPLIER);

        let error = service_error(Code::Unavailable);
        let mut state = policy.begin();
        assert_eq!(
            policy.decide(&mut state, &error),
            RetryDecision::Continue(Some(DEFAULT_INITIAL_DELAY))
        );
        assert_eq!(
            state.current_delay(),
            DEFAULT_INITIAL_DELAY.mul_f64(DEFAULT_MULTIPLIER)
        );
    }

    #[test]
    fn decide_huge_multiplier_caps_at_max_delay() {
        let policy = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable])
            .set_multiplier(1e300);
        let error = service_error(Code::Unavailable);
        let mut state = policy.begin();
        let _ = policy.decide(&mut state, &error);
        assert_eq!(state.current_delay(), policy.max_delay());
        let _ = policy.decide(&mut state, &error);
        assert_eq!(state.current_delay(), policy.max_delay());
    }

    #[test]
    fn decide_non_matching_code() {
        let policy = RetryPolicy::default().set_retry_codes([Code::Unavailable]);
        let mut state = policy.begin();
        let decision = policy.decide(&mut state, &service_error(Code::PermissionDenied));
        assert!(decision.is_stop());
        // A stop leaves the backoff position untouched.
        assert_eq!(state.current_delay(), policy.initial_delay());
    }

    #[test]
    fn decide_error_without_status() {
        let policy = RetryPolicy::default().set_retry_codes([Code::Unavailable]);
        let mut state = policy.begin();
        let decision = policy.decide(&mut state, &Error::transport("reset".to_string()));
        assert!(decision.is_stop());
    }

    #[test]
    fn decide_empty_code_set() {
        let policy = RetryPolicy::default();
        let mut state = policy.begin();
        assert!(
            policy
                .decide(&mut state, &service_error(Code::Unavailable))
                .is_stop()
        );
    }

    #[test]
    fn apply_defaults_fills_only_unset() {
        let defaults = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable])
            .set_initial_delay(Duration::from_secs(2))
            .set_multiplier(2.0)
            .set_max_delay(Duration::from_secs(30));
        let policy = RetryPolicy::default()
            .set_initial_delay(Duration::from_millis(100))
            .apply_defaults(&defaults);
        assert_eq!(policy.initial_delay(), Duration::from_millis(100));
        assert_eq!(policy.multiplier(), 2.0);
        assert_eq!(policy.max_delay(), Duration::from_secs(30));
        assert!(policy.retry_codes().contains(&Code::Unavailable));
    }

    #[test]
    fn apply_defaults_noop_on_complete_policy() {
        let complete = RetryPolicy::default()
            .set_retry_codes([Code::Aborted])
            .set_initial_delay(Duration::from_secs(3))
            .set_multiplier(1.5)
            .set_max_delay(Duration::from_secs(10));
        let defaults = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable])
            .set_initial_delay(Duration::from_secs(9));
        assert_eq!(complete.clone().apply_defaults(&defaults), complete);
    }

    #[test]
    fn states_are_independent() {
        let policy = RetryPolicy::default().set_retry_codes([Code::Unavailable]);
        let error = service_error(Code::Unavailable);
        let mut a = policy.begin();
        let mut b = policy.begin();
        let _ = policy.decide(&mut a, &error);
        let _ = policy.decide(&mut a, &error);
        assert_eq!(b.current_delay(), policy.initial_delay());
        let _ = policy.decide(&mut b, &error);
        assert_ne!(a.current_delay(), policy.initial_delay());
    }

    #[test]
    fn call_policy_from_structured() {
        let call: CallRetryPolicy = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable])
            .into();
        let mut state = call.begin();
        let decision = call.decide(&mut state, &service_error(Code::Unavailable));
        assert_eq!(
            decision,
            RetryDecision::Continue(Some(DEFAULT_INITIAL_DELAY))
        );
        assert!(
            call.decide(&mut state, &service_error(Code::NotFound))
                .is_stop()
        );
    }

    #[test]
    fn call_policy_from_predicate() {
        let call =
            CallRetryPolicy::from_predicate(|error| error.code() == Some(Code::Unavailable));
        let mut state = call.begin();
        assert_eq!(
            call.decide(&mut state, &service_error(Code::Unavailable)),
            RetryDecision::Continue(None)
        );
        assert!(
            call.decide(&mut state, &service_error(Code::NotFound))
                .is_stop()
        );
    }

    #[test]
    fn deserialize_full() -> Result<()> {
        let policy = serde_json::from_value::<RetryPolicy>(serde_json::json!({
            "retry_codes": ["UNAVAILABLE", 4],
            "initial_delay": 0.5,
            "multiplier": 2.0,
            "max_delay": 30.0,
        }))?;
        let want = RetryPolicy::default()
            .set_retry_codes([Code::Unavailable, Code::DeadlineExceeded])
            .set_initial_delay(Duration::from_millis(500))
            .set_multiplier(2.0)
            .set_max_delay(Duration::from_secs(30));
        assert_eq!(policy, want);
        Ok(())
    }

    #[test]
    fn deserialize_partial_tracks_presence() -> Result<()> {
        let policy = serde_json::from_value::<RetryPolicy>(serde_json::json!({
            "initial_delay": 2.0,
        }))?;
        let defaults = RetryPolicy::default().set_max_delay(Duration::from_secs(60));
        let policy = policy.apply_defaults(&defaults);
        assert_eq!(policy.initial_delay(), Duration::from_secs(2));
        assert_eq!(policy.max_delay(), Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn deserialize_drops_unknown_codes() -> Result<()> {
        let policy = serde_json::from_value::<RetryPolicy>(serde_json::json!({
            "retry_codes": ["UNAVAILABLE", "NOT_A_CODE", 99],
        }))?;
        let want: BTreeSet<_> = [Code::Unavailable].into_iter().collect();
        assert_eq!(policy.retry_codes(), &want);
        Ok(())
    }

    #[test]
    fn deserialize_single_code_name() -> Result<()> {
        let policy = serde_json::from_value::<RetryPolicy>(serde_json::json!({
            "retry_codes": "unavailable",
        }))?;
        let want: BTreeSet<_> = [Code::Unavailable].into_iter().collect();
        assert_eq!(policy.retry_codes(), &want);
        Ok(())
    }

    #[test]
    fn deserialize_ignores_unknown_keys() -> Result<()> {
        let policy = serde_json::from_value::<RetryPolicy>(serde_json::json!({
            "multiplier": 1.5,
            "not_a_field": true,
        }))?;
        assert_eq!(policy.multiplier(), 1.5);
        Ok(())
    }

    #[test_case(serde_json::json!({"initial_delay": -1.0}); "negative initial delay")]
    #[test_case(serde_json::json!({"max_delay": -3.0}); "negative max delay")]
    #[test_case(serde_json::json!({"multiplier": 0.5}); "multiplier below one")]
    fn deserialize_rejects_invalid(value: serde_json::Value) {
        assert!(serde_json::from_value::<RetryPolicy>(value).is_err());
    }
}
