//! Bounded retry policy for request/response exchanges.
//
// The pump link retries a command while the reply is absent or malformed, but a
// reply the device itself flags as an error ends the exchange at once.

use std::time::Duration;

use crate::config::SerialConfig;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Pause between sending a request and reading its reply.
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            settle_delay: Duration::from_millis(15),
        }
    }
}

impl From<&SerialConfig> for RetryPolicy {
    fn from(config: &SerialConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            settle_delay: config.settle_delay(),
        }
    }
}

/// What one attempt produced.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Acceptable result, stop retrying
    Accepted(T),
    /// Unusable result, try again while attempts remain
    Rejected(T),
    /// Fault that must not be retried
    Fatal(E),
}

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    /// Last value produced
    pub value: T,
    /// Attempts made
    pub attempts: u32,
    /// Whether the last value was accepted
    pub accepted: bool,
}

/// Run `op` until it is accepted, fails fatally, or the policy's attempts run out.
///
/// `op` receives the 1-based attempt number. When every attempt is rejected the last
/// rejected value is returned with `accepted == false`.
pub fn with_retries<T, E>(
    policy: &RetryPolicy,
    mut op: impl FnMut(u32) -> Attempt<T, E>,
) -> Result<Retried<T>, E> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Attempt::Accepted(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    accepted: true,
                })
            }
            Attempt::Rejected(value) if attempt >= max_attempts => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    accepted: false,
                })
            }
            Attempt::Rejected(_) => attempt += 1,
            Attempt::Fatal(err) => return Err(err),
        }
    }
}
