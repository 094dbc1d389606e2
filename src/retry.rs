//! Bounded retry with an overall time budget.
//!
//! Every connect-like operation of the pipeline goes through [`RetryPolicy`].
//! The operation is a closure producing a future; synchronous work is simply an
//! `async move` block that never awaits. An `Err` from the operation counts as a
//! failed attempt exactly like `Ok(false)` / `Ok(None)`.

use std::{fmt::Display, future::Future, time::Duration};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::logging::category;

pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const RETRY_MAX_DELAY: Duration = Duration::from_millis(5_000);

/// Observational progress callback. Never influences control flow.
pub type Progress<'a> = Option<&'a (dyn Fn(&str) + Send + Sync)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub overall_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttemptOutcome {
    pub attempt: u32,
    pub elapsed: Duration,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RetryReport<T> {
    pub value: Option<T>,
    pub attempts: Vec<AttemptOutcome>,
    pub timed_out: bool,
}

impl<T> RetryReport<T> {
    pub fn succeeded(&self) -> bool {
        self.value.is_some()
    }
}

pub fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY
        .saturating_mul(attempt.max(1))
        .min(RETRY_MAX_DELAY)
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, overall_timeout: Duration) -> Self {
        Self {
            max_attempts,
            overall_timeout,
        }
    }

    /// Runs `operation` until it reports success, attempts run out, or the
    /// overall budget elapses.
    pub async fn execute<I, F, Fut, E>(
        &self,
        name: &str,
        input: I,
        mut operation: F,
        progress: Progress<'_>,
    ) -> bool
    where
        I: Clone,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: Display,
    {
        self.attempt(
            name,
            |_| {
                let pending = operation(input.clone());
                async move { pending.await.map(|ok| ok.then_some(())) }
            },
            progress,
        )
        .await
        .succeeded()
    }

    /// Value-producing form of [`RetryPolicy::execute`]; `Ok(None)` is a
    /// failed attempt. The operation receives the 1-based attempt number.
    pub async fn attempt<T, F, Fut, E>(
        &self,
        name: &str,
        mut operation: F,
        progress: Progress<'_>,
    ) -> RetryReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let notify = |message: String| {
            if let Some(callback) = progress {
                callback(&message);
            }
        };
        let max_attempts = self.max_attempts.max(1);
        let started = Instant::now();
        let mut attempts = Vec::new();

        info!(
            target: category::SYSTEM,
            "connecting {name}: max attempts {max_attempts}, timeout {:?}", self.overall_timeout
        );
        notify(format!("connecting {name}..."));

        for attempt in 1..=max_attempts {
            let elapsed = started.elapsed();
            if elapsed >= self.overall_timeout {
                warn!(
                    target: category::SYSTEM,
                    "{name}: timed out after {:?}, giving up", self.overall_timeout
                );
                notify(format!(
                    "{name} timed out ({}s)",
                    self.overall_timeout.as_secs_f64()
                ));
                return RetryReport {
                    value: None,
                    attempts,
                    timed_out: true,
                };
            }

            info!(target: category::SYSTEM, "{name}: attempt {attempt}/{max_attempts}");
            notify(format!("attempt {attempt}/{max_attempts}"));

            // An attempt that never resolves must not outlive the budget.
            let remaining = self.overall_timeout.saturating_sub(elapsed);
            let outcome = match tokio::time::timeout(remaining, operation(attempt)).await {
                Ok(Ok(Some(value))) => {
                    attempts.push(AttemptOutcome {
                        attempt,
                        elapsed: started.elapsed(),
                        success: true,
                        error: None,
                    });
                    info!(target: category::SYSTEM, "{name}: connected on attempt {attempt}");
                    notify(format!("{name} connected"));
                    return RetryReport {
                        value: Some(value),
                        attempts,
                        timed_out: false,
                    };
                }
                Ok(Ok(None)) => {
                    warn!(target: category::SYSTEM, "{name}: attempt {attempt} failed");
                    None
                }
                Ok(Err(err)) => {
                    error!(target: category::SYSTEM, "{name}: attempt {attempt} raised: {err}");
                    Some(err.to_string())
                }
                Err(_) => {
                    warn!(
                        target: category::SYSTEM,
                        "{name}: attempt {attempt} exceeded the time budget"
                    );
                    Some("attempt exceeded overall timeout".to_string())
                }
            };
            attempts.push(AttemptOutcome {
                attempt,
                elapsed: started.elapsed(),
                success: false,
                error: outcome,
            });

            // A spent budget ends the loop at the next check without a delay.
            if attempt < max_attempts && started.elapsed() < self.overall_timeout {
                let delay = retry_delay(attempt);
                info!(
                    target: category::SYSTEM,
                    "{name}: retrying in {}ms", delay.as_millis()
                );
                notify(format!("retrying in {}ms", delay.as_millis()));
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            target: category::SYSTEM,
            "{name}: failed after {max_attempts} attempts"
        );
        notify(format!("{name} failed"));
        RetryReport {
            value: None,
            attempts,
            timed_out: false,
        }
    }
}
