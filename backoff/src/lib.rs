//! Bounded retry with linear backoff.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::info;
use std::ops::ControlFlow;
use std::time::Duration;

/// Linear backoff with a bounded number of attempts.
///
/// Attempt `n` (1-based) sleeps `init_backoff * n` before retrying, capped
/// at `max_backoff`. After `max_attempts` failed attempts the last error is
/// returned to the caller.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Backoff added per failed attempt.
    pub init_backoff: Duration,

    /// Maximum backoff between two attempts.
    pub max_backoff: Duration,

    /// Total number of attempts before giving up.
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Error after all attempts have been exhausted.
#[derive(Debug)]
pub struct RetriesExhausted<E> {
    /// Name of the task that was retried.
    pub task_name: &'static str,

    /// Number of attempts made.
    pub attempts: usize,

    /// The error returned by the final attempt.
    pub source: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetriesExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task '{}' failed after {} attempts: {}",
            self.task_name, self.attempts, self.source
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetriesExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Backoff result.
pub type BackoffResult<T, E> = Result<T, RetriesExhausted<E>>;

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff
/// interval.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: usize,
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: *config,
            attempt: 0,
        }
    }

    /// Returns the next backoff duration to wait for, or `None` once the
    /// configured attempts are exhausted.
    fn next(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let backoff = self
            .config
            .init_backoff
            .saturating_mul(self.attempt as u32);
        Some(backoff.min(self.config.max_backoff))
    }

    /// Perform an async operation that retries with backoff.
    ///
    /// Retries while `do_stuff` returns `ControlFlow::Continue`, up to the
    /// configured number of attempts.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &'static str,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = ControlFlow<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        loop {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                ControlFlow::Break(r) => break Ok(r),
                ControlFlow::Continue(e) => e,
            };

            let backoff = match self.next() {
                Some(backoff) => backoff,
                None => {
                    break Err(RetriesExhausted {
                        task_name,
                        attempts: self.attempt,
                        source: e,
                    })
                }
            };
            info!(
                e=%e,
                task_name,
                backoff_millis = backoff.as_millis() as u64,
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Retry all errors.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &'static str,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        self.retry_with_backoff(task_name, move || {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            async {
                match do_stuff.await {
                    Ok(b) => ControlFlow::Break(b),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_linear_schedule() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            max_attempts: 5,
        };
        let mut backoff = Backoff::new(&config);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        // capped at max_backoff
        assert_eq!(backoff.next(), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(250)));
        // fifth attempt is the last one
        assert_eq!(backoff.next(), None);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            max_attempts: 5,
        };
        let calls = AtomicUsize::new(0);

        let result = Backoff::new(&config)
            .retry_all_errors("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            max_attempts: 3,
        };
        let calls = AtomicUsize::new(0);

        let result: BackoffResult<(), &str> = Backoff::new(&config)
            .retry_all_errors("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            err.to_string(),
            "task 'test' failed after 3 attempts: boom"
        );
    }
}
