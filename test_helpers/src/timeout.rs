//! Add a timeout to a future, panicking on expiry.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Extension trait bolting a panic-on-expiry timeout onto any future.
#[async_trait]
pub trait FutureTimeout: Future + Send + Sized {
    /// Await the future, panicking if it takes longer than `duration`.
    async fn with_timeout_panic(self, duration: Duration) -> Self::Output
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self)
            .await
            .expect("future timed out")
    }

    /// Await the future, returning an error on expiry instead of panicking.
    async fn with_timeout(self, duration: Duration) -> Result<Self::Output, tokio::time::error::Elapsed>
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self).await
    }
}

impl<F> FutureTimeout for F where F: Future + Send + Sized {}
