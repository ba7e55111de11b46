use anyhow::Result;
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::settings::{LimitsConfig, RetrievalConfig};

/// Process-wide concurrency limits for gateway calls.
#[derive(Clone)]
pub struct Limiters {
    pub retrieval: Arc<Semaphore>,
    pub llm: Arc<Semaphore>,
    pub acquire_timeout: Duration,
    pub call_timeout: Duration,
}

impl Limiters {
    pub fn new(limits: &LimitsConfig, retrieval: &RetrievalConfig) -> Self {
        Self {
            retrieval: Arc::new(Semaphore::new(retrieval.concurrency.max(1))),
            llm: Arc::new(Semaphore::new(limits.llm_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(limits.acquire_timeout_ms.max(1)),
            call_timeout: Duration::from_millis(limits.call_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }

    /// Run `fut` holding a permit from `sem`, bounded by the per-call timeout.
    pub async fn run_limited<T, F>(&self, sem: &Arc<Semaphore>, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let (_permit, waited) = Self::acquire_timed(sem.clone(), self.acquire_timeout, op).await?;
        if waited > Duration::from_millis(100) {
            tracing::debug!(op, waited_ms = waited.as_millis() as u64, "Waited for limiter");
        }

        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("Call timeout after {:?} for op={}", self.call_timeout, op))?
    }

    /// Like `run_limited`, but waits for a permit as long as it takes. Only
    /// the call itself is bounded by the per-call timeout.
    pub async fn run_queued<T, F>(&self, sem: &Arc<Semaphore>, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let _permit = sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("Limiter closed for op={}", op))?;
        let waited = start.elapsed();
        if waited > Duration::from_millis(100) {
            tracing::debug!(op, waited_ms = waited.as_millis() as u64, "Queued for limiter");
        }

        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("Call timeout after {:?} for op={}", self.call_timeout, op))?
    }

    pub async fn llm_call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let sem = self.llm.clone();
        self.run_limited(&sem, op, fut).await
    }

    pub async fn retrieval_call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let sem = self.retrieval.clone();
        self.run_queued(&sem, op, fut).await
    }
}

impl Default for Limiters {
    fn default() -> Self {
        Self::new(&LimitsConfig::default(), &RetrievalConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(call_timeout_ms: u64) -> Limiters {
        let limits = LimitsConfig {
            call_timeout_ms,
            ..LimitsConfig::default()
        };
        let retrieval = RetrievalConfig {
            concurrency: 1,
            ..RetrievalConfig::default()
        };
        Limiters::new(&limits, &retrieval)
    }

    #[tokio::test]
    async fn test_call_timeout_is_an_error() {
        let limiters = limits(20);
        let res: Result<()> = limiters
            .llm_call("slow", async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_permit_released_after_call() {
        let limiters = limits(1000);
        for _ in 0..3 {
            let v = limiters.retrieval_call("fast", async { Ok(1) }).await.unwrap();
            assert_eq!(v, 1);
        }
        assert_eq!(limiters.retrieval.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_retrieval_waits_past_acquire_timeout() {
        let limits = LimitsConfig {
            acquire_timeout_ms: 20,
            call_timeout_ms: 1_000,
            ..LimitsConfig::default()
        };
        let retrieval = RetrievalConfig {
            concurrency: 1,
            ..RetrievalConfig::default()
        };
        let limiters = Limiters::new(&limits, &retrieval);

        let calls = (0..3).map(|i| {
            let limiters = limiters.clone();
            async move {
                limiters
                    .retrieval_call("slow", async move {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(i)
                    })
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(limiters.retrieval.available_permits(), 1);
    }
}
