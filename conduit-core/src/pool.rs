//! Static pool of lazily created elements.
//!
//! Slots are handed out round-robin; an empty slot is filled on first use, so the same element
//! may be returned several times. Creation failures are retried with a [`Backoff`].

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::transport::Backoff;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Creates, validates and destroys pool elements.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;
    type Error: std::fmt::Display + Send + 'static;

    async fn create(&self) -> Result<Self::Item, Self::Error>;

    /// Reject a freshly created element; the slot is retried.
    fn check(&self, _item: &Self::Item) -> bool {
        true
    }

    async fn destroy(&self, _item: Self::Item) {}
}

/// Fixed-size pool with round-robin, lazily filled slots.
pub struct StaticPool<F: PoolFactory> {
    factory: F,
    slots: Vec<tokio::sync::Mutex<Option<F::Item>>>,
    next: AtomicUsize,
    backoff: Backoff,
    max_attempts: Option<u32>,
    stopped: CancellationToken,
}

impl<F: PoolFactory> std::fmt::Debug for StaticPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPool")
            .field("size", &self.slots.len())
            .field("max_attempts", &self.max_attempts)
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}

impl<F: PoolFactory> StaticPool<F> {
    pub fn new(factory: F, size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        Ok(Self {
            factory,
            slots: (0..size).map(|_| tokio::sync::Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
            backoff: Backoff::default(),
            max_attempts: None,
            stopped: CancellationToken::new(),
        })
    }

    pub fn from_config(factory: F, config: &PoolConfig, backoff: Backoff) -> Result<Self, PoolError> {
        Ok(Self::new(factory, config.size)?
            .with_backoff(backoff)
            .with_max_attempts(config.max_attempts))
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up on an element after this many failed attempts; `None` retries forever.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Number of slots holding a created element.
    pub async fn created(&self) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Next element in round-robin order, creating it if the slot is empty.
    pub async fn acquire(&self) -> Result<F::Item, PoolError> {
        if self.stopped.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index].lock().await;
        if let Some(item) = slot.as_ref() {
            return Ok(item.clone());
        }
        let item = self.create(index).await?;
        *slot = Some(item.clone());
        Ok(item)
    }

    async fn create(&self, index: usize) -> Result<F::Item, PoolError> {
        let mut attempt: u32 = 1;
        loop {
            let outcome = tokio::select! {
                _ = self.stopped.cancelled() => {
                    warn!(slot = index, "Pool element creation cancelled");
                    return Err(PoolError::Cancelled);
                }
                outcome = self.factory.create() => outcome,
            };

            let message = match outcome {
                Ok(item) if self.factory.check(&item) => {
                    debug!(slot = index, attempt, "Pool element created");
                    return Ok(item);
                }
                Ok(item) => {
                    self.factory.destroy(item).await;
                    "element failed its check".to_string()
                }
                Err(e) => e.to_string(),
            };
            error!(slot = index, attempt, error = %message, "Error creating pool element");

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(PoolError::CreationFailed {
                    attempts: attempt,
                    message,
                });
            }

            let delay = self.backoff.delay(attempt as usize - 1);
            attempt += 1;
            warn!(
                slot = index,
                next_attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting before next creation attempt"
            );
            tokio::select! {
                _ = self.stopped.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Cancel pending creations and destroy every created element.
    pub async fn stop(&self) {
        self.stopped.cancel();
        for slot in &self.slots {
            let item = slot.lock().await.take();
            if let Some(item) = item {
                self.factory.destroy(item).await;
            }
        }
        debug!(size = self.slots.len(), "Pool stopped");
    }
}
