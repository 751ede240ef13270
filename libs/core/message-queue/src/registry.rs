//! Explicit instance registry.
//!
//! Harnesses that start several producers and consumers register them here
//! and shut them all down in one call during teardown.

use crate::consumer::Consumer;
use crate::error::Result;
use crate::power::PowerState;
use crate::producer::Producer;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

/// Something with an up/down lifecycle
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn instance_id(&self) -> Uuid;

    fn state(&self) -> PowerState;

    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
impl Lifecycle for Consumer {
    fn instance_id(&self) -> Uuid {
        self.id()
    }

    fn state(&self) -> PowerState {
        Consumer::state(self)
    }

    async fn shutdown(&self) -> Result<()> {
        Consumer::shutdown(self).await
    }
}

#[async_trait]
impl Lifecycle for Producer {
    fn instance_id(&self) -> Uuid {
        self.id()
    }

    fn state(&self) -> PowerState {
        Producer::state(self)
    }

    async fn shutdown(&self) -> Result<()> {
        Producer::shutdown(self).await
    }
}

#[derive(Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<Mutex<Vec<Arc<dyn Lifecycle>>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Lifecycle>>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track an instance, handing it back for use
    pub fn register<T: Lifecycle + 'static>(&self, instance: T) -> Arc<T> {
        let instance = Arc::new(instance);
        self.lock().push(instance.clone());
        instance
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Shut down every running instance and forget all of them. Returns how
    /// many were stopped; failures are logged.
    pub async fn shutdown_all(&self) -> usize {
        let instances: Vec<_> = self.lock().drain(..).collect();
        let mut stopped = 0;
        for instance in instances {
            if instance.state() != PowerState::Up {
                continue;
            }
            match instance.shutdown().await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(instance_id = %instance.instance_id(), error = %e, "Shutdown failed"),
            }
        }
        stopped
    }
}
