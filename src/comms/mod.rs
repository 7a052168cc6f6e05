//! The communication registry — fan-out of agent events to channel adapters.

pub mod provider;
pub mod ws;

pub use provider::{ChannelMessage, InboundHandler, InboundMessage, MessageType, Provider};

use anyhow::Result;
use futures_util::future::join_all;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::HarnessError;

/// Ordered registry of providers. Registration order matters: `stop_all`
/// tears providers down in reverse so late-registered adapters (which may
/// depend on earlier ones) go first.
#[derive(Default)]
pub struct CommsRegistry {
    providers: RwLock<Vec<Arc<dyn Provider>>>,
}

impl CommsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider. A duplicate name is a hard error.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let mut providers = self.write_lock();
        if providers.iter().any(|p| p.name() == provider.name()) {
            return Err(HarnessError::InvalidParams(format!(
                "provider already registered: {}",
                provider.name()
            ))
            .into());
        }
        providers.push(provider);
        Ok(())
    }

    /// Start every provider. Best-effort: one provider failing to start is
    /// logged and the rest continue.
    pub async fn start_all(&self) {
        for provider in self.snapshot() {
            if let Err(e) = provider.start().await {
                warn!(provider = provider.name(), err = %e, "provider failed to start");
            } else {
                info!(provider = provider.name(), "provider started");
            }
        }
    }

    /// Stop every provider in reverse registration order, swallowing errors.
    pub async fn stop_all(&self) {
        for provider in self.snapshot().into_iter().rev() {
            if let Err(e) = provider.stop().await {
                warn!(provider = provider.name(), err = %e, "provider failed to stop");
            }
        }
    }

    /// Deliver a message to every ready provider whose accepted-type set
    /// (if any) contains the message's type. Fire-and-forget per provider:
    /// send failures are logged, never propagated.
    pub async fn broadcast(&self, message: &ChannelMessage) {
        let targets: Vec<Arc<dyn Provider>> = self
            .snapshot()
            .into_iter()
            .filter(|p| p.is_ready())
            .filter(|p| {
                p.accepted_types()
                    .map(|set| set.contains(&message.message_type))
                    .unwrap_or(true)
            })
            .collect();

        join_all(targets.iter().map(|provider| async {
            if let Err(e) = provider.send(message).await {
                warn!(provider = provider.name(), err = %e, "provider send failed");
            }
        }))
        .await;
    }

    /// Push a channel status indicator to every ready provider.
    pub async fn broadcast_status(&self, channel_id: &str, status: &str) {
        let targets: Vec<Arc<dyn Provider>> =
            self.snapshot().into_iter().filter(|p| p.is_ready()).collect();
        join_all(targets.iter().map(|provider| async {
            if let Err(e) = provider.set_status(channel_id, status).await {
                warn!(provider = provider.name(), err = %e, "provider status update failed");
            }
        }))
        .await;
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Provider>> {
        self.read_lock().clone()
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Provider>>> {
        match self.providers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Provider>>> {
        match self.providers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
