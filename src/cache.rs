//! Short-TTL read-through cache of agent context (zone + bypass flag).
//!
//! Owned by the process and passed around explicitly. Entries expire after
//! the configured TTL; `invalidate` lets zone/agent edits take effect sooner.

use crate::types::AgentContext;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Where cache misses are loaded from.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn load_context(&self, agent_id: &str) -> Result<Option<AgentContext>>;
}

#[async_trait]
impl ContextSource for crate::persistence::Persistence {
    async fn load_context(&self, agent_id: &str) -> Result<Option<AgentContext>> {
        self.load_agent_context(agent_id)
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    /// `None` caches a miss so unknown agents don't hit storage every pulse.
    context: Option<AgentContext>,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct AgentContextCache {
    entries: Arc<RwLock<HashMap<String, CachedEntry>>>,
    source: Arc<dyn ContextSource>,
    ttl: Duration,
}

impl AgentContextCache {
    pub fn new(source: Arc<dyn ContextSource>, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            source,
            ttl,
        }
    }

    /// Return the cached context or load it from the source.
    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentContext>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(agent_id) {
                if entry.expires_at > now {
                    tracing::trace!("Context cache hit for agent {}", agent_id);
                    return Ok(entry.context.clone());
                }
            }
        }

        tracing::debug!("Context cache miss for agent {}", agent_id);
        let context = self.source.load_context(agent_id).await?;

        let mut entries = self.entries.write().await;
        entries.insert(
            agent_id.to_string(),
            CachedEntry {
                context: context.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(context)
    }

    pub async fn invalidate(&self, agent_id: &str) -> bool {
        self.entries.write().await.remove(agent_id).is_some()
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
