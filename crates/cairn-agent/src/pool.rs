//! Bounded, expiry-ordered cache of agent clients.
//!
//! Entries live in a min-heap keyed by token expiry. Every acquisition
//! first pops expired entries under the write lock, then scans for a hit
//! under the read lock. Misses are built outside the lock and inserted
//! afterwards, so two callers may build the same client concurrently; the
//! second insert finds the first and hands it back instead.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use cairn_core::clock::Clock;
use cairn_core::context::RequestContext;
use cairn_core::{CairnError, CairnResult, NamespaceIdentifier, ResourceIdentifier};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::builder::{AgentClientBuilder, BuiltClient};
use crate::config::PoolConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolKey {
    namespace: NamespaceIdentifier,
    instance: ResourceIdentifier,
}

struct PoolEntry<C> {
    expires_at: DateTime<Utc>,
    /// Insertion order; breaks ties between equal expiries.
    seq: u64,
    key: PoolKey,
    client: Arc<C>,
}

impl<C> PoolEntry<C> {
    fn serves(&self, key: &PoolKey, now: DateTime<Utc>) -> bool {
        self.expires_at > now && &self.key == key
    }
}

impl<C> PartialEq for PoolEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.seq == other.seq
    }
}

impl<C> Eq for PoolEntry<C> {}

impl<C> PartialOrd for PoolEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for PoolEntry<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Cache of live agent clients keyed by (namespace, agent instance).
pub struct AgentConnectionPool<B: AgentClientBuilder> {
    builder: B,
    clock: Arc<dyn Clock>,
    capacity: usize,
    entries: RwLock<BinaryHeap<Reverse<PoolEntry<B::Client>>>>,
    next_seq: AtomicU64,
}

impl<B: AgentClientBuilder> AgentConnectionPool<B> {
    pub fn new(builder: B, clock: Arc<dyn Clock>, config: &PoolConfig) -> Self {
        Self {
            builder,
            clock,
            capacity: config.capacity,
            entries: RwLock::new(BinaryHeap::with_capacity(config.capacity)),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// A live client for `instance`, building one on a miss.
    ///
    /// Fails with `PoolExhausted` when the pool is full of unexpired
    /// clients for other instances; live entries are never evicted early.
    #[instrument(skip_all, fields(namespace = %namespace, instance = %instance))]
    pub async fn acquire(
        &self,
        ctx: &RequestContext,
        namespace: &NamespaceIdentifier,
        instance: &ResourceIdentifier,
    ) -> CairnResult<Arc<B::Client>> {
        ctx.authorize(namespace)?;
        ctx.ensure_active("acquire agent client")?;
        let key = PoolKey {
            namespace: namespace.clone(),
            instance: instance.clone(),
        };
        let now = self.clock.now();

        // 1. Evict.
        let evicted = self.evict_expired(now);
        if evicted > 0 {
            debug!(evicted, "Evicted expired agent clients");
        }

        // 2. Lookup.
        if let Some(client) = self.lookup(&key, now) {
            debug!("Agent client pool hit");
            return Ok(client);
        }

        // 3. Refuse to build what could not be stored.
        if self.len() >= self.capacity {
            warn!(capacity = self.capacity, "Agent client pool exhausted");
            return Err(CairnError::PoolExhausted {
                capacity: self.capacity,
            });
        }

        // 4. Build without holding the lock.
        debug!("Agent client pool miss");
        let built = self.builder.build(ctx, namespace, instance).await?;
        self.insert(key, built)
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut heap = self.entries.write();
        let mut evicted = 0;
        while heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.expires_at <= now)
        {
            heap.pop();
            evicted += 1;
        }
        evicted
    }

    fn lookup(&self, key: &PoolKey, now: DateTime<Utc>) -> Option<Arc<B::Client>> {
        self.entries
            .read()
            .iter()
            .find(|Reverse(entry)| entry.serves(key, now))
            .map(|Reverse(entry)| Arc::clone(&entry.client))
    }

    fn insert(&self, key: PoolKey, built: BuiltClient<B::Client>) -> CairnResult<Arc<B::Client>> {
        let now = self.clock.now();
        let mut heap = self.entries.write();

        let pooled = heap.iter().find(|Reverse(entry)| entry.serves(&key, now));
        if let Some(Reverse(existing)) = pooled {
            debug!("Agent client built concurrently; using the pooled one");
            return Ok(Arc::clone(&existing.client));
        }

        let client = Arc::new(built.client);
        if built.expires_at <= now {
            warn!(
                expires_at = %built.expires_at,
                "Built agent client is already expired; not pooling it"
            );
            return Ok(client);
        }
        if heap.len() >= self.capacity {
            warn!(capacity = self.capacity, "Agent client pool exhausted");
            return Err(CairnError::PoolExhausted {
                capacity: self.capacity,
            });
        }

        heap.push(Reverse(PoolEntry {
            expires_at: built.expires_at,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            key,
            client: Arc::clone(&client),
        }));
        debug!(
            expires_at = %built.expires_at,
            pooled = heap.len(),
            "Pooled agent client"
        );
        Ok(client)
    }
}
