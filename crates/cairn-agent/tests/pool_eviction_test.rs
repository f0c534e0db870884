//! Expiry-ordered eviction: clients expire in order and only expired
//! clients leave the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cairn_agent::{AgentClientBuilder, AgentConnectionPool, BuiltClient, PoolConfig};
use cairn_core::clock::{Clock, ManualClock};
use cairn_core::context::RequestContext;
use cairn_core::{CairnResult, NamespaceIdentifier, ResourceIdentifier};
use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;

/// `agentInstance:agent-<i>` expires `i + 1` minutes after `start`.
struct StaggeredBuilder {
    start: DateTime<Utc>,
    builds: AtomicUsize,
}

impl AgentClientBuilder for StaggeredBuilder {
    type Client = usize;

    async fn build(
        &self,
        _ctx: &RequestContext,
        _namespace: &NamespaceIdentifier,
        instance: &ResourceIdentifier,
    ) -> CairnResult<BuiltClient<usize>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let index: usize = instance
            .id()
            .to_string()
            .trim_start_matches("agent-")
            .parse()
            .unwrap();
        Ok(BuiltClient {
            client: index,
            expires_at: self.start + Duration::minutes(index as i64 + 1),
        })
    }
}

fn namespace() -> NamespaceIdentifier {
    "group:7d2e4c1a-9b3f-4e58-a6d0-2c1b0e9f8a7d".parse().unwrap()
}

fn instance(i: usize) -> ResourceIdentifier {
    format!("agentInstance:agent-{i}").parse().unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn advancing_past_kth_expiry_leaves_n_minus_k(n in 1usize..24, k_seed in 0usize..24) {
        let k = k_seed % (n + 1);
        runtime().block_on(async {
            let start = Utc::now();
            let clock = Arc::new(ManualClock::new(start));
            let builder = StaggeredBuilder { start, builds: AtomicUsize::new(0) };
            let config = PoolConfig { capacity: n, ..Default::default() };
            let pool = AgentConnectionPool::new(builder, clock.clone(), &config);
            let ctx = RequestContext::system();

            for i in 0..n {
                pool.acquire(&ctx, &namespace(), &instance(i)).await.unwrap();
            }

            // Between the Kth and (K+1)th expiry.
            clock.set(start + Duration::minutes(k as i64) + Duration::seconds(30));

            // Acquiring any client evicts; pick one that survives when possible.
            if k < n {
                let survivor = pool.acquire(&ctx, &namespace(), &instance(n - 1)).await.unwrap();
                assert_eq!(*survivor, n - 1);
            } else {
                pool.acquire(&ctx, &namespace(), &instance(0)).await.unwrap();
            }

            let expected = if k < n { n - k } else { 1 };
            assert_eq!(pool.len(), expected);
            // Unexpired clients are hits; only the rebuilt one (when all had
            // expired) cost a build.
            let rebuilds = usize::from(k == n);
            assert_eq!(pool.builder().builds.load(Ordering::SeqCst), n + rebuilds);
        });
    }
}

#[tokio::test]
async fn survivors_are_hits_and_expired_are_rebuilt() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let builder = StaggeredBuilder {
        start,
        builds: AtomicUsize::new(0),
    };
    let pool = AgentConnectionPool::new(builder, clock.clone(), &PoolConfig::default());
    let ctx = RequestContext::system();

    for i in 0..5 {
        pool.acquire(&ctx, &namespace(), &instance(i)).await.unwrap();
    }
    clock.set(start + Duration::minutes(2) + Duration::seconds(1));
    assert!(clock.now() > start + Duration::minutes(2));

    for i in 2..5 {
        pool.acquire(&ctx, &namespace(), &instance(i)).await.unwrap();
    }
    assert_eq!(pool.len(), 3);
    assert_eq!(pool.builder().builds.load(Ordering::SeqCst), 5);
}
