//! A replicated launch whose shards tests drive from scoped threads.

use std::sync::Arc;
use std::thread;

use weft_context::{
    ContextConfig, ReplicateContext, ReplicationConfig, Runtime, ShardManager,
};
use weft_core::ShardId;
use weft_pipeline::RegionRequirement;

use crate::fixtures::pooled_runtime;

/// Every shard of one launch.
pub struct ShardHarness {
    pub manager: Arc<ShardManager>,
    pub shards: Vec<Arc<ReplicateContext>>,
}

impl ShardHarness {
    /// Launch `total` shards on a two-worker runtime.
    pub fn launch(total: usize, requirements: Vec<RegionRequirement>) -> Self {
        Self::launch_on(pooled_runtime(ContextConfig::default(), 2), total, requirements)
    }

    /// Launch `total` shards on `runtime`.
    pub fn launch_on(
        runtime: Arc<Runtime>,
        total: usize,
        requirements: Vec<RegionRequirement>,
    ) -> Self {
        let manager = ShardManager::new(runtime, ReplicationConfig::shard(ShardId(0), total))
            .expect("valid replication config");
        let shards = manager
            .shards()
            .map(|s| {
                ReplicateContext::new(&manager, s, requirements.clone(), Vec::new())
                    .expect("shard context")
            })
            .collect();
        Self { manager, shards }
    }

    /// Run `f` on every shard concurrently; results are in shard order.
    pub fn on_every_shard<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&Arc<ReplicateContext>) -> T + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|ctx| s.spawn(move || f(ctx)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("shard panicked"))
                .collect()
        })
    }
}
