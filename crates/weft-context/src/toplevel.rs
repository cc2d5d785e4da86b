//! Entry points: the root of a task tree and replicated launches.
//!
//! The top-level context has no parent. Resources returned to it are
//! destroyed once their preconditions trigger rather than handed upward.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info};
use weft_core::{ContextError, ShardId};
use weft_pipeline::RegionRequirement;

use crate::config::ReplicationConfig;
use crate::context::Context;
use crate::inner::InnerContext;
use crate::launcher::TaskBody;
use crate::replicate::shard::ShardManager;
use crate::replicate::ReplicateContext;
use crate::runtime::Runtime;

/// Root of a task tree.
#[derive(Debug)]
pub struct TopLevelContext;

impl TopLevelContext {
    /// A fresh root context on `runtime`.
    pub fn create(runtime: Arc<Runtime>) -> Result<Context, ContextError> {
        let root = InnerContext::root(runtime)?;
        debug!(context = %root.did(), "top-level context created");
        Ok(Context::TopLevel(root))
    }

    /// Run `body` in a fresh root context and end it. Returns the body's
    /// value once every operation the body issued has completed.
    pub fn run(runtime: Arc<Runtime>, body: &TaskBody) -> Result<Vec<u8>, ContextError> {
        let ctx = Self::create(runtime)?;
        let value = body(&ctx);
        let done = ctx.end_task()?;
        let value = value?;
        done.wait().map_err(|_| ContextError::IllegalCall {
            call: "end_task",
            reason: "a child of the top-level task was poisoned".into(),
        })?;
        Ok(value)
    }
}

/// Run `body` once per shard of a replicated launch on `runtime`. Each
/// shard runs on its own thread. Returns every shard's value, in shard
/// order.
pub fn launch_replicated(
    runtime: Arc<Runtime>,
    config: ReplicationConfig,
    requirements: Vec<RegionRequirement>,
    args: Vec<u8>,
    body: &TaskBody,
) -> Result<Vec<Vec<u8>>, ContextError> {
    let manager = ShardManager::new(runtime, config).map_err(|e| ContextError::IllegalCall {
        call: "launch_replicated",
        reason: e.to_string(),
    })?;
    info!(shards = manager.total(), "replicated launch");
    let shards = manager
        .shards()
        .map(|s| ReplicateContext::new(&manager, s, requirements.clone(), args.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let results: Vec<Result<Vec<u8>, ContextError>> = thread::scope(|s| {
        let handles: Vec<_> = shards
            .iter()
            .map(|shard| {
                let ctx = Context::Replicate(Arc::clone(shard));
                s.spawn(move || -> Result<Vec<u8>, ContextError> {
                    let value = body(&ctx);
                    let ended = ctx.end_task();
                    let value = value?;
                    ended?.wait().map_err(|_| ContextError::IllegalCall {
                        call: "end_task",
                        reason: "a child of the replicated task was poisoned".into(),
                    })?;
                    Ok(value)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                h.join().unwrap_or_else(|_| {
                    Err(ContextError::IllegalCall {
                        call: "launch_replicated",
                        reason: format!("shard {} panicked", ShardId(i as u32)),
                    })
                })
            })
            .collect()
    });
    results.into_iter().collect()
}
