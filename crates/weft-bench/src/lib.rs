//! Benchmark profiles for the weft context layer.
//!
//! - [`reference_config`]: default window and frame limits
//! - [`issue_fills`]: a stream of fills over one region, alternating the
//!   written fields so consecutive fills only partly conflict
//! - [`seeded_messages`]: a deterministic mix of wire messages

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use weft_context::{ContextConfig, InnerContext, Message};
use weft_core::{CollectiveId, ContextError, DistributedId, FieldMask, LogicalRegion, ShardId};
use weft_pipeline::RegionRequirement;

/// Configuration used by every context benchmark.
pub fn reference_config() -> ContextConfig {
    ContextConfig {
        max_window_size: 4096,
        ..ContextConfig::default()
    }
}

/// Issue `count` fills over `region`. Fill `i` writes the first `1 + i % 3`
/// fields with the value `i % 8`.
pub fn issue_fills(
    ctx: &InnerContext,
    region: LogicalRegion,
    count: usize,
) -> Result<(), ContextError> {
    for i in 0..count {
        let req = RegionRequirement::read_write(region, FieldMask::first_n(1 + (i % 3) as u32));
        ctx.fill_fields(req, &[(i % 8) as u8])?;
    }
    Ok(())
}

/// `count` shard and release messages with payloads of up to `max_payload`
/// bytes, drawn from `seed`.
pub fn seeded_messages(count: usize, max_payload: usize, seed: u64) -> Vec<Message> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let len = (rng.next_u64() as usize) % (max_payload + 1);
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);
            let from = ShardId(rng.next_u32() % 16);
            match i % 3 {
                0 => Message::Collective {
                    collective: CollectiveId(rng.next_u64() % 1024),
                    from,
                    payload,
                },
                1 => Message::Rendezvous {
                    index: rng.next_u64(),
                    from,
                    payload,
                },
                _ => Message::RemoteRelease {
                    context: DistributedId(rng.next_u64()),
                },
            }
        })
        .collect()
}
