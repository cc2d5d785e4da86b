//! Context configuration, validation, and error types.
//!
//! [`ContextConfig`] is fixed when a context is constructed and checked
//! once by [`validate()`](ContextConfig::validate). [`ReplicationConfig`]
//! describes one shard of a control-replicated launch.

use std::error::Error;
use std::fmt;

use weft_core::ShardId;

// ── LeakPolicy ─────────────────────────────────────────────────────

/// How resource-accounting errors found at task end are surfaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Log a warning and continue.
    #[default]
    Warn,
    /// Return the error from `end_task`.
    Fatal,
}

// ── ContextConfig ──────────────────────────────────────────────────

/// Per-context tuning knobs.
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Outstanding children allowed before `issue_operation` blocks.
    /// Default: 1024.
    pub max_window_size: usize,
    /// Percentage of the window that must drain before a blocked issuer
    /// resumes. Default: 25.
    pub hysteresis_percentage: u32,
    /// Frames allowed in flight before `issue_frame` blocks. Default: 4.
    pub max_outstanding_frames: usize,
    /// Physical templates kept per trace; the oldest is evicted beyond
    /// this. Default: 16.
    pub max_templates_per_trace: usize,
    /// Leak and duplicate-deletion reporting. Default: [`LeakPolicy::Warn`].
    pub leak_policy: LeakPolicy,
    /// Fill views cached per context. Default: 64.
    pub fill_view_cache_size: usize,
    /// Messages buffered per unregistered target before the protocol is
    /// declared broken. Default: 1024.
    pub max_pending_messages: usize,
    /// Meta-task worker threads. `None` = auto-detect
    /// (`available_parallelism / 2`, clamped to `[2, 16]`).
    pub meta_workers: Option<usize>,
    /// Retired operation slots kept for reuse. Default: 256.
    pub op_pool_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_window_size: 1024,
            hysteresis_percentage: 25,
            max_outstanding_frames: 4,
            max_templates_per_trace: 16,
            leak_policy: LeakPolicy::Warn,
            fill_view_cache_size: 64,
            max_pending_messages: 1024,
            meta_workers: None,
            op_pool_size: 256,
        }
    }
}

impl ContextConfig {
    /// Resolve the meta-task worker count, applying auto-detection if
    /// `None`. Explicit values are clamped to `[1, 64]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.meta_workers {
            Some(n) => n.clamp(1, 64),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                (cpus / 2).clamp(2, 16)
            }
        }
    }

    /// Outstanding count at which a window-blocked issuer resumes.
    pub fn window_resume_at(&self) -> usize {
        resume_point(self.max_window_size, self.hysteresis_percentage)
    }

    /// Validate all invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 1. Window must admit at least one child.
        if self.max_window_size == 0 {
            return Err(ConfigError::WindowZero);
        }
        // 2. Hysteresis is a percentage.
        if self.hysteresis_percentage > 100 {
            return Err(ConfigError::HysteresisOutOfRange {
                value: self.hysteresis_percentage,
            });
        }
        // 3. At least one frame in flight.
        if self.max_outstanding_frames == 0 {
            return Err(ConfigError::FramesZero);
        }
        // 4. Traces keep at least one template.
        if self.max_templates_per_trace == 0 {
            return Err(ConfigError::TemplatesZero);
        }
        // 5. Fill-view cache holds at least one view.
        if self.fill_view_cache_size == 0 {
            return Err(ConfigError::FillCacheZero);
        }
        // 6. Pending-message bound >= 1.
        if self.max_pending_messages == 0 {
            return Err(ConfigError::PendingBoundZero);
        }
        Ok(())
    }
}

/// Outstanding count at which a throttle blocked at `max` resumes.
///
/// Always strictly below `max`, so a blocked issuer needs at least one
/// release to wake.
pub fn resume_point(max: usize, hysteresis_percentage: u32) -> usize {
    let pct = hysteresis_percentage.min(100) as usize;
    let at = max.saturating_mul(100 - pct) / 100;
    if at >= max {
        max.saturating_sub(1)
    } else {
        at
    }
}

// ── ReplicationConfig ──────────────────────────────────────────────

/// Shape of a control-replicated launch, as seen by one shard.
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Number of shards. Default: 1.
    pub total_shards: usize,
    /// This shard. Default: shard 0.
    pub shard_id: ShardId,
    /// Rotating close-mapped barriers. Default: 4.
    pub close_pool_size: usize,
    /// Rotating refinement-ready and refinement-mapped barriers.
    /// Default: 4.
    pub refinement_pool_size: usize,
    /// Paired collective-map barriers. Default: 4.
    pub collective_map_pool_size: usize,
    /// Paired indirection-copy barriers. Default: 4.
    pub indirection_pool_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            total_shards: 1,
            shard_id: ShardId(0),
            close_pool_size: 4,
            refinement_pool_size: 4,
            collective_map_pool_size: 4,
            indirection_pool_size: 4,
        }
    }
}

impl ReplicationConfig {
    /// Configuration of `shard` out of `total_shards`, default pool sizes.
    pub fn shard(shard: ShardId, total_shards: usize) -> Self {
        Self {
            total_shards,
            shard_id: shard,
            ..Self::default()
        }
    }

    /// Validate all invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_shards == 0 {
            return Err(ConfigError::NoShards);
        }
        if self.shard_id.index() >= self.total_shards {
            return Err(ConfigError::ShardOutOfRange {
                shard: self.shard_id,
                total: self.total_shards,
            });
        }
        for (pool, size) in [
            ("close-mapped", self.close_pool_size),
            ("refinement", self.refinement_pool_size),
            ("collective-map", self.collective_map_pool_size),
            ("indirection", self.indirection_pool_size),
        ] {
            if size == 0 {
                return Err(ConfigError::EmptyPool { pool });
            }
        }
        Ok(())
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected by the configuration `validate()` passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_window_size` is zero.
    WindowZero,
    /// `hysteresis_percentage` is above 100.
    HysteresisOutOfRange {
        /// The configured value.
        value: u32,
    },
    /// `max_outstanding_frames` is zero.
    FramesZero,
    /// `max_templates_per_trace` is zero.
    TemplatesZero,
    /// `fill_view_cache_size` is zero.
    FillCacheZero,
    /// `max_pending_messages` is zero.
    PendingBoundZero,
    /// `total_shards` is zero.
    NoShards,
    /// `shard_id` is not below `total_shards`.
    ShardOutOfRange {
        /// The configured shard.
        shard: ShardId,
        /// The configured shard count.
        total: usize,
    },
    /// A rotating barrier pool has no barriers.
    EmptyPool {
        /// Name of the pool.
        pool: &'static str,
    },
    /// A background thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WindowZero => write!(f, "max_window_size must be at least 1"),
            Self::HysteresisOutOfRange { value } => {
                write!(f, "hysteresis_percentage must be in [0, 100], got {value}")
            }
            Self::FramesZero => write!(f, "max_outstanding_frames must be at least 1"),
            Self::TemplatesZero => write!(f, "max_templates_per_trace must be at least 1"),
            Self::FillCacheZero => write!(f, "fill_view_cache_size must be at least 1"),
            Self::PendingBoundZero => write!(f, "max_pending_messages must be at least 1"),
            Self::NoShards => write!(f, "total_shards must be at least 1"),
            Self::ShardOutOfRange { shard, total } => {
                write!(f, "shard {shard} out of range for {total} shards")
            }
            Self::EmptyPool { pool } => write!(f, "barrier pool '{pool}' is empty"),
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(ContextConfig::default().validate(), Ok(()));
        assert_eq!(ReplicationConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_window_rejected() {
        let cfg = ContextConfig {
            max_window_size: 0,
            ..ContextConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::WindowZero));
    }

    #[test]
    fn hysteresis_above_100_rejected() {
        let cfg = ContextConfig {
            hysteresis_percentage: 101,
            ..ContextConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::HysteresisOutOfRange { value: 101 })
        );
    }

    #[test]
    fn resume_point_stays_below_max() {
        assert_eq!(resume_point(100, 50), 50);
        assert_eq!(resume_point(1024, 25), 768);
        assert_eq!(resume_point(4, 0), 3);
        assert_eq!(resume_point(1, 0), 0);
        assert_eq!(resume_point(10, 100), 0);
    }

    #[test]
    fn worker_count_clamped() {
        let cfg = ContextConfig {
            meta_workers: Some(0),
            ..ContextConfig::default()
        };
        assert_eq!(cfg.resolved_worker_count(), 1);
        let cfg = ContextConfig {
            meta_workers: Some(500),
            ..ContextConfig::default()
        };
        assert_eq!(cfg.resolved_worker_count(), 64);
        let auto = ContextConfig::default().resolved_worker_count();
        assert!((2..=16).contains(&auto));
    }

    #[test]
    fn shard_out_of_range_rejected() {
        let cfg = ReplicationConfig::shard(ShardId(4), 4);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ShardOutOfRange {
                shard: ShardId(4),
                total: 4
            })
        );
        let cfg = ReplicationConfig {
            indirection_pool_size: 0,
            ..ReplicationConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::EmptyPool {
                pool: "indirection"
            })
        );
    }
}
