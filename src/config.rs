//! Library configuration.
//!
//! Every knob is read once from the environment when a pool is created or
//! opened without an explicit [`Config`]; tests construct `Config` values
//! directly to exercise specific combinations in one process. The settings
//! are per-pool: two pools opened with different configurations do not
//! interfere.

use crate::param;

/// Environment variable names, one per knob.
pub const ENV_BLOCK_SIZE: &str = "PMFS_BLOCK_SIZE";
pub const ENV_OPT_LIST_WALK: &str = "PMFS_OPT_LIST_WALK";
pub const ENV_OPT_TREE_WALK: &str = "PMFS_OPT_TREE_WALK";
pub const ENV_CONTENTION_LEVEL: &str = "PMFS_CONTENTION_LEVEL";
pub const ENV_TRACK_DATA: &str = "PMFS_TRACK_DATA";
pub const ENV_REPLACE_BLOCKS: &str = "PMFS_REPLACE_BLOCKS";

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Fixed data-block size. 0 keeps the write-length heuristic
    /// (see `param::BLOCK_SIZE_*`).
    pub block_size: usize,

    /// Skip over completely full block arrays in O(1) while walking to an
    /// offset.
    pub list_walk: bool,

    /// Maintain a per-handle offset index over blocks and use it to seek in
    /// O(log n).
    pub tree_walk: bool,

    /// Lock family selector, 0..=5. 0 disables locking entirely, 1-2 spin,
    /// 3-4 use the user-space rwlock, 5 the OS mutex/rwlock.
    pub contention_level: u8,

    /// Snapshot overwritten block bytes so an aborted transaction restores
    /// them.
    pub track_data: bool,

    /// When an entire block is overwritten, free and reallocate its data
    /// instead of snapshotting it. Only consulted when `track_data` is set.
    pub replace_blocks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 0,
            list_walk: false,
            tree_walk: true,
            contention_level: 5,
            track_data: false,
            replace_blocks: false,
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<i64>().map(|n| n != 0).unwrap_or(default),
        Err(_) => default,
    }
}

impl Config {
    /// Reads the configuration from the environment.
    ///
    /// Panics on an out-of-range contention level; there is no sensible way
    /// to continue with an unknown lock family.
    pub fn from_env() -> Self {
        let default = Self::default();
        let cfg = Self {
            block_size: env_usize(ENV_BLOCK_SIZE, default.block_size),
            list_walk: env_bool(ENV_OPT_LIST_WALK, default.list_walk),
            tree_walk: env_bool(ENV_OPT_TREE_WALK, default.tree_walk),
            contention_level: env_usize(
                ENV_CONTENTION_LEVEL,
                default.contention_level as usize,
            ) as u8,
            track_data: env_bool(ENV_TRACK_DATA, default.track_data),
            replace_blocks: env_bool(ENV_REPLACE_BLOCKS, default.replace_blocks),
        };
        assert!(
            cfg.contention_level <= 5,
            "invalid contention level {}",
            cfg.contention_level
        );
        log::info!(
            "block size {} list walk {} tree walk {} contention {} track data {} replace blocks {}",
            cfg.block_size,
            cfg.list_walk,
            cfg.tree_walk,
            cfg.contention_level,
            cfg.track_data,
            cfg.replace_blocks
        );
        cfg
    }

    /// Data-block size for a write of `count` bytes that needs a fresh block.
    pub fn block_size_for(&self, count: usize) -> usize {
        if self.block_size != 0 {
            self.block_size
        } else if count < param::WRITE_SMALL {
            param::BLOCK_SIZE_SMALL
        } else if count < param::WRITE_MEDIUM {
            param::BLOCK_SIZE_MEDIUM
        } else if count < param::WRITE_LARGE {
            param::BLOCK_SIZE_LARGE
        } else {
            param::BLOCK_SIZE_HUGE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_ladder() {
        let cfg = Config::default();
        assert_eq!(cfg.block_size_for(1), param::BLOCK_SIZE_SMALL);
        assert_eq!(cfg.block_size_for(4095), param::BLOCK_SIZE_SMALL);
        assert_eq!(cfg.block_size_for(4096), param::BLOCK_SIZE_MEDIUM);
        assert_eq!(cfg.block_size_for(64 * 1024 - 1), param::BLOCK_SIZE_MEDIUM);
        assert_eq!(cfg.block_size_for(64 * 1024), param::BLOCK_SIZE_LARGE);
        assert_eq!(cfg.block_size_for(1024 * 1024), param::BLOCK_SIZE_HUGE);
    }

    #[test]
    fn explicit_block_size_wins() {
        let cfg = Config {
            block_size: 2 << 20,
            ..Config::default()
        };
        assert_eq!(cfg.block_size_for(1), 2 << 20);
        assert_eq!(cfg.block_size_for(16 << 20), 2 << 20);
    }
}
