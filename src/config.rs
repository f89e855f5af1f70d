//! Configuration recognised by a shard (spec §6).
//!
//! Plain struct with a `Default` impl and named presets, the same shape as
//! `GraniteConfig`/`SandstoneConfig` in the engines this crate is modeled
//! on — no config-file crate, since nothing outside this library reads these
//! values from disk.

use std::path::PathBuf;
use std::time::Duration;

/// Durability mode for translog writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync before acknowledging each write.
    Request,
    /// fsync on a timer / on generation roll.
    Async,
}

#[derive(Debug, Clone)]
pub struct ShardSettings {
    /// `index.translog.durability`
    pub translog_durability: Durability,
    /// `index.translog.flush_threshold_size`: bytes of uncommitted translog
    /// before a periodic flush is scheduled.
    pub flush_threshold_bytes: u64,
    /// `index.translog.generation_threshold_size`: bytes in a single
    /// generation before rolling.
    pub generation_threshold_bytes: u64,
    /// `index.refresh_interval`; `None` disables scheduled refresh (`-1`).
    pub refresh_interval: Option<Duration>,
    /// `index.search_idle_after`.
    pub search_idle_after: Duration,
    /// `index.priority` — opaque recovery priority hint.
    pub priority: i32,
    /// `index.data_path` — overrides the default data directory.
    pub data_path: Option<PathBuf>,
    /// How often the async-durability worker fsyncs on a timer.
    pub async_fsync_interval: Duration,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            translog_durability: Durability::Request,
            flush_threshold_bytes: 512 * 1024 * 1024,
            generation_threshold_bytes: 64 * 1024 * 1024,
            refresh_interval: Some(Duration::from_secs(1)),
            search_idle_after: Duration::from_secs(30),
            priority: 1,
            data_path: None,
            async_fsync_interval: Duration::from_millis(5000),
        }
    }
}

impl ShardSettings {
    /// Low-latency preset: synchronous fsync per write, frequent refresh.
    pub fn request_durability() -> Self {
        Self {
            translog_durability: Durability::Request,
            refresh_interval: Some(Duration::from_millis(200)),
            ..Default::default()
        }
    }

    /// Throughput-favoring preset: deferred fsync, larger generations.
    pub fn async_durability() -> Self {
        Self {
            translog_durability: Durability::Async,
            generation_threshold_bytes: 256 * 1024 * 1024,
            async_fsync_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// `-1` disables scheduled refresh.
    pub fn refresh_disabled(mut self) -> Self {
        self.refresh_interval = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_request_durability() {
        let s = ShardSettings::default();
        assert_eq!(s.translog_durability, Durability::Request);
    }

    #[test]
    fn async_preset_changes_durability() {
        let s = ShardSettings::async_durability();
        assert_eq!(s.translog_durability, Durability::Async);
    }

    #[test]
    fn refresh_disabled_clears_interval() {
        let s = ShardSettings::default().refresh_disabled();
        assert!(s.refresh_interval.is_none());
    }
}
