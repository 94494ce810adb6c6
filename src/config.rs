use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Inclusion policy between this level and the levels above it.
///
/// Discriminants are wire values shared with configuration tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Inclusion {
    /// Upper-level copies are invalidated when this level evicts.
    INCLUSIVE = 0,
    /// The local copy is invalidated when an upper level reads it.
    EXCLUSIVE = 1,
    /// Non-inclusive, non-exclusive.
    NINE = 2,
    /// A queue-only structure that tracks requests without holding lines.
    NOT_CACHE = 3,
}

/// Static parameters of one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub name: String,
    pub num_cpus: usize,

    pub num_sets: usize,
    pub num_ways: usize,
    pub offset_bits: u32,

    pub mshr_size: usize,
    /// Cycles between victim install and data hand-off to the producers.
    pub fill_latency: u64,
    /// Enqueue-to-ready latency of the request queues.
    pub queue_latency: u64,

    /// Head dequeues the read pipelines may perform per cycle.
    pub max_read: u32,
    /// Head dequeues shared by the invalidate and fill/writeback pipelines
    /// per cycle.
    pub max_write: u32,

    /// Position in the hierarchy; smaller is closer to the cpu.
    pub fill_level: u32,
    pub inclusion: Inclusion,

    /// Route prefetch misses through the lower level's read queue.
    pub prefetch_as_load: bool,
    /// Prefetches are issued on virtual addresses and translated via the
    /// VAPQ before entering the prefetch queue.
    pub virtual_prefetch: bool,
    /// Match writeback forwarding at full address granularity instead of
    /// block granularity.
    pub match_offset_bits: bool,
    /// Bitmask over request kinds that train the prefetcher.
    pub pref_activate_mask: u64,

    pub rq_size: usize,
    pub wq_size: usize,
    pub pq_size: usize,
    pub ivq_size: usize,
    pub vapq_size: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            num_cpus: 1,
            num_sets: 1024,
            num_ways: 8,
            offset_bits: 6,
            mshr_size: 32,
            fill_latency: 10,
            queue_latency: 1,
            max_read: 2,
            max_write: 2,
            fill_level: 2,
            inclusion: Inclusion::NINE,
            prefetch_as_load: false,
            virtual_prefetch: false,
            match_offset_bits: false,
            pref_activate_mask: (1 << crate::packet::Kind::LOAD as u64)
                | (1 << crate::packet::Kind::RFO as u64)
                | (1 << crate::packet::Kind::PREFETCH as u64),
            rq_size: 32,
            wq_size: 32,
            pq_size: 16,
            ivq_size: 32,
            vapq_size: 32,
        }
    }
}

impl Cache {
    /// Load a cache configuration from a JSON file. Missing fields take
    /// their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        eyre::ensure!(self.num_sets > 0, "{}: num_sets must be nonzero", self.name);
        eyre::ensure!(self.num_ways > 0, "{}: num_ways must be nonzero", self.name);
        eyre::ensure!(
            self.num_cpus > 0,
            "{}: num_cpus must be nonzero",
            self.name
        );
        eyre::ensure!(
            self.mshr_size > 0,
            "{}: mshr_size must be nonzero",
            self.name
        );
        Ok(())
    }

    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.num_sets * self.num_ways
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, Inclusion};

    #[test]
    fn defaults_are_valid() {
        let config = Cache::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_lines(), 8192);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Cache = serde_json::from_str(
            r#"{ "name": "LLC", "num_sets": 2048, "num_ways": 16, "inclusion": "INCLUSIVE" }"#,
        )
        .unwrap();
        assert_eq!(config.name, "LLC");
        assert_eq!(config.num_sets, 2048);
        assert_eq!(config.inclusion, Inclusion::INCLUSIVE);
        // untouched fields keep their defaults
        assert_eq!(config.offset_bits, 6);
        assert_eq!(config.mshr_size, 32);
    }
}
