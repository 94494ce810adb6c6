#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Request kinds tracked per cache level.
///
/// Discriminants are wire values shared with trace tooling and must not be
/// reordered.
#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[allow(non_camel_case_types)]
pub enum AccessKind {
    LOAD = 0,
    RFO = 1,
    PREFETCH = 2,
    WRITEBACK = 3,
    TRANSLATION = 4,
    INVALIDATE = 5,
    WRITEBACK_EXCLUSIVE = 6,
    NON_VALID = 7,
}

pub const NUM_ACCESS_KINDS: usize = 8;

/// Admission counters for one request queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Admission attempts.
    pub access: u64,
    /// Requests coalesced into an already queued entry.
    pub merged: u64,
    /// Requests refused because the queue was at capacity.
    pub full: u64,
    /// Requests that were enqueued.
    pub to_cache: u64,
    /// Requests satisfied by forwarding queued writeback data.
    pub forward: u64,
}

impl std::ops::AddAssign for Queue {
    fn add_assign(&mut self, other: Self) {
        self.access += other.access;
        self.merged += other.merged;
        self.full += other.full;
        self.to_cache += other.to_cache;
        self.forward += other.forward;
    }
}

/// Prefetcher effectiveness counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefetch {
    pub requested: u64,
    pub issued: u64,
    pub useful: u64,
    pub useless: u64,
    pub fill: u64,
}

impl std::ops::AddAssign for Prefetch {
    fn add_assign(&mut self, other: Self) {
        self.requested += other.requested;
        self.issued += other.issued;
        self.useful += other.useful;
        self.useless += other.useless;
        self.fill += other.fill;
    }
}

/// Per-cache counters: accesses, hits and misses are tracked per cpu and per
/// access kind.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub access: Vec<[u64; NUM_ACCESS_KINDS]>,
    pub hit: Vec<[u64; NUM_ACCESS_KINDS]>,
    pub miss: Vec<[u64; NUM_ACCESS_KINDS]>,

    /// Sum over all fills of (fill cycle - enqueue cycle).
    pub total_miss_latency: u64,

    pub prefetch: Prefetch,

    pub rq: Queue,
    pub wq: Queue,
    pub pq: Queue,
    pub ivq: Queue,
}

impl Cache {
    #[must_use]
    pub fn new(num_cpus: usize) -> Self {
        Self {
            access: vec![[0; NUM_ACCESS_KINDS]; num_cpus],
            hit: vec![[0; NUM_ACCESS_KINDS]; num_cpus],
            miss: vec![[0; NUM_ACCESS_KINDS]; num_cpus],
            total_miss_latency: 0,
            prefetch: Prefetch::default(),
            rq: Queue::default(),
            wq: Queue::default(),
            pq: Queue::default(),
            ivq: Queue::default(),
        }
    }

    pub fn inc_access(&mut self, cpu: usize, kind: AccessKind) {
        self.access[cpu][kind as usize] += 1;
    }

    pub fn inc_hit(&mut self, cpu: usize, kind: AccessKind) {
        self.hit[cpu][kind as usize] += 1;
    }

    pub fn inc_miss(&mut self, cpu: usize, kind: AccessKind) {
        self.miss[cpu][kind as usize] += 1;
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.access.len()
    }

    /// Total accesses of one kind, summed over cpus.
    #[must_use]
    pub fn accesses(&self, kind: AccessKind) -> u64 {
        self.access.iter().map(|per_cpu| per_cpu[kind as usize]).sum()
    }

    #[must_use]
    pub fn hits(&self, kind: AccessKind) -> u64 {
        self.hit.iter().map(|per_cpu| per_cpu[kind as usize]).sum()
    }

    #[must_use]
    pub fn misses(&self, kind: AccessKind) -> u64 {
        self.miss.iter().map(|per_cpu| per_cpu[kind as usize]).sum()
    }

    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        AccessKind::iter().map(|kind| self.accesses(kind)).sum()
    }

    #[must_use]
    pub fn total_misses(&self) -> u64 {
        AccessKind::iter().map(|kind| self.misses(kind)).sum()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(1)
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        let cpus = self.access.len().max(other.access.len());
        self.access.resize(cpus, [0; NUM_ACCESS_KINDS]);
        self.hit.resize(cpus, [0; NUM_ACCESS_KINDS]);
        self.miss.resize(cpus, [0; NUM_ACCESS_KINDS]);
        for (cpu, per_cpu) in other.access.iter().enumerate() {
            for (kind, count) in per_cpu.iter().enumerate() {
                self.access[cpu][kind] += count;
            }
        }
        for (cpu, per_cpu) in other.hit.iter().enumerate() {
            for (kind, count) in per_cpu.iter().enumerate() {
                self.hit[cpu][kind] += count;
            }
        }
        for (cpu, per_cpu) in other.miss.iter().enumerate() {
            for (kind, count) in per_cpu.iter().enumerate() {
                self.miss[cpu][kind] += count;
            }
        }
        self.total_miss_latency += other.total_miss_latency;
        self.prefetch += other.prefetch;
        self.rq += other.rq;
        self.wq += other.wq;
        self.pq += other.pq;
        self.ivq += other.ivq;
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // only print counters that fired
        let mut out = f.debug_struct("CacheStats");
        for kind in AccessKind::iter() {
            let (access, hit, miss) = (self.accesses(kind), self.hits(kind), self.misses(kind));
            if access > 0 {
                out.field(
                    &format!("{kind:?}"),
                    &format!("access={access} hit={hit} miss={miss}"),
                );
            }
        }
        if self.total_miss_latency > 0 {
            out.field("total_miss_latency", &self.total_miss_latency);
        }
        out.finish_non_exhaustive()
    }
}
