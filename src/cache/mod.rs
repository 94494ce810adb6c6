mod admission;
mod pipeline;
#[cfg(test)]
mod tests;

use crate::address;
use crate::block::Block;
use crate::config;
use crate::interconn::{
    AddResult, ConsumerHandle, ConsumerLink, MemoryRequestConsumer, MemoryRequestProducer,
    ProducerLink, QueueKind,
};
use crate::mshr::Mshr;
use crate::packet::{Kind, Packet, NO_EVENT};
use crate::prefetch::{PrefetchRequest, Prefetcher};
use crate::queue::DelayQueue;
use crate::replacement::ReplacementPolicy;
use crate::sync::{Arc, Mutex};
use crate::vmem::VirtualMemory;
use console::style;
use itertools::Itertools;

/// Partial progress of one victim eviction across stalled cycles.
///
/// A stall after the writeback went out but before every upstream
/// invalidation was accepted must not re-send the writeback on retry; these
/// flags record which sub-steps already happened. They persist on the cache
/// because the same victim is retried until the fill succeeds.
#[derive(Debug, Clone, Copy)]
struct EvictionProgress {
    send_wb_valid: bool,
    send_inv_valid: [bool; 2],
}

impl Default for EvictionProgress {
    fn default() -> Self {
        Self {
            send_wb_valid: true,
            send_inv_valid: [true; 2],
        }
    }
}

/// One level of the cache hierarchy.
///
/// A cache owns its block array, five bounded request queues and an MSHR,
/// and is linked to one consumer below it and up to two producers above it.
/// All work happens inside [`crate::Operable::operate`], once per global
/// cycle; cross-level traffic goes through the [`MemoryRequestConsumer`] and
/// [`MemoryRequestProducer`] interfaces.
pub struct Cache {
    pub name: String,
    pub stats: stats::Cache,

    config: Arc<config::Cache>,
    current_cycle: u64,
    /// cpu of the most recently handled request; self-issued prefetches are
    /// attributed to it.
    cpu: usize,
    warmup_complete: Vec<bool>,
    /// Set once any request with a translated data address has been seen;
    /// decides whether evictions report physical or virtual addresses to the
    /// prefetcher.
    ever_seen_data: bool,

    block: Vec<Block>,
    rq: DelayQueue<Packet>,
    wq: DelayQueue<Packet>,
    pq: DelayQueue<Packet>,
    ivq: DelayQueue<Packet>,
    vapq: DelayQueue<Packet>,
    mshr: Mshr,

    /// Non-owning links into the level tree; the simulator driver owns the
    /// components.
    lower_level: Option<ConsumerLink>,
    upper_level: [Option<ConsumerLink>; 2],
    /// This cache's own producer handle, registered on packets forwarded to
    /// the lower level.
    self_link: Option<ProducerLink>,

    replacement: Box<dyn ReplacementPolicy>,
    prefetcher: Box<dyn Prefetcher>,
    vmem: Option<Arc<Mutex<dyn VirtualMemory>>>,

    reads_available_this_cycle: u32,
    writes_available_this_cycle: u32,
    invalid_available_this_cycle: u32,

    eviction: EvictionProgress,
    /// Scratch buffer handed to prefetcher hooks.
    pf_issue: Vec<PrefetchRequest>,
}

pub struct Builder {
    pub config: Arc<config::Cache>,
    pub replacement: Box<dyn ReplacementPolicy>,
    pub prefetcher: Box<dyn Prefetcher>,
    pub vmem: Option<Arc<Mutex<dyn VirtualMemory>>>,
}

impl Builder {
    /// Materialise the cache behind its shared handle and register its own
    /// producer link for miss forwarding.
    #[must_use]
    pub fn build(self) -> Arc<Mutex<Cache>> {
        let config = self.config;
        let cache = Cache {
            name: config.name.clone(),
            stats: stats::Cache::new(config.num_cpus),
            current_cycle: 0,
            cpu: 0,
            warmup_complete: vec![false; config.num_cpus],
            ever_seen_data: false,
            block: (0..config.total_lines()).map(|_| Block::default()).collect(),
            rq: DelayQueue::new(config.rq_size, config.queue_latency),
            wq: DelayQueue::new(config.wq_size, config.queue_latency),
            pq: DelayQueue::new(config.pq_size, config.queue_latency),
            ivq: DelayQueue::new(config.ivq_size, config.queue_latency),
            vapq: DelayQueue::new(config.vapq_size, config.queue_latency),
            mshr: Mshr::new(config.mshr_size),
            lower_level: None,
            upper_level: [None, None],
            self_link: None,
            replacement: self.replacement,
            prefetcher: self.prefetcher,
            vmem: self.vmem,
            reads_available_this_cycle: 0,
            writes_available_this_cycle: 0,
            invalid_available_this_cycle: 0,
            eviction: EvictionProgress::default(),
            pf_issue: Vec::new(),
            config,
        };
        let cache = Arc::new(Mutex::new(cache));
        let producer: Arc<Mutex<dyn MemoryRequestProducer>> = cache.clone();
        cache.lock().self_link = Some(Arc::downgrade(&producer));
        cache
    }
}

impl Cache {
    pub fn set_lower_level(&mut self, link: ConsumerHandle) {
        self.lower_level = Some(Arc::downgrade(&link));
    }

    pub fn set_upper_level(&mut self, index: usize, link: ConsumerHandle) {
        self.upper_level[index] = Some(Arc::downgrade(&link));
    }

    /// The level below, if wired and still alive.
    pub(crate) fn lower(&self) -> Option<ConsumerHandle> {
        self.lower_level.as_ref().and_then(|link| link.upgrade())
    }

    /// One of the up-to-two levels above, if wired and still alive.
    pub(crate) fn upper(&self, index: usize) -> Option<ConsumerHandle> {
        self.upper_level[index].as_ref().and_then(|link| link.upgrade())
    }

    /// Flip one cpu out of warmup: queue latencies and the fill latency
    /// start to apply to its requests.
    pub fn set_warmup_complete(&mut self, cpu: usize) {
        self.warmup_complete[cpu] = true;
    }

    pub fn set_all_warmup_complete(&mut self) {
        self.warmup_complete.iter_mut().for_each(|done| *done = true);
    }

    pub(crate) fn warmup_done(&self, cpu: usize) -> bool {
        self.warmup_complete.get(cpu).copied().unwrap_or(true)
    }

    #[must_use]
    pub fn get_set(&self, addr: address) -> usize {
        ((addr >> self.config.offset_bits) % self.config.num_sets as u64) as usize
    }

    /// The way holding `addr`'s block, if any valid block matches.
    #[must_use]
    pub fn get_way(&self, addr: address, set: usize) -> Option<usize> {
        let start = set * self.config.num_ways;
        self.block[start..start + self.config.num_ways]
            .iter()
            .position(|block| block.matches(addr, self.config.offset_bits))
    }

    /// Drop `addr`'s block if present; returns the way that held it.
    pub fn invalidate_entry(&mut self, addr: address) -> Option<usize> {
        let set = self.get_set(addr);
        let way = self.get_way(addr, set);
        if let Some(way) = way {
            self.block[set * self.config.num_ways + way].valid = false;
        }
        way
    }

    pub(crate) fn should_activate_prefetcher(&self, kind: Kind) -> bool {
        (1u64 << kind as u64) & self.config.pref_activate_mask != 0
    }

    /// The address the prefetcher is trained on, masked to the block
    /// boundary unless offsets are significant for this cache.
    pub(crate) fn prefetch_base(&self, packet: &Packet) -> address {
        let raw = if self.config.virtual_prefetch {
            packet.v_address
        } else {
            packet.address
        };
        raw & !crate::util::bitmask(if self.config.match_offset_bits {
            0
        } else {
            self.config.offset_bits
        })
    }

    /// First invalid way of the set, else whatever the replacement policy
    /// picks.
    pub(crate) fn victim_way(&mut self, set: usize, packet: &Packet) -> usize {
        let start = set * self.config.num_ways;
        let end = start + self.config.num_ways;
        match self.block[start..end].iter().position(|block| !block.valid) {
            Some(way) => way,
            None => self.replacement.find_victim(
                packet.cpu,
                packet.instr_id,
                set,
                &self.block[start..end],
                packet.ip,
                packet.address,
                packet.kind,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update_replacement_state(
        &mut self,
        cpu: usize,
        set: usize,
        way: usize,
        addr: address,
        ip: address,
        victim_addr: address,
        kind: Kind,
        hit: bool,
    ) {
        let start = set * self.config.num_ways;
        let end = start + self.config.num_ways;
        self.replacement.update_state(
            &mut self.block[start..end],
            cpu,
            set,
            way,
            addr,
            ip,
            victim_addr,
            kind,
            hit,
        );
    }
}

impl MemoryRequestConsumer for Cache {
    fn add_rq(&mut self, packet: &mut Packet) -> AddResult {
        Cache::add_rq(self, packet)
    }

    fn add_wq(&mut self, packet: &mut Packet) -> AddResult {
        Cache::add_wq(self, packet)
    }

    fn add_pq(&mut self, packet: &mut Packet) -> AddResult {
        Cache::add_pq(self, packet)
    }

    fn add_ivq(&mut self, packet: &mut Packet) -> AddResult {
        Cache::add_ivq(self, packet)
    }

    fn get_occupancy(&self, queue: QueueKind, _address: address) -> u32 {
        match queue {
            QueueKind::MSHR => self.mshr.occupancy(),
            QueueKind::RQ => self.rq.occupancy(),
            QueueKind::WQ => self.wq.occupancy(),
            QueueKind::PQ => self.pq.occupancy(),
            QueueKind::IVQ => self.ivq.occupancy(),
        }
    }

    fn get_size(&self, queue: QueueKind, _address: address) -> u32 {
        match queue {
            QueueKind::MSHR => self.mshr.size(),
            QueueKind::RQ => self.rq.size(),
            QueueKind::WQ => self.wq.size(),
            QueueKind::PQ => self.pq.size(),
            QueueKind::IVQ => self.ivq.size(),
        }
    }

    fn fill_level(&self) -> u32 {
        self.config.fill_level
    }
}

impl crate::Operable for Cache {
    fn operate(&mut self, cycle: u64) {
        self.current_cycle = cycle;
        self.operate_invalid();
        self.operate_writes();
        self.operate_reads();

        let mut issue = std::mem::take(&mut self.pf_issue);
        self.prefetcher.cycle_operate(&mut issue);
        self.drain_prefetches(&mut issue);
        self.pf_issue = issue;
    }

    fn busy(&self) -> bool {
        !self.mshr.is_empty()
            || !self.rq.is_empty()
            || !self.wq.is_empty()
            || !self.pq.is_empty()
            || !self.ivq.is_empty()
            || !self.vapq.is_empty()
    }

    fn print_deadlock(&self) {
        let occupancy = [
            ("RQ", self.rq.occupancy()),
            ("WQ", self.wq.occupancy()),
            ("PQ", self.pq.occupancy()),
            ("IVQ", self.ivq.occupancy()),
            ("VAPQ", self.vapq.occupancy()),
        ]
        .iter()
        .map(|(queue, occupancy)| format!("{queue}={occupancy}"))
        .join(" ");

        if self.mshr.is_empty() {
            eprintln!("{} MSHR empty ({occupancy})", style(&self.name).bold());
            return;
        }
        eprintln!(
            "{} MSHR entries ({occupancy})",
            style(&self.name).bold().red()
        );
        for (index, entry) in self.mshr.iter().enumerate() {
            let event = if entry.event_cycle == NO_EVENT {
                "outstanding".to_string()
            } else {
                entry.event_cycle.to_string()
            };
            eprintln!(
                "  [{index}] {entry} instr_id={} fill_level={} event_cycle={event} invalid={}/{}",
                entry.instr_id,
                entry.fill_level,
                entry.mshr_return_data_invalid_count,
                entry.mshr_invalid_count,
            );
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("fill_level", &self.config.fill_level)
            .field("inclusion", &self.config.inclusion)
            .field("mshr", &self.mshr.occupancy())
            .field("rq", &self.rq.occupancy())
            .field("wq", &self.wq.occupancy())
            .field("pq", &self.pq.occupancy())
            .field("ivq", &self.ivq.occupancy())
            .finish_non_exhaustive()
    }
}
