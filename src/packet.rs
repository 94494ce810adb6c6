use crate::address;
use crate::interconn::ProducerLink;
use once_cell::sync::Lazy;
use smallvec::SmallVec;
use std::sync::atomic;

/// Request kind.
///
/// Discriminants are part of the external interface (trace tooling and the
/// prefetcher activation mask index by them) and must not be reordered.
#[derive(
    Debug, strum::FromRepr, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
#[allow(non_camel_case_types)]
pub enum Kind {
    LOAD = 0,
    RFO = 1,
    PREFETCH = 2,
    WRITEBACK = 3,
    TRANSLATION = 4,
    INVALIDATE = 5,
    WRITEBACK_EXCLUSIVE = 6,
    NON_VALID = 7,
}

impl From<Kind> for stats::cache::AccessKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::LOAD => Self::LOAD,
            Kind::RFO => Self::RFO,
            Kind::PREFETCH => Self::PREFETCH,
            Kind::WRITEBACK => Self::WRITEBACK,
            Kind::TRANSLATION => Self::TRANSLATION,
            Kind::INVALIDATE => Self::INVALIDATE,
            Kind::WRITEBACK_EXCLUSIVE => Self::WRITEBACK_EXCLUSIVE,
            Kind::NON_VALID => Self::NON_VALID,
        }
    }
}

/// Scoreboard indices of instructions waiting on this request.
///
/// Opaque to the cache: merged on coalescing, never inspected.
pub type DepList = SmallVec<[u64; 4]>;

/// Sentinel for requests whose data has not returned from the lower level.
pub const NO_EVENT: u64 = u64::MAX;

static PACKET_UID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(0));

/// Generate a unique id for correlating log lines of one request.
pub fn generate_uid() -> u64 {
    PACKET_UID.fetch_add(1, atomic::Ordering::SeqCst)
}

/// A memory request descriptor.
///
/// Packets are copy-semantics: admission clones them into queues and the
/// MSHR, the caller keeps its own.
#[derive(Clone)]
pub struct Packet {
    pub uid: u64,

    pub kind: Kind,
    pub address: address,
    pub v_address: address,
    pub ip: address,
    pub data: u64,
    pub instr_id: u64,
    pub cpu: usize,
    pub asid: [u8; 2],

    /// Lowest level that must install the data (smaller = closer to the cpu).
    pub fill_level: u32,
    /// Level whose prefetcher originated this request.
    pub pf_origin_level: u32,
    pub pf_metadata: u32,

    /// Producers awaiting `return_data` for this request, in arrival order.
    pub to_return: Vec<ProducerLink>,
    pub lq_index_depend_on_me: DepList,
    pub sq_index_depend_on_me: DepList,
    pub instr_depend_on_me: DepList,

    /// Upstream invalidation acks a queued writeback still waits for.
    pub inv_ongoing: i32,
    /// Invalidations coalesced into this entry (counts itself).
    pub merge_count: i32,
    /// Invalidations observed while the miss was in flight.
    pub mshr_invalid_count: i32,
    /// Snapshot of `mshr_invalid_count` taken when the data returned.
    pub mshr_return_data_invalid_count: i32,
    /// The `data` field is authoritative (e.g. donated by a dirty copy).
    pub data_valid: bool,

    /// Admission probe: must have no observable side effects.
    pub test_packet: bool,

    /// Cycle at which the next action on this packet is permitted.
    pub event_cycle: u64,
    pub cycle_enqueued: u64,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            uid: generate_uid(),
            kind: Kind::LOAD,
            address: 0,
            v_address: 0,
            ip: 0,
            data: 0,
            instr_id: 0,
            cpu: 0,
            asid: [0; 2],
            fill_level: 0,
            pf_origin_level: 0,
            pf_metadata: 0,
            to_return: Vec::new(),
            lq_index_depend_on_me: DepList::new(),
            sq_index_depend_on_me: DepList::new(),
            instr_depend_on_me: DepList::new(),
            inv_ongoing: 0,
            merge_count: 1,
            mshr_invalid_count: 0,
            mshr_return_data_invalid_count: 0,
            data_valid: false,
            test_packet: false,
            event_cycle: NO_EVENT,
            cycle_enqueued: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub kind: Kind,
    pub address: address,
    pub v_address: address,
    pub ip: address,
    pub instr_id: u64,
    pub cpu: usize,
    pub fill_level: u32,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Packet {
        Packet {
            kind: self.kind,
            address: self.address,
            v_address: self.v_address,
            ip: self.ip,
            instr_id: self.instr_id,
            cpu: self.cpu,
            fill_level: self.fill_level,
            ..Packet::default()
        }
    }
}

impl Packet {
    /// Does this packet target the same block as `addr`, at `shift`-bit
    /// granularity?
    #[must_use]
    pub fn matches(&self, addr: address, shift: u32) -> bool {
        (self.address >> shift) == (addr >> shift)
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}@{:#x}", self.kind, self.address)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("uid", &self.uid)
            .field("kind", &self.kind)
            .field("address", &format_args!("{:#x}", self.address))
            .field("v_address", &format_args!("{:#x}", self.v_address))
            .field("cpu", &self.cpu)
            .field("fill_level", &self.fill_level)
            .field("event_cycle", &self.event_cycle)
            .field("data_valid", &self.data_valid)
            .field("to_return", &self.to_return.len())
            .finish_non_exhaustive()
    }
}

/// Merge `src` into `dest`, dropping duplicates.
pub fn dep_merge(dest: &mut DepList, src: &DepList) {
    for &idx in src {
        if !dest.contains(&idx) {
            dest.push(idx);
        }
    }
}

/// Merge producer lists, dropping handles already present.
pub fn return_merge(dest: &mut Vec<ProducerLink>, src: &[ProducerLink]) {
    for link in src {
        if !dest.iter().any(|existing| existing.ptr_eq(link)) {
            dest.push(link.clone());
        }
    }
}
