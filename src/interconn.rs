//! Interfaces between adjacent levels of the memory hierarchy.
//!
//! A level talks to the level below it through [`MemoryRequestConsumer`] and
//! receives data back through [`MemoryRequestProducer`]. Caches, the main
//! memory model and test doubles all implement the same pair of traits, so
//! the hierarchy is polymorphic over what its neighbors actually are.

use crate::packet::Packet;
use crate::sync::{Arc, Mutex, Weak};
use crate::address;

/// Queue selector for occupancy and size queries.
///
/// Discriminants match the external query interface.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum QueueKind {
    MSHR = 0,
    RQ = 1,
    WQ = 2,
    PQ = 3,
    IVQ = 4,
}

/// Outcome of an `add_*q` admission attempt.
///
/// Wire codes (for parity with the integer protocol of the original
/// interface): `Full` = -2, `Forward` = -1, `Merged` = 0,
/// `MergedWriteback` = -3, `MergedInvalidate` = -4, `Queued(n)` = n.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Queue at capacity or admission conflict; retry next cycle.
    Full,
    /// Satisfied by forwarding queued writeback data. The packet's `data`
    /// field now holds the forwarded value and the caller performs its own
    /// `return_data` delivery.
    Forward,
    /// Coalesced into an existing entry of the same queue.
    Merged,
    /// Invalidation folded into a pending writeback.
    MergedWriteback,
    /// Invalidation folded into a pending invalidation.
    MergedInvalidate,
    /// Enqueued; the new occupancy.
    Queued(u32),
}

impl AddResult {
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Full => -2,
            Self::Forward => -1,
            Self::Merged => 0,
            Self::MergedWriteback => -3,
            Self::MergedInvalidate => -4,
            Self::Queued(occupancy) => i64::from(*occupancy),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// What upper levels call on the level below them.
pub trait MemoryRequestConsumer: Send {
    fn add_rq(&mut self, packet: &mut Packet) -> AddResult;
    fn add_wq(&mut self, packet: &mut Packet) -> AddResult;
    fn add_pq(&mut self, packet: &mut Packet) -> AddResult;
    fn add_ivq(&mut self, packet: &mut Packet) -> AddResult;

    fn get_occupancy(&self, queue: QueueKind, address: address) -> u32;
    fn get_size(&self, queue: QueueKind, address: address) -> u32;

    /// The level at which requests admitted here terminate.
    fn fill_level(&self) -> u32;
}

/// What a lower level calls to deliver data for an outstanding miss.
pub trait MemoryRequestProducer: Send {
    fn return_data(&mut self, packet: &Packet);
}

/// Owning handle to a hierarchy component. The simulator driver (or the
/// test harness) holds these; levels themselves never do.
pub type ConsumerHandle = Arc<Mutex<dyn MemoryRequestConsumer>>;

/// Non-owning link to a neighboring level. Both directions of the level
/// tree are non-owning, so the bipartite up/down graph cannot form a
/// reference cycle; each use upgrades and panics only where a wired
/// neighbor is required to exist.
pub type ConsumerLink = Weak<Mutex<dyn MemoryRequestConsumer>>;

/// Non-owning handle to a producer awaiting data. Held inside packets; weak
/// for the same reason as [`ConsumerLink`].
pub type ProducerLink = Weak<Mutex<dyn MemoryRequestProducer>>;

/// Deliver `packet` to every producer still alive on its return list.
///
/// Callers must not hold the lock of any producer on the list.
pub fn deliver_return(packet: &Packet) {
    for link in &packet.to_return {
        if let Some(producer) = link.upgrade() {
            producer.lock().return_data(packet);
        }
    }
}
