//! Queue admission: duplicate detection, writeback forwarding and merge
//! accounting for the four externally visible queues.

use super::Cache;
use crate::config::Inclusion;
use crate::interconn::AddResult;
use crate::packet::{self, Kind, Packet};
use std::cmp::Ordering;

impl Cache {
    /// Admit a demand read.
    ///
    /// Probes (`test_packet`) only report whether admission would conflict
    /// with a pending invalidation; they never touch queue state.
    pub fn add_rq(&mut self, packet: &mut Packet) -> AddResult {
        debug_assert_ne!(packet.address, 0);
        let offset_bits = self.config.offset_bits;

        if packet.test_packet {
            if self.config.inclusion != Inclusion::NOT_CACHE
                && self
                    .ivq
                    .iter()
                    .any(|queued| queued.matches(packet.address, offset_bits))
            {
                log::trace!("{}::add_rq({packet}) probe: invalidation conflict", self.name);
                return AddResult::Full;
            }
            return AddResult::Queued(self.rq.occupancy());
        }

        self.stats.rq.access += 1;
        log::trace!(
            "{}::add_rq({packet}) occupancy={} cycle={}",
            self.name,
            self.rq.occupancy(),
            self.current_cycle
        );

        // the freshest copy of the block may sit in the write queue; a
        // settled writeback answers the read immediately
        let wq_shift = if self.config.match_offset_bits {
            0
        } else {
            offset_bits
        };
        if let Some(found) = self
            .wq
            .iter()
            .find(|queued| queued.matches(packet.address, wq_shift))
        {
            if found.inv_ongoing == 0 && found.kind != Kind::NON_VALID {
                packet.data = found.data;
                self.stats.wq.forward += 1;
                log::debug!("{}::add_rq({packet}) forwarded from WQ", self.name);
                return AddResult::Forward;
            }
        }

        if let Some(found) = self
            .rq
            .iter_mut()
            .find(|queued| queued.matches(packet.address, offset_bits))
        {
            packet::dep_merge(&mut found.lq_index_depend_on_me, &packet.lq_index_depend_on_me);
            packet::dep_merge(&mut found.sq_index_depend_on_me, &packet.sq_index_depend_on_me);
            packet::dep_merge(&mut found.instr_depend_on_me, &packet.instr_depend_on_me);
            packet::return_merge(&mut found.to_return, &packet.to_return);
            self.stats.rq.merged += 1;
            return AddResult::Merged;
        }

        if self.rq.full() {
            self.stats.rq.full += 1;
            return AddResult::Full;
        }

        if self.warmup_done(packet.cpu) {
            self.rq.push_back(packet.clone());
        } else {
            self.rq.push_back_ready(packet.clone());
        }
        self.stats.rq.to_cache += 1;
        AddResult::Queued(self.rq.occupancy())
    }

    /// Admit a writeback or a store.
    pub fn add_wq(&mut self, packet: &mut Packet) -> AddResult {
        // clean handoffs are only meaningful to an exclusive level; anyone
        // else swallows them silently
        if self.config.inclusion != Inclusion::EXCLUSIVE
            && packet.kind == Kind::WRITEBACK_EXCLUSIVE
        {
            return AddResult::Merged;
        }

        self.stats.wq.access += 1;
        log::trace!(
            "{}::add_wq({packet}) occupancy={} cycle={}",
            self.name,
            self.wq.occupancy(),
            self.current_cycle
        );

        let shift = if self.config.match_offset_bits {
            0
        } else {
            self.config.offset_bits
        };
        if self
            .wq
            .iter()
            .any(|queued| queued.matches(packet.address, shift))
        {
            self.stats.wq.merged += 1;
            return AddResult::Merged;
        }

        if self.wq.full() {
            self.stats.wq.full += 1;
            return AddResult::Full;
        }

        if self.warmup_done(packet.cpu) {
            self.wq.push_back(packet.clone());
        } else {
            self.wq.push_back_ready(packet.clone());
        }
        self.stats.wq.to_cache += 1;
        AddResult::Queued(self.wq.occupancy())
    }

    /// Admit a prefetch.
    pub fn add_pq(&mut self, packet: &mut Packet) -> AddResult {
        debug_assert_ne!(packet.address, 0);
        self.stats.pq.access += 1;
        log::trace!(
            "{}::add_pq({packet}) occupancy={} cycle={}",
            self.name,
            self.pq.occupancy(),
            self.current_cycle
        );

        let shift = if self.config.match_offset_bits {
            0
        } else {
            self.config.offset_bits
        };
        if self
            .ivq
            .iter()
            .any(|queued| queued.matches(packet.address, shift))
        {
            log::trace!("{}::add_pq({packet}) invalidation conflict", self.name);
            return AddResult::Full;
        }

        if let Some(found) = self
            .wq
            .iter()
            .find(|queued| queued.matches(packet.address, shift))
        {
            packet.data = found.data;
            self.stats.wq.forward += 1;
            log::debug!("{}::add_pq({packet}) forwarded from WQ", self.name);
            return AddResult::Forward;
        }

        let offset_bits = self.config.offset_bits;
        if let Some(found) = self
            .pq
            .iter_mut()
            .find(|queued| queued.matches(packet.address, offset_bits))
        {
            found.fill_level = found.fill_level.min(packet.fill_level);
            packet::return_merge(&mut found.to_return, &packet.to_return);
            self.stats.pq.merged += 1;
            return AddResult::Merged;
        }

        if self.pq.full() {
            self.stats.pq.full += 1;
            return AddResult::Full;
        }

        if self.warmup_done(packet.cpu) {
            self.pq.push_back(packet.clone());
        } else {
            self.pq.push_back_ready(packet.clone());
        }
        self.stats.pq.to_cache += 1;
        AddResult::Queued(self.pq.occupancy())
    }

    /// Admit an invalidation from the level above.
    ///
    /// An invalidation may cancel or merge into a writeback already queued
    /// for the same block, and coalesces with a pending invalidation for the
    /// same block.
    pub fn add_ivq(&mut self, packet: &mut Packet) -> AddResult {
        debug_assert_eq!(packet.kind, Kind::INVALIDATE);
        self.stats.ivq.access += 1;
        log::trace!(
            "{}::add_ivq({packet}) occupancy={} fill_level={} cycle={}",
            self.name,
            self.ivq.occupancy(),
            packet.fill_level,
            self.current_cycle
        );

        if self.ivq.full() {
            self.stats.ivq.full += 1;
            return AddResult::Full;
        }

        let offset_bits = self.config.offset_bits;
        if let Some(found) = self
            .wq
            .iter_mut()
            .find(|queued| queued.matches(packet.address, offset_bits))
        {
            match found.fill_level.cmp(&packet.fill_level) {
                Ordering::Equal => {
                    // an upstream ack caught up with the writeback it was
                    // holding back
                    if packet.data_valid {
                        found.data = packet.data;
                    }
                    found.inv_ongoing -= packet.merge_count;
                    debug_assert!(found.inv_ongoing >= 0);
                    return AddResult::MergedWriteback;
                }
                Ordering::Less => {
                    // the writeback dies; its dirty data rides down on the
                    // invalidation instead
                    if !packet.data_valid && found.kind != Kind::WRITEBACK_EXCLUSIVE {
                        packet.data = found.data;
                        packet.data_valid = true;
                    }
                    found.kind = Kind::NON_VALID;
                    self.stats.ivq.merged += 1;
                }
                Ordering::Greater => {
                    log::error!(
                        "{}::add_ivq({packet}) writeback at level {} outranks invalidation at level {}",
                        self.name,
                        found.fill_level,
                        packet.fill_level
                    );
                    panic!("invalidation outranked by a queued writeback");
                }
            }
        }

        if let Some(found) = self
            .ivq
            .iter_mut()
            .find(|queued| queued.matches(packet.address, offset_bits))
        {
            if found.fill_level == packet.fill_level {
                found.merge_count += 1;
            }
            found.fill_level = found.fill_level.max(packet.fill_level);
            self.stats.ivq.merged += 1;
            return AddResult::MergedInvalidate;
        }

        if self.warmup_done(packet.cpu) {
            self.ivq.push_back(packet.clone());
        } else {
            self.ivq.push_back_ready(packet.clone());
        }
        self.stats.ivq.to_cache += 1;
        AddResult::Queued(self.ivq.occupancy())
    }
}
