//! The per-cycle work of one cache: invalidations first, then the fill and
//! writeback pipelines, then the read-side pipelines.
//!
//! Every drain loop works on the head of its queue and stops at the first
//! entry that cannot complete, leaving it in place for the next cycle. A
//! full downstream queue therefore backpressures the whole pipeline rather
//! than dropping work.

use super::Cache;
use crate::address;
use crate::config::Inclusion;
use crate::interconn::{
    self, AddResult, MemoryRequestConsumer, MemoryRequestProducer, QueueKind,
};
use crate::packet::{Builder, Kind, Packet, NO_EVENT};
use crate::prefetch::{PrefetchRequest, Prefetcher};
use crate::vmem::VirtualMemory;

impl Cache {
    pub(super) fn operate_invalid(&mut self) {
        self.invalid_available_this_cycle = self.config.max_write;
        self.handle_invalid();
        self.ivq.operate();
    }

    pub(super) fn operate_writes(&mut self) {
        // the write port is shared with the invalidation pipeline
        self.writes_available_this_cycle = self.invalid_available_this_cycle;
        self.handle_fill();
        self.handle_writeback();
        self.wq.operate();
    }

    pub(super) fn operate_reads(&mut self) {
        self.reads_available_this_cycle = self.config.max_read;
        self.handle_read();
        self.va_translate_prefetches();
        self.handle_prefetch();
        self.rq.operate();
        self.pq.operate();
        self.vapq.operate();
    }

    fn handle_invalid(&mut self) {
        while self.invalid_available_this_cycle > 0 {
            if !self.ivq.has_ready() {
                return;
            }
            let mut packet = self.ivq.front().expect("ready head").clone();
            debug_assert_eq!(packet.kind, Kind::INVALIDATE);
            log::debug!(
                "{}::handle_invalid({packet}) occupancy={} cycle={}",
                self.name,
                self.ivq.occupancy(),
                self.current_cycle
            );

            if let Some(index) = self.mshr.find(packet.address, self.config.offset_bits) {
                // flag the in-flight miss so the fill pipeline refetches
                self.mshr.get_mut(index).mshr_invalid_count += 1;
            }

            let set = self.get_set(packet.address);
            let way = self.get_way(packet.address, set);

            if packet.fill_level > self.config.fill_level {
                // passing through: pick up dirty data, forward downward,
                // drop the local copy
                if let Some(way) = way {
                    let block = &self.block[set * self.config.num_ways + way];
                    if !packet.data_valid && block.dirty {
                        packet.data = block.data;
                        packet.data_valid = true;
                    }
                }
                let lower = self
                    .lower()
                    .expect("invalidation passing below the last level");
                match lower.lock().add_ivq(&mut packet) {
                    AddResult::Full => return,
                    AddResult::MergedWriteback => {
                        log::trace!("{}::handle_invalid({packet}) merged into writeback", self.name);
                    }
                    AddResult::MergedInvalidate => {
                        log::trace!("{}::handle_invalid({packet}) merged into invalidation", self.name);
                    }
                    _ => {}
                }
                if way.is_some() {
                    self.stats.inc_hit(packet.cpu, packet.kind.into());
                } else {
                    self.stats.inc_miss(packet.cpu, packet.kind.into());
                }
                self.invalidate_entry(packet.address);
            } else if packet.fill_level == self.config.fill_level {
                if let Some(way) = way {
                    let index = set * self.config.num_ways + way;
                    if packet.data_valid {
                        self.block[index].data = packet.data;
                        self.block[index].dirty = true;
                    }
                    self.stats.inc_hit(packet.cpu, packet.kind.into());
                } else if packet.data_valid {
                    // no local copy to absorb the dirty data; keep pushing
                    // it toward memory
                    let lower = self
                        .lower()
                        .expect("invalidation data with no lower level");
                    packet.fill_level = lower.lock().fill_level();
                    if lower.lock().add_ivq(&mut packet).is_full() {
                        return;
                    }
                }
            } else {
                log::error!(
                    "{}::handle_invalid({packet}) fill_level={} below this cache at {}",
                    self.name,
                    packet.fill_level,
                    self.config.fill_level
                );
                panic!("invalidation addressed above its terminal level");
            }

            self.ivq.pop_front();
            self.invalid_available_this_cycle -= 1;
            self.stats.inc_access(packet.cpu, packet.kind.into());
        }
    }

    fn handle_fill(&mut self) {
        while self.writes_available_this_cycle > 0 {
            // return_data keeps returned entries at the front, so only the
            // head can ever be actionable
            let Some(head) = self.mshr.front() else { return };
            if head.event_cycle > self.current_cycle {
                return;
            }

            if self.config.inclusion != Inclusion::NOT_CACHE
                && head.mshr_return_data_invalid_count < head.mshr_invalid_count
            {
                // the block was invalidated while the miss was in flight;
                // installing it would resurrect stale data
                self.reissue_invalidated_miss();
                return;
            }

            if self.config.inclusion != Inclusion::EXCLUSIVE {
                let mut entry = self.mshr.front().expect("checked above").clone();
                let set = self.get_set(entry.address);
                let way = self.victim_way(set, &entry);
                if !self.filllike_miss(set, way, &mut entry) {
                    return;
                }
                if way != self.config.num_ways {
                    entry.data = self.block[set * self.config.num_ways + way].data;
                    interconn::deliver_return(&entry);
                }
            } else {
                // an exclusive level never installs on fill; the data only
                // goes back up
                let entry = self.mshr.front().expect("checked above").clone();
                interconn::deliver_return(&entry);
            }

            self.mshr.remove(0);
            self.writes_available_this_cycle -= 1;
        }
    }

    /// Push the invalidated head-of-MSHR miss back down and re-arm it as
    /// outstanding.
    fn reissue_invalidated_miss(&mut self) {
        let mut new_packet = {
            let head = self.mshr.front().expect("nonempty");
            let mut copy = head.clone();
            // re-issues travel on the physical address
            copy.v_address = head.address;
            copy
        };
        log::debug!(
            "{}::handle_fill({new_packet}) refetching invalidated miss ({}/{})",
            self.name,
            new_packet.mshr_return_data_invalid_count,
            new_packet.mshr_invalid_count
        );

        let is_read = self.config.prefetch_as_load || new_packet.kind != Kind::PREFETCH;
        if !self.lower_has_room(&mut new_packet, is_read) {
            return;
        }
        new_packet.test_packet = false;

        let entry = self.mshr.insert(new_packet.clone());
        entry.event_cycle = NO_EVENT;

        if new_packet.fill_level <= self.config.fill_level {
            new_packet.to_return = vec![self.self_link.clone().expect("cache not registered")];
        } else {
            new_packet.to_return.clear();
        }

        let lower = self.lower().expect("reissue with no lower level");
        let result = if is_read {
            lower.lock().add_rq(&mut new_packet)
        } else {
            lower.lock().add_pq(&mut new_packet)
        };
        if result == AddResult::Forward && !new_packet.to_return.is_empty() {
            MemoryRequestProducer::return_data(self, &new_packet);
        }

        self.mshr.remove(0);
    }

    fn handle_writeback(&mut self) {
        while self.writes_available_this_cycle > 0 {
            if !self.wq.has_ready() {
                return;
            }
            let mut packet = self.wq.front().expect("ready head").clone();
            log::debug!(
                "{}::handle_writeback({packet}) occupancy={} cycle={}",
                self.name,
                self.wq.occupancy(),
                self.current_cycle
            );

            if packet.kind == Kind::NON_VALID {
                // a cancelled writeback: the invalidation that overtook it
                // already carried the data away
                self.stats.inc_access(packet.cpu, packet.kind.into());
                self.stats.inc_hit(packet.cpu, packet.kind.into());
                self.writes_available_this_cycle -= 1;
                self.wq.pop_front();
                return;
            }

            let set = self.get_set(packet.address);
            match self.get_way(packet.address, set) {
                Some(way) => {
                    debug_assert_ne!(self.config.inclusion, Inclusion::EXCLUSIVE);
                    let index = set * self.config.num_ways + way;
                    let block_addr = self.block[index].address;
                    self.update_replacement_state(
                        packet.cpu, set, way, block_addr, packet.ip, 0, packet.kind, true,
                    );
                    self.stats.inc_hit(packet.cpu, packet.kind.into());
                    self.stats.inc_access(packet.cpu, packet.kind.into());
                    self.block[index].dirty = true;
                }
                None => {
                    let success = if packet.kind == Kind::RFO && packet.to_return.is_empty() {
                        // a store straight from the cpu wants the data
                        self.readlike_miss(&mut packet)
                    } else {
                        let way = self.victim_way(set, &packet);
                        self.filllike_miss(set, way, &mut packet)
                    };
                    if !success {
                        return;
                    }
                }
            }

            self.writes_available_this_cycle -= 1;
            self.wq.pop_front();
        }
    }

    fn handle_read(&mut self) {
        while self.reads_available_this_cycle > 0 {
            if !self.rq.has_ready() {
                return;
            }
            let mut packet = self.rq.front().expect("ready head").clone();

            // decides whether evictions report physical or virtual addresses
            // to the prefetcher
            self.ever_seen_data |= packet.v_address != packet.ip;

            let set = self.get_set(packet.address);
            match self.get_way(packet.address, set) {
                Some(way) => self.readlike_hit(set, way, &mut packet),
                None => {
                    if !self.readlike_miss(&mut packet) {
                        return;
                    }
                }
            }

            self.rq.pop_front();
            self.reads_available_this_cycle -= 1;
        }
    }

    fn handle_prefetch(&mut self) {
        while self.reads_available_this_cycle > 0 {
            if !self.pq.has_ready() {
                return;
            }
            let mut packet = self.pq.front().expect("ready head").clone();

            let set = self.get_set(packet.address);
            match self.get_way(packet.address, set) {
                Some(way) => self.readlike_hit(set, way, &mut packet),
                None => {
                    if !self.readlike_miss(&mut packet) {
                        return;
                    }
                }
            }

            self.pq.pop_front();
            self.reads_available_this_cycle -= 1;
        }
    }

    fn readlike_hit(&mut self, set: usize, way: usize, packet: &mut Packet) {
        log::debug!(
            "{}::readlike_hit({packet}) set={set} way={way} cycle={}",
            self.name,
            self.current_cycle
        );
        let index = set * self.config.num_ways + way;

        packet.data = self.block[index].data;
        if self.block[index].dirty {
            packet.data_valid = true;
        }

        if self.should_activate_prefetcher(packet.kind)
            && packet.pf_origin_level < self.config.fill_level
        {
            self.cpu = packet.cpu;
            let base = self.prefetch_base(packet);
            packet.pf_metadata =
                self.prefetcher_cache_operate(base, packet.ip, true, packet.kind, packet.pf_metadata);
        }

        if self.config.inclusion == Inclusion::EXCLUSIVE {
            // an exclusive read moves the line up; the local copy dies
            self.invalidate_entry(packet.address);
        }

        let block_addr = self.block[index].address;
        self.update_replacement_state(
            packet.cpu, set, way, block_addr, packet.ip, 0, packet.kind, true,
        );

        self.stats.inc_hit(packet.cpu, packet.kind.into());
        self.stats.inc_access(packet.cpu, packet.kind.into());

        interconn::deliver_return(packet);

        if self.block[index].prefetch {
            self.stats.prefetch.useful += 1;
            self.block[index].prefetch = false;
        }
    }

    /// Handle a read-side miss: merge into an in-flight miss or allocate an
    /// MSHR entry and forward downward. Returns false if nothing could be
    /// done this cycle.
    fn readlike_miss(&mut self, packet: &mut Packet) -> bool {
        log::debug!(
            "{}::readlike_miss({packet}) cycle={}",
            self.name,
            self.current_cycle
        );
        let offset_bits = self.config.offset_bits;

        if let Some(index) = self.mshr.find(packet.address, offset_bits) {
            // already in flight: fold this request in
            let mut upgraded_prefetch = false;
            {
                let our_level = self.config.fill_level;
                let entry = self.mshr.get_mut(index);
                entry.fill_level = entry.fill_level.min(packet.fill_level);
                crate::packet::dep_merge(
                    &mut entry.lq_index_depend_on_me,
                    &packet.lq_index_depend_on_me,
                );
                crate::packet::dep_merge(
                    &mut entry.sq_index_depend_on_me,
                    &packet.sq_index_depend_on_me,
                );
                crate::packet::dep_merge(&mut entry.instr_depend_on_me, &packet.instr_depend_on_me);
                crate::packet::return_merge(&mut entry.to_return, &packet.to_return);

                if entry.kind == Kind::PREFETCH && packet.kind != Kind::PREFETCH {
                    // a demand caught up with an in-flight prefetch: the
                    // entry takes the demand's identity, but keeps its
                    // returned-or-not status
                    upgraded_prefetch = entry.pf_origin_level == our_level;
                    let prior_event_cycle = entry.event_cycle;
                    *entry = packet.clone();
                    entry.event_cycle = prior_event_cycle;
                }
            }
            if upgraded_prefetch {
                self.stats.prefetch.useful += 1;
            }
        } else {
            if self.mshr.full() {
                return false;
            }

            let is_read = self.config.prefetch_as_load || packet.kind != Kind::PREFETCH;
            if !self.lower_has_room(packet, is_read) {
                return false;
            }
            packet.test_packet = false;

            if packet.fill_level <= self.config.fill_level {
                let cycle = self.current_cycle;
                let entry = self.mshr.insert(packet.clone());
                entry.cycle_enqueued = cycle;
                entry.event_cycle = NO_EVENT;
                packet.to_return = vec![self.self_link.clone().expect("cache not registered")];
            } else {
                packet.to_return.clear();
            }

            let lower = self.lower().expect("miss with no lower level");
            let result = if is_read {
                lower.lock().add_rq(packet)
            } else {
                lower.lock().add_pq(packet)
            };
            if result == AddResult::Forward && !packet.to_return.is_empty() {
                // the write queue below answered immediately
                MemoryRequestProducer::return_data(self, packet);
            }
        }

        if self.should_activate_prefetcher(packet.kind)
            && packet.pf_origin_level < self.config.fill_level
        {
            self.cpu = packet.cpu;
            let base = self.prefetch_base(packet);
            packet.pf_metadata =
                self.prefetcher_cache_operate(base, packet.ip, false, packet.kind, packet.pf_metadata);
        }
        true
    }

    /// Install `packet` into (`set`, `way`), evicting the victim.
    ///
    /// The victim may require a writeback to the lower level and, on an
    /// inclusive cache, invalidations to both upper levels. Each sub-step is
    /// guarded so a stalled retry next cycle never duplicates one that
    /// already went out.
    pub(super) fn filllike_miss(&mut self, set: usize, way: usize, packet: &mut Packet) -> bool {
        log::debug!(
            "{}::filllike_miss({packet}) set={set} way={way} cycle={}",
            self.name,
            self.current_cycle
        );
        let num_ways = self.config.num_ways;
        let bypass = way == num_ways;
        debug_assert!(!(packet.kind == Kind::WRITEBACK && bypass));
        debug_assert_ne!(packet.kind, Kind::INVALIDATE);

        let mut evicting_address = 0;

        if !bypass {
            let index = set * num_ways + way;
            let evicting_dirty = self.lower_level.is_some() && self.block[index].dirty;

            if self.block[index].valid {
                if self.eviction.send_wb_valid {
                    if let Some(lower) = self.lower() {
                        let send = self.config.inclusion != Inclusion::NOT_CACHE || evicting_dirty;
                        if send {
                            let kind = if self.config.inclusion == Inclusion::NOT_CACHE {
                                Kind::WRITEBACK
                            } else if evicting_dirty {
                                Kind::WRITEBACK
                            } else {
                                Kind::WRITEBACK_EXCLUSIVE
                            };
                            let mut writeback = Builder {
                                kind,
                                address: self.block[index].address,
                                v_address: 0,
                                ip: 0,
                                instr_id: packet.instr_id,
                                cpu: packet.cpu,
                                fill_level: lower.lock().fill_level(),
                            }
                            .build();
                            writeback.data = self.block[index].data;
                            writeback.inv_ongoing =
                                if self.config.inclusion == Inclusion::INCLUSIVE {
                                    2
                                } else {
                                    0
                                };
                            if lower.lock().add_wq(&mut writeback).is_full() {
                                return false;
                            }
                        }
                    }
                    self.eviction.send_wb_valid = false;
                }

                if self.config.inclusion == Inclusion::INCLUSIVE {
                    let lower_fill_level = self
                        .lower()
                        .expect("inclusive cache without lower level")
                        .lock()
                        .fill_level();
                    let mut invalidation = Builder {
                        kind: Kind::INVALIDATE,
                        address: self.block[index].address,
                        v_address: 0,
                        ip: 0,
                        instr_id: packet.instr_id,
                        cpu: packet.cpu,
                        fill_level: lower_fill_level,
                    }
                    .build();

                    let mut skipped = false;
                    for upper_index in 0..2 {
                        let Some(upper) = self.upper(upper_index) else {
                            continue;
                        };
                        if !self.eviction.send_inv_valid[upper_index] {
                            continue;
                        }
                        if upper.lock().add_ivq(&mut invalidation).is_full() {
                            skipped = true;
                        } else {
                            self.eviction.send_inv_valid[upper_index] = false;
                        }
                    }
                    if skipped {
                        log::trace!(
                            "{}::filllike_miss({packet}) upstream invalidation incomplete",
                            self.name
                        );
                        return false;
                    }
                    self.eviction.send_inv_valid = [true; 2];
                }
                self.eviction.send_wb_valid = true;
            }

            let raw_evicting = if self.ever_seen_data {
                self.block[index].address
            } else {
                self.block[index].v_address
            };
            evicting_address = raw_evicting
                & !crate::util::bitmask(if self.config.match_offset_bits {
                    0
                } else {
                    self.config.offset_bits
                });

            if self.block[index].prefetch && self.block[index].valid {
                // an evicted prefetch that never saw a demand hit
                self.stats.prefetch.useless += 1;
            }
            if packet.kind == Kind::PREFETCH {
                self.stats.prefetch.fill += 1;
            }

            let fill_level = self.config.fill_level;
            let offset_bits = self.config.offset_bits;
            let block = &mut self.block[index];
            block.valid = true;
            block.prefetch = packet.kind == Kind::PREFETCH && packet.pf_origin_level == fill_level;
            block.dirty = packet.kind == Kind::WRITEBACK
                || (packet.kind == Kind::RFO && packet.to_return.is_empty())
                || packet.data_valid;
            block.address = packet.address;
            block.v_address = packet.v_address;
            block.tag = packet.address >> offset_bits;
            block.data = packet.data;
            block.ip = packet.ip;
            block.cpu = packet.cpu;
            block.instr_id = packet.instr_id;
        }

        if self.warmup_done(packet.cpu) && packet.cycle_enqueued != 0 {
            self.stats.total_miss_latency += self.current_cycle - packet.cycle_enqueued;
        }

        self.cpu = packet.cpu;
        let base = self.prefetch_base(packet);
        packet.pf_metadata = self.prefetcher_cache_fill(
            base,
            set,
            way,
            packet.kind == Kind::PREFETCH,
            evicting_address,
            packet.pf_metadata,
        );

        self.update_replacement_state(
            packet.cpu, set, way, packet.address, packet.ip, 0, packet.kind, false,
        );

        self.stats.inc_miss(packet.cpu, packet.kind.into());
        self.stats.inc_access(packet.cpu, packet.kind.into());
        true
    }

    /// Translate the head of the VAPQ and hand it to the prefetch queue.
    /// One entry per cycle.
    fn va_translate_prefetches(&mut self) {
        if !self.vapq.has_ready() {
            return;
        }
        let mut packet = self.vapq.front().expect("ready head").clone();
        let vmem = self
            .vmem
            .clone()
            .expect("virtual prefetch without a translator");
        packet.address = vmem.lock().va_to_pa(packet.cpu, packet.v_address).0;

        let result = self.add_pq(&mut packet);
        if !result.is_full() {
            self.vapq.pop_front();
        }
        if result.is_queued() {
            self.stats.prefetch.issued += 1;
        }
    }

    /// Issue a prefetch for `pf_addr`, either into this level or only into
    /// the level below. Returns false if the request could not be accepted
    /// this cycle.
    pub fn prefetch_line(&mut self, pf_addr: address, fill_this_level: bool, metadata: u32) -> bool {
        self.stats.prefetch.requested += 1;

        let fill_level = if fill_this_level {
            self.config.fill_level
        } else {
            self.lower()
                .expect("prefetch below the last level")
                .lock()
                .fill_level()
        };
        let mut packet = Builder {
            kind: Kind::PREFETCH,
            address: pf_addr,
            v_address: if self.config.virtual_prefetch { pf_addr } else { 0 },
            ip: 0,
            instr_id: 0,
            cpu: self.cpu,
            fill_level,
        }
        .build();
        packet.pf_origin_level = self.config.fill_level;
        packet.pf_metadata = metadata;

        if self.config.virtual_prefetch {
            if self.vapq.full() {
                return false;
            }
            self.vapq.push_back(packet);
            true
        } else {
            let result = self.add_pq(&mut packet);
            if result.is_full() {
                return false;
            }
            if result.is_queued() {
                self.stats.prefetch.issued += 1;
            }
            true
        }
    }

    /// Probe whether the lower level can take one more miss this cycle.
    /// Probes are side-effect free on every consumer.
    fn lower_has_room(&self, packet: &mut Packet, is_read: bool) -> bool {
        let queue = if is_read { QueueKind::RQ } else { QueueKind::PQ };
        let Some(lower) = self.lower() else {
            return false;
        };
        packet.test_packet = true;
        let room = {
            let mut guard = lower.lock();
            let probe = guard.add_rq(packet);
            !probe.is_full()
                && guard.get_occupancy(queue, packet.address) != guard.get_size(queue, packet.address)
        };
        packet.test_packet = false;
        room
    }

    fn prefetcher_cache_operate(
        &mut self,
        addr: address,
        ip: address,
        cache_hit: bool,
        kind: Kind,
        metadata: u32,
    ) -> u32 {
        let mut issue = std::mem::take(&mut self.pf_issue);
        let metadata = self
            .prefetcher
            .cache_operate(addr, ip, cache_hit, kind, metadata, &mut issue);
        self.drain_prefetches(&mut issue);
        self.pf_issue = issue;
        metadata
    }

    fn prefetcher_cache_fill(
        &mut self,
        addr: address,
        set: usize,
        way: usize,
        prefetch: bool,
        evicted_addr: address,
        metadata: u32,
    ) -> u32 {
        let mut issue = std::mem::take(&mut self.pf_issue);
        let metadata = self
            .prefetcher
            .cache_fill(addr, set, way, prefetch, evicted_addr, metadata, &mut issue);
        self.drain_prefetches(&mut issue);
        self.pf_issue = issue;
        metadata
    }

    pub(super) fn drain_prefetches(&mut self, issue: &mut Vec<PrefetchRequest>) {
        for request in issue.drain(..) {
            self.prefetch_line(request.address, request.fill_this_level, request.metadata);
        }
    }
}

impl MemoryRequestProducer for Cache {
    /// Accept returned data from the lower level for an outstanding miss.
    ///
    /// The matched entry is armed with the fill latency and moved behind all
    /// previously returned entries but ahead of everything still
    /// outstanding, keeping the returned prefix of the MSHR contiguous.
    fn return_data(&mut self, packet: &Packet) {
        let Some(index) = self.mshr.find(packet.address, self.config.offset_bits) else {
            log::error!(
                "{}::return_data({packet}) no matching MSHR entry (occupancy {}/{}, cycle {})",
                self.name,
                self.mshr.occupancy(),
                self.mshr.size(),
                self.current_cycle
            );
            panic!("return_data without a matching MSHR entry");
        };
        let first_unreturned = self.mshr.first_unreturned().unwrap_or(index);

        let fill_latency = if self.warmup_done(packet.cpu) {
            self.config.fill_latency
        } else {
            0
        };
        let event_cycle = self.current_cycle + fill_latency;
        let entry = self.mshr.get_mut(index);
        entry.data = packet.data;
        entry.pf_metadata = packet.pf_metadata;
        entry.event_cycle = event_cycle;
        entry.mshr_return_data_invalid_count = packet.mshr_invalid_count;

        log::debug!(
            "{}::return_data({packet}) event_cycle={event_cycle} occupancy={}",
            self.name,
            self.mshr.occupancy()
        );

        self.mshr.reorder_returned(index, first_unreturned);
    }
}
