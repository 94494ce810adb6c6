//! Fixed-latency stand-in for the memory controller at the bottom of the
//! hierarchy. No banks, channels or scheduling: every read is answered a
//! constant number of cycles after admission, writes are absorbed.

use crate::interconn::{self, AddResult, MemoryRequestConsumer, QueueKind};
use crate::packet::{self, Kind, Packet};
use crate::queue::DelayQueue;
use crate::sync::{Arc, Mutex};
use crate::{address, Operable};

pub struct MainMemory {
    pub name: String,
    fill_level: u32,
    offset_bits: u32,
    max_read: u32,
    max_write: u32,
    rq: DelayQueue<Packet>,
    wq: DelayQueue<Packet>,
}

pub struct Builder {
    pub name: String,
    pub latency: u64,
    pub queue_size: usize,
    pub offset_bits: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: "DRAM".to_string(),
            latency: 100,
            queue_size: 64,
            offset_bits: 6,
        }
    }
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Arc<Mutex<MainMemory>> {
        Arc::new(Mutex::new(MainMemory {
            name: self.name,
            fill_level: u32::MAX,
            offset_bits: self.offset_bits,
            max_read: 4,
            max_write: 4,
            rq: DelayQueue::new(self.queue_size, self.latency),
            wq: DelayQueue::new(self.queue_size, self.latency),
        }))
    }
}

impl MemoryRequestConsumer for MainMemory {
    fn add_rq(&mut self, packet: &mut Packet) -> AddResult {
        debug_assert_ne!(packet.address, 0);
        if packet.test_packet {
            return AddResult::Queued(self.rq.occupancy());
        }
        log::trace!("{}::add_rq({packet}) occupancy={}", self.name, self.rq.occupancy());

        if let Some(found) = self
            .wq
            .iter()
            .find(|queued| queued.matches(packet.address, self.offset_bits))
        {
            packet.data = found.data;
            return AddResult::Forward;
        }

        if let Some(found) = self
            .rq
            .iter_mut()
            .find(|queued| queued.matches(packet.address, self.offset_bits))
        {
            packet::return_merge(&mut found.to_return, &packet.to_return);
            packet::dep_merge(&mut found.lq_index_depend_on_me, &packet.lq_index_depend_on_me);
            packet::dep_merge(&mut found.sq_index_depend_on_me, &packet.sq_index_depend_on_me);
            packet::dep_merge(&mut found.instr_depend_on_me, &packet.instr_depend_on_me);
            return AddResult::Merged;
        }

        if self.rq.full() {
            return AddResult::Full;
        }
        self.rq.push_back(packet.clone());
        AddResult::Queued(self.rq.occupancy())
    }

    fn add_wq(&mut self, packet: &mut Packet) -> AddResult {
        if packet.test_packet {
            return AddResult::Queued(self.wq.occupancy());
        }
        log::trace!("{}::add_wq({packet}) occupancy={}", self.name, self.wq.occupancy());

        if self
            .wq
            .iter()
            .any(|queued| queued.matches(packet.address, self.offset_bits))
        {
            return AddResult::Merged;
        }
        if self.wq.full() {
            return AddResult::Full;
        }
        self.wq.push_back(packet.clone());
        AddResult::Queued(self.wq.occupancy())
    }

    fn add_pq(&mut self, packet: &mut Packet) -> AddResult {
        // prefetches read memory like demands do
        self.add_rq(packet)
    }

    fn add_ivq(&mut self, packet: &mut Packet) -> AddResult {
        if packet.test_packet {
            return AddResult::Queued(self.wq.occupancy());
        }
        // an invalidation that reaches memory is just a write of whatever
        // dirty data it carried
        if self.wq.full() {
            return AddResult::Full;
        }
        if packet.data_valid {
            let mut write = packet.clone();
            write.kind = Kind::WRITEBACK;
            self.wq.push_back(write);
        }
        AddResult::Queued(self.wq.occupancy())
    }

    fn get_occupancy(&self, queue: QueueKind, _address: address) -> u32 {
        match queue {
            QueueKind::MSHR => 0,
            QueueKind::RQ | QueueKind::PQ => self.rq.occupancy(),
            QueueKind::WQ | QueueKind::IVQ => self.wq.occupancy(),
        }
    }

    fn get_size(&self, queue: QueueKind, _address: address) -> u32 {
        match queue {
            QueueKind::MSHR => 0,
            QueueKind::RQ | QueueKind::PQ => self.rq.size(),
            QueueKind::WQ | QueueKind::IVQ => self.wq.size(),
        }
    }

    fn fill_level(&self) -> u32 {
        self.fill_level
    }
}

impl Operable for MainMemory {
    fn operate(&mut self, _cycle: u64) {
        for _ in 0..self.max_read {
            if !self.rq.has_ready() {
                break;
            }
            let packet = self.rq.pop_front().expect("ready head");
            log::debug!("{}::operate answering {packet}", self.name);
            interconn::deliver_return(&packet);
        }
        for _ in 0..self.max_write {
            if !self.wq.has_ready() {
                break;
            }
            self.wq.pop_front();
        }
        self.rq.operate();
        self.wq.operate();
    }

    fn busy(&self) -> bool {
        !self.rq.is_empty() || !self.wq.is_empty()
    }
}
