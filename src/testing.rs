//! Deterministic stand-ins for the neighbors of a cache under test.

use crate::interconn::{
    AddResult, MemoryRequestConsumer, MemoryRequestProducer, ProducerLink, QueueKind,
};
use crate::packet::Packet;
use crate::sync::{Arc, Mutex};
use crate::address;

/// A producer that records every packet returned to it.
pub struct RequestSink {
    pub name: String,
    pub returned: Vec<Packet>,
}

impl RequestSink {
    #[must_use]
    pub fn new(name: &str) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            name: name.to_string(),
            returned: Vec::new(),
        }))
    }

    /// A weak producer handle suitable for a packet's return list.
    #[must_use]
    pub fn link(sink: &Arc<Mutex<Self>>) -> ProducerLink {
        let producer: Arc<Mutex<dyn MemoryRequestProducer>> = sink.clone();
        Arc::downgrade(&producer)
    }

    /// How many returns matched `addr`'s block.
    #[must_use]
    pub fn count_for(&self, addr: address, offset_bits: u32) -> usize {
        self.returned
            .iter()
            .filter(|packet| packet.matches(addr, offset_bits))
            .count()
    }
}

impl MemoryRequestProducer for RequestSink {
    fn return_data(&mut self, packet: &Packet) {
        log::debug!("{}::return_data({packet})", self.name);
        self.returned.push(packet.clone());
    }
}

/// A scriptable neighboring level: records what it is asked to admit and
/// can be told to refuse any of its queues.
pub struct StubLevel {
    pub name: String,
    pub level: u32,
    pub queue_size: u32,

    pub reject_rq: bool,
    pub reject_wq: bool,
    pub reject_pq: bool,
    pub reject_ivq: bool,

    pub rq: Vec<Packet>,
    pub wq: Vec<Packet>,
    pub pq: Vec<Packet>,
    pub ivq: Vec<Packet>,
}

impl StubLevel {
    #[must_use]
    pub fn new(name: &str, level: u32) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            name: name.to_string(),
            level,
            queue_size: 64,
            reject_rq: false,
            reject_wq: false,
            reject_pq: false,
            reject_ivq: false,
            rq: Vec::new(),
            wq: Vec::new(),
            pq: Vec::new(),
            ivq: Vec::new(),
        }))
    }
}

impl MemoryRequestConsumer for StubLevel {
    fn add_rq(&mut self, packet: &mut Packet) -> AddResult {
        if packet.test_packet {
            return AddResult::Queued(self.rq.len() as u32);
        }
        if self.reject_rq {
            return AddResult::Full;
        }
        self.rq.push(packet.clone());
        AddResult::Queued(self.rq.len() as u32)
    }

    fn add_wq(&mut self, packet: &mut Packet) -> AddResult {
        if packet.test_packet {
            return AddResult::Queued(self.wq.len() as u32);
        }
        if self.reject_wq {
            return AddResult::Full;
        }
        self.wq.push(packet.clone());
        AddResult::Queued(self.wq.len() as u32)
    }

    fn add_pq(&mut self, packet: &mut Packet) -> AddResult {
        if packet.test_packet {
            return AddResult::Queued(self.pq.len() as u32);
        }
        if self.reject_pq {
            return AddResult::Full;
        }
        self.pq.push(packet.clone());
        AddResult::Queued(self.pq.len() as u32)
    }

    fn add_ivq(&mut self, packet: &mut Packet) -> AddResult {
        if packet.test_packet {
            return AddResult::Queued(self.ivq.len() as u32);
        }
        if self.reject_ivq {
            return AddResult::Full;
        }
        self.ivq.push(packet.clone());
        AddResult::Queued(self.ivq.len() as u32)
    }

    fn get_occupancy(&self, queue: QueueKind, _address: address) -> u32 {
        match queue {
            QueueKind::MSHR => 0,
            QueueKind::RQ => self.rq.len() as u32,
            QueueKind::WQ => self.wq.len() as u32,
            QueueKind::PQ => self.pq.len() as u32,
            QueueKind::IVQ => self.ivq.len() as u32,
        }
    }

    fn get_size(&self, queue: QueueKind, _address: address) -> u32 {
        match queue {
            QueueKind::MSHR => u32::MAX,
            _ => self.queue_size,
        }
    }

    fn fill_level(&self) -> u32 {
        self.level
    }
}
