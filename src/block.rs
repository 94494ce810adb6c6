use crate::address;

/// One cache line's worth of bookkeeping.
///
/// No line data is modeled; `data` is an opaque word carried along so that
/// forwarding paths can be checked end to end. While `valid` is unset the
/// remaining fields are unspecified.
#[derive(Debug, Clone)]
pub struct Block {
    pub valid: bool,
    pub dirty: bool,
    pub prefetch: bool,

    pub address: address,
    pub v_address: address,
    pub tag: address,
    pub data: u64,
    pub ip: address,
    pub instr_id: u64,
    pub cpu: usize,

    /// Replacement-state word, owned by the replacement policy.
    pub lru: u32,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            valid: false,
            dirty: false,
            prefetch: false,
            address: 0,
            v_address: 0,
            tag: 0,
            data: 0,
            ip: 0,
            instr_id: 0,
            cpu: 0,
            lru: u32::MAX >> 1,
        }
    }
}

impl Block {
    /// True if this block holds `addr`'s line at `offset_bits` granularity.
    #[must_use]
    pub fn matches(&self, addr: address, offset_bits: u32) -> bool {
        self.valid && (self.address >> offset_bits) == (addr >> offset_bits)
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.valid {
            write!(
                f,
                "Block({:#x}{}{})",
                self.address,
                if self.dirty { " dirty" } else { "" },
                if self.prefetch { " pf" } else { "" },
            )
        } else {
            write!(f, "Block(invalid)")
        }
    }
}
