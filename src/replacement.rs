use crate::address;
use crate::block::Block;
use crate::packet::Kind;

/// Victim selection and recency bookkeeping for one cache.
///
/// Policies keep their per-line state in the block's `lru` word; the cache
/// treats both the word and the policy's decisions as opaque. `set_blocks`
/// always spans exactly one set, so `way` indexes into it directly.
pub trait ReplacementPolicy: Send {
    /// Pick the way to evict from a set with no invalid blocks.
    fn find_victim(
        &mut self,
        cpu: usize,
        instr_id: u64,
        set: usize,
        set_blocks: &[Block],
        ip: address,
        addr: address,
        kind: Kind,
    ) -> usize;

    /// Record an access to `way`. Called with `hit = false` on fills; `way`
    /// equals the set size when the fill bypassed the block array.
    #[allow(clippy::too_many_arguments)]
    fn update_state(
        &mut self,
        set_blocks: &mut [Block],
        cpu: usize,
        set: usize,
        way: usize,
        addr: address,
        ip: address,
        victim_addr: address,
        kind: Kind,
        hit: bool,
    );
}

/// Least-recently-used replacement over the per-block `lru` word.
///
/// Smaller values are more recent; the victim is the way with the largest.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lru;

impl ReplacementPolicy for Lru {
    fn find_victim(
        &mut self,
        _cpu: usize,
        _instr_id: u64,
        _set: usize,
        set_blocks: &[Block],
        _ip: address,
        _addr: address,
        _kind: Kind,
    ) -> usize {
        set_blocks
            .iter()
            .enumerate()
            .max_by_key(|(_, block)| block.lru)
            .map_or(0, |(way, _)| way)
    }

    fn update_state(
        &mut self,
        set_blocks: &mut [Block],
        _cpu: usize,
        _set: usize,
        way: usize,
        _addr: address,
        _ip: address,
        _victim_addr: address,
        kind: Kind,
        hit: bool,
    ) {
        if way >= set_blocks.len() {
            return;
        }
        // writeback hits carry no reuse information
        if hit && kind == Kind::WRITEBACK {
            return;
        }
        let touched = set_blocks[way].lru;
        for block in set_blocks.iter_mut() {
            if block.lru < touched {
                block.lru += 1;
            }
        }
        set_blocks[way].lru = 0;
    }
}
