//! Intrusive doubly-linked list edits on remote memory
//!
//! The target's lists are live while we edit them; every insertion and
//! splice is performed as individual pointer writes, with the entry's own
//! links set before any list-visible pointer changes.

use crate::offsets::ListLink;
use crate::traits::MemoryIo;
use shade_common::{Bitness, Result};

/// Tail-insert `entry` into the list headed at `head`. Both addresses point
/// at link pairs (forward, back), not at record starts.
pub fn insert_tail(mem: &dyn MemoryIo, bitness: Bitness, head: u64, entry: u64) -> Result<()> {
    let link = ListLink::for_bitness(bitness);
    let prev = mem.read_ptr(head + link.blink, bitness)?;

    // New node first, while nothing in the list points at it yet
    mem.write_ptr(entry + link.flink, head, bitness)?;
    mem.write_ptr(entry + link.blink, prev, bitness)?;

    mem.write_ptr(prev + link.flink, entry, bitness)?;
    mem.write_ptr(head + link.blink, entry, bitness)?;
    Ok(())
}

/// Splice `entry` out of whatever list it is linked into
pub fn remove_entry(mem: &dyn MemoryIo, bitness: Bitness, entry: u64) -> Result<()> {
    let link = ListLink::for_bitness(bitness);
    let flink = mem.read_ptr(entry + link.flink, bitness)?;
    let blink = mem.read_ptr(entry + link.blink, bitness)?;

    mem.write_ptr(blink + link.flink, flink, bitness)?;
    mem.write_ptr(flink + link.blink, blink, bitness)?;
    Ok(())
}

/// Walk the list headed at `head`, yielding each link address until the
/// walk returns to the head or `limit` entries were seen (cycle guard for
/// live structures the target may be editing underneath us).
pub fn walk(
    mem: &dyn MemoryIo,
    bitness: Bitness,
    head: u64,
    limit: usize,
) -> Result<Vec<u64>> {
    let link = ListLink::for_bitness(bitness);
    let mut entries = Vec::new();
    let mut cursor = mem.read_ptr(head + link.flink, bitness)?;

    while cursor != head && cursor != 0 && entries.len() < limit {
        entries.push(cursor);
        cursor = mem.read_ptr(cursor + link.flink, bitness)?;
    }
    Ok(entries)
}
