//! Unlink engine
//!
//! Reverses the editor's linking one structure at a time. Participation is
//! never assumed: each list is searched for the record (hash lookup first,
//! linear scan by base address as fallback) and absence from any structure
//! is an ordinary outcome, not an error. Tree removal goes through the
//! target's own delete routine, and only for records that were actually
//! tree-linked.

use crate::editor::ModuleHandle;
use crate::lists;
use crate::locator::Anchors;
use crate::offsets::{RecordOffsets, HASH_BUCKETS};
use crate::traits::{MemoryIo, TargetRoutines};
use shade_common::{LinkState, LinkStructure, Result, UnlinkReport};
use tracing::{debug, info, warn};

/// Entry guard for list scans over live structures
const LIST_SCAN_LIMIT: usize = 0x1000;

pub struct UnlinkEngine<'a> {
    mem: &'a dyn MemoryIo,
    routines: &'a mut dyn TargetRoutines,
    anchors: Anchors,
    offsets: RecordOffsets,
}

impl<'a> UnlinkEngine<'a> {
    pub fn new(
        mem: &'a dyn MemoryIo,
        routines: &'a mut dyn TargetRoutines,
        anchors: Anchors,
        offsets: RecordOffsets,
    ) -> Self {
        Self {
            mem,
            routines,
            anchors,
            offsets,
        }
    }

    /// Unregister one module: splice it out of every structure it
    /// participates in, then release the controller-owned allocations.
    pub fn unregister_module(&mut self, handle: &mut ModuleHandle) -> Result<UnlinkReport> {
        info!("unregistering {} at {:#x}", handle.name, handle.base);
        let mut report = UnlinkReport::default();

        self.step(&mut report, handle, LinkStructure::HashBucket, Self::unlink_hash);
        self.step(&mut report, handle, LinkStructure::LoadOrder, |s, h| {
            s.unlink_list(h, s.anchors.lists.load_order, s.offsets.load_order_links)
        });
        self.step(&mut report, handle, LinkStructure::MemoryOrder, |s, h| {
            s.unlink_list(h, s.anchors.lists.memory_order, s.offsets.memory_order_links)
        });
        self.step(&mut report, handle, LinkStructure::InitOrder, |s, h| {
            s.unlink_list(h, s.anchors.lists.init_order, s.offsets.init_order_links)
        });
        self.step(&mut report, handle, LinkStructure::TreeNode, Self::unlink_tree);

        self.release(handle);
        handle.state = LinkState::Unregistered;
        Ok(report)
    }

    fn step(
        &mut self,
        report: &mut UnlinkReport,
        handle: &mut ModuleHandle,
        structure: LinkStructure,
        op: impl FnOnce(&mut Self, &mut ModuleHandle) -> Result<bool>,
    ) {
        match op(self, handle) {
            Ok(true) => {
                handle.links.clear(structure);
                report.removed.push(structure);
            }
            Ok(false) => report.not_present.push(structure),
            Err(e) => {
                warn!(structure = structure.name(), error = %e, "unlink step failed");
                report.not_present.push(structure);
            }
        }
    }

    fn unlink_hash(&mut self, handle: &mut ModuleHandle) -> Result<bool> {
        let Some(table) = self.anchors.hash_table else {
            return Ok(false);
        };
        let stride = self.offsets.bucket_stride();

        // Known hash narrows the search to one bucket; otherwise scan all
        let buckets: Vec<u64> = match handle.name_hash {
            Some(hash) => vec![table + (hash % HASH_BUCKETS) as u64 * stride],
            None => (0..HASH_BUCKETS as u64).map(|i| table + i * stride).collect(),
        };

        for bucket in buckets {
            if self.splice_from(bucket, self.offsets.hash_links, handle.base)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn unlink_list(
        &mut self,
        handle: &mut ModuleHandle,
        head: u64,
        link_offset: u64,
    ) -> Result<bool> {
        if head == 0 {
            return Ok(false);
        }
        self.splice_from(head, link_offset, handle.base)
    }

    /// Scan the list at `head` for a record whose base matches, splice it
    /// out, repoint predecessor and successor at each other.
    fn splice_from(&mut self, head: u64, link_offset: u64, base: u64) -> Result<bool> {
        let bitness = self.offsets.bitness;
        for link in lists::walk(self.mem, bitness, head, LIST_SCAN_LIMIT)? {
            let record = link.wrapping_sub(link_offset);
            let record_base = match self.mem.read_ptr(record + self.offsets.dll_base, bitness) {
                Ok(b) => b,
                // Foreign nodes may hang off partially unmapped records
                Err(_) => continue,
            };
            if record_base == base {
                lists::remove_entry(self.mem, bitness, link)?;
                debug!("record {:#x} spliced out", record);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn unlink_tree(&mut self, handle: &mut ModuleHandle) -> Result<bool> {
        // A record that never went into the tree must not touch it
        if !handle.links.contains(LinkStructure::TreeNode) {
            return Ok(false);
        }
        let Some(root_cell) = self.anchors.module_index else {
            return Ok(false);
        };
        let tree_off = self
            .offsets
            .tree_node
            .expect("tree-linked record implies graph layout");

        self.routines
            .tree_delete(root_cell, handle.record + tree_off)?;
        Ok(true)
    }

    /// Free the controller-owned remote allocations. Records carved from
    /// the target's loader heap are left to the target.
    fn release(&mut self, handle: &mut ModuleHandle) {
        for buffer in [
            handle.name_buffer.take(),
            handle.tls_buffer.take(),
            handle.exception_directory.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = self.mem.free(buffer);
        }

        if !handle.record_from_heap {
            // Group node came from the same allocator as the record
            if let Some(group) = handle.group_node.take() {
                let _ = self.mem.free(group);
            }
            let _ = self.mem.free(handle.record);
        }
    }
}
