//! Loader graph editor
//!
//! Builds a bookkeeping record for a manually mapped module and links it
//! into every structure the active profile requires:
//! `Unregistered -> RecordAllocated -> PartiallyLinked -> FullyLinked`.
//!
//! Individual structure failures degrade the registration to a partial
//! link; they never abort it. The only fatal condition is failure of the
//! initial record allocation. Structures already linked are left in place
//! when a later one fails; the returned report and the handle's
//! participation flags record the exact partial state, and the unlink
//! engine reverses precisely that.

use crate::lists;
use crate::locator::Anchors;
use crate::offsets::{
    InvertedTableOffsets, RecordOffsets, FLAG_DONT_CALL_FOR_THREADS, FLAG_IMAGE_DLL,
    FLAG_PROCESS_ATTACH_CALLED, GROUP_STATE_READY, HASH_BUCKETS, LOAD_COUNT_PINNED,
};
use crate::traits::{MemoryIo, TargetRoutines};
use shade_common::{
    Error, LinkFailure, LinkFlags, LinkReport, LinkSet, LinkState, LinkStructure,
    ModuleDescriptor, OsProfile, Protection, RecordLayout, Result, TlsInfo,
};
use tracing::{debug, info, warn};

/// Offset of the full path inside the name buffer; the base name sits at 0
const PATH_SPLIT: u64 = 0x800;
/// Name buffer allocation size
const NAME_BUFFER_SIZE: usize = 0x1000;
/// Fabricated unwind directory capacity, entries
const FAKE_DIRECTORY_CAPACITY: usize = 0x100;
/// Walk guard for the live base-address tree
const TREE_DEPTH_LIMIT: usize = 64;
/// Entry guard for the inverted table scan
const INVERTED_TABLE_LIMIT: u32 = 0x200;

/// Controller-side handle to one registered record. The controller stays
/// responsible for unregistering and freeing it on teardown; a dropped
/// handle leaks the record in the target.
#[derive(Debug)]
pub struct ModuleHandle {
    pub record: u64,
    pub base: u64,
    pub name: String,
    pub name_hash: Option<u32>,
    pub links: LinkSet,
    pub state: LinkState,
    /// Record came from the target's own loader heap (not ours to free)
    pub record_from_heap: bool,
    pub group_node: Option<u64>,
    pub name_buffer: Option<u64>,
    pub tls_buffer: Option<u64>,
    pub exception_directory: Option<u64>,
}

pub struct LoaderGraphEditor<'a> {
    mem: &'a dyn MemoryIo,
    routines: &'a mut dyn TargetRoutines,
    anchors: Anchors,
    profile: OsProfile,
    offsets: RecordOffsets,
}

impl<'a> LoaderGraphEditor<'a> {
    pub fn new(
        mem: &'a dyn MemoryIo,
        routines: &'a mut dyn TargetRoutines,
        anchors: Anchors,
        profile: OsProfile,
        offsets: RecordOffsets,
    ) -> Self {
        Self {
            mem,
            routines,
            anchors,
            profile,
            offsets,
        }
    }

    pub fn offsets(&self) -> &RecordOffsets {
        &self.offsets
    }

    /// Register one mapped module. Returns the handle plus a report; a
    /// report with failures is a partial link, not an error.
    pub fn register_module(
        &mut self,
        desc: &ModuleDescriptor,
        flags: LinkFlags,
    ) -> Result<(ModuleHandle, LinkReport)> {
        info!(
            "registering {} at {:#x}, {:?} layout",
            desc.name, desc.base, self.offsets.layout
        );

        let (record, record_from_heap) = self.allocate_block(self.offsets.record_size)?;
        let mut handle = ModuleHandle {
            record,
            base: desc.base,
            name: desc.name.clone(),
            name_hash: None,
            links: LinkSet::default(),
            state: LinkState::RecordAllocated,
            record_from_heap,
            group_node: None,
            name_buffer: None,
            tls_buffer: None,
            exception_directory: None,
        };
        self.write_core_fields(&mut handle, desc, flags)?;

        let mut report = ReportBuilder::default();

        if flags.hash_table {
            let outcome = self.link_hash(&mut handle, desc);
            report.record(LinkStructure::HashBucket, outcome);
        }

        if flags.module_lists {
            for (structure, head) in self.list_plan() {
                let outcome = self.link_list(&mut handle, structure, head);
                report.record(structure, outcome);
            }
            if self.offsets.layout == RecordLayout::Graph {
                let outcome = self.link_tree(&mut handle, desc);
                report.record(LinkStructure::TreeNode, outcome);
            }
        }

        if flags.thread_callback {
            if let Some(tls) = desc.tls {
                let outcome = self.link_tls(&mut handle, tls);
                report.record(LinkStructure::Tls, outcome);
            }
        }

        let outcome = self.link_exception(&mut handle, desc);
        report.record(LinkStructure::ExceptionTable, outcome);

        let report = report.build();
        handle.state = report.state;
        Ok((handle, report))
    }

    /// Allocate zeroed target memory, preferring the target's own loader
    /// heap so the record looks heap-backed to the target's runtime.
    fn allocate_block(&mut self, size: usize) -> Result<(u64, bool)> {
        match self.routines.heap_alloc(size) {
            Ok(Some(addr)) => return Ok((addr, true)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "loader heap allocation failed, using raw allocation"),
        }
        let addr = self.mem.allocate(size, Protection::ReadWrite)?;
        Ok((addr, false))
    }

    fn write_core_fields(
        &mut self,
        handle: &mut ModuleHandle,
        desc: &ModuleDescriptor,
        flags: LinkFlags,
    ) -> Result<()> {
        let o = self.offsets;
        let bitness = o.bitness;
        let record = handle.record;

        self.mem.write_ptr(record + o.dll_base, desc.base, bitness)?;
        self.mem
            .write_ptr(record + o.entry_point, desc.entry_point, bitness)?;
        self.mem
            .write_u32(record + o.size_of_image, desc.size as u32)?;
        self.mem
            .write(record + o.load_count, &LOAD_COUNT_PINNED.to_le_bytes())?;

        let mut record_flags = FLAG_IMAGE_DLL | FLAG_PROCESS_ATTACH_CALLED;
        if !flags.thread_callback {
            record_flags |= FLAG_DONT_CALL_FOR_THREADS;
        }
        self.mem.write_u32(record + o.flags, record_flags)?;

        if let Some(fwd) = o.forwarder_links {
            // Empty self-referential list
            self.mem.write_ptr(record + fwd, record + fwd, bitness)?;
            self.mem
                .write_ptr(record + fwd + bitness.word_size(), record + fwd, bitness)?;
        }

        if let Some(group_off) = o.group_node {
            let (group, _) = self.allocate_block(o.group().size as usize)?;
            let g = o.group();
            self.mem.write_ptr(record + group_off, group, bitness)?;
            self.mem.write_u32(group + g.state, GROUP_STATE_READY)?;
            self.mem.write_u32(group + g.reference_count, 1)?;
            self.mem.write_u32(group + g.load_count, u32::MAX)?;
            handle.group_node = Some(group);
        }

        // Name strings live in a secondary buffer; losing them degrades the
        // record cosmetically but does not block linking
        match self.write_names(record, desc) {
            Ok(buffer) => handle.name_buffer = Some(buffer),
            Err(e) => warn!(error = %e, "name buffer setup failed"),
        }
        Ok(())
    }

    fn write_names(&mut self, record: u64, desc: &ModuleDescriptor) -> Result<u64> {
        let o = self.offsets;
        let cs = o.counted_string();
        let buffer = self.mem.allocate(NAME_BUFFER_SIZE, Protection::ReadWrite)?;

        for (field, text, at) in [
            (o.base_name, &desc.name, buffer),
            (o.full_name, &desc.full_path, buffer + PATH_SPLIT),
        ] {
            let chars: Vec<u8> = text
                .encode_utf16()
                .flat_map(|u| u.to_le_bytes())
                .chain([0, 0])
                .collect();
            let byte_len = (chars.len() - 2) as u16;
            self.mem.write(at, &chars)?;
            self.mem
                .write(record + field + cs.length, &byte_len.to_le_bytes())?;
            self.mem
                .write(record + field + cs.max_length, &(byte_len + 2).to_le_bytes())?;
            self.mem.write_ptr(record + field + cs.buffer, at, o.bitness)?;
        }
        Ok(buffer)
    }

    /// Bucket selection must agree bit-for-bit with the target's own
    /// lookups, so the hash always comes from the target's routine.
    fn link_hash(&mut self, handle: &mut ModuleHandle, desc: &ModuleDescriptor) -> Result<()> {
        let table = self
            .anchors
            .hash_table
            .ok_or_else(|| Error::PatternNotFound("HashTable".to_string()))?;

        let hash = self.routines.hash_name(&desc.name)?;
        handle.name_hash = Some(hash);

        if let Some(hash_field) = self.offsets.base_name_hash {
            self.mem.write_u32(handle.record + hash_field, hash)?;
        }

        let bucket = table + (hash % HASH_BUCKETS) as u64 * self.offsets.bucket_stride();
        lists::insert_tail(
            self.mem,
            self.offsets.bitness,
            bucket,
            handle.record + self.offsets.hash_links,
        )?;
        handle.links.set(LinkStructure::HashBucket);
        debug!("hash bucket {} linked", hash % HASH_BUCKETS);
        Ok(())
    }

    /// Which order lists the active layout participates in
    fn list_plan(&self) -> Vec<(LinkStructure, u64)> {
        let heads = self.anchors.lists;
        match self.offsets.layout {
            RecordLayout::Legacy => vec![
                (LinkStructure::LoadOrder, heads.load_order),
                (LinkStructure::MemoryOrder, heads.memory_order),
                (LinkStructure::InitOrder, heads.init_order),
            ],
            RecordLayout::Graph => vec![
                (LinkStructure::LoadOrder, heads.load_order),
                (LinkStructure::InitOrder, heads.init_order),
            ],
        }
    }

    fn link_list(
        &mut self,
        handle: &mut ModuleHandle,
        structure: LinkStructure,
        head: u64,
    ) -> Result<()> {
        if head == 0 {
            return Err(Error::PatternNotFound(format!(
                "{} head unavailable",
                structure.name()
            )));
        }
        let links = handle.record + self.link_offset(structure);
        lists::insert_tail(self.mem, self.offsets.bitness, head, links)?;
        handle.links.set(structure);
        Ok(())
    }

    fn link_offset(&self, structure: LinkStructure) -> u64 {
        match structure {
            LinkStructure::LoadOrder => self.offsets.load_order_links,
            LinkStructure::MemoryOrder => self.offsets.memory_order_links,
            LinkStructure::InitOrder => self.offsets.init_order_links,
            LinkStructure::HashBucket => self.offsets.hash_links,
            _ => unreachable!("not a list structure"),
        }
    }

    /// Insert into the base-address tree, or bump the reference count of an
    /// existing group when the base is already present. Rebalancing happens
    /// in the target's own insert routine.
    fn link_tree(&mut self, handle: &mut ModuleHandle, desc: &ModuleDescriptor) -> Result<()> {
        let root_cell = self
            .anchors
            .module_index
            .ok_or_else(|| Error::PatternNotFound("ModuleIndex".to_string()))?;
        let tree_off = self
            .offsets
            .tree_node
            .expect("graph layout carries a tree node");
        let t = self.offsets.tree();
        let bitness = self.offsets.bitness;

        let mut node = self.mem.read_ptr(root_cell, bitness)?;
        if node == 0 {
            return Err(Error::Unsupported("module index is empty".to_string()));
        }

        let mut insert_right = false;
        for _ in 0..TREE_DEPTH_LIMIT {
            let record = node - tree_off;
            let node_base = self.mem.read_ptr(record + self.offsets.dll_base, bitness)?;

            if desc.base < node_base {
                let left = self.mem.read_ptr(node + t.left, bitness)?;
                if left == 0 {
                    insert_right = false;
                    break;
                }
                node = left;
            } else if desc.base > node_base {
                let right = self.mem.read_ptr(node + t.right, bitness)?;
                if right == 0 {
                    insert_right = true;
                    break;
                }
                node = right;
            } else {
                // Same physical base: share the existing group record
                return self.bump_group_refcount(record);
            }
        }

        self.routines
            .tree_insert(root_cell, node, insert_right, handle.record + tree_off)?;
        handle.links.set(LinkStructure::TreeNode);
        Ok(())
    }

    fn bump_group_refcount(&mut self, existing_record: u64) -> Result<()> {
        let group_off = self
            .offsets
            .group_node
            .expect("graph layout carries a group node");
        let g = self.offsets.group();
        let group = self
            .mem
            .read_ptr(existing_record + group_off, self.offsets.bitness)?;
        if group == 0 {
            return Err(Error::Unsupported(
                "existing record has no group node".to_string(),
            ));
        }
        let count = self.mem.read_u32(group + g.reference_count)?;
        self.mem.write_u32(group + g.reference_count, count + 1)?;
        debug!("duplicate base, group reference bumped to {}", count + 1);
        Ok(())
    }

    /// TLS registration through the target's routine; falls back to a
    /// direct per-thread buffer patch when the routine is unavailable.
    /// The fallback covers only the current worker thread.
    fn link_tls(&mut self, handle: &mut ModuleHandle, tls: TlsInfo) -> Result<()> {
        if self.anchors.handle_tls.is_some() {
            self.routines.register_tls(handle.record)?;
            return Ok(());
        }

        let cell = self
            .anchors
            .tls_pointer_cell
            .ok_or_else(|| Error::PatternNotFound("HandleTlsData".to_string()))?;
        let bitness = self.offsets.bitness;

        let raw_len = (tls.raw_data_end.saturating_sub(tls.raw_data_start)) as usize;
        let store_size = NAME_BUFFER_SIZE.max(PATH_SPLIT as usize + raw_len);
        let store = self.mem.allocate(store_size, Protection::ReadWrite)?;

        let raw = self.mem.read(tls.raw_data_start, raw_len)?;
        self.mem.write(store + PATH_SPLIT, &raw)?;
        // Slot array with a single entry pointing at the copied data
        self.mem.write_ptr(store, store + PATH_SPLIT, bitness)?;
        self.mem.write_ptr(cell, store, bitness)?;

        handle.tls_buffer = Some(store);
        warn!("TLS registered via direct thread patch; single-thread scope");
        Ok(())
    }

    /// Exception/unwind registration via the process-global inverted table
    fn link_exception(&mut self, handle: &mut ModuleHandle, desc: &ModuleDescriptor) -> Result<()> {
        let table = self
            .anchors
            .inverted_table
            .ok_or_else(|| Error::PatternNotFound("InvertedFunctionTable".to_string()))?;
        let t = InvertedTableOffsets::for_profile(self.offsets.layout, self.offsets.bitness);

        // Already present: nothing to do
        if self.find_inverted_entry(table, &t, desc.base)?.is_some() {
            return Ok(());
        }

        self.routines.insert_exception_entry(desc.base, desc.size)?;

        let (entry, table_size) = self
            .find_inverted_entry(table, &t, desc.base)?
            .ok_or_else(|| {
                Error::Unsupported("insert routine did not register the module".to_string())
            })?;

        // A module without an unwind directory gets a fabricated empty one
        // so the target's dispatch finds a valid (if empty) table
        if table_size == 0 && desc.exception.is_none() {
            let directory = self
                .mem
                .allocate(FAKE_DIRECTORY_CAPACITY * 4, Protection::ReadWrite)?;
            let encoded = self.routines.encode_pointer(directory)?;
            self.write_protected(entry + t.entry_exception_dir, encoded)?;
            handle.exception_directory = Some(directory);
        }
        Ok(())
    }

    fn find_inverted_entry(
        &self,
        table: u64,
        t: &InvertedTableOffsets,
        base: u64,
    ) -> Result<Option<(u64, u32)>> {
        let count = self.mem.read_u32(table + t.count)?.min(INVERTED_TABLE_LIMIT);
        for i in 0..count as u64 {
            let entry = table + t.entries + i * t.entry_stride;
            let image_base = self
                .mem
                .read_ptr(entry + t.entry_image_base, self.offsets.bitness)?;
            if image_base == base {
                let table_size = self.mem.read_u32(entry + t.entry_table_size)?;
                return Ok(Some((entry, table_size)));
            }
        }
        Ok(None)
    }

    /// Pointer-sized write that relaxes and restores page protection when
    /// the destination is read-only
    fn write_protected(&self, addr: u64, value: u64) -> Result<()> {
        let bitness = self.offsets.bitness;
        if self.mem.write_ptr(addr, value, bitness).is_ok() {
            return Ok(());
        }
        let len = bitness.word_size() as usize;
        let old = self.mem.protect(addr, len, Protection::ReadWrite)?;
        let result = self.mem.write_ptr(addr, value, bitness);
        let _ = self.mem.protect(addr, len, old);
        result
    }

    pub fn profile(&self) -> &OsProfile {
        &self.profile
    }
}

#[derive(Default)]
struct ReportBuilder {
    linked: Vec<LinkStructure>,
    failures: Vec<LinkFailure>,
}

impl ReportBuilder {
    fn record(&mut self, structure: LinkStructure, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.linked.push(structure),
            Err(e) => {
                warn!(structure = structure.name(), error = %e, "link step failed");
                self.failures.push(LinkFailure {
                    structure,
                    error: e.to_string(),
                });
            }
        }
    }

    fn build(self) -> LinkReport {
        let state = match (self.linked.is_empty(), self.failures.is_empty()) {
            (_, true) if !self.linked.is_empty() => LinkState::FullyLinked,
            (false, false) => LinkState::PartiallyLinked,
            _ => LinkState::RecordAllocated,
        };
        LinkReport {
            state,
            linked: self.linked,
            failures: self.failures,
        }
    }
}
