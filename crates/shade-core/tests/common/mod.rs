//! Shared fake target for integration tests
//!
//! A scripted process: flat memory with protection emulation, a bump
//! allocator, remote "functions" executed by the instruction emulator, and
//! a deterministic stand-in for the target-internal routines.

#![allow(dead_code)]

pub mod emu;

use shade_common::{Bitness, Error, Protection, Result, WaitStatus, WorkerHandle};
use shade_core::offsets::{GroupNodeOffsets, RecordOffsets, TreeNodeOffsets};
use shade_core::traits::{MemoryIo, TargetRoutines};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type RemoteFn = Arc<dyn Fn(&FakeMemory, &emu::Regs) -> u64 + Send + Sync>;

struct Region {
    data: Vec<u8>,
    writable: bool,
}

#[derive(Default)]
struct State {
    next: u64,
    regions: BTreeMap<u64, Region>,
    freed: Vec<u64>,
}

pub struct FakeMemory {
    state: Mutex<State>,
    functions: Mutex<HashMap<u64, RemoteFn>>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next: 0x0020_0000,
                ..Default::default()
            }),
            functions: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a writable region at a fixed address
    pub fn map(&self, base: u64, size: usize) {
        self.state.lock().unwrap().regions.insert(
            base,
            Region {
                data: vec![0; size],
                writable: true,
            },
        );
    }

    /// Install a remote function the emulator dispatches calls to
    pub fn install_fn(&self, address: u64, f: RemoteFn) {
        self.functions.lock().unwrap().insert(address, f);
    }

    pub fn lookup_fn(&self, address: u64) -> Option<RemoteFn> {
        self.functions.lock().unwrap().get(&address).cloned()
    }

    pub fn freed(&self) -> Vec<u64> {
        self.state.lock().unwrap().freed.clone()
    }

    fn access<T>(
        &self,
        addr: u64,
        len: usize,
        write: Option<&[u8]>,
        ok: impl FnOnce(&[u8]) -> T,
    ) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        for (&base, region) in state.regions.iter_mut() {
            if addr >= base && addr + len as u64 <= base + region.data.len() as u64 {
                let start = (addr - base) as usize;
                if let Some(bytes) = write {
                    if !region.writable {
                        return None;
                    }
                    region.data[start..start + len].copy_from_slice(bytes);
                }
                return Some(ok(&region.data[start..start + len]));
            }
        }
        None
    }
}

impl MemoryIo for FakeMemory {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.access(addr, len, None, |d| d.to_vec())
            .ok_or(Error::RemoteRead {
                address: addr,
                len,
                message: "unmapped".to_string(),
            })
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.access(addr, data.len(), Some(data), |_| ())
            .ok_or(Error::RemoteWrite {
                address: addr,
                len: data.len(),
                message: "unmapped or read-only".to_string(),
            })
    }

    fn allocate(&self, size: usize, _protection: Protection) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let addr = state.next;
        state.next += ((size as u64) + 0xFFF) & !0xFFF;
        state.regions.insert(
            addr,
            Region {
                data: vec![0; size],
                writable: true,
            },
        );
        Ok(addr)
    }

    fn free(&self, addr: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.regions.remove(&addr);
        state.freed.push(addr);
        Ok(())
    }

    fn protect(&self, addr: u64, _len: usize, protection: Protection) -> Result<Protection> {
        let mut state = self.state.lock().unwrap();
        for (&base, region) in state.regions.iter_mut() {
            if addr >= base && addr < base + region.data.len() as u64 {
                let old = if region.writable {
                    Protection::ReadWrite
                } else {
                    Protection::ReadOnly
                };
                region.writable = matches!(
                    protection,
                    Protection::ReadWrite | Protection::ExecuteReadWrite
                );
                return Ok(old);
            }
        }
        Err(Error::RemoteWrite {
            address: addr,
            len: 0,
            message: "unmapped".to_string(),
        })
    }

    fn create_worker(&self, entry: u64, _arg: u64) -> Result<WorkerHandle> {
        emu::run(self, entry);
        Ok(WorkerHandle(entry))
    }

    fn wait_one(&self, _handle: WorkerHandle, _timeout: Duration) -> Result<WaitStatus> {
        Ok(WaitStatus::Signaled)
    }
}

/// Fixed fixture addresses
pub const HASH_TABLE: u64 = 0x7F10_0000;
pub const LIST_HEADS: u64 = 0x7F20_0000;
pub const MODULE_INDEX: u64 = 0x7F30_0000;
pub const INVERTED_TABLE: u64 = 0x7F40_0000;

/// Deterministic stand-in for the target's internal routines. The tree
/// edits write real child/parent pointers in fake memory so invariants can
/// be checked structurally.
pub struct FakeRoutines<'m> {
    pub mem: &'m FakeMemory,
    pub offsets: RecordOffsets,
    /// Forced hash values per name; otherwise a rolling hash of the
    /// uppercased name
    pub hash_overrides: HashMap<String, u32>,
    /// Allocate records from "the loader heap" (plain fake allocations)
    pub use_heap: bool,
    pub tls_registrations: Vec<u64>,
    pub deny_tree: bool,
    pub tree_inserts: usize,
    pub tree_deletes: usize,
}

impl<'m> FakeRoutines<'m> {
    pub fn new(mem: &'m FakeMemory, offsets: RecordOffsets) -> Self {
        Self {
            mem,
            offsets,
            hash_overrides: HashMap::new(),
            use_heap: false,
            tls_registrations: Vec::new(),
            deny_tree: false,
            tree_inserts: 0,
            tree_deletes: 0,
        }
    }

    fn bitness(&self) -> Bitness {
        self.offsets.bitness
    }

    pub fn default_hash(name: &str) -> u32 {
        name.to_uppercase()
            .encode_utf16()
            .fold(0u32, |h, c| h.wrapping_mul(65599).wrapping_add(c as u32))
    }
}

impl TargetRoutines for FakeRoutines<'_> {
    fn hash_name(&mut self, name: &str) -> Result<u32> {
        Ok(self
            .hash_overrides
            .get(name)
            .copied()
            .unwrap_or_else(|| Self::default_hash(name)))
    }

    fn tree_insert(&mut self, root: u64, parent: u64, right: bool, node: u64) -> Result<()> {
        if self.deny_tree {
            panic!("tree insert must not run in this scenario");
        }
        let bitness = self.bitness();
        let t = TreeNodeOffsets::for_bitness(bitness);
        let root_node = self.mem.read_ptr(root, bitness)?;
        if root_node == 0 {
            self.mem.write_ptr(root, node, bitness)?;
        } else {
            let child = if right { t.right } else { t.left };
            self.mem.write_ptr(parent + child, node, bitness)?;
            self.mem.write_ptr(node + t.parent_value, parent, bitness)?;
        }
        self.tree_inserts += 1;
        Ok(())
    }

    fn tree_delete(&mut self, root: u64, node: u64) -> Result<()> {
        if self.deny_tree {
            panic!("tree delete must not run in this scenario");
        }
        let bitness = self.bitness();
        let t = TreeNodeOffsets::for_bitness(bitness);

        // Leaf removal is all the fixtures need; a real target rebalances
        let parent = self.mem.read_ptr(node + t.parent_value, bitness)?;
        if parent == 0 {
            let root_node = self.mem.read_ptr(root, bitness)?;
            assert_eq!(root_node, node, "only the root may have no parent");
            self.mem.write_ptr(root, 0, bitness)?;
        } else {
            for child in [t.left, t.right] {
                if self.mem.read_ptr(parent + child, bitness)? == node {
                    self.mem.write_ptr(parent + child, 0, bitness)?;
                }
            }
        }
        self.tree_deletes += 1;
        Ok(())
    }

    fn register_tls(&mut self, record: u64) -> Result<u64> {
        self.tls_registrations.push(record);
        Ok(0)
    }

    fn insert_exception_entry(&mut self, base: u64, size: u64) -> Result<u64> {
        let bitness = self.bitness();
        let t = shade_core::offsets::InvertedTableOffsets::for_profile(
            self.offsets.layout,
            bitness,
        );
        // The real routine runs inside the target and is not blocked by the
        // protection the controller sees; mirror that here
        let old = self.mem.protect(INVERTED_TABLE, 1, Protection::ReadWrite)?;
        let result = self.append_entry(&t, base, size);
        let _ = self.mem.protect(INVERTED_TABLE, 1, old);
        result
    }

    fn encode_pointer(&mut self, value: u64) -> Result<u64> {
        Ok(value ^ 0xA5A5)
    }

    fn heap_alloc(&mut self, size: usize) -> Result<Option<u64>> {
        if !self.use_heap {
            return Ok(None);
        }
        Ok(Some(self.mem.allocate(size, Protection::ReadWrite)?))
    }
}

impl FakeRoutines<'_> {
    fn append_entry(
        &self,
        t: &shade_core::offsets::InvertedTableOffsets,
        base: u64,
        size: u64,
    ) -> Result<u64> {
        let bitness = self.bitness();
        let count = self.mem.read_u32(INVERTED_TABLE + t.count)?;
        let entry = INVERTED_TABLE + t.entries + count as u64 * t.entry_stride;
        self.mem
            .write_ptr(entry + t.entry_image_base, base, bitness)?;
        self.mem
            .write_u32(entry + t.entry_image_size, size as u32)?;
        self.mem.write_u32(entry + t.entry_table_size, 0)?;
        self.mem.write_u32(INVERTED_TABLE + t.count, count + 1)?;
        Ok(0)
    }
}

/// Seed the loader fixture: empty hash buckets, empty order lists, an
/// inverted table, and a base-address tree holding one pre-existing module.
pub struct Fixture {
    pub seed_record: u64,
    pub seed_base: u64,
}

pub fn seed_loader(mem: &FakeMemory, offsets: &RecordOffsets) -> Fixture {
    let bitness = offsets.bitness;
    let stride = offsets.bucket_stride();

    mem.map(HASH_TABLE, (32 * stride) as usize);
    for i in 0..32u64 {
        let bucket = HASH_TABLE + i * stride;
        empty_list(mem, bitness, bucket);
    }

    mem.map(LIST_HEADS, 0x100);
    for head in [list_head(0, offsets), list_head(1, offsets), list_head(2, offsets)] {
        empty_list(mem, bitness, head);
    }

    mem.map(INVERTED_TABLE, 0x2000);
    mem.map(MODULE_INDEX, 0x100);

    // One resident module so the tree has a root to walk from
    let seed_base = 0x7FFC_0000_0000u64;
    let seed_record = mem.allocate(offsets.record_size, Protection::ReadWrite).unwrap();
    mem.write_ptr(seed_record + offsets.dll_base, seed_base, bitness)
        .unwrap();
    if let Some(tree_off) = offsets.tree_node {
        mem.write_ptr(MODULE_INDEX, seed_record + tree_off, bitness)
            .unwrap();
    }
    if let Some(group_off) = offsets.group_node {
        let g = GroupNodeOffsets::for_bitness(bitness);
        let group = mem.allocate(g.size as usize, Protection::ReadWrite).unwrap();
        mem.write_u32(group + g.reference_count, 1).unwrap();
        mem.write_ptr(seed_record + group_off, group, bitness).unwrap();
    }

    Fixture {
        seed_record,
        seed_base,
    }
}

pub fn list_head(index: u64, offsets: &RecordOffsets) -> u64 {
    LIST_HEADS + index * offsets.list_link().size
}

pub fn empty_list(mem: &FakeMemory, bitness: Bitness, head: u64) {
    mem.write_ptr(head, head, bitness).unwrap();
    mem.write_ptr(head + bitness.word_size(), head, bitness).unwrap();
}

/// Anchors matching the seeded fixture
pub fn fixture_anchors(offsets: &RecordOffsets) -> shade_core::Anchors {
    shade_core::Anchors {
        hash_table: Some(HASH_TABLE),
        module_index: offsets.tree_node.map(|_| MODULE_INDEX),
        inverted_table: Some(INVERTED_TABLE),
        insert_inverted: Some(0x7FFD_1000),
        handle_tls: Some(0x7FFD_2000),
        hash_routine: Some(0x7FFD_3000),
        rb_insert: Some(0x7FFD_4000),
        rb_remove: Some(0x7FFD_5000),
        loader_heap: None,
        allocate_heap: None,
        encode_pointer: Some(0x7FFD_6000),
        lists: shade_core::ListHeads {
            load_order: list_head(0, offsets),
            memory_order: list_head(1, offsets),
            init_order: list_head(2, offsets),
        },
        tls_pointer_cell: None,
    }
}

/// Number of records reachable from a bucket or list head
pub fn chain_len(mem: &FakeMemory, bitness: Bitness, head: u64) -> usize {
    shade_core::lists::walk(mem, bitness, head, 64).unwrap().len()
}

/// Count tree nodes reachable from the module index root
pub fn tree_size(mem: &FakeMemory, offsets: &RecordOffsets) -> usize {
    let bitness = offsets.bitness;
    let t = TreeNodeOffsets::for_bitness(bitness);
    let root = mem.read_ptr(MODULE_INDEX, bitness).unwrap();
    let mut count = 0;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node == 0 {
            continue;
        }
        count += 1;
        stack.push(mem.read_ptr(node + t.left, bitness).unwrap());
        stack.push(mem.read_ptr(node + t.right, bitness).unwrap());
    }
    count
}
