//! Per-profile offset tables
//!
//! All pointer arithmetic on the target's opaque bookkeeping structures is
//! centralized here: field name -> byte offset, per record layout and per
//! bitness, computed once. Nothing outside this module hardcodes a field
//! offset.

use shade_common::{Bitness, RecordLayout};

/// Buckets in the name-hash table
pub const HASH_BUCKETS: u32 = 32;

/// Record flag: entry describes a DLL image
pub const FLAG_IMAGE_DLL: u32 = 0x0000_0004;
/// Record flag: skip thread-attach notifications for this module
pub const FLAG_DONT_CALL_FOR_THREADS: u32 = 0x0004_0000;
/// Record flag: process-attach notification already delivered
pub const FLAG_PROCESS_ATTACH_CALLED: u32 = 0x0008_0000;

/// Group-record state: module fully initialized and runnable
pub const GROUP_STATE_READY: u32 = 9;

/// Pinned load count (never unloaded by reference counting)
pub const LOAD_COUNT_PINNED: u16 = 0xFFFF;

/// Intrusive list link: forward pointer then back pointer
#[derive(Debug, Clone, Copy)]
pub struct ListLink {
    pub flink: u64,
    pub blink: u64,
    pub size: u64,
}

impl ListLink {
    pub fn for_bitness(bitness: Bitness) -> Self {
        let word = bitness.word_size();
        Self {
            flink: 0,
            blink: word,
            size: 2 * word,
        }
    }
}

/// Counted UTF-16 string field: length, capacity, buffer pointer
#[derive(Debug, Clone, Copy)]
pub struct CountedStringOffsets {
    pub length: u64,
    pub max_length: u64,
    pub buffer: u64,
    pub size: u64,
}

impl CountedStringOffsets {
    pub fn for_bitness(bitness: Bitness) -> Self {
        match bitness {
            Bitness::X86 => Self {
                length: 0,
                max_length: 2,
                buffer: 4,
                size: 8,
            },
            Bitness::X64 => Self {
                length: 0,
                max_length: 2,
                buffer: 8,
                size: 16,
            },
        }
    }
}

/// Balanced-tree node embedded in graph records: left, right, parent word
#[derive(Debug, Clone, Copy)]
pub struct TreeNodeOffsets {
    pub left: u64,
    pub right: u64,
    pub parent_value: u64,
}

impl TreeNodeOffsets {
    pub fn for_bitness(bitness: Bitness) -> Self {
        let word = bitness.word_size();
        Self {
            left: 0,
            right: word,
            parent_value: 2 * word,
        }
    }
}

/// Shared dependency-group record referenced by graph entries
#[derive(Debug, Clone, Copy)]
pub struct GroupNodeOffsets {
    pub modules: u64,
    pub load_count: u64,
    pub reference_count: u64,
    pub state: u64,
    pub size: u64,
}

impl GroupNodeOffsets {
    pub fn for_bitness(bitness: Bitness) -> Self {
        match bitness {
            Bitness::X86 => Self {
                modules: 0x00,
                load_count: 0x0C,
                reference_count: 0x10,
                state: 0x20,
                size: 0x30,
            },
            Bitness::X64 => Self {
                modules: 0x00,
                load_count: 0x18,
                reference_count: 0x1C,
                state: 0x38,
                size: 0x50,
            },
        }
    }
}

/// The process-global inverted function table and its entries
#[derive(Debug, Clone, Copy)]
pub struct InvertedTableOffsets {
    pub count: u64,
    pub max_count: u64,
    pub entries: u64,
    pub entry_stride: u64,
    pub entry_exception_dir: u64,
    pub entry_image_base: u64,
    pub entry_image_size: u64,
    pub entry_table_size: u64,
}

impl InvertedTableOffsets {
    pub fn for_profile(layout: RecordLayout, bitness: Bitness) -> Self {
        let word = bitness.word_size();
        // Graph-era tables carry an overflow flag before the entries
        let entries = match layout {
            RecordLayout::Legacy => 0x0C,
            RecordLayout::Graph => 0x10,
        };
        Self {
            count: 0x00,
            max_count: 0x04,
            entries,
            entry_stride: 2 * word + 8,
            entry_exception_dir: 0,
            entry_image_base: word,
            entry_image_size: 2 * word,
            entry_table_size: 2 * word + 4,
        }
    }
}

/// Bookkeeping record field offsets for the active profile
#[derive(Debug, Clone, Copy)]
pub struct RecordOffsets {
    pub layout: RecordLayout,
    pub bitness: Bitness,
    pub load_order_links: u64,
    pub memory_order_links: u64,
    pub init_order_links: u64,
    pub dll_base: u64,
    pub entry_point: u64,
    pub size_of_image: u64,
    pub full_name: u64,
    pub base_name: u64,
    pub flags: u64,
    pub load_count: u64,
    pub tls_index: u64,
    pub hash_links: u64,
    /// Self-referential forwarder links, legacy records only
    pub forwarder_links: Option<u64>,
    /// Pointer to the shared group record, graph records only
    pub group_node: Option<u64>,
    /// Embedded base-address tree node, graph records only
    pub tree_node: Option<u64>,
    /// Cached name hash, graph records only
    pub base_name_hash: Option<u64>,
    pub record_size: usize,
}

impl RecordOffsets {
    pub fn for_profile(layout: RecordLayout, bitness: Bitness) -> Self {
        match (bitness, layout) {
            (Bitness::X64, RecordLayout::Legacy) => Self {
                layout,
                bitness,
                load_order_links: 0x00,
                memory_order_links: 0x10,
                init_order_links: 0x20,
                dll_base: 0x30,
                entry_point: 0x38,
                size_of_image: 0x40,
                full_name: 0x48,
                base_name: 0x58,
                flags: 0x68,
                load_count: 0x6C,
                tls_index: 0x6E,
                hash_links: 0x70,
                forwarder_links: Some(0x98),
                group_node: None,
                tree_node: None,
                base_name_hash: None,
                record_size: 0xE0,
            },
            (Bitness::X64, RecordLayout::Graph) => Self {
                layout,
                bitness,
                load_order_links: 0x00,
                memory_order_links: 0x10,
                init_order_links: 0x20,
                dll_base: 0x30,
                entry_point: 0x38,
                size_of_image: 0x40,
                full_name: 0x48,
                base_name: 0x58,
                flags: 0x68,
                load_count: 0x6C,
                tls_index: 0x6E,
                hash_links: 0x70,
                forwarder_links: None,
                group_node: Some(0x98),
                tree_node: Some(0xC8),
                base_name_hash: Some(0x108),
                record_size: 0x118,
            },
            (Bitness::X86, RecordLayout::Legacy) => Self {
                layout,
                bitness,
                load_order_links: 0x00,
                memory_order_links: 0x08,
                init_order_links: 0x10,
                dll_base: 0x18,
                entry_point: 0x1C,
                size_of_image: 0x20,
                full_name: 0x24,
                base_name: 0x2C,
                flags: 0x34,
                load_count: 0x38,
                tls_index: 0x3A,
                hash_links: 0x3C,
                forwarder_links: Some(0x50),
                group_node: None,
                tree_node: None,
                base_name_hash: None,
                record_size: 0x78,
            },
            (Bitness::X86, RecordLayout::Graph) => Self {
                layout,
                bitness,
                load_order_links: 0x00,
                memory_order_links: 0x08,
                init_order_links: 0x10,
                dll_base: 0x18,
                entry_point: 0x1C,
                size_of_image: 0x20,
                full_name: 0x24,
                base_name: 0x2C,
                flags: 0x34,
                load_count: 0x38,
                tls_index: 0x3A,
                hash_links: 0x3C,
                forwarder_links: None,
                group_node: Some(0x50),
                tree_node: Some(0x68),
                base_name_hash: Some(0x90),
                record_size: 0xA0,
            },
        }
    }

    pub fn list_link(&self) -> ListLink {
        ListLink::for_bitness(self.bitness)
    }

    pub fn counted_string(&self) -> CountedStringOffsets {
        CountedStringOffsets::for_bitness(self.bitness)
    }

    pub fn tree(&self) -> TreeNodeOffsets {
        TreeNodeOffsets::for_bitness(self.bitness)
    }

    pub fn group(&self) -> GroupNodeOffsets {
        GroupNodeOffsets::for_bitness(self.bitness)
    }

    /// Stride of one hash bucket head in the bucket array
    pub fn bucket_stride(&self) -> u64 {
        self.list_link().size
    }
}
