//! Link bookkeeping types
//!
//! A registered module participates in each loader structure individually.
//! Participation is tracked per structure and never assumed all-or-nothing,
//! so unlink can reverse exactly what link achieved.

use serde::{Deserialize, Serialize};

/// Structures a record may be linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStructure {
    HashBucket,
    LoadOrder,
    MemoryOrder,
    InitOrder,
    TreeNode,
    Tls,
    ExceptionTable,
}

impl LinkStructure {
    pub fn name(self) -> &'static str {
        match self {
            Self::HashBucket => "hash bucket",
            Self::LoadOrder => "load-order list",
            Self::MemoryOrder => "memory-order list",
            Self::InitOrder => "init-order list",
            Self::TreeNode => "base-address tree",
            Self::Tls => "tls registration",
            Self::ExceptionTable => "exception table",
        }
    }
}

/// Which structures to link during registration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkFlags {
    /// Insert into the name-hash table
    pub hash_table: bool,
    /// Insert into the module list trio (and tree, on graph profiles)
    pub module_lists: bool,
    /// Mark for thread-attach notifications and register TLS
    pub thread_callback: bool,
}

impl Default for LinkFlags {
    fn default() -> Self {
        Self {
            hash_table: true,
            module_lists: true,
            thread_callback: true,
        }
    }
}

impl LinkFlags {
    pub fn none() -> Self {
        Self {
            hash_table: false,
            module_lists: false,
            thread_callback: false,
        }
    }
}

/// Registration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Unregistered,
    RecordAllocated,
    PartiallyLinked,
    FullyLinked,
}

/// Per-structure participation of one record
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinkSet {
    pub hash_bucket: bool,
    pub load_order: bool,
    pub memory_order: bool,
    pub init_order: bool,
    pub tree_node: bool,
}

impl LinkSet {
    pub fn contains(&self, structure: LinkStructure) -> bool {
        match structure {
            LinkStructure::HashBucket => self.hash_bucket,
            LinkStructure::LoadOrder => self.load_order,
            LinkStructure::MemoryOrder => self.memory_order,
            LinkStructure::InitOrder => self.init_order,
            LinkStructure::TreeNode => self.tree_node,
            LinkStructure::Tls | LinkStructure::ExceptionTable => false,
        }
    }

    pub fn set(&mut self, structure: LinkStructure) {
        match structure {
            LinkStructure::HashBucket => self.hash_bucket = true,
            LinkStructure::LoadOrder => self.load_order = true,
            LinkStructure::MemoryOrder => self.memory_order = true,
            LinkStructure::InitOrder => self.init_order = true,
            LinkStructure::TreeNode => self.tree_node = true,
            LinkStructure::Tls | LinkStructure::ExceptionTable => {}
        }
    }

    pub fn clear(&mut self, structure: LinkStructure) {
        match structure {
            LinkStructure::HashBucket => self.hash_bucket = false,
            LinkStructure::LoadOrder => self.load_order = false,
            LinkStructure::MemoryOrder => self.memory_order = false,
            LinkStructure::InitOrder => self.init_order = false,
            LinkStructure::TreeNode => self.tree_node = false,
            LinkStructure::Tls | LinkStructure::ExceptionTable => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.hash_bucket
            || self.load_order
            || self.memory_order
            || self.init_order
            || self.tree_node)
    }
}

/// One failed linking step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkFailure {
    pub structure: LinkStructure,
    pub error: String,
}

/// Outcome of a registration. A partial link is a warning, not a failure:
/// the module typically remains usable and the report says exactly which
/// structures were linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkReport {
    pub state: LinkState,
    pub linked: Vec<LinkStructure>,
    pub failures: Vec<LinkFailure>,
}

impl LinkReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Outcome of an unregistration, per structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnlinkReport {
    /// Structures a node was actually spliced out of
    pub removed: Vec<LinkStructure>,
    /// Structures the record did not participate in (not an error)
    pub not_present: Vec<LinkStructure>,
}
