//! Core trait definitions
//!
//! These traits are the engine's only view of the outside world. The Memory
//! I/O seam is backed by user-mode APIs or a driver channel; the engine is
//! agnostic. Target-internal routines (name hash, tree insert/delete, TLS
//! registration, exception-table insert) are behind a strategy trait so
//! tests can substitute a fake target.

use shade_common::{Bitness, Protection, Result, WaitStatus, WorkerHandle};
use std::time::Duration;

/// Memory and execution primitives against one target process
pub trait MemoryIo: Send + Sync {
    /// Read bytes from the target
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Write bytes into the target
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Allocate a zeroed region in the target
    fn allocate(&self, size: usize, protection: Protection) -> Result<u64>;

    /// Release a region previously allocated through this seam
    fn free(&self, addr: u64) -> Result<()>;

    /// Change protection of a region, returning the previous protection
    fn protect(&self, addr: u64, len: usize, protection: Protection) -> Result<Protection>;

    /// Start exactly one unit of execution at `entry` with `arg`
    fn create_worker(&self, entry: u64, arg: u64) -> Result<WorkerHandle>;

    /// Block until the worker signals or the timeout elapses
    fn wait_one(&self, handle: WorkerHandle, timeout: Duration) -> Result<WaitStatus>;

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.read(addr, 4)?;
        Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    /// Read one target-sized pointer
    fn read_ptr(&self, addr: u64, bitness: Bitness) -> Result<u64> {
        match bitness {
            Bitness::X86 => Ok(self.read_u32(addr)? as u64),
            Bitness::X64 => self.read_u64(addr),
        }
    }

    fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write one target-sized pointer
    fn write_ptr(&self, addr: u64, value: u64, bitness: Bitness) -> Result<()> {
        match bitness {
            Bitness::X86 => self.write_u32(addr, value as u32),
            Bitness::X64 => self.write_u64(addr, value),
        }
    }
}

/// Target-internal routines the engine must never reimplement locally.
///
/// Their exact algorithms are unspecified and version-dependent; the
/// production implementation routes every one of them through the remote
/// executor to the addresses the locator resolved.
pub trait TargetRoutines {
    /// Hash a module base name exactly the way the target's lookups do
    fn hash_name(&mut self, name: &str) -> Result<u32>;

    /// Insert `node` into the balanced tree rooted at the cell `root`,
    /// attached under `parent` on the side given by `right`
    fn tree_insert(&mut self, root: u64, parent: u64, right: bool, node: u64) -> Result<()>;

    /// Delete `node` from the balanced tree rooted at the cell `root`
    fn tree_delete(&mut self, root: u64, node: u64) -> Result<()>;

    /// Run the target's TLS registration for a bookkeeping record
    fn register_tls(&mut self, record: u64) -> Result<u64>;

    /// Run the target's exception-table insert routine
    fn insert_exception_entry(&mut self, base: u64, size: u64) -> Result<u64>;

    /// Encode a pointer the way the target obscures stored pointers.
    /// Identity when the encode routine is unresolved.
    fn encode_pointer(&mut self, value: u64) -> Result<u64>;

    /// Allocate zeroed memory from the target's own loader heap.
    /// `None` when no heap handle is known; callers fall back to a raw
    /// remote allocation.
    fn heap_alloc(&mut self, size: usize) -> Result<Option<u64>>;
}
