//! Target-routine strategy backed by the remote executor
//!
//! The hash function, tree rebalancing, TLS registration and
//! exception-table insertion all live inside the target and are version
//! dependent; reimplementing any of them locally would diverge from the
//! target's own behavior. Every call here runs the real routine in the
//! target at the address the locator resolved.

use crate::executor::RemoteExecutor;
use crate::locator::Anchors;
use crate::offsets::CountedStringOffsets;
use crate::traits::{MemoryIo, TargetRoutines};
use shade_common::{
    Bitness, CallOptions, CallingConvention, Error, ExceptionInsertShape, OsProfile, Protection,
    RemoteArg, Result,
};
use tracing::trace;

/// Zero-fill flag for the target's heap allocator
const HEAP_ZERO_MEMORY: u64 = 0x8;

/// Scratch block layout for the hash call
const SCRATCH_OUT: u64 = 0x20;
const SCRATCH_CHARS: u64 = 0x40;

pub struct RemoteRoutines<'e, 'm> {
    mem: &'m dyn MemoryIo,
    exec: &'e mut RemoteExecutor<'m>,
    anchors: Anchors,
    profile: OsProfile,
    timeout_ms: u64,
}

impl<'e, 'm> RemoteRoutines<'e, 'm> {
    pub fn new(
        mem: &'m dyn MemoryIo,
        exec: &'e mut RemoteExecutor<'m>,
        anchors: Anchors,
        profile: OsProfile,
    ) -> Self {
        Self {
            mem,
            exec,
            anchors,
            profile,
            timeout_ms: CallOptions::default().timeout_ms,
        }
    }

    fn bitness(&self) -> Bitness {
        self.exec.builder().callee_mode
    }

    /// Plain-function convention of the target's bitness
    fn native_cc(&self) -> CallingConvention {
        match self.bitness() {
            Bitness::X86 => CallingConvention::Stdcall,
            Bitness::X64 => CallingConvention::Win64,
        }
    }

    fn options(&self, convention: CallingConvention) -> CallOptions {
        CallOptions {
            convention,
            timeout_ms: self.timeout_ms,
        }
    }

    fn require(&self, anchor: Option<u64>, symbol: &str) -> Result<u64> {
        anchor.ok_or_else(|| Error::PatternNotFound(symbol.to_string()))
    }
}

impl TargetRoutines for RemoteRoutines<'_, '_> {
    fn hash_name(&mut self, name: &str) -> Result<u32> {
        let routine = self.require(self.anchors.hash_routine, "HashUnicodeString")?;
        let bitness = self.bitness();
        let cs = CountedStringOffsets::for_bitness(bitness);

        // Scratch block: counted-string header, out cell, character data
        let chars: Vec<u8> = name
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .chain([0, 0])
            .collect();
        let byte_len = (chars.len() - 2) as u16;
        let scratch = self
            .mem
            .allocate(SCRATCH_CHARS as usize + chars.len(), Protection::ReadWrite)?;

        let options = self.options(self.native_cc());
        let result = (|| {
            self.mem.write(scratch + SCRATCH_CHARS, &chars)?;
            self.mem
                .write(scratch + cs.length, &byte_len.to_le_bytes())?;
            self.mem
                .write(scratch + cs.max_length, &(byte_len + 2).to_le_bytes())?;
            self.mem
                .write_ptr(scratch + cs.buffer, scratch + SCRATCH_CHARS, bitness)?;

            let case_fold = self.profile.hash_case_insensitive as u64;
            self.exec.call(
                routine,
                &[
                    RemoteArg::Pointer(scratch),
                    RemoteArg::Int(case_fold),
                    RemoteArg::Int(0),
                    RemoteArg::Pointer(scratch + SCRATCH_OUT),
                ],
                &options,
            )?;

            self.mem.read_u32(scratch + SCRATCH_OUT)
        })();

        let _ = self.mem.free(scratch);
        let hash = result?;
        trace!("remote hash of {} is {:#x}", name, hash);
        Ok(hash)
    }

    fn tree_insert(&mut self, root: u64, parent: u64, right: bool, node: u64) -> Result<()> {
        let routine = self.require(self.anchors.rb_insert, "RbInsertNode")?;
        let options = self.options(self.native_cc());
        self.exec.call(
            routine,
            &[
                RemoteArg::Pointer(root),
                RemoteArg::Pointer(parent),
                RemoteArg::Int(right as u64),
                RemoteArg::Pointer(node),
            ],
            &options,
        )?;
        Ok(())
    }

    fn tree_delete(&mut self, root: u64, node: u64) -> Result<()> {
        let routine = self.require(self.anchors.rb_remove, "RbRemoveNode")?;
        let options = self.options(self.native_cc());
        self.exec.call(
            routine,
            &[RemoteArg::Pointer(root), RemoteArg::Pointer(node)],
            &options,
        )?;
        Ok(())
    }

    fn register_tls(&mut self, record: u64) -> Result<u64> {
        let routine = self.require(self.anchors.handle_tls, "HandleTlsData")?;
        let convention = match self.bitness() {
            Bitness::X86 => self.profile.tls_convention,
            Bitness::X64 => CallingConvention::Win64,
        };
        let options = self.options(convention);
        let result = self
            .exec
            .call(routine, &[RemoteArg::Pointer(record)], &options)?;
        Ok(result.value)
    }

    fn insert_exception_entry(&mut self, base: u64, size: u64) -> Result<u64> {
        let routine = self.require(self.anchors.insert_inverted, "InsertInvertedFunctionTable")?;
        let (convention, args) = match self.profile.exception_insert {
            ExceptionInsertShape::BaseAndSize(cc) => {
                (cc, vec![RemoteArg::Pointer(base), RemoteArg::Int(size)])
            }
            ExceptionInsertShape::TableBaseSize(cc) => {
                let table = self.require(self.anchors.inverted_table, "InvertedFunctionTable")?;
                (
                    cc,
                    vec![
                        RemoteArg::Pointer(table),
                        RemoteArg::Pointer(base),
                        RemoteArg::Int(size),
                    ],
                )
            }
        };
        let convention = match self.bitness() {
            Bitness::X86 => convention,
            Bitness::X64 => CallingConvention::Win64,
        };
        let options = self.options(convention);
        let result = self.exec.call(routine, &args, &options)?;
        Ok(result.value)
    }

    fn encode_pointer(&mut self, value: u64) -> Result<u64> {
        // Identity when the target offers no pointer obfuscation
        let Some(routine) = self.anchors.encode_pointer else {
            return Ok(value);
        };
        let options = self.options(self.native_cc());
        let result = self
            .exec
            .call(routine, &[RemoteArg::Pointer(value)], &options)?;
        Ok(result.value)
    }

    fn heap_alloc(&mut self, size: usize) -> Result<Option<u64>> {
        let (Some(heap_cell), Some(routine)) =
            (self.anchors.loader_heap, self.anchors.allocate_heap)
        else {
            return Ok(None);
        };

        let heap = self.mem.read_ptr(heap_cell, self.bitness())?;
        if heap == 0 {
            return Ok(None);
        }

        let options = self.options(self.native_cc());
        let result = self.exec.call(
            routine,
            &[
                RemoteArg::Pointer(heap),
                RemoteArg::Int(HEAP_ZERO_MEMORY),
                RemoteArg::Int(size as u64),
            ],
            &options,
        )?;
        if result.value == 0 {
            return Err(Error::RemoteAllocation {
                size,
                message: "target heap allocator returned null".to_string(),
            });
        }
        Ok(Some(result.value))
    }
}
