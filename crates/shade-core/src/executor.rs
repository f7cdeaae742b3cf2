//! Remote executor
//!
//! Runs one generated call sequence inside the target and retrieves the
//! result synchronously. Per instance the protocol is strictly serialized:
//! one stub, one context block, one worker at a time; `call` takes `&mut
//! self` so two calls can never be in flight together.
//!
//! A wait timeout does NOT retract the remote unit of execution. The stub
//! and context allocations of a timed-out call are quarantined, never
//! reused, and only freed after `reap_quarantine` independently confirms
//! the worker finished (secondary join plus completion flag).

use crate::stub::{
    ArgPlan, RemoteStubBuilder, DONE_MAGIC, DONE_OFFSET, RESULT_OFFSET, SPILL_OFFSET,
    STATUS_OFFSET,
};
use crate::traits::MemoryIo;
use shade_common::{
    Bitness, CallOptions, CallResult, Error, Protection, RemoteArg, Result, WaitStatus,
    WorkerHandle,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Minimum context block size (header plus a small spill area)
const MIN_CTX_SIZE: usize = 0x40;

struct Quarantined {
    stub: u64,
    ctx: u64,
    handle: WorkerHandle,
}

pub struct RemoteExecutor<'a> {
    mem: &'a dyn MemoryIo,
    builder: RemoteStubBuilder,
    /// Allocations of timed-out calls, untouchable until confirmed finished
    quarantine: Vec<Quarantined>,
    last: Option<CallResult>,
}

impl<'a> RemoteExecutor<'a> {
    pub fn new(mem: &'a dyn MemoryIo, worker_mode: Bitness, callee_mode: Bitness) -> Self {
        Self {
            mem,
            builder: RemoteStubBuilder::new(worker_mode, callee_mode),
            quarantine: Vec::new(),
            last: None,
        }
    }

    /// Worker/callee mode pairing used by this instance
    pub fn builder(&self) -> RemoteStubBuilder {
        self.builder
    }

    /// 32-bit status view of the last completed call
    pub fn last_status(&self) -> Option<u32> {
        self.last.map(|r| r.status)
    }

    /// Execute one call in the target and block until it completes
    pub fn call(
        &mut self,
        address: u64,
        args: &[RemoteArg],
        options: &CallOptions,
    ) -> Result<CallResult> {
        let (ctx_size, spill) = plan_spill(args);
        let ctx = self.mem.allocate(ctx_size, Protection::ReadWrite)?;

        let outcome = self.call_with_ctx(ctx, address, args, &spill, options);
        match outcome {
            Ok((result, stub)) => {
                // Success or remote failure status: the worker signaled, the
                // memory is safe to release either way.
                let _ = self.mem.free(stub);
                let _ = self.mem.free(ctx);
                self.last = Some(result);
                Ok(result)
            }
            Err(CallFailure::BeforeStart(e)) => {
                let _ = self.mem.free(ctx);
                Err(e)
            }
            Err(CallFailure::AfterStart { stub, handle, error }) => {
                warn!(
                    "remote call timed out; quarantining stub {:#x} and context {:#x}",
                    stub, ctx
                );
                self.quarantine.push(Quarantined { stub, ctx, handle });
                Err(error)
            }
        }
    }

    fn call_with_ctx(
        &mut self,
        ctx: u64,
        address: u64,
        args: &[RemoteArg],
        spill: &[(usize, Vec<u8>)],
        options: &CallOptions,
    ) -> std::result::Result<(CallResult, u64), CallFailure> {
        // Spill string/buffer payloads into the context block and resolve
        // every argument to a plain value
        for (offset, payload) in spill {
            self.mem
                .write(ctx + *offset as u64, payload)
                .map_err(CallFailure::BeforeStart)?;
        }
        let values = resolve_values(args, ctx, spill);

        let plan = ArgPlan::build(options.convention, &values, self.builder.callee_mode)
            .map_err(CallFailure::BeforeStart)?;

        let stub_size = 0x1000;
        let stub_addr = self
            .mem
            .allocate(stub_size, Protection::ExecuteReadWrite)
            .map_err(CallFailure::BeforeStart)?;

        let result = self.run_stub(stub_addr, ctx, address, &plan, options);
        match result {
            Ok(r) => Ok((r, stub_addr)),
            Err(RunFailure::NotStarted(e)) => {
                let _ = self.mem.free(stub_addr);
                Err(CallFailure::BeforeStart(e))
            }
            Err(RunFailure::TimedOut { handle, error }) => Err(CallFailure::AfterStart {
                stub: stub_addr,
                handle,
                error,
            }),
        }
    }

    fn run_stub(
        &mut self,
        stub_addr: u64,
        ctx: u64,
        address: u64,
        plan: &ArgPlan,
        options: &CallOptions,
    ) -> std::result::Result<CallResult, RunFailure> {
        let stub = self
            .builder
            .build(stub_addr, ctx, address, plan)
            .map_err(RunFailure::NotStarted)?;
        self.mem
            .write(stub_addr, &stub.bytes)
            .map_err(RunFailure::NotStarted)?;

        trace!(
            "starting remote call to {:#x}, stub at {:#x}, {} args",
            address,
            stub_addr,
            plan.entries.len()
        );

        let handle = self
            .mem
            .create_worker(stub_addr + stub.entry, ctx)
            .map_err(RunFailure::NotStarted)?;

        let timeout = Duration::from_millis(options.timeout_ms);
        match self.mem.wait_one(handle, timeout) {
            Ok(WaitStatus::Signaled) => {}
            Ok(WaitStatus::TimedOut) => {
                return Err(RunFailure::TimedOut {
                    handle,
                    error: Error::WaitTimeout {
                        ms: options.timeout_ms,
                    },
                })
            }
            Err(e) => {
                // Wait failure after the worker started: same hazard as a
                // timeout, the worker may still be running.
                return Err(RunFailure::TimedOut { handle, error: e });
            }
        }

        let done = self
            .mem
            .read_u32(ctx + DONE_OFFSET)
            .map_err(|e| RunFailure::TimedOut { handle, error: e })?;
        if done != DONE_MAGIC {
            debug!("worker exited without completion flag");
        }

        let value = self
            .mem
            .read_u64(ctx + RESULT_OFFSET)
            .map_err(|e| RunFailure::TimedOut { handle, error: e })?;
        let status = self
            .mem
            .read_u32(ctx + STATUS_OFFSET)
            .map_err(|e| RunFailure::TimedOut { handle, error: e })?;

        Ok(CallResult { value, status })
    }

    /// Secondary join over quarantined calls. Frees the allocations of
    /// every worker that can be confirmed finished; returns the number of
    /// calls still quarantined.
    pub fn reap_quarantine(&mut self) -> usize {
        let mem = self.mem;
        self.quarantine.retain(|q| {
            let joined = matches!(
                mem.wait_one(q.handle, Duration::ZERO),
                Ok(WaitStatus::Signaled)
            );
            if joined {
                let _ = mem.free(q.stub);
                let _ = mem.free(q.ctx);
            }
            !joined
        });
        self.quarantine.len()
    }
}

enum CallFailure {
    BeforeStart(Error),
    AfterStart {
        stub: u64,
        handle: WorkerHandle,
        error: Error,
    },
}

enum RunFailure {
    NotStarted(Error),
    TimedOut { handle: WorkerHandle, error: Error },
}

/// Compute the spill layout: (context size, per-arg (offset, payload))
fn plan_spill(args: &[RemoteArg]) -> (usize, Vec<(usize, Vec<u8>)>) {
    let mut offset = SPILL_OFFSET as usize;
    let mut spill = Vec::new();

    for arg in args {
        let payload = match arg {
            RemoteArg::WideString(s) => {
                let mut bytes: Vec<u8> =
                    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
                bytes.extend_from_slice(&[0, 0]);
                Some(bytes)
            }
            RemoteArg::Bytes(b) => Some(b.clone()),
            RemoteArg::Int(_) | RemoteArg::Pointer(_) => None,
        };
        if let Some(payload) = payload {
            spill.push((offset, payload));
            let len = spill.last().unwrap().1.len();
            offset += (len + 7) & !7;
        }
    }

    (offset.max(MIN_CTX_SIZE), spill)
}

/// Resolve each argument to the value that travels in a register or slot
fn resolve_values(args: &[RemoteArg], ctx: u64, spill: &[(usize, Vec<u8>)]) -> Vec<u64> {
    let mut spilled = spill.iter();
    args.iter()
        .map(|arg| match arg.immediate() {
            Some(v) => v,
            None => {
                let (offset, _) = spilled.next().expect("spill plan covers every buffer arg");
                ctx + *offset as u64
            }
        })
        .collect()
}
