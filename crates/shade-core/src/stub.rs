//! Remote stub builder
//!
//! Assembles the code sequence for exactly one remote call: argument
//! marshalling per convention, an optional bit-mode switch wrapped around
//! the call, result capture into the call context, completion signal,
//! return. The stub is position-dependent; the caller passes the address it
//! will be written to.
//!
//! Call context block layout (shared contract with the executor):
//!
//! | offset | contents                               |
//! |--------|----------------------------------------|
//! | 0x00   | result cell (full-width return value)  |
//! | 0x08   | status cell (32-bit view of the result)|
//! | 0x10   | completion flag, 0 -> 1 when done      |
//! | 0x20   | argument/string spill area             |

use iced_x86::code_asm::*;
use iced_x86::IcedError;
use shade_common::{Bitness, CallingConvention, Error, Result};

pub const RESULT_OFFSET: u64 = 0x00;
pub const STATUS_OFFSET: u64 = 0x08;
pub const DONE_OFFSET: u64 = 0x10;
pub const SPILL_OFFSET: u64 = 0x20;

/// Value stored to the completion flag by the stub
pub const DONE_MAGIC: u32 = 1;

/// x64 long-mode code selector used by the mode-switch gate
const SEL_CODE64: u16 = 0x33;
/// x86 compatibility-mode code selector
const SEL_CODE32: u16 = 0x23;

fn codegen(e: IcedError) -> Error {
    Error::Codegen(e.to_string())
}

/// Where one argument travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassingClass {
    /// Designated argument register, by index
    Register(usize),
    /// Stack slot; slot k sits `k * word` past the first stack-argument
    /// position, which itself is one word past the return-address slot
    StackSlot(usize),
}

/// Ordered (value, passing-class) pairs for one call. Built fresh per call
/// and consumed once by the emitter.
#[derive(Debug, Clone)]
pub struct ArgPlan {
    pub convention: CallingConvention,
    pub entries: Vec<(u64, PassingClass)>,
}

impl ArgPlan {
    pub fn build(
        convention: CallingConvention,
        values: &[u64],
        bitness: Bitness,
    ) -> Result<Self> {
        // 64-bit emission always marshals the Win64 way regardless of the
        // declared convention; the distinction only exists on x86.
        let effective = match bitness {
            Bitness::X64 => CallingConvention::Win64,
            Bitness::X86 => {
                if convention == CallingConvention::Win64 {
                    return Err(Error::Unsupported(
                        "Win64 convention on a 32-bit callee".to_string(),
                    ));
                }
                for &v in values {
                    if v > u32::MAX as u64 {
                        return Err(Error::Unsupported(format!(
                            "argument {:#x} does not fit a 32-bit register",
                            v
                        )));
                    }
                }
                convention
            }
        };

        let reg_count = effective.register_args();
        let mut entries = Vec::with_capacity(values.len());
        let mut slot = 0usize;
        for (i, &value) in values.iter().enumerate() {
            let class = if i < reg_count {
                PassingClass::Register(i)
            } else {
                let s = PassingClass::StackSlot(slot);
                slot += 1;
                s
            };
            entries.push((value, class));
        }

        Ok(Self {
            convention: effective,
            entries,
        })
    }

    /// Byte offset of a stack slot from the first stack-argument position
    pub fn stack_slot_offset(slot: usize, bitness: Bitness) -> u64 {
        slot as u64 * bitness.word_size()
    }

    fn stack_args(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.entries.iter().filter_map(|&(v, c)| match c {
            PassingClass::StackSlot(s) => Some((v, s)),
            PassingClass::Register(_) => None,
        })
    }

    fn register_args(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.entries.iter().filter_map(|&(v, c)| match c {
            PassingClass::Register(r) => Some((v, r)),
            PassingClass::StackSlot(_) => None,
        })
    }
}

/// Finished stub, ready to be written at the address it was built for
#[derive(Debug, Clone)]
pub struct StubImage {
    pub bytes: Vec<u8>,
    /// Entry offset within `bytes`
    pub entry: u64,
    /// Result-cell offset within the call context block
    pub result_cell: u64,
}

/// Builds call stubs for one worker-mode / callee-mode pairing
#[derive(Debug, Clone, Copy)]
pub struct RemoteStubBuilder {
    /// Mode the worker thread starts in
    pub worker_mode: Bitness,
    /// Mode of the callee
    pub callee_mode: Bitness,
}

impl RemoteStubBuilder {
    pub fn new(worker_mode: Bitness, callee_mode: Bitness) -> Self {
        Self {
            worker_mode,
            callee_mode,
        }
    }

    /// Whether a mode-transition sequence wraps the call
    pub fn needs_mode_switch(&self) -> bool {
        self.worker_mode != self.callee_mode
    }

    /// Assemble the stub for one call at `stub_base`, reporting into the
    /// context block at `ctx`.
    pub fn build(
        &self,
        stub_base: u64,
        ctx: u64,
        target: u64,
        plan: &ArgPlan,
    ) -> Result<StubImage> {
        let bytes = match (self.worker_mode, self.callee_mode) {
            (Bitness::X64, Bitness::X64) => emit_x64(stub_base, ctx, target, plan, false)?,
            (Bitness::X86, Bitness::X86) => emit_x86(stub_base, ctx, target, plan)?,
            (Bitness::X86, Bitness::X64) => emit_gate_call(stub_base, ctx, target, plan)?,
            (Bitness::X64, Bitness::X86) => {
                return Err(Error::Unsupported(
                    "64-bit worker calling a 32-bit callee".to_string(),
                ))
            }
        };

        Ok(StubImage {
            bytes,
            entry: 0,
            result_cell: RESULT_OFFSET,
        })
    }
}

fn win64_frame(total_args: usize, aligned_entry: bool) -> i32 {
    // Room for the four-register home area plus any stack slots; the call
    // itself pushes the return address, so an entry from a running thread
    // (rsp = 8 mod 16) takes an extra word to land 16-aligned at the call.
    let base = std::cmp::max(total_args * 8, 0x28);
    let aligned = (base + 15) & !15;
    if aligned_entry {
        aligned as i32
    } else {
        (aligned + 8) as i32
    }
}

/// Plain 64-bit stub. With `aligned_entry` the stack is already 16-aligned
/// (mode-switch path aligns it explicitly).
fn emit_x64(
    stub_base: u64,
    ctx: u64,
    target: u64,
    plan: &ArgPlan,
    aligned_entry: bool,
) -> Result<Vec<u8>> {
    let mut a = CodeAssembler::new(64).map_err(codegen)?;
    let frame = win64_frame(plan.entries.len(), aligned_entry);

    a.sub(rsp, frame).map_err(codegen)?;

    // Stack slots first, through the scratch register the call target will
    // reuse afterwards
    for (value, slot) in plan.stack_args() {
        let disp = 0x20 + (slot as i32) * 8;
        a.mov(rax, value).map_err(codegen)?;
        a.mov(qword_ptr(rsp + disp), rax).map_err(codegen)?;
    }

    for (value, index) in plan.register_args() {
        let reg = [rcx, rdx, r8, r9][index];
        a.mov(reg, value).map_err(codegen)?;
    }

    a.mov(rax, target).map_err(codegen)?;
    a.call(rax).map_err(codegen)?;

    // Result, status, completion
    a.mov(rcx, ctx + RESULT_OFFSET).map_err(codegen)?;
    a.mov(qword_ptr(rcx), rax).map_err(codegen)?;
    a.mov(rcx, ctx + STATUS_OFFSET).map_err(codegen)?;
    a.mov(dword_ptr(rcx), eax).map_err(codegen)?;
    a.mov(rcx, ctx + DONE_OFFSET).map_err(codegen)?;
    a.mov(dword_ptr(rcx), DONE_MAGIC as i32).map_err(codegen)?;

    a.add(rsp, frame).map_err(codegen)?;
    a.ret().map_err(codegen)?;

    a.assemble(stub_base).map_err(codegen)
}

/// Plain 32-bit stub
fn emit_x86(stub_base: u64, ctx: u64, target: u64, plan: &ArgPlan) -> Result<Vec<u8>> {
    let mut a = CodeAssembler::new(32).map_err(codegen)?;

    a.push(ebp).map_err(codegen)?;
    a.mov(ebp, esp).map_err(codegen)?;

    // Stack args pushed right-to-left so slot 0 lands lowest
    let stack: Vec<(u64, usize)> = plan.stack_args().collect();
    for &(value, _) in stack.iter().rev() {
        a.push(value as i32).map_err(codegen)?;
    }

    for (value, index) in plan.register_args() {
        let reg = [ecx, edx][index];
        a.mov(reg, value as u32).map_err(codegen)?;
    }

    a.mov(eax, target as u32).map_err(codegen)?;
    a.call(eax).map_err(codegen)?;

    if plan.convention.caller_cleans() && !stack.is_empty() {
        a.add(esp, (stack.len() * 4) as i32).map_err(codegen)?;
    }

    // Result cell is 8 bytes wide; clear the high half explicitly
    a.mov(edx, (ctx + RESULT_OFFSET) as u32).map_err(codegen)?;
    a.mov(dword_ptr(edx), eax).map_err(codegen)?;
    a.mov(dword_ptr(edx + 4), 0i32).map_err(codegen)?;
    a.mov(edx, (ctx + STATUS_OFFSET) as u32).map_err(codegen)?;
    a.mov(dword_ptr(edx), eax).map_err(codegen)?;
    a.mov(edx, (ctx + DONE_OFFSET) as u32).map_err(codegen)?;
    a.mov(dword_ptr(edx), DONE_MAGIC as i32).map_err(codegen)?;

    a.mov(esp, ebp).map_err(codegen)?;
    a.pop(ebp).map_err(codegen)?;
    // ret 4: the worker start routine passes one stdcall argument
    a.db(&[0xC2, 0x04, 0x00]).map_err(codegen)?;

    a.assemble(stub_base).map_err(codegen)
}

/// 32-bit worker calling a 64-bit callee: far-transfer into long mode,
/// run the 64-bit call sequence, far-return to compatibility mode, finish
/// in 32-bit code. Requires the stub page below 4 GB, which holds for any
/// dual-mode target.
fn emit_gate_call(stub_base: u64, ctx: u64, target: u64, plan: &ArgPlan) -> Result<Vec<u8>> {
    if stub_base > u32::MAX as u64 {
        return Err(Error::Unsupported(
            "mode-switch stub must live below 4 GB".to_string(),
        ));
    }

    // jmp far SEL_CODE64:<64-bit body> — EA imm32 sel16, 7 bytes
    let gate_len = 7u64;
    let body_base = stub_base + gate_len;

    // Two passes: the far return inside the body targets the 32-bit tail,
    // whose address depends on the body length. Immediate widths are fixed,
    // so the length converges after the first pass.
    let body_probe = emit_gate_body(body_base, ctx, target, plan, body_base)?;
    let tail_base = body_base + body_probe.len() as u64;
    let body = emit_gate_body(body_base, ctx, target, plan, tail_base)?;
    debug_assert_eq!(body.len(), body_probe.len());

    let mut bytes = Vec::with_capacity(gate_len as usize + body.len() + 8);
    bytes.push(0xEA);
    bytes.extend_from_slice(&(body_base as u32).to_le_bytes());
    bytes.extend_from_slice(&SEL_CODE64.to_le_bytes());
    bytes.extend_from_slice(&body);

    // 32-bit tail: completion flag, then return to the worker start routine
    let mut tail = CodeAssembler::new(32).map_err(codegen)?;
    tail.mov(edx, (ctx + DONE_OFFSET) as u32).map_err(codegen)?;
    tail.mov(dword_ptr(edx), DONE_MAGIC as i32).map_err(codegen)?;
    tail.db(&[0xC2, 0x04, 0x00]).map_err(codegen)?;
    bytes.extend_from_slice(&tail.assemble(tail_base).map_err(codegen)?);

    Ok(bytes)
}

/// The long-mode section of a gate stub: align, call, capture, far-return
fn emit_gate_body(
    body_base: u64,
    ctx: u64,
    target: u64,
    plan: &ArgPlan,
    return_to: u64,
) -> Result<Vec<u8>> {
    let mut a = CodeAssembler::new(64).map_err(codegen)?;
    let frame = win64_frame(plan.entries.len(), true);

    // Preserve the 32-bit stack pointer across the aligned call
    a.mov(r12, rsp).map_err(codegen)?;
    a.and(rsp, -16i32).map_err(codegen)?;
    a.sub(rsp, frame).map_err(codegen)?;

    for (value, slot) in plan.stack_args() {
        let disp = 0x20 + (slot as i32) * 8;
        a.mov(rax, value).map_err(codegen)?;
        a.mov(qword_ptr(rsp + disp), rax).map_err(codegen)?;
    }
    for (value, index) in plan.register_args() {
        let reg = [rcx, rdx, r8, r9][index];
        a.mov(reg, value).map_err(codegen)?;
    }

    a.mov(rax, target).map_err(codegen)?;
    a.call(rax).map_err(codegen)?;

    a.mov(rcx, ctx + RESULT_OFFSET).map_err(codegen)?;
    a.mov(qword_ptr(rcx), rax).map_err(codegen)?;
    a.mov(rcx, ctx + STATUS_OFFSET).map_err(codegen)?;
    a.mov(dword_ptr(rcx), eax).map_err(codegen)?;

    a.add(rsp, frame).map_err(codegen)?;
    a.mov(rsp, r12).map_err(codegen)?;

    // Far return to compatibility mode: 32-bit offset and selector frames
    a.sub(rsp, 8i32).map_err(codegen)?;
    a.mov(dword_ptr(rsp), return_to as i32).map_err(codegen)?;
    a.mov(dword_ptr(rsp + 4), SEL_CODE32 as i32).map_err(codegen)?;
    // retf, 32-bit operand size
    a.db(&[0xCB]).map_err(codegen)?;

    a.assemble(body_base).map_err(codegen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn decode(bytes: &[u8], bitness: u32, ip: u64) -> Vec<iced_x86::Instruction> {
        Decoder::with_ip(bitness, bytes, ip, DecoderOptions::NONE)
            .iter()
            .collect()
    }

    #[test]
    fn test_plan_win64_six_args() {
        let values = [1u64, 2, 3, 4, 5, 6];
        let plan = ArgPlan::build(CallingConvention::Win64, &values, Bitness::X64).unwrap();

        for i in 0..4 {
            assert_eq!(plan.entries[i].1, PassingClass::Register(i));
        }
        assert_eq!(plan.entries[4].1, PassingClass::StackSlot(0));
        assert_eq!(plan.entries[5].1, PassingClass::StackSlot(1));

        // Stack slots 0 and 1 land at offsets 0 and word size
        assert_eq!(ArgPlan::stack_slot_offset(0, Bitness::X64), 0);
        assert_eq!(ArgPlan::stack_slot_offset(1, Bitness::X64), 8);
    }

    #[test]
    fn test_plan_fastcall() {
        let plan =
            ArgPlan::build(CallingConvention::Fastcall, &[10, 20, 30], Bitness::X86).unwrap();
        assert_eq!(plan.entries[0].1, PassingClass::Register(0));
        assert_eq!(plan.entries[1].1, PassingClass::Register(1));
        assert_eq!(plan.entries[2].1, PassingClass::StackSlot(0));
    }

    #[test]
    fn test_plan_stdcall_all_stack() {
        let plan = ArgPlan::build(CallingConvention::Stdcall, &[1, 2], Bitness::X86).unwrap();
        assert_eq!(plan.entries[0].1, PassingClass::StackSlot(0));
        assert_eq!(plan.entries[1].1, PassingClass::StackSlot(1));
    }

    #[test]
    fn test_plan_rejects_wide_arg_on_x86() {
        let err = ArgPlan::build(
            CallingConvention::Stdcall,
            &[0x1_0000_0000],
            Bitness::X86,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_x64_stub_shape() {
        let plan =
            ArgPlan::build(CallingConvention::Win64, &[7, 8], Bitness::X64).unwrap();
        let builder = RemoteStubBuilder::new(Bitness::X64, Bitness::X64);
        let stub = builder
            .build(0x1_0000, 0x2_0000, 0xdead_beef, &plan)
            .unwrap();

        let insns = decode(&stub.bytes, 64, 0x1_0000);
        assert_eq!(insns.first().unwrap().mnemonic(), Mnemonic::Sub);
        assert_eq!(insns.last().unwrap().mnemonic(), Mnemonic::Ret);
        // Two register loads carry the argument values
        let imm_loads: Vec<u64> = insns
            .iter()
            .filter(|i| {
                i.mnemonic() == Mnemonic::Mov
                    && i.op0_kind() == iced_x86::OpKind::Register
                    && i.op1_kind() != iced_x86::OpKind::Register
                    && i.op1_kind() != iced_x86::OpKind::Memory
            })
            .map(|i| i.immediate(1))
            .collect();
        assert!(imm_loads.contains(&7));
        assert!(imm_loads.contains(&8));
    }

    #[test]
    fn test_x86_stub_pushes_right_to_left() {
        let plan =
            ArgPlan::build(CallingConvention::Stdcall, &[0x11, 0x22], Bitness::X86).unwrap();
        let builder = RemoteStubBuilder::new(Bitness::X86, Bitness::X86);
        let stub = builder.build(0x40_0000, 0x50_0000, 0x1234, &plan).unwrap();

        let insns = decode(&stub.bytes, 32, 0x40_0000);
        let pushes: Vec<u64> = insns
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Push && i.op0_kind() != iced_x86::OpKind::Register)
            .map(|i| i.immediate(0))
            .collect();
        // Last value pushed first; slot 0 ends up lowest on the stack
        assert_eq!(pushes, vec![0x22, 0x11]);
    }

    #[test]
    fn test_gate_stub_enters_long_mode() {
        let plan = ArgPlan::build(CallingConvention::Win64, &[1], Bitness::X64).unwrap();
        let builder = RemoteStubBuilder::new(Bitness::X86, Bitness::X64);
        let stub = builder
            .build(0x40_0000, 0x50_0000, 0x7ffd_0000_1000, &plan)
            .unwrap();

        // Far jump to the long-mode body with the 64-bit code selector
        assert_eq!(stub.bytes[0], 0xEA);
        let offset = u32::from_le_bytes(stub.bytes[1..5].try_into().unwrap());
        assert_eq!(offset as u64, 0x40_0000 + 7);
        let selector = u16::from_le_bytes(stub.bytes[5..7].try_into().unwrap());
        assert_eq!(selector, SEL_CODE64);
        // Far return back to compatibility mode somewhere in the body
        assert!(stub.bytes.contains(&0xCB));
    }

    #[test]
    fn test_gate_stub_rejected_above_4g() {
        let plan = ArgPlan::build(CallingConvention::Win64, &[], Bitness::X64).unwrap();
        let builder = RemoteStubBuilder::new(Bitness::X86, Bitness::X64);
        assert!(builder
            .build(0x1_0000_0000, 0x50_0000, 0x1000, &plan)
            .is_err());
    }

    #[test]
    fn test_downward_call_unsupported() {
        let plan = ArgPlan::build(CallingConvention::Stdcall, &[], Bitness::X86).unwrap();
        let builder = RemoteStubBuilder::new(Bitness::X64, Bitness::X86);
        assert!(matches!(
            builder.build(0x1000, 0x2000, 0x3000, &plan),
            Err(Error::Unsupported(_))
        ));
    }
}
