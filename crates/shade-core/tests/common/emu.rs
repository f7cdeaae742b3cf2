//! Minimal x64 emulator for generated stubs
//!
//! Executes exactly the instruction shapes the stub builder emits: immediate
//! loads, stack adjustment, register/memory moves, calls through rax, ret.
//! Calls dispatch to Rust closures registered in the fake memory, which act
//! as the "target's" routines.

use super::FakeMemory;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use shade_common::Protection;
use shade_core::traits::MemoryIo;

const STEP_LIMIT: usize = 10_000;

/// Register file visible to remote-function closures
#[derive(Debug, Default, Clone)]
pub struct Regs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r12: u64,
    pub rsp: u64,
}

impl Regs {
    fn get(&self, reg: Register) -> u64 {
        match reg.full_register() {
            Register::RAX => self.rax,
            Register::RCX => self.rcx,
            Register::RDX => self.rdx,
            Register::R8 => self.r8,
            Register::R9 => self.r9,
            Register::R12 => self.r12,
            Register::RSP => self.rsp,
            other => panic!("unemulated register {:?}", other),
        }
    }

    fn set(&mut self, reg: Register, value: u64) {
        match reg.full_register() {
            Register::RAX => self.rax = value,
            Register::RCX => self.rcx = value,
            Register::RDX => self.rdx = value,
            Register::R8 => self.r8 = value,
            Register::R9 => self.r9 = value,
            Register::R12 => self.r12 = value,
            Register::RSP => self.rsp = value,
            other => panic!("unemulated register {:?}", other),
        }
    }

    /// Win64 stack argument k as the callee sees it: return address, the
    /// four-register home area, then the spill slots
    pub fn stack_arg(&self, mem: &FakeMemory, k: usize) -> u64 {
        mem.read_u64(self.rsp + 0x28 + 8 * k as u64).unwrap()
    }
}

fn effective_address(regs: &Regs, insn: &Instruction) -> u64 {
    let base = match insn.memory_base() {
        Register::None => 0,
        reg => regs.get(reg),
    };
    base.wrapping_add(insn.memory_displacement64())
}

/// Run the stub at `entry` until its final ret
pub fn run(mem: &FakeMemory, entry: u64) {
    let stack = mem.allocate(0x4000, Protection::ReadWrite).unwrap();
    let mut regs = Regs {
        rsp: stack + 0x3000,
        ..Default::default()
    };
    let mut rip = entry;

    for _ in 0..STEP_LIMIT {
        let bytes = mem.read(rip, 16).or_else(|_| mem.read(rip, 8)).unwrap();
        let mut decoder = Decoder::with_ip(64, &bytes, rip, DecoderOptions::NONE);
        let insn = decoder.decode();
        assert!(!insn.is_invalid(), "undecodable bytes at {:#x}", rip);

        match insn.mnemonic() {
            Mnemonic::Sub => {
                let v = regs.get(insn.op0_register());
                regs.set(insn.op0_register(), v.wrapping_sub(insn.immediate(1)));
            }
            Mnemonic::Add => {
                let v = regs.get(insn.op0_register());
                regs.set(insn.op0_register(), v.wrapping_add(insn.immediate(1)));
            }
            Mnemonic::And => {
                let v = regs.get(insn.op0_register());
                regs.set(insn.op0_register(), v & insn.immediate(1));
            }
            Mnemonic::Mov => exec_mov(mem, &mut regs, &insn),
            Mnemonic::Call => {
                let target = regs.get(insn.op0_register());
                let f = mem
                    .lookup_fn(target)
                    .unwrap_or_else(|| panic!("call to unregistered function {:#x}", target));
                // Push the return address so stack-argument math holds
                regs.rsp -= 8;
                mem.write_u64(regs.rsp, insn.next_ip()).unwrap();
                regs.rax = f(mem, &regs);
                regs.rsp += 8;
            }
            Mnemonic::Ret => {
                let _ = mem.free(stack);
                return;
            }
            other => panic!("unemulated instruction {:?} at {:#x}", other, rip),
        }
        rip = insn.next_ip();
    }
    panic!("stub did not terminate within {} steps", STEP_LIMIT);
}

fn exec_mov(mem: &FakeMemory, regs: &mut Regs, insn: &Instruction) {
    match (insn.op0_kind(), insn.op1_kind()) {
        (OpKind::Register, OpKind::Register) => {
            regs.set(insn.op0_register(), regs.get(insn.op1_register()));
        }
        (OpKind::Register, _) => {
            regs.set(insn.op0_register(), insn.immediate(1));
        }
        (OpKind::Memory, OpKind::Register) => {
            let addr = effective_address(regs, insn);
            let value = regs.get(insn.op1_register());
            if insn.op1_register().size() == 4 {
                mem.write_u32(addr, value as u32).unwrap();
            } else {
                mem.write_u64(addr, value).unwrap();
            }
        }
        (OpKind::Memory, _) => {
            let addr = effective_address(regs, insn);
            mem.write_u32(addr, insn.immediate(1) as u32).unwrap();
        }
        other => panic!("unemulated mov shape {:?}", other),
    }
}
