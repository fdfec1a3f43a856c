//! Gadget lifter: x86_64 bytes to symbolic effects.
//!
//! Covers the instruction forms that make up the bulk of real ROP
//! gadgets: pops and pushes, register/immediate moves, simple ALU ops,
//! loads and stores through a base register, and the `ret` / `jmp reg` /
//! `call reg` endings. Anything else is reported as unsupported.

use std::collections::{BTreeMap, BTreeSet};

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};

use crate::error::{Error, Result};
use crate::gadget::{EndKind, MemAccess, MAX_SP_DELTA};
use crate::symbolic::expr::{Expr, VarAlias};
use crate::types::Reg;

/// A store performed by the gadget; its width is `value.bits()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemWrite {
    pub addr: Expr,
    pub value: Expr,
}

/// Everything the solver needs to know about one gadget execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effects {
    /// Final value of every register the gadget assigns (rsp excluded).
    pub regs: BTreeMap<Reg, Expr>,
    pub written: BTreeSet<Reg>,
    pub mem_writes: Vec<MemWrite>,
    pub reads_memory: bool,
    /// Target of the closing `jmp reg` / `call reg`.
    pub transfer: Option<Expr>,
    pub end: EndKind,
    /// Stack bytes consumed before the control transfer.
    pub sp_delta: i64,
}

impl Effects {
    /// Final value of `reg`, or its entry value if the gadget leaves it alone.
    pub fn reg(&self, reg: Reg) -> Expr {
        self.regs.get(&reg).cloned().unwrap_or_else(|| Expr::reg(reg))
    }

    pub fn mem_access(&self) -> MemAccess {
        match self.mem_writes.first() {
            Some(w) => MemAccess::Write(w.value.bits()),
            None if self.reads_memory => MemAccess::Read,
            None => MemAccess::None,
        }
    }
}

/// Decode `bytes` at `addr` into instructions, rejecting invalid encodings.
pub(crate) fn decode(addr: u64, bytes: &[u8]) -> Result<Vec<Instruction>> {
    if bytes.is_empty() {
        return Err(Error::NoBytes(addr));
    }
    let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
    let mut insns = Vec::new();
    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(Error::Decode {
                addr: insn.ip(),
                reason: "invalid instruction".into(),
            });
        }
        insns.push(insn);
    }
    Ok(insns)
}

/// Lift the gadget at `addr` into its effects.
pub fn lift(addr: u64, bytes: &[u8]) -> Result<Effects> {
    let insns = decode(addr, bytes)?;
    let mut state = State::default();
    let last = insns.len() - 1;

    for (i, insn) in insns.iter().enumerate() {
        if insn.flow_control() != FlowControl::Next {
            if i != last {
                return Err(unsupported(insn));
            }
            return state.finish(insn);
        }
        state.step(insn)?;
    }

    Err(Error::Decode {
        addr,
        reason: "gadget does not end in a control transfer".into(),
    })
}

fn unsupported(insn: &Instruction) -> Error {
    Error::Unsupported {
        addr: insn.ip(),
        insn: format!("{}", insn),
    }
}

enum Address {
    /// `[entry rsp + offset]`
    Stack(i64),
    Mem(Expr),
}

#[derive(Default)]
struct State {
    regs: BTreeMap<Reg, Expr>,
    written: BTreeSet<Reg>,
    /// rsp relative to gadget entry.
    sp: i64,
    /// Qwords stored on the stack by the gadget itself.
    stack: BTreeMap<i64, Expr>,
    mem_writes: Vec<MemWrite>,
    reads_memory: bool,
}

impl State {
    fn get(&self, reg: Reg) -> Expr {
        if reg == Reg::Rsp {
            return Expr::add(Expr::reg(Reg::Rsp), Expr::qword(self.sp as u64)).simplify();
        }
        self.regs.get(&reg).cloned().unwrap_or_else(|| Expr::reg(reg))
    }

    fn set(&mut self, reg: Reg, value: Expr) {
        self.regs.insert(reg, value.simplify());
        self.written.insert(reg);
    }

    fn read_stack(&self, off: i64) -> Expr {
        if let Some(v) = self.stack.get(&off) {
            return v.clone();
        }
        if off >= 0 {
            Expr::stack(off as u64)
        } else {
            Expr::var(VarAlias::Other(format!("STACK-{:#x}", -off)))
        }
    }

    fn read_reg(&self, insn: &Instruction, reg: Register) -> Result<(Expr, u32)> {
        let full = Reg::from_iced(reg).ok_or_else(|| unsupported(insn))?;
        match reg.size() {
            8 => Ok((self.get(full), 64)),
            4 => Ok((Expr::extract(31, 0, self.get(full)), 32)),
            _ => Err(unsupported(insn)),
        }
    }

    fn write_reg(&mut self, insn: &Instruction, reg: Register, value: Expr) -> Result<()> {
        let full = Reg::from_iced(reg).ok_or_else(|| unsupported(insn))?;
        if full == Reg::Rsp {
            return Err(unsupported(insn));
        }
        match reg.size() {
            8 => self.set(full, value),
            // 32-bit writes zero the upper half
            4 => self.set(full, Expr::zext(64, value)),
            _ => return Err(unsupported(insn)),
        }
        Ok(())
    }

    fn dst_reg(&self, insn: &Instruction) -> Result<(Register, u32)> {
        if insn.op0_kind() != OpKind::Register {
            return Err(unsupported(insn));
        }
        let reg = insn.op0_register();
        let (_, width) = self.read_reg(insn, reg)?;
        Ok((reg, width))
    }

    fn operand(&mut self, insn: &Instruction, op: u32, width: u32) -> Result<Expr> {
        match insn.op_kind(op) {
            OpKind::Register => {
                let (value, w) = self.read_reg(insn, insn.op_register(op))?;
                if w != width {
                    return Err(unsupported(insn));
                }
                Ok(value)
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(Expr::constant(insn.immediate(op), width)),
            OpKind::Memory => self.load(insn, width),
            _ => Err(unsupported(insn)),
        }
    }

    fn address(&self, insn: &Instruction) -> Result<Address> {
        if matches!(insn.memory_segment(), Register::FS | Register::GS) {
            return Err(unsupported(insn));
        }
        if insn.is_ip_rel_memory_operand() {
            return Ok(Address::Mem(Expr::qword(insn.ip_rel_memory_address())));
        }
        let base = insn.memory_base();
        let index = insn.memory_index();
        let disp = insn.memory_displacement64();
        if base == Register::RSP && index == Register::None {
            return Ok(Address::Stack(self.sp.wrapping_add(disp as i64)));
        }

        let mut addr = Expr::qword(disp);
        if base != Register::None {
            let (b, w) = self.read_reg(insn, base)?;
            if w != 64 {
                return Err(unsupported(insn));
            }
            addr = Expr::add(b, addr);
        }
        if index != Register::None {
            let (i, w) = self.read_reg(insn, index)?;
            if w != 64 {
                return Err(unsupported(insn));
            }
            let shift = insn.memory_index_scale().trailing_zeros();
            addr = Expr::add(addr, Expr::shl(i, shift));
        }
        Ok(Address::Mem(addr.simplify()))
    }

    fn load(&mut self, insn: &Instruction, width: u32) -> Result<Expr> {
        let value = match self.address(insn)? {
            Address::Stack(off) => self.read_stack(off),
            Address::Mem(addr) => {
                self.reads_memory = true;
                Expr::var(VarAlias::Other(format!("[{}]", addr)))
            }
        };
        match width {
            64 => Ok(value),
            32 => Ok(Expr::extract(31, 0, value)),
            _ => Err(unsupported(insn)),
        }
    }

    fn store(&mut self, insn: &Instruction, value: Expr) -> Result<()> {
        match self.address(insn)? {
            Address::Stack(off) => {
                if value.bits() != 64 {
                    return Err(unsupported(insn));
                }
                self.stack.insert(off, value.simplify());
            }
            Address::Mem(addr) => self.mem_writes.push(MemWrite {
                addr,
                value: value.simplify(),
            }),
        }
        Ok(())
    }

    fn step(&mut self, insn: &Instruction) -> Result<()> {
        match insn.mnemonic() {
            Mnemonic::Nop | Mnemonic::Endbr64 => {}
            Mnemonic::Pop => {
                let (reg, width) = self.dst_reg(insn)?;
                if width != 64 {
                    return Err(unsupported(insn));
                }
                let value = self.read_stack(self.sp);
                self.sp += 8;
                self.write_reg(insn, reg, value)?;
            }
            Mnemonic::Push => {
                let value = self.operand(insn, 0, 64)?;
                self.sp -= 8;
                self.stack.insert(self.sp, value.simplify());
            }
            Mnemonic::Mov => match insn.op0_kind() {
                OpKind::Register => {
                    let (reg, width) = self.dst_reg(insn)?;
                    let value = self.operand(insn, 1, width)?;
                    self.write_reg(insn, reg, value)?;
                }
                OpKind::Memory => {
                    let width = (insn.memory_size().size() * 8) as u32;
                    let value = self.operand(insn, 1, width)?;
                    self.store(insn, value)?;
                }
                _ => return Err(unsupported(insn)),
            },
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::Xor | Mnemonic::And | Mnemonic::Or => {
                let (reg, width) = self.dst_reg(insn)?;
                if reg == Register::RSP {
                    return self.adjust_sp(insn);
                }
                let lhs = self.read_reg(insn, reg)?.0;
                let rhs = self.operand(insn, 1, width)?;
                let value = match insn.mnemonic() {
                    Mnemonic::Add => Expr::add(lhs, rhs),
                    Mnemonic::Sub => Expr::sub(lhs, rhs),
                    Mnemonic::Xor => Expr::xor(lhs, rhs),
                    Mnemonic::And => Expr::and(lhs, rhs),
                    _ => Expr::or(lhs, rhs),
                };
                self.write_reg(insn, reg, value)?;
            }
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => {
                let (reg, width) = self.dst_reg(insn)?;
                let value = self.read_reg(insn, reg)?.0;
                let one = Expr::constant(1, width);
                let value = match insn.mnemonic() {
                    Mnemonic::Inc => Expr::add(value, one),
                    Mnemonic::Dec => Expr::sub(value, one),
                    Mnemonic::Neg => Expr::neg(value),
                    _ => Expr::not(value),
                };
                self.write_reg(insn, reg, value)?;
            }
            Mnemonic::Xchg => {
                if insn.op0_kind() != OpKind::Register || insn.op1_kind() != OpKind::Register {
                    return Err(unsupported(insn));
                }
                let (a, b) = (insn.op0_register(), insn.op1_register());
                let (va, wa) = self.read_reg(insn, a)?;
                let (vb, wb) = self.read_reg(insn, b)?;
                if wa != wb {
                    return Err(unsupported(insn));
                }
                self.write_reg(insn, a, vb)?;
                self.write_reg(insn, b, va)?;
            }
            Mnemonic::Lea => {
                let (reg, width) = self.dst_reg(insn)?;
                let addr = match self.address(insn)? {
                    Address::Stack(off) => {
                        Expr::add(Expr::reg(Reg::Rsp), Expr::qword(off as u64)).simplify()
                    }
                    Address::Mem(addr) => addr,
                };
                let value = if width == 32 { Expr::extract(31, 0, addr) } else { addr };
                self.write_reg(insn, reg, value)?;
            }
            Mnemonic::Shl | Mnemonic::Shr => {
                let (reg, width) = self.dst_reg(insn)?;
                if insn.op1_kind() != OpKind::Immediate8 {
                    return Err(unsupported(insn));
                }
                // the CPU masks the count to the operand width
                let count = (insn.immediate(1) as u32) & (width - 1);
                let value = self.read_reg(insn, reg)?.0;
                let value = if insn.mnemonic() == Mnemonic::Shl {
                    Expr::shl(value, count)
                } else {
                    Expr::shr(value, count)
                };
                self.write_reg(insn, reg, value)?;
            }
            _ => return Err(unsupported(insn)),
        }
        Ok(())
    }

    fn adjust_sp(&mut self, insn: &Instruction) -> Result<()> {
        if insn.op1_kind() == OpKind::Register || insn.op1_kind() == OpKind::Memory {
            return Err(unsupported(insn));
        }
        let imm = insn.immediate(1) as i64;
        match insn.mnemonic() {
            Mnemonic::Add => self.sp = self.sp.wrapping_add(imm),
            Mnemonic::Sub => self.sp = self.sp.wrapping_sub(imm),
            _ => return Err(unsupported(insn)),
        }
        Ok(())
    }

    fn finish(self, insn: &Instruction) -> Result<Effects> {
        let (end, transfer) = match insn.flow_control() {
            // `ret imm16` would put padding after the next address
            FlowControl::Return if insn.op_count() == 0 => (EndKind::Return, None),
            FlowControl::IndirectBranch | FlowControl::IndirectCall
                if insn.op0_kind() == OpKind::Register =>
            {
                let (target, width) = self.read_reg(insn, insn.op0_register())?;
                let reg = Reg::from_iced(insn.op0_register()).ok_or_else(|| unsupported(insn))?;
                if width != 64 {
                    return Err(unsupported(insn));
                }
                let end = if insn.flow_control() == FlowControl::IndirectBranch {
                    EndKind::Jump(reg)
                } else {
                    EndKind::Call(reg)
                };
                (end, Some(target))
            }
            _ => return Err(unsupported(insn)),
        };

        if self.sp < 0 || self.sp > MAX_SP_DELTA || self.sp % 8 != 0 {
            return Err(unsupported(insn));
        }

        // Slots at or past the final rsp belong to whatever runs next;
        // the gadget cannot be given a value there.
        let limit = self.sp as u64;
        let demote = |alias: &VarAlias| match alias {
            VarAlias::Stack(off) if *off >= limit => {
                Some(Expr::var(VarAlias::Other(format!("STACK+{:#x}", off))))
            }
            _ => None,
        };

        Ok(Effects {
            regs: self
                .regs
                .iter()
                .map(|(r, e)| (*r, e.substitute(&demote)))
                .collect(),
            written: self.written,
            mem_writes: self
                .mem_writes
                .iter()
                .map(|w| MemWrite {
                    addr: w.addr.substitute(&demote),
                    value: w.value.substitute(&demote),
                })
                .collect(),
            reads_memory: self.reads_memory,
            transfer: transfer.map(|t| t.substitute(&demote)),
            end,
            sp_delta: self.sp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lift_pop_rdi_ret() {
        let fx = lift(0x1000, &[0x5f, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rdi), Expr::stack(0));
        assert_eq!(fx.sp_delta, 8);
        assert_eq!(fx.end, EndKind::Return);
        assert_eq!(fx.mem_access(), MemAccess::None);
    }

    #[test]
    fn lift_two_pops() {
        // pop rsi; pop r15; ret
        let fx = lift(0x2000, &[0x5e, 0x41, 0x5f, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rsi), Expr::stack(0));
        assert_eq!(fx.reg(Reg::R15), Expr::stack(8));
        assert_eq!(fx.sp_delta, 16);
    }

    #[test]
    fn lift_xor_self_is_zero() {
        // xor eax, eax; ret
        let fx = lift(0x3000, &[0x31, 0xc0, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rax), Expr::qword(0));
        assert_eq!(fx.sp_delta, 0);
    }

    #[test]
    fn lift_mov_reg_reg() {
        // mov rdi, rax; ret
        let fx = lift(0x4000, &[0x48, 0x89, 0xc7, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rdi), Expr::reg(Reg::Rax));
        assert!(fx.written.contains(&Reg::Rdi));
        assert!(!fx.written.contains(&Reg::Rax));
    }

    #[test]
    fn lift_pop_then_add_imm() {
        // pop rax; add rax, 0x10; ret
        let fx = lift(0x5000, &[0x58, 0x48, 0x83, 0xc0, 0x10, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rax), Expr::add(Expr::stack(0), Expr::qword(0x10)));
    }

    #[test]
    fn lift_mov_imm32_zero_extends() {
        // mov eax, 0x3b; ret
        let fx = lift(0x6000, &[0xb8, 0x3b, 0x00, 0x00, 0x00, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rax), Expr::qword(0x3b));
    }

    #[test]
    fn lift_add_rsp_skips_slot() {
        // add rsp, 8; ret
        let fx = lift(0x7000, &[0x48, 0x83, 0xc4, 0x08, 0xc3]).unwrap();
        assert_eq!(fx.sp_delta, 8);
        assert!(fx.written.is_empty());
    }

    #[test]
    fn lift_rejects_huge_stack_skip() {
        // add rsp, 0x2000; ret
        let err = lift(0x7000, &[0x48, 0x81, 0xc4, 0x00, 0x20, 0x00, 0x00, 0xc3]).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn lift_jmp_and_call_reg() {
        // pop rdi; jmp rax
        let fx = lift(0x8000, &[0x5f, 0xff, 0xe0]).unwrap();
        assert_eq!(fx.end, EndKind::Jump(Reg::Rax));
        assert_eq!(fx.transfer, Some(Expr::reg(Reg::Rax)));
        assert_eq!(fx.sp_delta, 8);

        // call rbx
        let fx = lift(0x9000, &[0xff, 0xd3]).unwrap();
        assert_eq!(fx.end, EndKind::Call(Reg::Rbx));
    }

    #[test]
    fn lift_memory_write() {
        // mov qword ptr [rdi], rsi; ret
        let fx = lift(0xa000, &[0x48, 0x89, 0x37, 0xc3]).unwrap();
        assert_eq!(fx.mem_access(), MemAccess::Write(64));
        assert_eq!(fx.mem_writes[0].addr, Expr::reg(Reg::Rdi));
        assert_eq!(fx.mem_writes[0].value, Expr::reg(Reg::Rsi));

        // mov qword ptr [rdi+8], rax; ret
        let fx = lift(0xa100, &[0x48, 0x89, 0x47, 0x08, 0xc3]).unwrap();
        assert_eq!(fx.mem_writes[0].addr, Expr::add(Expr::reg(Reg::Rdi), Expr::qword(8)));
    }

    #[test]
    fn lift_memory_read() {
        // mov rax, qword ptr [rdi]; ret
        let fx = lift(0xb000, &[0x48, 0x8b, 0x07, 0xc3]).unwrap();
        assert_eq!(fx.mem_access(), MemAccess::Read);
    }

    #[test]
    fn stack_read_past_final_rsp_is_uncontrolled() {
        // mov rax, qword ptr [rsp+8]; ret
        let fx = lift(0xc000, &[0x48, 0x8b, 0x44, 0x24, 0x08, 0xc3]).unwrap();
        assert!(matches!(fx.reg(Reg::Rax).as_var(), Some(VarAlias::Other(_))));
    }

    #[test]
    fn push_pop_moves_value() {
        // push rsi; pop rdi; ret
        let fx = lift(0xd000, &[0x56, 0x5f, 0xc3]).unwrap();
        assert_eq!(fx.reg(Reg::Rdi), Expr::reg(Reg::Rsi));
        assert_eq!(fx.sp_delta, 0);
    }

    #[test]
    fn rejects_unsupported_forms() {
        // ret 8
        assert!(matches!(lift(0x1, &[0xc2, 0x08, 0x00]), Err(Error::Unsupported { .. })));
        // pop rsp; ret
        assert!(matches!(lift(0x2, &[0x5c, 0xc3]), Err(Error::Unsupported { .. })));
        // ret; ret
        assert!(matches!(lift(0x3, &[0xc3, 0xc3]), Err(Error::Unsupported { .. })));
        // pop rdi (no ending)
        assert!(matches!(lift(0x4, &[0x5f]), Err(Error::Decode { .. })));
        assert!(matches!(lift(0x5, &[]), Err(Error::NoBytes(_))));
    }
}
