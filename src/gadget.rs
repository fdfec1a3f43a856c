//! Gadget model.
//!
//! A [`Gadget`] carries the catalog metadata the classifier works from
//! (popped / written / defined / input registers, stack displacement,
//! ending) and lazily caches its symbolic effects the first time the
//! solver asks for them.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use iced_x86::{Formatter as _, IntelFormatter};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::symbolic::lift::{self, Effects};
use crate::symbolic::{ConstraintEngine, Expr, VarAlias};
use crate::types::{Reg, Value};

/// Largest stack displacement a gadget may have.
pub const MAX_SP_DELTA: i64 = 0x1000;

/// How a gadget hands control to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndKind {
    /// `ret`
    Return,
    /// `jmp reg`
    Jump(Reg),
    /// `call reg`
    Call(Reg),
    /// Anything the solver cannot chain through.
    Unknown,
}

impl EndKind {
    pub fn is_indirect(self) -> bool {
        matches!(self, EndKind::Jump(_) | EndKind::Call(_))
    }

    /// Register holding the transfer target of an indirect ending.
    pub fn transfer_reg(self) -> Option<Reg> {
        match self {
            EndKind::Jump(r) | EndKind::Call(r) => Some(r),
            _ => None,
        }
    }

    /// Stack displacement the landing `ret` gadget must have:
    /// zero after a jump, one qword (the pushed return address) after a call.
    pub fn terminal_offset(self) -> Option<i64> {
        match self {
            EndKind::Jump(_) => Some(0),
            EndKind::Call(_) => Some(8),
            _ => None,
        }
    }
}

/// Memory side effects. A gadget that both reads and writes is `Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemAccess {
    #[default]
    None,
    Read,
    /// Width in bits of the first store.
    Write(u32),
}

/// A ROP gadget with classified effects.
#[derive(Debug, Clone)]
pub struct Gadget {
    /// Virtual address of the first instruction.
    pub address: u64,
    pub bytes: Vec<u8>,
    /// Disassembly, e.g. "pop rdi; ret".
    pub instructions: String,
    pub mem: MemAccess,
    /// Registers loaded straight off the stack.
    pub popped: BTreeSet<Reg>,
    /// Registers assigned in any way.
    pub written: BTreeSet<Reg>,
    /// Registers whose final value is a known constant or another
    /// register's entry value.
    pub defined: BTreeMap<Reg, Value>,
    /// Registers whose entry value influences the effects.
    pub depends: BTreeSet<Reg>,
    /// Stack bytes consumed before the control transfer.
    pub sp_delta: i64,
    pub end: EndKind,
    terminal: Option<Rc<Gadget>>,
    effects: OnceCell<Option<Effects>>,
}

impl Gadget {
    /// An empty gadget with no known effects; fill in the metadata fields.
    pub fn new(address: u64) -> Self {
        Gadget {
            address,
            bytes: Vec::new(),
            instructions: String::new(),
            mem: MemAccess::None,
            popped: BTreeSet::new(),
            written: BTreeSet::new(),
            defined: BTreeMap::new(),
            depends: BTreeSet::new(),
            sp_delta: 0,
            end: EndKind::Unknown,
            terminal: None,
            effects: OnceCell::new(),
        }
    }

    /// Decode and classify the gadget at `address`.
    ///
    /// Invalid encodings are an error. Valid code the lifter cannot model
    /// yields a gadget with [`EndKind::Unknown`], which the classifier
    /// drops.
    pub fn decode(address: u64, bytes: &[u8]) -> Result<Self> {
        let insns = lift::decode(address, bytes)?;

        let mut formatter = IntelFormatter::new();
        let mut parts = Vec::with_capacity(insns.len());
        for insn in &insns {
            let mut text = String::new();
            formatter.format(insn, &mut text);
            parts.push(text);
        }

        let mut gadget = Gadget::new(address);
        gadget.bytes = bytes.to_vec();
        gadget.instructions = parts.join("; ");

        match lift::lift(address, bytes) {
            Ok(fx) => gadget.apply_effects(&fx),
            Err(Error::Unsupported { addr, insn }) => {
                trace!("{:#x}: unsupported `{}` at {:#x}", address, insn, addr);
            }
            Err(e) => return Err(e),
        }
        Ok(gadget)
    }

    fn apply_effects(&mut self, fx: &Effects) {
        self.mem = fx.mem_access();
        self.sp_delta = fx.sp_delta;
        self.end = fx.end;
        self.written = fx.written.clone();

        for (&reg, expr) in &fx.regs {
            match expr {
                Expr::Var(VarAlias::Stack(_)) => {
                    self.popped.insert(reg);
                }
                Expr::Var(VarAlias::Register(src)) if *src != reg => {
                    self.defined.insert(reg, Value::Alias(*src));
                }
                Expr::Const { value, .. } => {
                    self.defined.insert(reg, Value::Literal(*value));
                }
                _ => {}
            }
        }

        let mut depends: BTreeSet<Reg> = fx.regs.values().flat_map(|e| e.input_regs()).collect();
        for w in &fx.mem_writes {
            depends.extend(w.addr.input_regs());
            depends.extend(w.value.input_regs());
        }
        if let Some(t) = &fx.transfer {
            depends.extend(t.input_regs());
        }
        depends.remove(&Reg::Rsp);
        self.depends = depends;
    }

    /// Symbolic effects, built through `engine` on first use.
    ///
    /// `None` if the engine could not model the gadget; the failure is
    /// remembered too.
    pub fn effects<E: ConstraintEngine + ?Sized>(&self, engine: &mut E) -> Option<&Effects> {
        self.effects
            .get_or_init(|| match engine.build_effects(self) {
                Ok(fx) => Some(fx),
                Err(e) => {
                    debug!("{:#x}: no effects: {}", self.address, e);
                    None
                }
            })
            .as_ref()
    }

    /// The `ret` gadget an indirect ending lands on, once paired.
    pub fn terminal(&self) -> Option<&Gadget> {
        self.terminal.as_deref()
    }

    /// A copy of this indirect gadget that lands on `terminal`.
    ///
    /// The copy's displacement covers both gadgets, minus the return
    /// address a `call` pushes and the terminal pops.
    pub fn paired_with(&self, terminal: Rc<Gadget>) -> Gadget {
        let offset = self.end.terminal_offset().unwrap_or(0);
        let mut paired = self.clone();
        paired.sp_delta = self.sp_delta + terminal.sp_delta - offset;
        paired.terminal = Some(terminal);
        paired
    }

    pub fn writes(&self, reg: Reg) -> bool {
        self.written.contains(&reg)
    }

    pub fn writes_any<'a>(&self, regs: impl IntoIterator<Item = &'a Reg>) -> bool {
        regs.into_iter().any(|r| self.written.contains(r))
    }

    /// `ret` with no stack consumption: usable anywhere in a chain.
    pub fn is_bare_return(&self) -> bool {
        self.sp_delta == 0 && self.end == EndKind::Return
    }
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instructions.is_empty() {
            write!(f, "{:#x}", self.address)
        } else {
            write!(f, "{:#x}: {}", self.address, self.instructions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::InversionEngine;

    #[test]
    fn decode_pop_rdi_ret() {
        let g = Gadget::decode(0x1000, &[0x5f, 0xc3]).unwrap();
        assert_eq!(g.instructions, "pop rdi; ret");
        assert!(g.popped.contains(&Reg::Rdi));
        assert!(g.writes(Reg::Rdi));
        assert_eq!(g.sp_delta, 8);
        assert_eq!(g.end, EndKind::Return);
        assert!(g.depends.is_empty());
        assert!(!g.is_bare_return());
    }

    #[test]
    fn decode_mov_defines_alias() {
        // mov rdi, rsi; ret
        let g = Gadget::decode(0x2000, &[0x48, 0x89, 0xf7, 0xc3]).unwrap();
        assert_eq!(g.defined.get(&Reg::Rdi), Some(&Value::Alias(Reg::Rsi)));
        assert!(g.depends.contains(&Reg::Rsi));
        assert!(g.is_bare_return());
    }

    #[test]
    fn decode_xor_defines_literal() {
        // xor eax, eax; ret
        let g = Gadget::decode(0x3000, &[0x31, 0xc0, 0xc3]).unwrap();
        assert_eq!(g.defined.get(&Reg::Rax), Some(&Value::Literal(0)));
    }

    #[test]
    fn decode_unsupported_is_unknown() {
        // syscall; ret
        let g = Gadget::decode(0x4000, &[0x0f, 0x05, 0xc3]).unwrap();
        assert_eq!(g.end, EndKind::Unknown);
        assert!(g.written.is_empty());
    }

    #[test]
    fn decode_invalid_bytes_fails() {
        assert!(Gadget::decode(0x5000, &[0x06, 0xc3]).is_err());
    }

    #[test]
    fn decode_jmp_depends_on_target() {
        // pop rdi; jmp rax
        let g = Gadget::decode(0x6000, &[0x5f, 0xff, 0xe0]).unwrap();
        assert_eq!(g.end, EndKind::Jump(Reg::Rax));
        assert!(g.depends.contains(&Reg::Rax));
    }

    #[test]
    fn effects_are_built_once() {
        let g = Gadget::decode(0x1000, &[0x5f, 0xc3]).unwrap();
        let mut engine = InversionEngine::new();
        let first = g.effects(&mut engine).unwrap() as *const Effects;
        let second = g.effects(&mut engine).unwrap() as *const Effects;
        assert_eq!(first, second);
    }

    #[test]
    fn pairing_adjusts_displacement() {
        // pop rdi; call rax
        let g = Gadget::decode(0x7000, &[0x5f, 0xff, 0xd0]).unwrap();
        // pop rbx; ret
        let t = Rc::new(Gadget::decode(0x8000, &[0x5b, 0xc3]).unwrap());
        let p = g.paired_with(t);
        assert_eq!(p.sp_delta, 8);
        assert_eq!(p.terminal().map(|t| t.address), Some(0x8000));
        assert!(g.terminal().is_none());
    }
}
