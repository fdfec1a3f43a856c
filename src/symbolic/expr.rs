//! Bitvector expressions over gadget inputs.
//!
//! Every variable is the 64-bit value some input held when the gadget
//! started: a register, a stack slot above the entry stack pointer, or
//! something the solver cannot control (a memory load, a slot below the
//! entry stack pointer).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::Reg;

/// What a symbolic variable stands for.
///
/// Variant order matters: solvers walk variables in `Ord` order, so
/// stack slots are preferred as free variables over registers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VarAlias {
    /// Qword at `[entry rsp + offset]`.
    Stack(u64),
    /// Entry value of a register.
    Register(Reg),
    /// Anything else (memory loads, uninitialised stack below rsp).
    Other(String),
}

impl fmt::Display for VarAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarAlias::Stack(off) => write!(f, "STACK+{:#x}", off),
            VarAlias::Register(r) => write!(f, "{}", r),
            VarAlias::Other(name) => write!(f, "{}", name),
        }
    }
}

pub type Env = BTreeMap<VarAlias, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Const { value: u64, bits: u32 },
    Var(VarAlias),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Xor(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Shl(Box<Expr>, u32),
    Shr(Box<Expr>, u32),
    /// Bits `hi..=lo` of the inner expression.
    Extract { hi: u32, lo: u32, inner: Box<Expr> },
    ZeroExt { bits: u32, inner: Box<Expr> },
}

pub fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl Expr {
    pub fn constant(value: u64, bits: u32) -> Expr {
        Expr::Const { value: value & mask(bits), bits }
    }

    pub fn qword(value: u64) -> Expr {
        Expr::constant(value, 64)
    }

    pub fn var(alias: VarAlias) -> Expr {
        Expr::Var(alias)
    }

    pub fn reg(reg: Reg) -> Expr {
        Expr::Var(VarAlias::Register(reg))
    }

    pub fn stack(offset: u64) -> Expr {
        Expr::Var(VarAlias::Stack(offset))
    }

    pub fn add(a: Expr, b: Expr) -> Expr {
        Expr::Add(Box::new(a), Box::new(b))
    }

    pub fn sub(a: Expr, b: Expr) -> Expr {
        Expr::Sub(Box::new(a), Box::new(b))
    }

    pub fn xor(a: Expr, b: Expr) -> Expr {
        Expr::Xor(Box::new(a), Box::new(b))
    }

    pub fn and(a: Expr, b: Expr) -> Expr {
        Expr::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Expr, b: Expr) -> Expr {
        Expr::Or(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(a: Expr) -> Expr {
        Expr::Not(Box::new(a))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(a: Expr) -> Expr {
        Expr::Neg(Box::new(a))
    }

    pub fn shl(a: Expr, n: u32) -> Expr {
        Expr::Shl(Box::new(a), n)
    }

    pub fn shr(a: Expr, n: u32) -> Expr {
        Expr::Shr(Box::new(a), n)
    }

    pub fn extract(hi: u32, lo: u32, inner: Expr) -> Expr {
        Expr::Extract { hi, lo, inner: Box::new(inner) }
    }

    pub fn zext(bits: u32, inner: Expr) -> Expr {
        Expr::ZeroExt { bits, inner: Box::new(inner) }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Expr::Const { bits, .. } => *bits,
            Expr::Var(_) => 64,
            Expr::Add(a, _)
            | Expr::Sub(a, _)
            | Expr::Xor(a, _)
            | Expr::And(a, _)
            | Expr::Or(a, _) => a.bits(),
            Expr::Not(a) | Expr::Neg(a) | Expr::Shl(a, _) | Expr::Shr(a, _) => a.bits(),
            Expr::Extract { hi, lo, .. } => hi - lo + 1,
            Expr::ZeroExt { bits, .. } => *bits,
        }
    }

    pub fn as_const(&self) -> Option<u64> {
        match self {
            Expr::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&VarAlias> {
        match self {
            Expr::Var(alias) => Some(alias),
            _ => None,
        }
    }

    /// Direct operands of the top-level node (empty for leaves).
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const { .. } | Expr::Var(_) => Vec::new(),
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Xor(a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b) => vec![a, b],
            Expr::Not(a) | Expr::Neg(a) | Expr::Shl(a, _) | Expr::Shr(a, _) => vec![a],
            Expr::Extract { inner, .. } | Expr::ZeroExt { inner, .. } => vec![inner],
        }
    }

    pub fn vars(&self) -> BTreeSet<VarAlias> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut BTreeSet<VarAlias>) {
        if let Expr::Var(alias) = self {
            out.insert(alias.clone());
        }
        for child in self.children() {
            child.collect_vars(out);
        }
    }

    /// Number of times `alias` appears in the tree.
    pub fn occurrences(&self, alias: &VarAlias) -> usize {
        match self {
            Expr::Var(a) => usize::from(a == alias),
            _ => self.children().iter().map(|c| c.occurrences(alias)).sum(),
        }
    }

    /// Registers whose entry value this expression reads.
    pub fn input_regs(&self) -> BTreeSet<Reg> {
        self.vars()
            .into_iter()
            .filter_map(|v| match v {
                VarAlias::Register(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Rebuild the tree, replacing each variable for which `f` returns `Some`.
    pub fn substitute<F>(&self, f: &F) -> Expr
    where
        F: Fn(&VarAlias) -> Option<Expr>,
    {
        let sub = |e: &Expr| Box::new(e.substitute(f));
        match self {
            Expr::Const { .. } => self.clone(),
            Expr::Var(alias) => f(alias).unwrap_or_else(|| self.clone()),
            Expr::Add(a, b) => Expr::Add(sub(a), sub(b)),
            Expr::Sub(a, b) => Expr::Sub(sub(a), sub(b)),
            Expr::Xor(a, b) => Expr::Xor(sub(a), sub(b)),
            Expr::And(a, b) => Expr::And(sub(a), sub(b)),
            Expr::Or(a, b) => Expr::Or(sub(a), sub(b)),
            Expr::Not(a) => Expr::Not(sub(a)),
            Expr::Neg(a) => Expr::Neg(sub(a)),
            Expr::Shl(a, n) => Expr::Shl(sub(a), *n),
            Expr::Shr(a, n) => Expr::Shr(sub(a), *n),
            Expr::Extract { hi, lo, inner } => Expr::Extract { hi: *hi, lo: *lo, inner: sub(inner) },
            Expr::ZeroExt { bits, inner } => Expr::ZeroExt { bits: *bits, inner: sub(inner) },
        }
    }

    /// Evaluate under `env`; unbound variables read as zero.
    pub fn eval(&self, env: &Env) -> u64 {
        let m = mask(self.bits());
        let v = match self {
            Expr::Const { value, .. } => *value,
            Expr::Var(alias) => env.get(alias).copied().unwrap_or(0),
            Expr::Add(a, b) => a.eval(env).wrapping_add(b.eval(env)),
            Expr::Sub(a, b) => a.eval(env).wrapping_sub(b.eval(env)),
            Expr::Xor(a, b) => a.eval(env) ^ b.eval(env),
            Expr::And(a, b) => a.eval(env) & b.eval(env),
            Expr::Or(a, b) => a.eval(env) | b.eval(env),
            Expr::Not(a) => !a.eval(env),
            Expr::Neg(a) => a.eval(env).wrapping_neg(),
            Expr::Shl(a, n) => a.eval(env).checked_shl(*n).unwrap_or(0),
            Expr::Shr(a, n) => a.eval(env).checked_shr(*n).unwrap_or(0),
            Expr::Extract { lo, inner, .. } => inner.eval(env) >> lo,
            Expr::ZeroExt { inner, .. } => inner.eval(env),
        };
        v & m
    }

    /// Constant folding plus the handful of identities the lifter produces.
    pub fn simplify(&self) -> Expr {
        let folded = match self {
            Expr::Const { .. } | Expr::Var(_) => return self.clone(),
            Expr::Add(a, b) => simplify_add(a.simplify(), b.simplify()),
            Expr::Sub(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                if a == b {
                    Expr::constant(0, a.bits())
                } else if let Some(c) = b.as_const() {
                    simplify_add(a.clone(), Expr::constant(c.wrapping_neg(), a.bits()))
                } else {
                    Expr::sub(a, b)
                }
            }
            Expr::Xor(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                if a == b {
                    Expr::constant(0, a.bits())
                } else if b.as_const() == Some(0) {
                    a
                } else if a.as_const() == Some(0) {
                    b
                } else {
                    Expr::xor(a, b)
                }
            }
            Expr::And(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                let full = mask(a.bits());
                if b.as_const() == Some(full) || a == b {
                    a
                } else if a.as_const() == Some(full) {
                    b
                } else if a.as_const() == Some(0) || b.as_const() == Some(0) {
                    Expr::constant(0, a.bits())
                } else {
                    Expr::and(a, b)
                }
            }
            Expr::Or(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                if b.as_const() == Some(0) || a == b {
                    a
                } else if a.as_const() == Some(0) {
                    b
                } else {
                    Expr::or(a, b)
                }
            }
            Expr::Not(a) => match a.simplify() {
                Expr::Not(inner) => *inner,
                a => Expr::not(a),
            },
            Expr::Neg(a) => match a.simplify() {
                Expr::Neg(inner) => *inner,
                a => Expr::neg(a),
            },
            Expr::Shl(a, 0) | Expr::Shr(a, 0) => a.simplify(),
            Expr::Shl(a, n) => Expr::shl(a.simplify(), *n),
            Expr::Shr(a, n) => Expr::shr(a.simplify(), *n),
            Expr::Extract { hi, lo, inner } => {
                let inner = inner.simplify();
                if *lo == 0 && *hi + 1 == inner.bits() {
                    inner
                } else {
                    match inner {
                        Expr::ZeroExt { inner: narrow, .. } if *hi < narrow.bits() => {
                            Expr::extract(*hi, *lo, *narrow).simplify()
                        }
                        inner => Expr::extract(*hi, *lo, inner),
                    }
                }
            }
            Expr::ZeroExt { bits, inner } => {
                let inner = inner.simplify();
                if inner.bits() == *bits {
                    inner
                } else {
                    Expr::zext(*bits, inner)
                }
            }
        };
        if folded.vars().is_empty() {
            Expr::constant(folded.eval(&Env::new()), folded.bits())
        } else {
            folded
        }
    }
}

fn simplify_add(a: Expr, b: Expr) -> Expr {
    let bits = a.bits();
    match (a, b) {
        (x, Expr::Const { value: 0, .. }) | (Expr::Const { value: 0, .. }, x) => x,
        // (x + c1) + c2 => x + (c1 + c2)
        (Expr::Add(x, c1), Expr::Const { value: c2, .. }) if c1.as_const().is_some() => {
            let c = c1.as_const().unwrap_or(0).wrapping_add(c2);
            simplify_add(*x, Expr::constant(c, bits))
        }
        (Expr::Const { value: c, .. }, x) => Expr::add(x, Expr::constant(c, bits)),
        (a, b) => Expr::add(a, b),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const { value, .. } => write!(f, "{:#x}", value),
            Expr::Var(alias) => write!(f, "{}", alias),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Xor(a, b) => write!(f, "({} ^ {})", a, b),
            Expr::And(a, b) => write!(f, "({} & {})", a, b),
            Expr::Or(a, b) => write!(f, "({} | {})", a, b),
            Expr::Not(a) => write!(f, "~{}", a),
            Expr::Neg(a) => write!(f, "-{}", a),
            Expr::Shl(a, n) => write!(f, "({} << {})", a, n),
            Expr::Shr(a, n) => write!(f, "({} >> {})", a, n),
            Expr::Extract { hi, lo, inner } => write!(f, "{}[{}:{}]", inner, hi, lo),
            Expr::ZeroExt { bits, inner } => write!(f, "zext{}({})", bits, inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_wraps_at_width() {
        let e = Expr::add(Expr::reg(Reg::Rax), Expr::qword(1));
        let mut env = Env::new();
        env.insert(VarAlias::Register(Reg::Rax), u64::MAX);
        assert_eq!(e.eval(&env), 0);

        let narrow = Expr::zext(64, Expr::extract(31, 0, Expr::reg(Reg::Rax)));
        assert_eq!(narrow.eval(&env), 0xffff_ffff);
    }

    #[test]
    fn simplify_folds_constants_and_offsets() {
        let e = Expr::sub(Expr::add(Expr::stack(0), Expr::qword(0x10)), Expr::qword(0x8));
        assert_eq!(e.simplify(), Expr::add(Expr::stack(0), Expr::qword(0x8)));

        let zero = Expr::xor(Expr::reg(Reg::Rax), Expr::reg(Reg::Rax));
        assert_eq!(zero.simplify(), Expr::qword(0));

        let folded = Expr::add(Expr::qword(2), Expr::qword(3));
        assert_eq!(folded.simplify(), Expr::qword(5));
    }

    #[test]
    fn simplify_drops_full_width_extract() {
        let e = Expr::extract(63, 0, Expr::reg(Reg::Rbx));
        assert_eq!(e.simplify(), Expr::reg(Reg::Rbx));
    }

    #[test]
    fn children_of_leaf_are_empty() {
        assert!(Expr::stack(8).children().is_empty());
        let e = Expr::add(Expr::stack(8), Expr::qword(1));
        assert_eq!(e.children().len(), 2);
    }

    #[test]
    fn vars_are_ordered_stack_first() {
        let e = Expr::add(Expr::reg(Reg::Rax), Expr::stack(8));
        let vars: Vec<_> = e.vars().into_iter().collect();
        assert_eq!(vars, vec![VarAlias::Stack(8), VarAlias::Register(Reg::Rax)]);
        assert_eq!(e.input_regs().into_iter().collect::<Vec<_>>(), vec![Reg::Rax]);
    }
}
