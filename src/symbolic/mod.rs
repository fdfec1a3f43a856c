//! Constraint engine contract and the built-in engine.
//!
//! The chain solver only talks to [`ConstraintEngine`]: it asks for a
//! gadget's effects, simplifies expressions, and solves conjunctions of
//! (in)equalities. Each answer is a list of [`Binding`]s tagged with the
//! [`VarAlias`] the variable stands for.

pub mod expr;
pub mod lift;
pub mod solver;

pub use expr::{Env, Expr, VarAlias};
pub use lift::{Effects, MemWrite};
pub use solver::InversionEngine;

use std::fmt;

use crate::error::Result;
use crate::gadget::Gadget;

/// One variable assignment from a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub alias: VarAlias,
    pub value: u64,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {:#x}", self.alias, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    And(Vec<Constraint>),
}

impl Constraint {
    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Constraint::Eq(lhs, rhs)
    }

    pub fn ne(lhs: Expr, rhs: Expr) -> Self {
        Constraint::Ne(lhs, rhs)
    }

    pub fn and(parts: Vec<Constraint>) -> Self {
        Constraint::And(parts)
    }

    /// Leaf (in)equalities of a nested conjunction, in order.
    pub fn conjuncts(&self) -> Vec<&Constraint> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Constraint>) {
        match self {
            Constraint::And(parts) => parts.iter().for_each(|p| p.flatten_into(out)),
            leaf => out.push(leaf),
        }
    }

    pub fn holds(&self, env: &Env) -> bool {
        match self {
            Constraint::Eq(a, b) => a.eval(env) == b.eval(env),
            Constraint::Ne(a, b) => a.eval(env) != b.eval(env),
            Constraint::And(parts) => parts.iter().all(|p| p.holds(env)),
        }
    }
}

/// What the chain solver needs from a symbolic backend.
pub trait ConstraintEngine {
    /// Lift a gadget into its register, memory-write and transfer effects.
    fn build_effects(&mut self, gadget: &Gadget) -> Result<Effects>;

    fn simplify(&mut self, expr: &Expr) -> Expr;

    /// Find a model. `None` means unsatisfiable (or given up);
    /// `Some(vec![])` means satisfiable without any free variable.
    fn solve(&mut self, constraint: &Constraint) -> Option<Vec<Binding>>;
}

impl<E: ConstraintEngine + ?Sized> ConstraintEngine for &mut E {
    fn build_effects(&mut self, gadget: &Gadget) -> Result<Effects> {
        (**self).build_effects(gadget)
    }

    fn simplify(&mut self, expr: &Expr) -> Expr {
        (**self).simplify(expr)
    }

    fn solve(&mut self, constraint: &Constraint) -> Option<Vec<Binding>> {
        (**self).solve(constraint)
    }
}

/// Byte `pos` (little-endian) of `expr` as an 8-bit expression.
pub fn extract_byte(expr: &Expr, pos: u32) -> Expr {
    Expr::extract(pos * 8 + 7, pos * 8, expr.clone())
}

/// `byte(expr, i) != bad` for each of the low `len` bytes of `expr`.
///
/// Bytes beyond the expression's width are skipped.
pub fn filter_byte(expr: &Expr, bad: u8, len: usize) -> Vec<Constraint> {
    let width = (expr.bits() / 8) as usize;
    (0..len.min(width))
        .map(|i| Constraint::ne(extract_byte(expr, i as u32), Expr::constant(u64::from(bad), 8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reg;

    #[test]
    fn conjuncts_flatten_nested_and() {
        let c = Constraint::and(vec![
            Constraint::eq(Expr::reg(Reg::Rax), Expr::qword(1)),
            Constraint::and(vec![
                Constraint::ne(Expr::reg(Reg::Rbx), Expr::qword(2)),
                Constraint::eq(Expr::reg(Reg::Rcx), Expr::qword(3)),
            ]),
        ]);
        assert_eq!(c.conjuncts().len(), 3);
    }

    #[test]
    fn extract_byte_reads_little_endian_position() {
        let mut env = Env::new();
        env.insert(VarAlias::Register(Reg::Rax), 0x1122_3344);
        assert_eq!(extract_byte(&Expr::reg(Reg::Rax), 0).eval(&env), 0x44);
        assert_eq!(extract_byte(&Expr::reg(Reg::Rax), 3).eval(&env), 0x11);
    }

    #[test]
    fn filter_byte_respects_width() {
        assert_eq!(filter_byte(&Expr::reg(Reg::Rax), 0x0a, 4).len(), 4);
        let narrow = Expr::extract(15, 0, Expr::reg(Reg::Rax));
        assert_eq!(filter_byte(&narrow, 0x0a, 4).len(), 2);
    }
}
