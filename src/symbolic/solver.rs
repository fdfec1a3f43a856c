//! Built-in constraint engine.
//!
//! Solves conjunctions by walking the equalities in order and binding one
//! free variable per equality through inversion of the operations on its
//! path; every other free variable of that equality is pinned to zero.
//! Inequalities and already-ground equalities are then checked by
//! evaluation. Pivots are tried in `VarAlias` order, so stack slots are
//! preferred over register inputs.

use log::trace;

use crate::error::{Error, Result};
use crate::gadget::Gadget;
use crate::symbolic::expr::{mask, Env, Expr, VarAlias};
use crate::symbolic::lift::{self, Effects};
use crate::symbolic::{Binding, Constraint, ConstraintEngine};

#[derive(Debug, Default, Clone, Copy)]
pub struct InversionEngine;

impl InversionEngine {
    pub fn new() -> Self {
        InversionEngine
    }
}

impl ConstraintEngine for InversionEngine {
    fn build_effects(&mut self, gadget: &Gadget) -> Result<Effects> {
        if gadget.bytes.is_empty() {
            return Err(Error::NoBytes(gadget.address));
        }
        lift::lift(gadget.address, &gadget.bytes)
    }

    fn simplify(&mut self, expr: &Expr) -> Expr {
        expr.simplify()
    }

    fn solve(&mut self, constraint: &Constraint) -> Option<Vec<Binding>> {
        let conjuncts = constraint.conjuncts();
        let equalities: Vec<(&Expr, &Expr)> = conjuncts
            .iter()
            .filter_map(|c| match c {
                Constraint::Eq(a, b) => Some((a, b)),
                _ => None,
            })
            .collect();

        let mut vars = std::collections::BTreeSet::new();
        for c in &conjuncts {
            if let Constraint::Eq(a, b) | Constraint::Ne(a, b) = c {
                vars.extend(a.vars());
                vars.extend(b.vars());
            }
        }

        let env = assign(&equalities, 0, Env::new(), constraint)?;
        let model: Vec<Binding> = vars
            .into_iter()
            .map(|alias| Binding {
                value: env.get(&alias).copied().unwrap_or(0),
                alias,
            })
            .collect();
        trace!(
            "model: [{}]",
            model.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", ")
        );
        Some(model)
    }
}

/// Bind the free variables of `equalities[i..]` on top of `env`.
fn assign(equalities: &[(&Expr, &Expr)], i: usize, env: Env, all: &Constraint) -> Option<Env> {
    let Some(&(lhs, rhs)) = equalities.get(i) else {
        return all.holds(&env).then_some(env);
    };

    // Normalise to `expr == target` with `target` ground.
    let free_in = |e: &Expr| e.vars().into_iter().filter(|v| !env.contains_key(v)).count();
    let (expr, target) = if free_in(rhs) == 0 {
        (lhs.clone(), rhs.eval(&env))
    } else if free_in(lhs) == 0 {
        (rhs.clone(), lhs.eval(&env))
    } else {
        (Expr::sub(lhs.clone(), rhs.clone()), 0)
    };

    let free: Vec<VarAlias> = expr.vars().into_iter().filter(|v| !env.contains_key(v)).collect();
    if free.is_empty() {
        return if expr.eval(&env) == target {
            assign(equalities, i + 1, env, all)
        } else {
            None
        };
    }

    for pivot in free.iter().filter(|v| expr.occurrences(v) == 1) {
        let mut next = env.clone();
        for other in free.iter().filter(|v| *v != pivot) {
            next.insert(other.clone(), 0);
        }
        let Some(value) = invert(&expr, pivot, target, &next) else {
            continue;
        };
        next.insert(pivot.clone(), value);
        if expr.eval(&next) != target {
            continue;
        }
        if let Some(done) = assign(equalities, i + 1, next, all) {
            return Some(done);
        }
    }
    None
}

/// Value of `pivot` that makes `expr` evaluate to `target`, with every
/// other variable taken from `env`. `pivot` must occur exactly once.
fn invert(expr: &Expr, pivot: &VarAlias, target: u64, env: &Env) -> Option<u64> {
    let m = mask(expr.bits());
    if target & !m != 0 {
        return None;
    }
    let has = |e: &Expr| e.occurrences(pivot) > 0;

    match expr {
        Expr::Var(v) if v == pivot => Some(target),
        Expr::Const { .. } | Expr::Var(_) => None,
        Expr::Add(a, b) => {
            if has(a) {
                invert(a, pivot, target.wrapping_sub(b.eval(env)) & m, env)
            } else {
                invert(b, pivot, target.wrapping_sub(a.eval(env)) & m, env)
            }
        }
        Expr::Sub(a, b) => {
            if has(a) {
                invert(a, pivot, target.wrapping_add(b.eval(env)) & m, env)
            } else {
                invert(b, pivot, a.eval(env).wrapping_sub(target) & m, env)
            }
        }
        Expr::Xor(a, b) => {
            let (x, other) = if has(a) { (a, b) } else { (b, a) };
            invert(x, pivot, target ^ other.eval(env), env)
        }
        Expr::And(a, b) => {
            let (x, other) = if has(a) { (a, b) } else { (b, a) };
            let keep = other.eval(env);
            if target & !keep != 0 {
                return None;
            }
            invert(x, pivot, target, env)
        }
        Expr::Or(a, b) => {
            let (x, other) = if has(a) { (a, b) } else { (b, a) };
            let set = other.eval(env);
            if target & set != set {
                return None;
            }
            invert(x, pivot, target & !set, env)
        }
        Expr::Not(a) => invert(a, pivot, !target & m, env),
        Expr::Neg(a) => invert(a, pivot, target.wrapping_neg() & m, env),
        Expr::Shl(a, n) => {
            if *n >= 64 || target & mask(*n) != 0 {
                return None;
            }
            invert(a, pivot, target >> n, env)
        }
        Expr::Shr(a, n) => {
            let shifted = target.checked_shl(*n)?;
            if shifted >> n != target {
                return None;
            }
            invert(a, pivot, shifted & m, env)
        }
        // The bits outside the window are free; leave them zero.
        Expr::Extract { lo, inner, .. } => invert(inner, pivot, target << lo, env),
        Expr::ZeroExt { inner, .. } => {
            if target & !mask(inner.bits()) != 0 {
                return None;
            }
            invert(inner, pivot, target, env)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::filter_byte;
    use crate::types::Reg;

    fn solve(c: Constraint) -> Option<Vec<Binding>> {
        InversionEngine::new().solve(&c)
    }

    #[test]
    fn solves_plain_stack_slot() {
        let model = solve(Constraint::eq(Expr::stack(0), Expr::qword(0x41414141))).unwrap();
        assert_eq!(
            model,
            vec![Binding { alias: VarAlias::Stack(0), value: 0x41414141 }]
        );
    }

    #[test]
    fn inverts_offset_and_xor() {
        let e = Expr::xor(Expr::add(Expr::stack(8), Expr::qword(0x10)), Expr::qword(0xff));
        let model = solve(Constraint::eq(e.clone(), Expr::qword(0x1234))).unwrap();
        let mut env = Env::new();
        env.insert(model[0].alias.clone(), model[0].value);
        assert_eq!(e.eval(&env), 0x1234);
    }

    #[test]
    fn constant_expression_is_sat_without_vars() {
        assert_eq!(solve(Constraint::eq(Expr::qword(5), Expr::qword(5))), Some(vec![]));
        assert_eq!(solve(Constraint::eq(Expr::qword(5), Expr::qword(6))), None);
    }

    #[test]
    fn zero_extended_register_cannot_hold_high_bits() {
        let e = Expr::zext(64, Expr::extract(31, 0, Expr::reg(Reg::Rax)));
        assert!(solve(Constraint::eq(e.clone(), Expr::qword(0x1_0000_0000))).is_none());
        let model = solve(Constraint::eq(e, Expr::qword(0xdead))).unwrap();
        assert_eq!(model[0].value, 0xdead);
    }

    #[test]
    fn two_variables_prefer_stack_pivot() {
        let e = Expr::add(Expr::reg(Reg::Rbx), Expr::stack(0));
        let model = solve(Constraint::eq(e, Expr::qword(100))).unwrap();
        assert_eq!(
            model,
            vec![
                Binding { alias: VarAlias::Stack(0), value: 100 },
                Binding { alias: VarAlias::Register(Reg::Rbx), value: 0 },
            ]
        );
    }

    #[test]
    fn byte_filter_rejects_unique_solution() {
        let mut parts = filter_byte(&Expr::stack(0), 0x41, 4);
        parts.push(Constraint::eq(Expr::stack(0), Expr::qword(0x41414141)));
        assert!(solve(Constraint::and(parts)).is_none());

        let mut parts = filter_byte(&Expr::stack(0), 0x0a, 4);
        parts.push(Constraint::eq(Expr::stack(0), Expr::qword(0x41414141)));
        assert!(solve(Constraint::and(parts)).is_some());
    }

    #[test]
    fn builds_effects_from_gadget_bytes() {
        let g = Gadget::decode(0x1000, &[0x5f, 0xc3]).unwrap();
        let fx = InversionEngine::new().build_effects(&g).unwrap();
        assert_eq!(fx.reg(Reg::Rdi), Expr::stack(0));
        assert!(InversionEngine::new().build_effects(&Gadget::new(0x2000)).is_err());
    }
}
