//! Memory-write solver.
//!
//! Satisfies `address -> value` requests with gadgets that store a
//! register (or stack slot) through another register. Whatever registers
//! the store needs are loaded by a chain from [`ChainSolver::solve`].

use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::chain::{merge_stack, sort_bindings, Chain, ChainSolver, RegRequest, Requirements, Solution};
use crate::gadget::{EndKind, Gadget, MemAccess};
use crate::symbolic::expr::mask;
use crate::symbolic::ConstraintEngine;

fn default_bits() -> u32 {
    64
}

/// A value to store and the store width it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemValue {
    pub value: u64,
    #[serde(default = "default_bits")]
    pub bits: u32,
}

impl MemValue {
    pub fn new(value: u64, bits: u32) -> Self {
        MemValue { value, bits }
    }

    pub fn fits(&self) -> bool {
        self.value & !mask(self.bits) == 0
    }
}

impl From<u64> for MemValue {
    fn from(value: u64) -> Self {
        MemValue { value, bits: 64 }
    }
}

/// Requested memory contents, keyed by target address.
pub type MemRequest = IndexMap<u64, MemValue>;

/// A store gadget, the request it satisfies and how to drive it.
#[derive(Debug, Clone)]
pub struct MemStep {
    pub gadget: Rc<Gadget>,
    pub address: u64,
    pub value: MemValue,
    pub solution: Solution,
}

impl<E: ConstraintEngine> ChainSolver<E> {
    /// Satisfy as many memory requests as possible.
    ///
    /// The result may be partial; compare its length with the number of
    /// requests.
    pub fn solve_memory_writes(&mut self, pool: Vec<Gadget>, requests: &MemRequest) -> Vec<MemStep> {
        let pool: Vec<Rc<Gadget>> = pool.into_iter().map(Rc::new).collect();

        let mut by_width: BTreeMap<u32, Vec<Rc<Gadget>>> = BTreeMap::new();
        for g in &pool {
            if self.config().bad_bytes.hits(g.address) || g.end != EndKind::Return {
                continue;
            }
            if let MemAccess::Write(bits) = g.mem {
                by_width.entry(bits).or_default().push(Rc::clone(g));
            }
        }

        let mut outstanding = requests.clone();
        let mut steps = Vec::new();
        debug!("memory: {} requests, {} store gadgets", outstanding.len(), by_width.values().map(Vec::len).sum::<usize>());

        for (&bits, gadgets) in &by_width {
            for gadget in gadgets {
                let pending: Vec<(u64, MemValue)> = outstanding.iter().map(|(a, v)| (*a, *v)).collect();
                for (address, value) in pending {
                    if value.bits != bits || !value.fits() {
                        continue;
                    }
                    let Some(solution) = self.store(gadget, address, value.value, &pool) else {
                        continue;
                    };
                    debug!("memory: {} stores {:#x} at {:#x}", gadget, value.value, address);
                    outstanding.shift_remove(&address);
                    steps.push(MemStep {
                        gadget: Rc::clone(gadget),
                        address,
                        value,
                        solution,
                    });
                    if outstanding.is_empty() {
                        return steps;
                    }
                }
            }
        }

        trace!("memory: {} requests left", outstanding.len());
        steps
    }

    /// Drive `gadget`'s first store to write `value` at `address`.
    fn store(&mut self, gadget: &Gadget, address: u64, value: u64, pool: &[Rc<Gadget>]) -> Option<Solution> {
        let (addr_expr, value_expr) = {
            let fx = gadget.effects(self.engine_mut())?;
            let w = fx.mem_writes.first()?;
            (w.addr.clone(), w.value.clone())
        };

        let addr_model = self.query(&addr_expr, address, false)?;
        let value_model = self.query(&value_expr, value, false)?;

        let bad = &self.config().bad_bytes;
        let at = sort_bindings(&addr_model, address, bad)?;
        let val = sort_bindings(&value_model, value, bad)?;
        let Requirements { mut regs, mut stack } = at;
        for (reg, v) in val.regs {
            if regs.insert(reg, v).is_some() {
                trace!("{}: {} bound twice", gadget, reg);
                return None;
            }
        }
        if !merge_stack(&mut stack, &val.stack) {
            return None;
        }

        let setup = if regs.is_empty() {
            None
        } else {
            Some(self.prerequisite_chain(pool, &regs)?)
        };
        Some(Solution { stack, setup })
    }

    fn prerequisite_chain(&mut self, pool: &[Rc<Gadget>], regs: &RegRequest) -> Option<Chain> {
        self.solve_candidates(pool.to_vec(), regs, &Default::default(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{g, CountingEngine};
    use crate::config::SolverConfig;
    use crate::payload::Payload;

    fn store_pool() -> Vec<Gadget> {
        vec![
            g(0x1000, &[0x48, 0x89, 0x37, 0xc3]), // mov [rdi], rsi; ret
            g(0x2000, &[0x5f, 0xc3]),             // pop rdi; ret
            g(0x3000, &[0x5e, 0xc3]),             // pop rsi; ret
        ]
    }

    fn solver() -> ChainSolver<CountingEngine> {
        ChainSolver::new(CountingEngine::default(), SolverConfig::default())
    }

    #[test]
    fn store_through_two_registers() {
        let mut req = MemRequest::new();
        req.insert(0x601000, MemValue::from(0x68732f6e69622f));
        let steps = solver().solve_memory_writes(store_pool(), &req);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].gadget.address, 0x1000);

        let mut p = Payload::new(0x41);
        p.push_memory_steps(&steps);
        assert_eq!(p.words(), vec![0x2000, 0x601000, 0x3000, 0x68732f6e69622f, 0x1000]);
    }

    #[test]
    fn width_mismatch_is_skipped() {
        let mut req = MemRequest::new();
        req.insert(0x601000, MemValue::new(0x1234, 32));
        assert!(solver().solve_memory_writes(store_pool(), &req).is_empty());
    }

    #[test]
    fn partial_result_when_prerequisites_fail() {
        // No way to load rsi.
        let pool = vec![g(0x1000, &[0x48, 0x89, 0x37, 0xc3]), g(0x2000, &[0x5f, 0xc3])];
        let mut req = MemRequest::new();
        req.insert(0x601000, MemValue::from(1));
        assert!(solver().solve_memory_writes(pool, &req).is_empty());
    }

    #[test]
    fn several_requests() {
        let mut req = MemRequest::new();
        req.insert(0x601000, MemValue::from(1));
        req.insert(0x601008, MemValue::from(2));
        let steps = solver().solve_memory_writes(store_pool(), &req);
        let addrs: Vec<u64> = steps.iter().map(|s| s.address).collect();
        assert_eq!(addrs, vec![0x601000, 0x601008]);
    }

    #[test]
    fn store_gadget_at_bad_address_is_ignored() {
        let mut s = ChainSolver::new(CountingEngine::default(), SolverConfig::default().with_bad_bytes(&[0x10]));
        let mut req = MemRequest::new();
        req.insert(0x602000, MemValue::from(1));
        assert!(s.solve_memory_writes(store_pool(), &req).is_empty());
        assert_eq!(s.engine().solves, 0);
    }

    #[test]
    fn fits_checks_width() {
        assert!(MemValue::new(0xffff_ffff, 32).fits());
        assert!(!MemValue::new(0x1_0000_0000, 32).fits());
        assert!(MemValue::from(u64::MAX).fits());
    }
}
