//! Candidate classification.
//!
//! Orders a gadget pool by how directly each gadget can service a set of
//! target registers. Registers the chosen gadgets read are classified
//! again against what is left of the pool, wave after wave, so that the
//! chain solver can find setup gadgets for nested requests.

use std::collections::BTreeSet;
use std::rc::Rc;

use itertools::Itertools;
use log::trace;

use crate::config::SolverConfig;
use crate::gadget::{EndKind, Gadget, MemAccess};
use crate::types::Reg;

/// Result of [`classify`]: the priority-ordered candidates and every
/// gadget that was not selected.
#[derive(Debug, Default)]
pub struct Classification {
    pub candidates: Vec<Rc<Gadget>>,
    pub remainder: Vec<Rc<Gadget>>,
}

#[derive(Clone, Copy)]
enum Tier {
    Defined,
    Pop,
    Write,
    NoReturn,
    BareReturn,
}

/// Tiers found for one set of target registers.
#[derive(Default)]
struct Wave {
    defined: Vec<Rc<Gadget>>,
    pop: Vec<Rc<Gadget>>,
    write: Vec<Rc<Gadget>>,
    no_return: Vec<Rc<Gadget>>,
    bare_return: Vec<Rc<Gadget>>,
    depends: BTreeSet<Reg>,
}

impl Wave {
    fn take(&mut self, gadget: Rc<Gadget>, tier: Tier) {
        self.depends.extend(gadget.depends.iter().copied());
        let list = match tier {
            Tier::Defined => &mut self.defined,
            Tier::Pop => &mut self.pop,
            Tier::Write => &mut self.write,
            Tier::NoReturn => &mut self.no_return,
            Tier::BareReturn => &mut self.bare_return,
        };
        list.push(gadget);
    }
}

/// Why a gadget cannot serve a register request at all.
fn rejection(gadget: &Gadget, config: &SolverConfig) -> Option<&'static str> {
    if config.bad_bytes.hits(gadget.address) {
        Some("forbidden byte in address")
    } else if gadget.end == EndKind::Unknown {
        Some("unknown ending")
    } else if gadget.mem != MemAccess::None {
        Some("memory access")
    } else if gadget.writes_any(&config.forbidden_regs) {
        Some("writes a forbidden register")
    } else {
        None
    }
}

/// Partition `pool` into priority-ordered candidates for `targets`.
///
/// Each gadget is classified at most once. Within one wave the order is
/// exact definitions, pops, other writes, then indirect endings; deeper
/// waves follow; bare `ret` gadgets come last, the outermost wave's last
/// of all.
pub fn classify(pool: Vec<Rc<Gadget>>, targets: &[Reg], config: &SolverConfig) -> Classification {
    let mut remainder = Vec::new();
    let mut pool: Vec<Rc<Gadget>> = pool
        .into_iter()
        .filter_map(|g| match rejection(&g, config) {
            Some(reason) => {
                trace!("classify: drop {}: {}", g, reason);
                remainder.push(g);
                None
            }
            None => Some(g),
        })
        .collect();

    let mut waves: Vec<Wave> = Vec::new();
    let mut targets: Vec<Reg> = targets.to_vec();

    while !targets.is_empty() && !pool.is_empty() {
        let mut wave = Wave::default();

        let mut rest = Vec::with_capacity(pool.len());
        for g in pool {
            if g.is_bare_return() {
                wave.take(g, Tier::BareReturn);
            } else if g.end.is_indirect() {
                wave.take(g, Tier::NoReturn);
            } else {
                rest.push(g);
            }
        }
        pool = rest;

        for n in (1..=targets.len()).rev() {
            for comb in targets.iter().copied().combinations(n) {
                let mut rest = Vec::with_capacity(pool.len());
                for g in pool {
                    if comb.iter().all(|r| g.defined.contains_key(r)) {
                        wave.take(g, Tier::Defined);
                    } else if comb.iter().all(|r| g.popped.contains(r)) {
                        wave.take(g, Tier::Pop);
                    } else if comb.iter().all(|r| g.written.contains(r)) {
                        wave.take(g, Tier::Write);
                    } else {
                        rest.push(g);
                    }
                }
                pool = rest;
            }
        }

        targets = wave.depends.iter().copied().collect();
        waves.push(wave);
    }

    let mut candidates = Vec::new();
    let mut bare = Vec::new();
    for wave in waves.iter_mut() {
        candidates.append(&mut wave.defined);
        candidates.append(&mut wave.pop);
        candidates.append(&mut wave.write);
        candidates.append(&mut wave.no_return);
    }
    for wave in waves.iter_mut().rev() {
        bare.append(&mut wave.bare_return);
    }
    candidates.append(&mut bare);
    remainder.append(&mut pool);

    Classification { candidates, remainder }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(addr: u64, bytes: &[u8]) -> Rc<Gadget> {
        Rc::new(Gadget::decode(addr, bytes).unwrap())
    }

    fn addrs(gs: &[Rc<Gadget>]) -> Vec<u64> {
        gs.iter().map(|g| g.address).collect()
    }

    #[test]
    fn tier_order() {
        let pool = vec![
            g(0x1000, &[0xc3]),                         // ret
            g(0x2000, &[0x5e, 0x31, 0xff, 0xc3]),       // pop rsi; xor edi, edi; ret
            g(0x3000, &[0x48, 0x89, 0xc7, 0xc3]),       // mov rdi, rax; ret
            g(0x4000, &[0x5f, 0xc3]),                   // pop rdi; ret
            g(0x5000, &[0x48, 0xff, 0xc7, 0xc3]),       // inc rdi; ret
            g(0x6000, &[0x5f, 0xff, 0xe0]),             // pop rdi; jmp rax
        ];
        let c = classify(pool, &[Reg::Rdi], &SolverConfig::default());
        // Every zero-displacement `ret` gadget lands in the last tier.
        assert_eq!(addrs(&c.candidates), vec![0x2000, 0x4000, 0x6000, 0x1000, 0x3000, 0x5000]);
        assert!(c.remainder.is_empty());
    }

    #[test]
    fn larger_combinations_first() {
        let pool = vec![
            g(0x1000, &[0x5f, 0xc3]),       // pop rdi; ret
            g(0x2000, &[0x5f, 0x5e, 0xc3]), // pop rdi; pop rsi; ret
        ];
        let c = classify(pool, &[Reg::Rdi, Reg::Rsi], &SolverConfig::default());
        assert_eq!(addrs(&c.candidates), vec![0x2000, 0x1000]);
    }

    #[test]
    fn dependencies_form_a_second_wave() {
        let pool = vec![
            g(0x1000, &[0x58, 0xc3]),             // pop rax; ret
            g(0x2000, &[0x48, 0x89, 0xc7, 0xc3]), // mov rdi, rax; ret
            g(0x3000, &[0x5b, 0xc3]),             // pop rbx; ret
        ];
        let c = classify(pool, &[Reg::Rdi], &SolverConfig::default());
        assert_eq!(addrs(&c.candidates), vec![0x1000, 0x2000]);
        assert_eq!(addrs(&c.remainder), vec![0x3000]);
    }

    #[test]
    fn dependency_wave_precedes_bare_returns() {
        let mut nop_ret = Gadget::new(0x9000);
        nop_ret.end = EndKind::Return;
        nop_ret.depends.insert(Reg::Rbx);
        let pool = vec![
            Rc::new(nop_ret),
            g(0x1000, &[0x5f, 0xc3]), // pop rdi; ret
            g(0x2000, &[0x5b, 0xc3]), // pop rbx; ret
        ];
        let c = classify(pool, &[Reg::Rdi], &SolverConfig::default());
        assert_eq!(addrs(&c.candidates), vec![0x1000, 0x2000, 0x9000]);
    }

    #[test]
    fn drops_unusable_gadgets() {
        let pool = vec![
            g(0x1000, &[0x48, 0x89, 0x37, 0xc3]), // mov [rdi], rsi; ret
            g(0x2000, &[0x0f, 0x05, 0xc3]),       // syscall; ret
            g(0x400a, &[0x5f, 0xc3]),             // pop rdi; ret at a bad address
            g(0x3000, &[0x5f, 0x5b, 0xc3]),       // pop rdi; pop rbx; ret
            g(0x4000, &[0x5f, 0xc3]),             // pop rdi; ret
        ];
        let config = SolverConfig::default()
            .with_bad_bytes(&[0x0a])
            .with_forbidden_regs([Reg::Rbx]);
        let c = classify(pool, &[Reg::Rdi], &config);
        assert_eq!(addrs(&c.candidates), vec![0x4000]);
        assert_eq!(c.remainder.len(), 4);
    }

    #[test]
    fn classification_is_deterministic() {
        let mk = || {
            vec![
                g(0x1000, &[0x5e, 0xc3]),
                g(0x2000, &[0x5f, 0xc3]),
                g(0x3000, &[0x5f, 0x5e, 0xc3]),
                g(0x4000, &[0xc3]),
            ]
        };
        let cfg = SolverConfig::default();
        let a = classify(mk(), &[Reg::Rsi, Reg::Rdi], &cfg);
        let b = classify(mk(), &[Reg::Rsi, Reg::Rdi], &cfg);
        assert_eq!(addrs(&a.candidates), addrs(&b.candidates));
        assert_eq!(addrs(&a.candidates), vec![0x3000, 0x1000, 0x2000, 0x4000]);
    }
}
