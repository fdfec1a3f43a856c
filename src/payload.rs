//! Stack payload rendering.
//!
//! Lays a solved chain out as the little-endian qword sequence that is
//! written over the stack: each gadget address followed by the slots it
//! pops, setup chains first.

use log::debug;

use crate::chain::{Chain, ChainSolver, Step};
use crate::config::Goal;
use crate::gadget::Gadget;
use crate::memwrite::MemStep;
use crate::symbolic::ConstraintEngine;

/// A single qword of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadElement {
    /// Byte offset within the payload.
    pub offset: usize,
    /// Human-readable description.
    pub description: String,
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct Payload {
    padding: u64,
    elements: Vec<PayloadElement>,
}

impl Payload {
    /// An empty payload; unconstrained slots are filled with `padding`.
    pub fn new(padding: u64) -> Self {
        Payload { padding, elements: Vec::new() }
    }

    pub fn push_chain(&mut self, chain: &Chain) {
        for step in &chain.steps {
            self.push_step(step);
        }
    }

    pub fn push_memory_steps(&mut self, steps: &[MemStep]) {
        for step in steps {
            if let Some(setup) = &step.solution.setup {
                self.push_chain(setup);
            }
            self.push_gadget(&step.gadget, |off| step.solution.stack.get(&off).copied());
        }
    }

    fn push_step(&mut self, step: &Step) {
        for setup in step.setups() {
            self.push_chain(setup);
        }
        self.push_gadget(&step.gadget, |off| step.stack_value(off));
    }

    fn push_gadget(&mut self, gadget: &Gadget, slot: impl Fn(u64) -> Option<u64>) {
        let name = if gadget.instructions.is_empty() {
            format!("{:#x}", gadget.address)
        } else {
            gadget.instructions.clone()
        };
        self.push(gadget.address, name.clone());

        let slots = gadget.sp_delta.max(0) as u64 / 8;
        for i in 0..slots {
            let off = i * 8;
            match slot(off) {
                Some(v) => self.push(v, format!("{} [+{:#x}] = {:#x}", name, off, v)),
                None => self.push(self.padding, "padding".into()),
            }
        }
    }

    fn push(&mut self, value: u64, description: String) {
        let offset = self.elements.len() * 8;
        self.elements.push(PayloadElement { offset, description, value });
    }

    pub fn elements(&self) -> &[PayloadElement] {
        &self.elements
    }

    pub fn words(&self) -> Vec<u64> {
        self.elements.iter().map(|e| e.value).collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.elements.iter().flat_map(|e| e.value.to_le_bytes()).collect()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.elements.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<E: ConstraintEngine> ChainSolver<E> {
    /// Solve every memory write of `goal`, then its registers, into one
    /// payload. `None` unless every request is satisfied.
    pub fn solve_goal(&mut self, pool: Vec<Gadget>, goal: &Goal) -> Option<Payload> {
        if goal.is_empty() {
            return None;
        }
        let mut payload = Payload::new(self.config().padding);

        if !goal.memory.is_empty() {
            let steps = self.solve_memory_writes(pool.clone(), &goal.memory);
            if steps.len() != goal.memory.len() {
                debug!("goal: {} of {} memory writes solved", steps.len(), goal.memory.len());
                return None;
            }
            payload.push_memory_steps(&steps);
        }

        if !goal.registers.is_empty() {
            let chain = self.solve(pool, &goal.registers)?;
            payload.push_chain(&chain);
        }
        Some(payload)
    }
}
