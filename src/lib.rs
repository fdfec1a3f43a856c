//! ropsolve: constraint-driven ROP chain synthesis for x86_64.
//!
//! Given a pool of already discovered gadgets, finds an ordered chain that
//! leaves requested registers (and memory cells) holding requested values,
//! avoiding forbidden bytes and forbidden registers, and renders it as a
//! stack payload.
//!
//! # Module overview
//!
//! ## Model
//!
//! - [`error`]: error types used throughout the crate.
//! - [`types`]: registers, requested values, forbidden-byte sets.
//! - [`gadget`]: gadget metadata, lazily built effects, indirect-ending pairing.
//! - [`config`]: solver settings and goals (JSON).
//! - [`catalog`]: gadget catalog input (JSON).
//!
//! ## Symbolic layer
//!
//! - [`symbolic`]: the constraint engine contract.
//! - [`symbolic::expr`]: bitvector expressions over registers and stack slots.
//! - [`symbolic::lift`]: x86_64 gadget bytes to symbolic effects, using iced-x86.
//! - [`symbolic::solver`]: the built-in inversion engine.
//!
//! ## Synthesis
//!
//! - [`classify`]: priority ordering of candidate gadgets.
//! - [`chain`]: recursive register chain search.
//! - [`memwrite`]: memory-write search.
//! - [`payload`]: flattening chains into stack words.
//!
//! # Example
//!
//! ```
//! use ropsolve::catalog::parse_catalog;
//! use ropsolve::chain::{ChainSolver, RegRequest};
//! use ropsolve::config::SolverConfig;
//! use ropsolve::payload::Payload;
//! use ropsolve::symbolic::InversionEngine;
//! use ropsolve::types::Reg;
//!
//! let pool = parse_catalog(r#"[{"address": "0x401000", "bytes": "5fc3"}]"#).unwrap();
//! let mut request = RegRequest::new();
//! request.insert(Reg::Rdi, 0x41414141u64.into());
//!
//! let mut solver = ChainSolver::new(InversionEngine::new(), SolverConfig::default());
//! let chain = solver.solve(pool, &request).unwrap();
//!
//! let mut payload = Payload::new(solver.config().padding);
//! payload.push_chain(&chain);
//! assert_eq!(payload.words(), vec![0x401000, 0x41414141]);
//! ```

pub mod error;
pub mod types;
pub mod symbolic;
pub mod gadget;
pub mod config;
pub mod catalog;
pub mod classify;
pub mod chain;
pub mod memwrite;
pub mod payload;
