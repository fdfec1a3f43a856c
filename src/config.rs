//! Solver configuration and goal descriptions.
//!
//! Both deserialize from JSON so a front end can hand them over as-is.

use std::collections::BTreeSet;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memwrite::MemValue;
use crate::types::{BadBytes, Reg, Value};

/// Default recursion budget for nested register prerequisites.
pub const DEFAULT_MAX_DEPTH: usize = 6;

/// Default filler for stack slots nothing constrains ("AAAAAAAA").
pub const DEFAULT_PADDING: u64 = 0x4141_4141_4141_4141;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Registers no chosen gadget may write.
    pub forbidden_regs: BTreeSet<Reg>,
    /// Bytes that must not appear in gadget addresses or stack values.
    pub bad_bytes: BadBytes,
    /// How many levels of nested prerequisite solving are allowed.
    pub max_depth: usize,
    pub padding: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            forbidden_regs: BTreeSet::new(),
            bad_bytes: BadBytes::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            padding: DEFAULT_PADDING,
        }
    }
}

impl SolverConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SolverConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bad_bytes.hits(self.padding) {
            return Err(Error::Config(format!(
                "padding {:#x} contains a forbidden byte",
                self.padding
            )));
        }
        if let Some(r) = self.forbidden_regs.iter().find(|r| **r == Reg::Rsp) {
            return Err(Error::Config(format!("{} cannot be forbidden", r)));
        }
        Ok(())
    }

    pub fn with_bad_bytes(mut self, bytes: &[u8]) -> Self {
        self.bad_bytes = BadBytes::new(bytes);
        self
    }

    pub fn with_forbidden_regs(mut self, regs: impl IntoIterator<Item = Reg>) -> Self {
        self.forbidden_regs = regs.into_iter().collect();
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_padding(mut self, padding: u64) -> Self {
        self.padding = padding;
        self
    }
}

/// Requested end state: register contents and memory contents.
///
/// Order is preserved; it drives classification order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Goal {
    pub registers: IndexMap<Reg, Value>,
    pub memory: IndexMap<u64, MemValue>,
}

impl Goal {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn register(mut self, reg: Reg, value: impl Into<Value>) -> Self {
        self.registers.insert(reg, value.into());
        self
    }

    pub fn memory(mut self, addr: u64, value: impl Into<MemValue>) -> Self {
        self.memory.insert(addr, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.memory.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = SolverConfig::from_json(r#"{"bad_bytes": [0, 10]}"#).unwrap();
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert!(config.bad_bytes.contains(0x0a));
        assert!(config.forbidden_regs.is_empty());
    }

    #[test]
    fn forbidden_regs_by_name() {
        let config = SolverConfig::from_json(r#"{"forbidden_regs": ["rbp", "r12"]}"#).unwrap();
        assert!(config.forbidden_regs.contains(&Reg::R12));
        assert!(config.forbidden_regs.contains(&Reg::Rbp));
    }

    #[test]
    fn padding_with_bad_byte_is_rejected() {
        let err = SolverConfig::from_json(r#"{"bad_bytes": [65]}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(SolverConfig::from_json(r#"{"bad_bytes": [65], "padding": 4774451407313060418}"#).is_ok());
    }

    #[test]
    fn goal_keeps_request_order() {
        let goal = Goal::from_json(
            r#"{"registers": {"rsi": 0, "rdi": "rax", "rdx": 16},
                "memory": {"6295552": {"value": 26739, "bits": 64}}}"#,
        )
        .unwrap();
        let regs: Vec<_> = goal.registers.keys().copied().collect();
        assert_eq!(regs, vec![Reg::Rsi, Reg::Rdi, Reg::Rdx]);
        assert_eq!(goal.registers[&Reg::Rdi], Value::Alias(Reg::Rax));
        assert_eq!(goal.memory[&0x601000].value, 26739);
    }

    #[test]
    fn goal_builder() {
        let goal = Goal::default().register(Reg::Rdi, 0x41u64).memory(0x1000, 7u64);
        assert!(!goal.is_empty());
        assert_eq!(goal.memory[&0x1000].bits, 64);
    }
}
