//! Gadget catalog input.
//!
//! A catalog is a JSON array of entries. An entry holding only an
//! address and hex bytes is decoded and lifted here; an entry carrying
//! an `end` is taken as already-classified metadata (bytes optional,
//! needed only when the solver has to query the gadget's effects).
//!
//! ```json
//! [
//!   {"address": "0x401234", "bytes": "5fc3"},
//!   {"address": 4198960, "instructions": "mov rdi, rsi; ret",
//!    "defined": {"rdi": "rsi"}, "depends": ["rsi"], "sp_delta": 0, "end": "return"}
//! ]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::gadget::{EndKind, Gadget, MemAccess, MAX_SP_DELTA};
use crate::types::{Reg, Value};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Address {
    Number(u64),
    Text(String),
}

impl Address {
    fn resolve(&self) -> Result<u64> {
        match self {
            Address::Number(n) => Ok(*n),
            Address::Text(s) => parse_address(s),
        }
    }
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| Error::Catalog(format!("invalid address: {:?}", s)))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Entry {
    address: Address,
    #[serde(default)]
    bytes: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    mem: MemAccess,
    #[serde(default)]
    popped: BTreeSet<Reg>,
    #[serde(default)]
    written: BTreeSet<Reg>,
    #[serde(default)]
    defined: BTreeMap<Reg, Value>,
    #[serde(default)]
    depends: BTreeSet<Reg>,
    #[serde(default)]
    sp_delta: i64,
    #[serde(default)]
    end: Option<EndKind>,
}

impl Entry {
    fn into_gadget(self) -> Result<Gadget> {
        let address = self.address.resolve()?;
        let bytes = match &self.bytes {
            Some(text) => hex::decode(text.trim().replace(' ', ""))?,
            None => Vec::new(),
        };

        let Some(end) = self.end else {
            if bytes.is_empty() {
                return Err(Error::Catalog(format!("{:#x}: entry has neither bytes nor metadata", address)));
            }
            return Gadget::decode(address, &bytes);
        };

        if self.sp_delta < 0 || self.sp_delta > MAX_SP_DELTA || self.sp_delta % 8 != 0 {
            return Err(Error::Catalog(format!("{:#x}: bad sp_delta {}", address, self.sp_delta)));
        }

        let mut gadget = Gadget::new(address);
        gadget.bytes = bytes;
        gadget.instructions = self.instructions.unwrap_or_default();
        gadget.mem = self.mem;
        gadget.sp_delta = self.sp_delta;
        gadget.end = end;
        gadget.written = self
            .written
            .iter()
            .chain(self.popped.iter())
            .chain(self.defined.keys())
            .copied()
            .collect();
        gadget.popped = self.popped;
        gadget.defined = self.defined;
        gadget.depends = self.depends;
        if let Some(r) = end.transfer_reg() {
            gadget.depends.insert(r);
        }

        if gadget.bytes.is_empty() {
            let opaque: Vec<Reg> = gadget
                .written
                .iter()
                .filter(|r| !gadget.defined.contains_key(r))
                .copied()
                .collect();
            if !opaque.is_empty() {
                debug!("{:#x}: no bytes, {:?} only usable through defined values", address, opaque);
            }
        }
        Ok(gadget)
    }
}

/// Parse a JSON catalog.
pub fn parse_catalog(text: &str) -> Result<Vec<Gadget>> {
    let entries: Vec<Entry> = serde_json::from_str(text)?;
    let gadgets = entries
        .into_iter()
        .map(Entry::into_gadget)
        .collect::<Result<Vec<_>>>()?;
    debug!("catalog: {} gadgets", gadgets.len());
    Ok(gadgets)
}

pub fn load_catalog(path: &Path) -> Result<Vec<Gadget>> {
    let text = std::fs::read_to_string(path)?;
    parse_catalog(&text)
}
