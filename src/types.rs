use std::fmt;
use std::str::FromStr;

use iced_x86::Register;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// x86_64 64-bit register.
///
/// Declaration order is the canonical ordering used by every ordered
/// set and map in the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reg {
    Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rbp, Rsp,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx,
        Reg::Rsi, Reg::Rdi, Reg::Rbp, Reg::Rsp,
        Reg::R8, Reg::R9, Reg::R10, Reg::R11,
        Reg::R12, Reg::R13, Reg::R14, Reg::R15,
    ];

    /// Whether a solver binding may legitimately name this register.
    ///
    /// `rbp` and `rsp` are excluded: a model that asks for a particular
    /// frame or stack pointer cannot be satisfied by a chain.
    pub fn is_general_purpose(self) -> bool {
        !matches!(self, Reg::Rbp | Reg::Rsp)
    }

    /// Map a 64- or 32-bit iced register onto its full-width register.
    pub fn from_iced(reg: Register) -> Option<Self> {
        match reg {
            Register::RAX | Register::EAX => Some(Reg::Rax),
            Register::RBX | Register::EBX => Some(Reg::Rbx),
            Register::RCX | Register::ECX => Some(Reg::Rcx),
            Register::RDX | Register::EDX => Some(Reg::Rdx),
            Register::RSI | Register::ESI => Some(Reg::Rsi),
            Register::RDI | Register::EDI => Some(Reg::Rdi),
            Register::RBP | Register::EBP => Some(Reg::Rbp),
            Register::RSP | Register::ESP => Some(Reg::Rsp),
            Register::R8 | Register::R8D => Some(Reg::R8),
            Register::R9 | Register::R9D => Some(Reg::R9),
            Register::R10 | Register::R10D => Some(Reg::R10),
            Register::R11 | Register::R11D => Some(Reg::R11),
            Register::R12 | Register::R12D => Some(Reg::R12),
            Register::R13 | Register::R13D => Some(Reg::R13),
            Register::R14 | Register::R14D => Some(Reg::R14),
            Register::R15 | Register::R15D => Some(Reg::R15),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax", Reg::Rbx => "rbx",
            Reg::Rcx => "rcx", Reg::Rdx => "rdx",
            Reg::Rsi => "rsi", Reg::Rdi => "rdi",
            Reg::Rbp => "rbp", Reg::Rsp => "rsp",
            Reg::R8  => "r8",  Reg::R9  => "r9",
            Reg::R10 => "r10", Reg::R11 => "r11",
            Reg::R12 => "r12", Reg::R13 => "r13",
            Reg::R14 => "r14", Reg::R15 => "r15",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Reg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Reg::ALL
            .iter()
            .copied()
            .find(|r| r.name() == lower)
            .ok_or_else(|| Error::Other(format!("unknown register: {}", s)))
    }
}

/// Requested (or known) register content.
///
/// `Alias` means "equal to whatever that register holds", not a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Literal(u64),
    Alias(Reg),
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Literal(v)
    }
}

impl From<Reg> for Value {
    fn from(r: Reg) -> Self {
        Value::Alias(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Literal(v) => write!(f, "{:#x}", v),
            Value::Alias(r) => write!(f, "{}", r),
        }
    }
}

/// Forbidden byte values (e.g. `\0`, `\n` for string-based overflows).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u8>", into = "Vec<u8>")]
pub struct BadBytes(Vec<u8>);

impl BadBytes {
    pub fn new(bytes: &[u8]) -> Self {
        let mut v = bytes.to_vec();
        v.sort_unstable();
        v.dedup();
        BadBytes(v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, byte: u8) -> bool {
        self.0.binary_search(&byte).is_ok()
    }

    /// True if the 8-byte little-endian form of `value` has a forbidden byte.
    pub fn hits(&self, value: u64) -> bool {
        value.to_le_bytes().iter().any(|b| self.contains(*b))
    }
}

impl From<Vec<u8>> for BadBytes {
    fn from(v: Vec<u8>) -> Self {
        BadBytes::new(&v)
    }
}

impl From<BadBytes> for Vec<u8> {
    fn from(b: BadBytes) -> Self {
        b.0
    }
}

/// Number of bytes left in the little-endian form of `value` once
/// trailing zero bytes are dropped. Zero has no significant bytes.
pub fn significant_len(value: u64) -> usize {
    8 - (value.leading_zeros() as usize / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_display_and_parse() {
        assert_eq!(format!("{}", Reg::R10), "r10");
        assert_eq!("RDI".parse::<Reg>().unwrap(), Reg::Rdi);
        assert!("xmm0".parse::<Reg>().is_err());
    }

    #[test]
    fn reg_from_iced_32bit() {
        assert_eq!(Reg::from_iced(Register::EAX), Some(Reg::Rax));
        assert_eq!(Reg::from_iced(Register::R9D), Some(Reg::R9));
        assert_eq!(Reg::from_iced(Register::AL), None);
    }

    #[test]
    fn general_purpose_excludes_frame_regs() {
        assert!(Reg::Rdi.is_general_purpose());
        assert!(!Reg::Rsp.is_general_purpose());
        assert!(!Reg::Rbp.is_general_purpose());
        assert_eq!(Reg::ALL.iter().filter(|r| r.is_general_purpose()).count(), 14);
    }

    #[test]
    fn value_deserializes_literal_or_alias() {
        let v: Vec<Value> = serde_json::from_str(r#"[65, "rsi"]"#).unwrap();
        assert_eq!(v, vec![Value::Literal(65), Value::Alias(Reg::Rsi)]);
    }

    #[test]
    fn bad_bytes_hits() {
        let bad = BadBytes::new(&[0x0a, 0x00, 0x0a]);
        assert_eq!(bad.iter().collect::<Vec<_>>(), vec![0x00, 0x0a]);
        assert!(bad.hits(0x401000)); // high bytes are zero
        assert!(!BadBytes::new(&[0x0a]).hits(0x401000));
        assert!(BadBytes::new(&[0x0a]).hits(0x40100a));
    }

    #[test]
    fn significant_len_strips_high_zeros() {
        assert_eq!(significant_len(0), 0);
        assert_eq!(significant_len(0x41), 1);
        assert_eq!(significant_len(0x41414141), 4);
        assert_eq!(significant_len(u64::MAX), 8);
    }
}
