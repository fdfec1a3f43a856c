use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("decode error at {addr:#x}: {reason}")]
    Decode { addr: u64, reason: String },

    #[error("unsupported instruction at {addr:#x}: {insn}")]
    Unsupported { addr: u64, insn: String },

    #[error("gadget {0:#x} has no instruction bytes")]
    NoBytes(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
