use thiserror::Error;

/// Errors returned by address derivation, encoding and wallet persistence.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid seed length {0}: expected 16 to 64 bytes")]
    InvalidSeed(usize),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The derived child key is out of range or zero. The caller should move
    /// on to the next index.
    #[error("derived key at index {index} is invalid")]
    InvalidChildKey { index: u32 },

    #[error("address index space exhausted")]
    IndexExhausted,

    #[error("invalid base58 character {character:?} at position {position}")]
    InvalidBase58 { character: char, position: usize },

    #[error("base58check checksum mismatch")]
    ChecksumMismatch,

    #[error("unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address rpc error: {0}")]
    Rpc(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("wallet storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
