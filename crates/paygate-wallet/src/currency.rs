use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WalletError;

/// A currency the paywall can accept. Serialized by ticker (`BTC`, `XMR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "BTC")]
    Bitcoin,
    #[serde(rename = "XMR")]
    Monero,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Bitcoin, Currency::Monero];

    /// Ticker symbol.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Bitcoin => "BTC",
            Currency::Monero => "XMR",
        }
    }

    /// Number of decimal places in the smallest on-chain unit
    /// (satoshi, piconero).
    pub fn atomic_scale(&self) -> u32 {
        match self {
            Currency::Bitcoin => 8,
            Currency::Monero => 12,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Currency::Bitcoin),
            "xmr" | "monero" => Ok(Currency::Monero),
            _ => Err(WalletError::UnknownCurrency(s.to_string())),
        }
    }
}
