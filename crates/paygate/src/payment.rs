use chrono::{DateTime, Utc};
use paygate_wallet::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Payment ids are 16 random bytes, hex encoded.
pub const PAYMENT_ID_HEX_LEN: usize = 32;

/// Lifecycle of a payment. `Confirmed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Staying put is always allowed; otherwise only `Pending` may move.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        *self == next || *self == PaymentStatus::Pending
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "confirmed" => Ok(PaymentStatus::Confirmed),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// A request for payment, with one receiving address per enabled currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub addresses: BTreeMap<Currency, String>,
    pub amounts: BTreeMap<Currency, Decimal>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PaymentStatus,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl Payment {
    /// A fresh pending payment with no confirmations.
    pub fn new(
        id: String,
        addresses: BTreeMap<Currency, String>,
        amounts: BTreeMap<Currency, Decimal>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            addresses,
            amounts,
            created_at,
            expires_at,
            status: PaymentStatus::Pending,
            confirmations: 0,
            transaction_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Currency whose receiving address is `address`, if any.
    pub fn currency_for_address(&self, address: &str) -> Option<Currency> {
        self.addresses
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(c, _)| *c)
    }
}

/// True for a well-formed payment id (lowercase hex of the expected length).
pub fn is_valid_payment_id(id: &str) -> bool {
    id.len() == PAYMENT_ID_HEX_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Duration;

    /// A pending single-currency payment; equal arguments give equal records.
    /// Timestamps sit in 2100 so the payment is never expired.
    pub fn payment(n: u8, confirmations: u32) -> Payment {
        let id = hex::encode([n; 16]);
        let created_at = DateTime::from_timestamp(4_102_444_800 + i64::from(n), 0)
            .unwrap_or_else(Utc::now);
        let mut p = Payment::new(
            id,
            BTreeMap::from([(Currency::Bitcoin, format!("1Addr{n}"))]),
            BTreeMap::from([(Currency::Bitcoin, Decimal::new(1, 3))]),
            created_at,
            created_at + Duration::hours(2),
        );
        p.confirmations = confirmations;
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_rules() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Expired));
        assert!(Confirmed.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Expired.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Expired));
    }

    #[test]
    fn test_json_shape() {
        let p = fixtures::payment(1, 0);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["amounts"]["BTC"], "0.001");
        assert!(json.get("transaction_id").is_none());

        let back: Payment = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_payment_id_validation() {
        assert!(is_valid_payment_id(&"ab".repeat(16)));
        assert!(!is_valid_payment_id("../../etc/passwd"));
        assert!(!is_valid_payment_id(&"AB".repeat(16)));
        assert!(!is_valid_payment_id("abcd"));
    }

    #[test]
    fn test_currency_for_address() {
        let p = fixtures::payment(2, 0);
        assert_eq!(p.currency_for_address("1Addr2"), Some(Currency::Bitcoin));
        assert_eq!(p.currency_for_address("1Other"), None);
    }
}
