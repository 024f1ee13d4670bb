use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::builder::ActionEnvelope;
use crate::config::Config;
use crate::events::{EventKind, EventSource, RawEvent};

mod paper;
mod rest;
pub mod retry;
pub mod signing;

pub use paper::PaperLedger;
pub use rest::RestLedger;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerKind {
    Rest,
    Paper,
}

impl LedgerKind {
    pub fn for_config_flag(dry_run: bool) -> Self {
        if dry_run {
            LedgerKind::Paper
        } else {
            LedgerKind::Rest
        }
    }

    pub fn build(self, cfg: &Config) -> Result<Box<dyn Ledger>> {
        match self {
            LedgerKind::Rest => Ok(Box::new(RestLedger::new(cfg)?)),
            LedgerKind::Paper => Ok(Box::new(PaperLedger::new(0))),
        }
    }
}

/// Transaction status as reported by the access node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Unknown,
    Pending,
    Finalized,
    Executed,
    Sealed,
    Expired,
}

impl TxStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => TxStatus::Pending,
            "Finalized" => TxStatus::Finalized,
            "Executed" => TxStatus::Executed,
            "Sealed" => TxStatus::Sealed,
            "Expired" => TxStatus::Expired,
            _ => TxStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Unknown => "Unknown",
            TxStatus::Pending => "Pending",
            TxStatus::Finalized => "Finalized",
            TxStatus::Executed => "Executed",
            TxStatus::Sealed => "Sealed",
            TxStatus::Expired => "Expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Sealed | TxStatus::Expired)
    }
}

/// Terminal outcome of a submitted transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Finality {
    pub status: TxStatus,
    pub error_message: Option<String>,
    pub raw: Value,
}

impl Finality {
    /// Sealed without an execution error.
    pub fn succeeded(&self) -> bool {
        self.status == TxStatus::Sealed
            && self.error_message.as_deref().map(str::is_empty).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VaultStats {
    pub total_assets: f64,
    pub total_shares: f64,
}

impl VaultStats {
    pub fn from_fields(v: &Value) -> Result<Self> {
        let read = |name: &str| -> Option<f64> {
            match v.get(name)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
        };
        match (read("totalAssets"), read("totalShares")) {
            (Some(total_assets), total_shares) => Ok(Self {
                total_assets,
                total_shares: total_shares.unwrap_or(0.0),
            }),
            _ => bail!("vault stats missing totalAssets: {}", v),
        }
    }
}

/// Everything the executor needs from the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn latest_height(&self) -> Result<u64>;
    /// Events of one kind emitted by `source` in the inclusive range.
    async fn events(&self, source: &EventSource, kind: EventKind, from: u64, to: u64) -> Result<Vec<RawEvent>>;
    /// Returns the transaction id.
    async fn submit(&self, envelope: &ActionEnvelope) -> Result<String>;
    async fn await_finality(&self, tx_id: &str) -> Result<Finality>;
    async fn vault_stats(&self) -> Result<VaultStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finality_classification() {
        let ok = Finality { status: TxStatus::Sealed, error_message: None, raw: Value::Null };
        assert!(ok.succeeded());
        let reverted = Finality {
            status: TxStatus::Sealed,
            error_message: Some("panic: insufficient balance".to_string()),
            raw: Value::Null,
        };
        assert!(!reverted.succeeded());
        let expired = Finality { status: TxStatus::Expired, error_message: None, raw: Value::Null };
        assert!(!expired.succeeded());
        assert!(TxStatus::parse("Expired").is_terminal());
        assert!(!TxStatus::parse("Executed").is_terminal());
    }

    #[test]
    fn test_vault_stats_parse() {
        let s = VaultStats::from_fields(&json!({"totalAssets": "100.00000000", "totalShares": "80.0"})).unwrap();
        assert_eq!(s.total_assets, 100.0);
        assert_eq!(s.total_shares, 80.0);
        assert!(VaultStats::from_fields(&json!({})).is_err());
    }

    #[test]
    fn test_kind_selection() {
        assert_eq!(LedgerKind::for_config_flag(true), LedgerKind::Paper);
        assert_eq!(LedgerKind::for_config_flag(false), LedgerKind::Rest);
    }
}
