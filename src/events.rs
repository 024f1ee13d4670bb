use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Contracts whose events the executor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Contract {
    AionVault,
    ActionRegistry,
}

impl Contract {
    pub fn name(&self) -> &'static str {
        match self {
            Contract::AionVault => "AIONVault",
            Contract::ActionRegistry => "ActionRegistry",
        }
    }

    /// Event kinds emitted by this contract, in polling order.
    pub fn event_kinds(&self) -> &'static [EventKind] {
        match self {
            Contract::AionVault => &[
                EventKind::Deposit,
                EventKind::Withdraw,
                EventKind::Rebalance,
                EventKind::StrategyRecommendation,
                EventKind::YieldRealized,
                EventKind::StrategyAllocationUpdated,
                EventKind::AiAgentUpdated,
                EventKind::VaultLockStatusChanged,
                EventKind::VaultSnapshot,
            ],
            Contract::ActionRegistry => &[
                EventKind::ActionRegistered,
                EventKind::ActionExecuted,
                EventKind::ActionFailed,
                EventKind::ActionUpdated,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Deposit,
    Withdraw,
    Rebalance,
    StrategyRecommendation,
    YieldRealized,
    StrategyAllocationUpdated,
    AiAgentUpdated,
    VaultLockStatusChanged,
    VaultSnapshot,
    ActionRegistered,
    ActionExecuted,
    ActionFailed,
    ActionUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Deposit,
        EventKind::Withdraw,
        EventKind::Rebalance,
        EventKind::StrategyRecommendation,
        EventKind::YieldRealized,
        EventKind::StrategyAllocationUpdated,
        EventKind::AiAgentUpdated,
        EventKind::VaultLockStatusChanged,
        EventKind::VaultSnapshot,
        EventKind::ActionRegistered,
        EventKind::ActionExecuted,
        EventKind::ActionFailed,
        EventKind::ActionUpdated,
    ];

    /// Event name as declared in the contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Deposit => "Deposit",
            EventKind::Withdraw => "Withdraw",
            EventKind::Rebalance => "Rebalance",
            EventKind::StrategyRecommendation => "StrategyRecommendation",
            EventKind::YieldRealized => "YieldRealized",
            EventKind::StrategyAllocationUpdated => "StrategyAllocationUpdated",
            EventKind::AiAgentUpdated => "AIAgentUpdated",
            EventKind::VaultLockStatusChanged => "VaultLockStatusChanged",
            EventKind::VaultSnapshot => "VaultSnapshot",
            EventKind::ActionRegistered => "ActionRegistered",
            EventKind::ActionExecuted => "ActionExecuted",
            EventKind::ActionFailed => "ActionFailed",
            EventKind::ActionUpdated => "ActionUpdated",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    pub fn contract(&self) -> Contract {
        if Contract::AionVault.event_kinds().contains(self) {
            Contract::AionVault
        } else {
            Contract::ActionRegistry
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployed contract the monitor polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub contract: Contract,
    pub address: String,
}

impl EventSource {
    pub fn new(contract: Contract, address: &str) -> Self {
        Self { contract, address: address.to_string() }
    }

    /// `A.<address>.<Contract>`, the prefix of every event type it emits.
    pub fn id(&self) -> String {
        format!(
            "A.{}.{}",
            self.address.trim_start_matches("0x"),
            self.contract.name()
        )
    }

    pub fn qualified_type(&self, kind: EventKind) -> String {
        format!("{}.{}", self.id(), kind.as_str())
    }

    pub fn kinds(&self) -> &'static [EventKind] {
        self.contract.event_kinds()
    }
}

/// Identity of one event occurrence on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub tx_id: String,
    pub event_index: u32,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.tx_id, self.event_index)
    }
}

/// An event as returned by the ledger client.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub source_id: String,
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    pub tx_id: String,
    pub block_height: u64,
    pub event_index: u32,
}

impl RawEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            tx_id: self.tx_id.clone(),
            event_index: self.event_index,
        }
    }

    /// Domain fields plus the ledger coordinates of the occurrence.
    pub fn enriched_payload(&self) -> Map<String, Value> {
        let mut payload = self.payload.clone();
        payload.insert("transactionId".to_string(), Value::String(self.tx_id.clone()));
        payload.insert("blockHeight".to_string(), Value::from(self.block_height));
        payload.insert("eventIndex".to_string(), Value::from(self.event_index));
        payload
    }
}

/// What subscribers receive from the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEvent {
    pub kind: EventKind,
    pub payload: Map<String, Value>,
}

impl MonitorEvent {
    pub fn from_raw(event: &RawEvent) -> Self {
        Self {
            kind: event.kind,
            payload: event.enriched_payload(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Numeric field; fixed-point values arrive as strings and are parsed.
    pub fn f64_field(&self, name: &str) -> Option<f64> {
        match self.payload.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.payload.get(name).and_then(Value::as_bool)
    }

    pub fn string_list(&self, name: &str) -> Vec<String> {
        self.payload
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tx_id(&self) -> Option<&str> {
        self.str_field("transactionId")
    }
}
