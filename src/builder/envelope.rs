use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cadence::{encode_arg, TypeTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Deposit,
    Withdraw,
    Rebalance,
    Register,
    SetAgent,
    Recommendation,
    Custom,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Deposit => "deposit",
            ActionType::Withdraw => "withdraw",
            ActionType::Rebalance => "rebalance",
            ActionType::Register => "register",
            ActionType::SetAgent => "set_agent",
            ActionType::Recommendation => "recommendation",
            ActionType::Custom => "custom",
        }
    }

    /// Template file holding the transaction code, for types read from the
    /// template store.
    pub fn template_file(&self) -> Option<&'static str> {
        match self {
            ActionType::Deposit => Some("deposit.cdc"),
            ActionType::Withdraw => Some("withdraw.cdc"),
            ActionType::Rebalance => Some("rebalance.cdc"),
            ActionType::Register => Some("register_action.cdc"),
            ActionType::SetAgent => Some("set_ai_agent.cdc"),
            ActionType::Recommendation | ActionType::Custom => None,
        }
    }
}

/// One positional transaction argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub value: Value,
    pub type_tag: TypeTag,
}

impl Arg {
    pub fn new(value: Value, type_tag: TypeTag) -> Self {
        Self { value, type_tag }
    }

    pub fn string(s: &str) -> Self {
        Self::new(Value::String(s.to_string()), TypeTag::String)
    }

    /// `s` must already be formatted to the fixed-point precision.
    pub fn ufix64(s: String) -> Self {
        Self::new(Value::String(s), TypeTag::UFix64)
    }

    pub fn address(addr: &str) -> Self {
        Self::new(Value::String(addr.to_string()), TypeTag::Address)
    }

    pub fn uint8(n: u8) -> Self {
        Self::new(Value::from(n), TypeTag::UInt8)
    }

    pub fn to_cadence(&self) -> Result<Value> {
        encode_arg(&self.value, &self.type_tag)
    }
}

/// A fully-formed transaction description. Fields are read-only after
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    name: String,
    action_type: ActionType,
    code: String,
    args: Vec<Arg>,
    metadata: Map<String, Value>,
}

impl ActionEnvelope {
    pub(crate) fn new(
        name: &str,
        action_type: ActionType,
        code: String,
        args: Vec<Arg>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.to_string(),
            action_type,
            code,
            args,
            metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Stable identity over type, code and arguments; metadata is excluded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.action_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.code.as_bytes());
        for arg in &self.args {
            hasher.update([0u8]);
            hasher.update(arg.type_tag.cadence_name().as_bytes());
            hasher.update([b':']);
            hasher.update(arg.value.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Arguments as JSON-Cadence values, in declaration order.
    pub fn cadence_args(&self) -> Result<Vec<Value>> {
        self.args.iter().map(Arg::to_cadence).collect()
    }
}
