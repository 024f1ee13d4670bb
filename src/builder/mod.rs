//! Turns logical action requests into submittable envelopes.
//!
//! Builders validate their inputs, format quantities to the ledger's
//! fixed-point precision and pull transaction code from a [`TemplateStore`].
//! Arguments are emitted in the exact positional order the code declares.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cadence::{format_fixed, format_ufix64, is_flow_address, TypeTag};
use crate::logging::{debug, obj, v_str, Domain};

pub mod envelope;
pub mod templates;

pub use envelope::{ActionEnvelope, ActionType, Arg};
pub use templates::{DirTemplateStore, MemoryTemplateStore, TemplateStore};

/// Decimal places for recommendation scores.
const SCORE_DECIMALS: usize = 2;

/// Import placeholders substituted into template code.
pub const VAULT_PLACEHOLDER: &str = "0xAIONVAULT";
pub const REGISTRY_PLACEHOLDER: &str = "0xACTIONREGISTRY";
pub const FUNGIBLE_TOKEN_PLACEHOLDER: &str = "0xFUNGIBLETOKEN";
pub const FLOW_TOKEN_PLACEHOLDER: &str = "0xFLOWTOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    pub from_strategy: String,
    pub to_strategy: String,
    pub amount: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub shares: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterActionRequest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub contract_address: String,
    pub method: String,
    pub schema: String,
    pub category: String,
    pub risk_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAgentRequest {
    pub agent_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest {
    pub strategies: Vec<String>,
    pub apys: Vec<f64>,
    pub risk_score: f64,
    #[serde(rename = "metadataCID")]
    pub metadata_cid: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomRequest {
    pub name: String,
    pub code: String,
    pub args: Vec<Arg>,
    pub metadata: Map<String, Value>,
}

pub struct ActionBuilder {
    templates: Arc<dyn TemplateStore>,
    vault_address: String,
    aliases: Vec<(String, String)>,
}

impl ActionBuilder {
    pub fn new(templates: Arc<dyn TemplateStore>, vault_address: &str) -> Self {
        Self {
            templates,
            vault_address: vault_address.to_string(),
            aliases: vec![(VAULT_PLACEHOLDER.to_string(), vault_address.to_string())],
        }
    }

    /// Replaces `placeholder` with `address` in every template loaded.
    pub fn with_alias(mut self, placeholder: &str, address: &str) -> Self {
        self.aliases.push((placeholder.to_string(), address.to_string()));
        self
    }

    pub fn rebalance(&self, req: &RebalanceRequest) -> Result<ActionEnvelope> {
        require_text("fromStrategy", &req.from_strategy)?;
        require_text("toStrategy", &req.to_strategy)?;
        require_text("reason", &req.reason)?;
        let amount = require_quantity("amount", req.amount)?;

        let code = self.load(ActionType::Rebalance)?;
        self.finish(
            "Rebalance Strategy",
            ActionType::Rebalance,
            code,
            vec![
                Arg::string(&req.from_strategy),
                Arg::string(&req.to_strategy),
                Arg::ufix64(amount),
                Arg::string(&req.reason),
            ],
            mirror(req)?,
        )
    }

    pub fn deposit(&self, req: &DepositRequest) -> Result<ActionEnvelope> {
        let amount = require_quantity("amount", req.amount)?;
        let code = self.load(ActionType::Deposit)?;
        self.finish(
            "Deposit Funds",
            ActionType::Deposit,
            code,
            vec![Arg::ufix64(amount)],
            mirror(req)?,
        )
    }

    pub fn withdraw(&self, req: &WithdrawRequest) -> Result<ActionEnvelope> {
        let shares = require_quantity("shares", req.shares)?;
        let code = self.load(ActionType::Withdraw)?;
        self.finish(
            "Withdraw Funds",
            ActionType::Withdraw,
            code,
            vec![Arg::ufix64(shares)],
            mirror(req)?,
        )
    }

    pub fn register_action(&self, req: &RegisterActionRequest) -> Result<ActionEnvelope> {
        require_text("id", &req.id)?;
        require_text("name", &req.name)?;
        require_text("description", &req.description)?;
        require_address("contractAddress", &req.contract_address)?;
        require_text("method", &req.method)?;
        require_text("schema", &req.schema)?;
        require_text("category", &req.category)?;

        let code = self.load(ActionType::Register)?;
        self.finish(
            "Register Action",
            ActionType::Register,
            code,
            vec![
                Arg::string(&req.id),
                Arg::string(&req.name),
                Arg::string(&req.description),
                Arg::address(&req.contract_address),
                Arg::string(&req.method),
                Arg::string(&req.schema),
                Arg::string(&req.category),
                Arg::uint8(req.risk_level),
            ],
            mirror(req)?,
        )
    }

    pub fn set_agent(&self, req: &SetAgentRequest) -> Result<ActionEnvelope> {
        require_address("agentAddress", &req.agent_address)?;
        let code = self.load(ActionType::SetAgent)?;
        self.finish(
            "Set AI Agent",
            ActionType::SetAgent,
            code,
            vec![Arg::address(&req.agent_address)],
            mirror(req)?,
        )
    }

    /// Posts a recommendation on chain. The transaction is generated against
    /// the configured vault rather than read from the template store.
    pub fn recommendation(&self, req: &RecommendationRequest) -> Result<ActionEnvelope> {
        if req.strategies.is_empty() {
            bail!("missing required field: strategies");
        }
        for s in &req.strategies {
            require_text("strategies", s)?;
        }
        if req.apys.len() != req.strategies.len() {
            bail!(
                "apys has {} entries but strategies has {}",
                req.apys.len(),
                req.strategies.len()
            );
        }
        require_text("metadataCID", &req.metadata_cid)?;
        let apys = req
            .apys
            .iter()
            .map(|a| format_fixed(*a, SCORE_DECIMALS).map(Value::String))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| anyhow!("invalid field apys: {}", e))?;
        let risk = format_fixed(req.risk_score, SCORE_DECIMALS)
            .map_err(|e| anyhow!("invalid field riskScore: {}", e))?;
        let confidence = format_fixed(req.confidence, SCORE_DECIMALS)
            .map_err(|e| anyhow!("invalid field confidence: {}", e))?;

        let strategies = req.strategies.iter().cloned().map(Value::String).collect();
        self.finish(
            "Post AI Recommendation",
            ActionType::Recommendation,
            recommendation_code(&self.vault_address),
            vec![
                Arg::new(Value::Array(strategies), TypeTag::array_of(TypeTag::String)),
                Arg::new(Value::Array(apys), TypeTag::array_of(TypeTag::UFix64)),
                Arg::new(Value::String(risk), TypeTag::UFix64),
                Arg::string(&req.metadata_cid),
                Arg::new(Value::String(confidence), TypeTag::UFix64),
            ],
            mirror(req)?,
        )
    }

    /// Caller-supplied code and arguments; the template store is not consulted.
    pub fn custom(&self, req: CustomRequest) -> Result<ActionEnvelope> {
        require_text("name", &req.name)?;
        require_text("code", &req.code)?;
        for (i, arg) in req.args.iter().enumerate() {
            arg.to_cadence()
                .map_err(|e| anyhow!("invalid argument {}: {}", i, e))?;
        }
        self.finish(&req.name, ActionType::Custom, req.code, req.args, req.metadata)
    }

    fn load(&self, action: ActionType) -> Result<String> {
        let file = action
            .template_file()
            .ok_or_else(|| anyhow!("{} actions have no template", action.as_str()))?;
        let mut code = self.templates.load_template(file)?;
        for (placeholder, address) in &self.aliases {
            code = code.replace(placeholder.as_str(), address);
        }
        Ok(code)
    }

    fn finish(
        &self,
        name: &str,
        action: ActionType,
        code: String,
        args: Vec<Arg>,
        metadata: Map<String, Value>,
    ) -> Result<ActionEnvelope> {
        let envelope = ActionEnvelope::new(name, action, code, args, metadata);
        debug(
            Domain::Builder,
            "envelope_built",
            obj(&[
                ("action", v_str(envelope.name())),
                ("type", v_str(action.as_str())),
                ("fingerprint", v_str(&envelope.fingerprint())),
            ]),
        );
        Ok(envelope)
    }
}

fn recommendation_code(vault_address: &str) -> String {
    format!(
        r#"import AIONVault from {vault}

transaction(
    strategies: [String],
    apys: [UFix64],
    riskScore: UFix64,
    metadataCID: String,
    confidence: UFix64
) {{
    prepare(signer: &Account) {{}}

    execute {{
        AIONVault.postRecommendation(
            aiAgent: signer.address,
            strategies: strategies,
            apys: apys,
            riskScore: riskScore,
            metadataCID: metadataCID,
            confidence: confidence
        )
    }}
}}
"#,
        vault = vault_address
    )
}

fn mirror<T: Serialize>(req: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(req)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("request did not serialize to an object: {}", other)),
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("missing required field: {}", field);
    }
    Ok(())
}

fn require_quantity(field: &str, value: f64) -> Result<String> {
    format_ufix64(value).map_err(|e| anyhow!("invalid field {}: {}", field, e))
}

fn require_address(field: &str, value: &str) -> Result<()> {
    require_text(field, value)?;
    if !is_flow_address(value) {
        bail!("invalid field {}: not a Flow address: {}", field, value);
    }
    Ok(())
}
