use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Finality, Ledger, TxStatus, VaultStats};
use crate::builder::ActionEnvelope;
use crate::events::{EventKind, EventSource, RawEvent};
use crate::logging::{info, obj, v_str, Domain};

#[derive(Default)]
struct PaperState {
    height: Option<u64>,
    events: Vec<RawEvent>,
    failing_kinds: HashSet<EventKind>,
    event_queries: usize,
    finality: HashMap<String, Finality>,
    default_finality: Option<Finality>,
    submit_error: Option<String>,
    submissions: Vec<ActionEnvelope>,
    vault: Option<VaultStats>,
    next_tx: u64,
}

/// In-memory ledger for dry runs and tests. Submissions are recorded and
/// seal successfully unless told otherwise.
pub struct PaperLedger {
    state: Mutex<PaperState>,
    submit_lock: tokio::sync::Mutex<()>,
}

impl PaperLedger {
    pub fn new(height: u64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                height: Some(height),
                vault: Some(VaultStats::default()),
                ..PaperState::default()
            }),
            submit_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut PaperState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_height(&self, height: u64) {
        self.with(|s| s.height = Some(height));
    }

    /// Height queries fail until a height is set again.
    pub fn set_height_unavailable(&self) {
        self.with(|s| s.height = None);
    }

    /// Adds an event emitted by `source`.
    pub fn push_event(
        &self,
        source: &EventSource,
        kind: EventKind,
        tx_id: &str,
        event_index: u32,
        block_height: u64,
        payload: Map<String, Value>,
    ) {
        let event = RawEvent {
            source_id: source.id(),
            kind,
            payload,
            tx_id: tx_id.to_string(),
            block_height,
            event_index,
        };
        self.with(|s| s.events.push(event));
    }

    pub fn fail_queries_for(&self, kind: EventKind) {
        self.with(|s| {
            s.failing_kinds.insert(kind);
        });
    }

    pub fn event_queries(&self) -> usize {
        self.with(|s| s.event_queries)
    }

    pub fn set_finality(&self, tx_id: &str, finality: Finality) {
        self.with(|s| {
            s.finality.insert(tx_id.to_string(), finality);
        });
    }

    /// Outcome for every submission without an explicit override.
    pub fn set_default_finality(&self, finality: Finality) {
        self.with(|s| s.default_finality = Some(finality));
    }

    pub fn fail_submissions(&self, message: &str) {
        self.with(|s| s.submit_error = Some(message.to_string()));
    }

    pub fn clear_submission_failure(&self) {
        self.with(|s| s.submit_error = None);
    }

    pub fn set_vault_stats(&self, stats: VaultStats) {
        self.with(|s| s.vault = Some(stats));
    }

    pub fn fail_vault_stats(&self) {
        self.with(|s| s.vault = None);
    }

    pub fn submissions(&self) -> Vec<ActionEnvelope> {
        self.with(|s| s.submissions.clone())
    }
}

#[async_trait]
impl Ledger for PaperLedger {
    async fn latest_height(&self) -> Result<u64> {
        self.with(|s| s.height).ok_or_else(|| anyhow!("paper ledger height unavailable"))
    }

    async fn events(&self, source: &EventSource, kind: EventKind, from: u64, to: u64) -> Result<Vec<RawEvent>> {
        let source_id = source.id();
        self.with(|s| {
            s.event_queries += 1;
            if s.failing_kinds.contains(&kind) {
                bail!("query failed for {}", source.qualified_type(kind));
            }
            let mut found: Vec<RawEvent> = s
                .events
                .iter()
                .filter(|e| e.source_id == source_id && e.kind == kind)
                .filter(|e| e.block_height >= from && e.block_height <= to)
                .cloned()
                .collect();
            found.sort_by_key(|e| (e.block_height, e.event_index));
            Ok(found)
        })
    }

    async fn submit(&self, envelope: &ActionEnvelope) -> Result<String> {
        let _signer = self.submit_lock.lock().await;
        let tx_id = self.with(|s| {
            if let Some(msg) = &s.submit_error {
                bail!("{}", msg);
            }
            s.next_tx += 1;
            s.submissions.push(envelope.clone());
            Ok(format!("paper_tx_{}", s.next_tx))
        })?;
        info(
            Domain::Ledger,
            "paper_submit",
            obj(&[
                ("tx_id", v_str(&tx_id)),
                ("action", v_str(envelope.name())),
                ("fingerprint", v_str(&envelope.fingerprint())),
            ]),
        );
        Ok(tx_id)
    }

    async fn await_finality(&self, tx_id: &str) -> Result<Finality> {
        Ok(self.with(|s| {
            s.finality
                .get(tx_id)
                .or(s.default_finality.as_ref())
                .cloned()
                .unwrap_or_else(|| Finality {
                    status: TxStatus::Sealed,
                    error_message: None,
                    raw: json!({ "id": tx_id, "status": "Sealed" }),
                })
        }))
    }

    async fn vault_stats(&self) -> Result<VaultStats> {
        self.with(|s| s.vault).ok_or_else(|| anyhow!("vault stats unavailable"))
    }
}
