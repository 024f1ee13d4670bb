use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration, Instant};

use super::retry::{retry_async, HttpStatusError, RetryConfig};
use super::signing::{sign_relay_request, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::{Finality, Ledger, TxStatus, VaultStats};
use crate::builder::ActionEnvelope;
use crate::cadence::{decode_base64, decode_event_payload, encode_base64};
use crate::config::Config;
use crate::events::{EventKind, EventSource, RawEvent};
use crate::logging::{debug, info, obj, ts_epoch_ms, v_str, v_u64, warn, Domain};

/// Access nodes reject event queries spanning more blocks than this.
pub const MAX_EVENT_RANGE: u64 = 250;

/// Client for a Flow access node's REST API. Transactions are signed by an
/// authorization relay.
pub struct RestLedger {
    client: Client,
    base: String,
    vault_address: String,
    proposer: String,
    relay_url: Option<String>,
    relay_secret: Option<String>,
    gas_limit: u64,
    finality_timeout: Duration,
    finality_poll: Duration,
    retry: RetryConfig,
    submit_lock: tokio::sync::Mutex<()>,
}

#[derive(Deserialize, Debug)]
struct BlockHeader {
    height: String,
}

#[derive(Deserialize, Debug)]
struct Block {
    header: BlockHeader,
}

#[derive(Deserialize, Debug)]
struct BlockEvents {
    block_height: String,
    #[serde(default)]
    events: Vec<FlowEvent>,
}

#[derive(Deserialize, Debug)]
struct FlowEvent {
    #[serde(rename = "type")]
    event_type: String,
    transaction_id: String,
    event_index: String,
    payload: String,
}

#[derive(Deserialize, Debug)]
struct TransactionResult {
    status: String,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    execution: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    #[serde(alias = "id", alias = "transaction_id")]
    transaction_id: String,
}

/// Splits `[from, to]` into windows the access node accepts.
pub fn event_windows(from: u64, to: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut start = from;
    while start <= to {
        let end = to.min(start.saturating_add(MAX_EVENT_RANGE - 1));
        out.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    out
}

fn parse_u64(field: &str, s: &str) -> Result<u64> {
    s.trim().parse().with_context(|| format!("{} is not an integer: {}", field, s))
}

fn parse_event_index(s: &str) -> Result<u32> {
    let index = parse_u64("event_index", s)?;
    u32::try_from(index).map_err(|_| anyhow!("event_index out of range: {}", index))
}

impl RestLedger {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base: cfg.access_node.trim_end_matches('/').to_string(),
            vault_address: cfg.vault_address.clone(),
            proposer: cfg.executor_address.clone(),
            relay_url: cfg.authz_relay_url.clone(),
            relay_secret: cfg.authz_relay_secret.clone(),
            gas_limit: cfg.max_gas_limit,
            finality_timeout: Duration::from_secs(cfg.finality_timeout_secs),
            finality_poll: Duration::from_millis(cfg.finality_poll_ms.max(1)),
            retry: RetryConfig::default(),
            submit_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpStatusError { status: status.as_u16(), body }.into());
        }
        Ok(resp.json().await?)
    }

    async fn transaction_result(&self, tx_id: &str) -> Result<(TransactionResult, Value)> {
        let url = format!("{}/v1/transaction_results/{}", self.base, tx_id);
        let (this, url) = (self, url.as_str());
        let raw: Value = retry_async(&self.retry, "transaction_result", move || this.get_json(url)).await?;
        let parsed: TransactionResult = serde_json::from_value(raw.clone())?;
        Ok((parsed, raw))
    }

    fn vault_stats_script(&self) -> String {
        format!(
            "import AIONVault from {}\n\naccess(all) fun main(): {{String: UFix64}} {{\n    return AIONVault.getVaultStats()\n}}\n",
            self.vault_address
        )
    }
}

#[async_trait::async_trait]
impl Ledger for RestLedger {
    async fn latest_height(&self) -> Result<u64> {
        let url = format!("{}/v1/blocks?height=sealed", self.base);
        let (this, url) = (self, url.as_str());
        let blocks: Vec<Block> = retry_async(&self.retry, "latest_height", move || this.get_json(url)).await?;
        let block = blocks.first().ok_or_else(|| anyhow!("access node returned no sealed block"))?;
        parse_u64("block height", &block.header.height)
    }

    async fn events(&self, source: &EventSource, kind: EventKind, from: u64, to: u64) -> Result<Vec<RawEvent>> {
        let event_type = source.qualified_type(kind);
        let mut out = Vec::new();
        for (start, end) in event_windows(from, to) {
            let url = format!(
                "{}/v1/events?type={}&start_height={}&end_height={}",
                self.base, event_type, start, end
            );
            let blocks: Vec<BlockEvents> = self.get_json(&url).await?;
            for block in blocks {
                let block_height = parse_u64("block_height", &block.block_height)?;
                for ev in block.events {
                    if ev.event_type != event_type {
                        continue;
                    }
                    let payload = decode_event_payload(&ev.payload)
                        .with_context(|| format!("event {} in tx {}", event_type, ev.transaction_id))?;
                    out.push(RawEvent {
                        source_id: source.id(),
                        kind,
                        payload,
                        tx_id: ev.transaction_id,
                        block_height,
                        event_index: parse_event_index(&ev.event_index)?,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn submit(&self, envelope: &ActionEnvelope) -> Result<String> {
        let relay = self
            .relay_url
            .as_deref()
            .ok_or_else(|| anyhow!("AUTHZ_RELAY_URL is not configured; cannot submit {}", envelope.name()))?;
        let arguments: Vec<String> = envelope.cadence_args()?.iter().map(encode_base64).collect();
        let body = json!({
            "script": STANDARD.encode(envelope.code()),
            "arguments": arguments,
            "gas_limit": self.gas_limit.to_string(),
            "proposer": self.proposer,
            "name": envelope.name(),
            "fingerprint": envelope.fingerprint(),
        })
        .to_string();

        // One in-flight transaction per signer keeps sequence numbers ordered.
        let _signer = self.submit_lock.lock().await;
        let mut req = self
            .client
            .post(relay)
            .header("Content-Type", "application/json")
            .body(body.clone());
        if let Some(secret) = &self.relay_secret {
            let ts = ts_epoch_ms();
            req = req
                .header(TIMESTAMP_HEADER, ts.to_string())
                .header(SIGNATURE_HEADER, sign_relay_request(ts, &body, secret)?);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("relay rejected {} ({}): {}", envelope.name(), status, text);
        }
        let parsed: RelayResponse = resp.json().await.context("relay response missing transaction id")?;
        info(
            Domain::Ledger,
            "tx_submitted",
            obj(&[
                ("tx_id", v_str(&parsed.transaction_id)),
                ("action", v_str(envelope.name())),
            ]),
        );
        Ok(parsed.transaction_id)
    }

    async fn await_finality(&self, tx_id: &str) -> Result<Finality> {
        let deadline = Instant::now() + self.finality_timeout;
        loop {
            let (result, raw) = self.transaction_result(tx_id).await?;
            let status = TxStatus::parse(&result.status);
            debug(
                Domain::Ledger,
                "tx_status",
                obj(&[("tx_id", v_str(tx_id)), ("status", v_str(status.as_str()))]),
            );
            if status.is_terminal() {
                let failed_execution = result.execution.as_deref() == Some("Failure");
                let error_message = if !result.error_message.is_empty() {
                    Some(result.error_message)
                } else if failed_execution {
                    Some("execution failed".to_string())
                } else {
                    None
                };
                return Ok(Finality { status, error_message, raw });
            }
            if Instant::now() >= deadline {
                warn(
                    Domain::Ledger,
                    "finality_timeout",
                    obj(&[
                        ("tx_id", v_str(tx_id)),
                        ("last_status", v_str(status.as_str())),
                        ("timeout_secs", v_u64(self.finality_timeout.as_secs())),
                    ]),
                );
                bail!("transaction {} not sealed after {:?}", tx_id, self.finality_timeout);
            }
            sleep(self.finality_poll).await;
        }
    }

    async fn vault_stats(&self) -> Result<VaultStats> {
        let url = format!("{}/v1/scripts?block_height=sealed", self.base);
        let body = json!({ "script": STANDARD.encode(self.vault_stats_script()), "arguments": [] });
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("vault stats script failed ({}): {}", status, text);
        }
        // The response is a JSON string holding base64 JSON-Cadence.
        let encoded: String = resp.json().await?;
        VaultStats::from_fields(&decode_base64(&encoded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_windows() {
        assert_eq!(event_windows(1, 250), vec![(1, 250)]);
        assert_eq!(event_windows(1, 251), vec![(1, 250), (251, 251)]);
        assert_eq!(event_windows(101, 600), vec![(101, 350), (351, 600)]);
        assert_eq!(event_windows(7, 7), vec![(7, 7)]);
        assert!(event_windows(8, 7).is_empty());
    }

    #[test]
    fn test_parse_events_response() {
        let payload = encode_base64(&json!({
            "type": "Event",
            "value": {
                "id": "A.f8d6e0586b0a20c7.AIONVault.Deposit",
                "fields": [{ "name": "amount", "value": { "type": "UFix64", "value": "5.00000000" } }]
            }
        }));
        let body = json!([{
            "block_id": "abc",
            "block_height": "42",
            "block_timestamp": "2024-01-01T00:00:00Z",
            "events": [{
                "type": "A.f8d6e0586b0a20c7.AIONVault.Deposit",
                "transaction_id": "tx1",
                "transaction_index": "0",
                "event_index": "3",
                "payload": payload
            }]
        }]);
        let blocks: Vec<BlockEvents> = serde_json::from_value(body).unwrap();
        assert_eq!(blocks[0].block_height, "42");
        assert_eq!(blocks[0].events[0].event_index, "3");
        let fields = decode_event_payload(&blocks[0].events[0].payload).unwrap();
        assert_eq!(fields["amount"], json!("5.00000000"));
    }

    #[test]
    fn test_relay_response_aliases() {
        let a: RelayResponse = serde_json::from_value(json!({"transactionId": "t1"})).unwrap();
        let b: RelayResponse = serde_json::from_value(json!({"id": "t2"})).unwrap();
        assert_eq!(a.transaction_id, "t1");
        assert_eq!(b.transaction_id, "t2");
    }

    #[test]
    fn test_event_index_range() {
        assert_eq!(parse_event_index("7").unwrap(), 7);
        assert_eq!(parse_event_index("4294967295").unwrap(), u32::MAX);
        assert!(parse_event_index("4294967296").is_err());
        assert!(parse_event_index("-1").is_err());
    }
}
