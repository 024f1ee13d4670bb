use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::logging::{debug, obj, ts_now, v_str, warn, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsType {
    Rebalance,
    Deposit,
    Withdraw,
    ActionExecuted,
}

impl AnalyticsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsType::Rebalance => "rebalance",
            AnalyticsType::Deposit => "deposit",
            AnalyticsType::Withdraw => "withdraw",
            AnalyticsType::ActionExecuted => "action_executed",
        }
    }
}

/// Body posted to the analytics webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: String,
}

impl AnalyticsRecord {
    pub fn new(kind: AnalyticsType, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data: Value::Object(data),
            timestamp: ts_now(),
        }
    }
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn send(&self, record: &AnalyticsRecord) -> Result<()>;
}

pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Self {
        Self { client: Client::new(), url: url.to_string() }
    }
}

#[async_trait]
impl AnalyticsSink for WebhookSink {
    async fn send(&self, record: &AnalyticsRecord) -> Result<()> {
        let resp = self.client.post(&self.url).json(record).send().await?;
        if !resp.status().is_success() {
            bail!("analytics webhook returned {}", resp.status());
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct NullSink;

#[async_trait]
impl AnalyticsSink for NullSink {
    async fn send(&self, _record: &AnalyticsRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<AnalyticsRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AnalyticsRecord> {
        match self.records.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AnalyticsSink for RecordingSink {
    async fn send(&self, record: &AnalyticsRecord) -> Result<()> {
        match self.records.lock() {
            Ok(mut g) => g.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}

/// Sends on a background task; failures are logged and dropped.
pub fn forward(sink: Arc<dyn AnalyticsSink>, record: AnalyticsRecord) -> JoinHandle<()> {
    tokio::spawn(async move {
        match sink.send(&record).await {
            Ok(()) => debug(Domain::Analytics, "sent", obj(&[("type", v_str(&record.kind))])),
            Err(e) => warn(
                Domain::Analytics,
                "send_failed",
                obj(&[("type", v_str(&record.kind)), ("error", v_str(&e.to_string()))]),
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_shape() {
        let mut data = Map::new();
        data.insert("amount".to_string(), json!("5.00000000"));
        let rec = AnalyticsRecord::new(AnalyticsType::Deposit, data);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], json!("deposit"));
        assert_eq!(v["data"]["amount"], json!("5.00000000"));
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_forward_to_recorder() {
        let sink = Arc::new(RecordingSink::new());
        forward(sink.clone(), AnalyticsRecord::new(AnalyticsType::Withdraw, Map::new()))
            .await
            .unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].kind, "withdraw");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_swallowed() {
        let sink: Arc<dyn AnalyticsSink> = Arc::new(WebhookSink::new("http://127.0.0.1:1/hook"));
        let handle = forward(sink, AnalyticsRecord::new(AnalyticsType::Rebalance, Map::new()));
        assert!(handle.await.is_ok());
    }
}
