//! Ledger event monitor.
//!
//! A single polling task advances a block cursor, fetches events for every
//! tracked `(source, kind)` pair, drops occurrences already seen and fans the
//! rest out to subscribers. Rounds never overlap: the poll loop and manual
//! `poll_once` calls share one round gate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::events::{EventKind, EventSource, MonitorEvent, RawEvent};
use crate::ledger::Ledger;
use crate::logging::{debug, info, log_poll_round, obj, v_str, v_u64, warn, Domain};

pub mod cache;

pub use cache::EventCache;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// Cursor to resume from; the current ledger height when absent.
    pub start_height: Option<u64>,
    pub sources: Vec<EventSource>,
}

/// A registered consumer of monitor events. Dropping it deregisters it on
/// the next emit.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<MonitorEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MonitorEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: u64,
    kinds: HashSet<EventKind>,
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

/// What a completed round covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    pub from: u64,
    pub to: u64,
    pub fetched: usize,
    pub emitted: usize,
    pub failed_queries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub is_running: bool,
    pub cursor: u64,
    pub total_events: u64,
    pub cache_size: usize,
}

struct Inner {
    ledger: Arc<dyn Ledger>,
    config: MonitorConfig,
    round_gate: tokio::sync::Mutex<()>,
    cursor: AtomicU64,
    cache: Mutex<EventCache>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    total_events: AtomicU64,
    running: AtomicBool,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct EventMonitor {
    inner: Arc<Inner>,
}

impl EventMonitor {
    pub fn new(ledger: Arc<dyn Ledger>, config: MonitorConfig) -> Self {
        let cursor = config.start_height.unwrap_or(0);
        Self {
            inner: Arc::new(Inner {
                ledger,
                config,
                round_gate: tokio::sync::Mutex::new(()),
                cursor: AtomicU64::new(cursor),
                cache: Mutex::new(EventCache::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                total_events: AtomicU64::new(0),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Resolves the initial cursor and spawns the polling task. No-op when
    /// already running.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            warn(Domain::Monitor, "already_running", obj(&[]));
            return Ok(());
        }
        let cursor = match self.inner.config.start_height {
            Some(h) => h,
            None => self
                .inner
                .ledger
                .latest_height()
                .await
                .context("no start height configured and ledger height unavailable")?,
        };
        // A round that might still be in flight from a previous run must not
        // overwrite the resolved cursor.
        let _gate = self.inner.round_gate.lock().await;
        self.inner.cursor.store(cursor, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = self.clone();
        let interval = Duration::from_millis(self.inner.config.poll_interval_ms);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = sleep(interval) => {}
                }
                if !monitor.is_running() {
                    break;
                }
                monitor.poll_once().await;
            }
            debug(Domain::Monitor, "poll_loop_exit", obj(&[]));
        });
        *locked(&self.inner.task) = Some((stop_tx, handle));

        info(
            Domain::Monitor,
            "started",
            obj(&[
                ("cursor", v_u64(cursor)),
                ("poll_interval_ms", v_u64(self.inner.config.poll_interval_ms)),
                ("sources", v_u64(self.inner.config.sources.len() as u64)),
            ]),
        );
        Ok(())
    }

    /// Prevents further rounds. A round already running completes.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((stop_tx, _handle)) = locked(&self.inner.task).take() {
            let _ = stop_tx.send(true);
        }
        info(Domain::Monitor, "stopped", obj(&[("cursor", v_u64(self.cursor()))]));
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        locked(&self.inner.subscribers).push(Subscriber {
            id,
            kinds: kinds.iter().copied().collect(),
            tx,
        });
        debug(
            Domain::Monitor,
            "subscribed",
            obj(&[("subscriber", v_u64(id)), ("kinds", v_u64(kinds.len() as u64))]),
        );
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = locked(&self.inner.subscribers);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// One polling round. Returns `None` when the ledger had nothing new or
    /// its height could not be read.
    pub async fn poll_once(&self) -> Option<RoundSummary> {
        let _gate = self.inner.round_gate.lock().await;

        let height = match self.inner.ledger.latest_height().await {
            Ok(h) => h,
            Err(e) => {
                debug(Domain::Monitor, "height_unavailable", obj(&[("error", v_str(&e.to_string()))]));
                return None;
            }
        };
        let cursor = self.cursor();
        if height <= cursor {
            return None;
        }
        let (from, to) = (cursor + 1, height);

        let mut fetched = 0;
        let mut emitted = 0;
        let mut failed_queries = 0;
        for source in &self.inner.config.sources {
            for &kind in source.kinds() {
                match self.inner.ledger.events(source, kind, from, to).await {
                    Ok(events) => {
                        fetched += events.len();
                        emitted += self.process_events(&events);
                    }
                    Err(e) => {
                        failed_queries += 1;
                        debug(
                            Domain::Monitor,
                            "query_failed",
                            obj(&[
                                ("event_type", v_str(&source.qualified_type(kind))),
                                ("error", v_str(&e.to_string())),
                            ]),
                        );
                    }
                }
            }
        }

        self.inner.cursor.fetch_max(height, Ordering::SeqCst);
        log_poll_round(from, to, fetched, emitted, failed_queries);
        Some(RoundSummary { from, to, fetched, emitted, failed_queries })
    }

    /// Deduplicates a batch and emits new occurrences. Returns how many were
    /// emitted.
    pub fn process_events(&self, events: &[RawEvent]) -> usize {
        let mut fresh = Vec::new();
        {
            let mut cache = locked(&self.inner.cache);
            for event in events {
                if cache.insert(event.dedup_key()) {
                    fresh.push(MonitorEvent::from_raw(event));
                }
            }
            let dropped = cache.trim();
            if dropped > 0 {
                debug(Domain::Monitor, "cache_trimmed", obj(&[("dropped", v_u64(dropped as u64))]));
            }
        }
        self.inner.total_events.fetch_add(fresh.len() as u64, Ordering::SeqCst);

        let mut subs = locked(&self.inner.subscribers);
        for event in &fresh {
            subs.retain(|s| !s.kinds.contains(&event.kind) || s.tx.send(event.clone()).is_ok());
        }
        fresh.len()
    }

    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn total_events(&self) -> u64 {
        self.inner.total_events.load(Ordering::SeqCst)
    }

    pub fn cache_size(&self) -> usize {
        locked(&self.inner.cache).len()
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            is_running: self.is_running(),
            cursor: self.cursor(),
            total_events: self.total_events(),
            cache_size: self.cache_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Contract, EventSource};
    use crate::ledger::PaperLedger;
    use serde_json::{json, Map};

    fn vault() -> EventSource {
        EventSource::new(Contract::AionVault, "0xf8d6e0586b0a20c7")
    }

    fn raw(tx: &str, idx: u32, kind: EventKind) -> RawEvent {
        let mut payload = Map::new();
        payload.insert("amount".to_string(), json!("1.00000000"));
        RawEvent {
            source_id: vault().id(),
            kind,
            payload,
            tx_id: tx.to_string(),
            block_height: 5,
            event_index: idx,
        }
    }

    fn monitor(ledger: Arc<PaperLedger>, start: Option<u64>) -> EventMonitor {
        EventMonitor::new(
            ledger,
            MonitorConfig { poll_interval_ms: 1000, start_height: start, sources: vec![vault()] },
        )
    }

    #[tokio::test]
    async fn test_duplicate_delivered_once() {
        let m = monitor(Arc::new(PaperLedger::new(0)), Some(0));
        let mut sub = m.subscribe(&[EventKind::Deposit]);
        let e = raw("tx1", 0, EventKind::Deposit);
        assert_eq!(m.process_events(&[e.clone(), e.clone()]), 1);
        assert_eq!(m.process_events(&[e]), 0);
        let got = sub.try_recv().unwrap();
        assert_eq!(got.tx_id(), Some("tx1"));
        assert!(sub.try_recv().is_none());
        assert_eq!(m.total_events(), 1);
    }

    #[tokio::test]
    async fn test_routing_by_kind_and_unsubscribe() {
        let m = monitor(Arc::new(PaperLedger::new(0)), Some(0));
        let mut deposits = m.subscribe(&[EventKind::Deposit]);
        let mut withdraws = m.subscribe(&[EventKind::Withdraw]);
        m.process_events(&[raw("tx1", 0, EventKind::Withdraw)]);
        assert!(deposits.try_recv().is_none());
        assert_eq!(withdraws.try_recv().unwrap().kind, EventKind::Withdraw);

        assert!(m.unsubscribe(withdraws.id));
        assert!(!m.unsubscribe(withdraws.id));
        m.process_events(&[raw("tx2", 0, EventKind::Withdraw)]);
        assert!(withdraws.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cache_bound_within_batch() {
        let m = monitor(Arc::new(PaperLedger::new(0)), Some(0));
        let batch: Vec<RawEvent> = (0..10_001).map(|i| raw(&format!("tx{}", i), 0, EventKind::Deposit)).collect();
        m.process_events(&batch);
        assert_eq!(m.cache_size(), cache::C_KEEP);
        // The newest key is still cached, the oldest is not.
        assert_eq!(m.process_events(&[raw("tx10000", 0, EventKind::Deposit)]), 0);
        assert_eq!(m.process_events(&[raw("tx0", 0, EventKind::Deposit)]), 1);
    }

    #[tokio::test]
    async fn test_start_without_height_fails() {
        let ledger = Arc::new(PaperLedger::new(0));
        ledger.set_height_unavailable();
        let m = monitor(ledger, None);
        assert!(m.start().await.is_err());
        assert!(!m.is_running());
    }

    #[tokio::test]
    async fn test_poll_advances_cursor() {
        let ledger = Arc::new(PaperLedger::new(10));
        ledger.push_event(&vault(), EventKind::Deposit, "tx1", 0, 4, Map::new());
        let m = monitor(ledger.clone(), Some(2));
        let mut sub = m.subscribe(&[EventKind::Deposit]);

        let round = m.poll_once().await.unwrap();
        assert_eq!((round.from, round.to, round.emitted), (3, 10, 1));
        assert_eq!(m.cursor(), 10);
        assert_eq!(sub.try_recv().unwrap().field("blockHeight"), Some(&json!(4)));

        assert!(m.poll_once().await.is_none());
        assert_eq!(m.cursor(), 10);
    }
}
