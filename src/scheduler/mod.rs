//! Deferred execution of action envelopes.
//!
//! Each schedule owns one timer task. When the timer fires the schedule moves
//! to `executing`, every registered [`ExecuteListener`] receives the envelope
//! and the schedule settles as `completed` or `failed`. Only pending
//! schedules can be cancelled.
//!
//! Counters in [`Stats`] are cumulative: `cleanup` shrinks the table but does
//! not rewrite history, so `total == pending + completed + failed + cancelled`
//! holds at every observable point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::builder::ActionEnvelope;
use crate::logging::{debug, error, info, log_schedule_transition, obj, v_str, v_u64, Domain};

pub mod recurring;

pub use recurring::RecurringSchedule;

pub type ScheduleId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Executing => "executing",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Completed | ScheduleStatus::Failed | ScheduleStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResult {
    pub success: bool,
    pub executed_at: DateTime<Utc>,
}

/// Point-in-time copy of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: ScheduleId,
    pub envelope: ActionEnvelope,
    pub delay_seconds: u64,
    pub execute_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub result: Option<ScheduleResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: u64,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Entries currently in the table.
    pub schedules: usize,
}

/// Receives envelopes whose timer fired. An `Err` marks the schedule failed.
pub trait ExecuteListener: Send + Sync {
    fn on_execute(&self, schedule_id: &str, envelope: &ActionEnvelope) -> Result<()>;
}

impl<F> ExecuteListener for F
where
    F: Fn(&str, &ActionEnvelope) -> Result<()> + Send + Sync,
{
    fn on_execute(&self, schedule_id: &str, envelope: &ActionEnvelope) -> Result<()> {
        self(schedule_id, envelope)
    }
}

struct Entry {
    schedule: Schedule,
    seq: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct Table {
    entries: HashMap<ScheduleId, Entry>,
    next_id: u64,
    stats: Stats,
    pub(crate) recurring: HashMap<String, recurring::RecurringEntry>,
    pub(crate) next_recurring: u64,
}

pub(crate) struct Inner {
    table: Mutex<Table>,
    listeners: Mutex<Vec<Arc<dyn ExecuteListener>>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table { next_id: 1, next_recurring: 1, ..Table::default() }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, Table> {
        locked(&self.inner.table)
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecuteListener>) {
        locked(&self.inner.listeners).push(listener);
    }

    /// Arms a timer that executes `envelope` after `delay_seconds`.
    pub fn schedule_action(&self, envelope: ActionEnvelope, delay_seconds: u64) -> ScheduleId {
        let now = Utc::now();
        let execute_at = chrono::Duration::from_std(Duration::from_secs(delay_seconds))
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let name = envelope.name().to_string();

        let id = {
            let mut table = self.table();
            let seq = table.next_id;
            table.next_id += 1;
            let id = format!("schedule_{}", seq);

            let scheduler = self.clone();
            let timer_id = id.clone();
            let timer = tokio::spawn(async move {
                sleep(Duration::from_secs(delay_seconds)).await;
                scheduler.execute_scheduled_action(&timer_id);
            });

            table.entries.insert(
                id.clone(),
                Entry {
                    schedule: Schedule {
                        id: id.clone(),
                        envelope,
                        delay_seconds,
                        execute_at,
                        status: ScheduleStatus::Pending,
                        created_at: now,
                        cancelled_at: None,
                        result: None,
                        error: None,
                    },
                    seq,
                    timer: Some(timer),
                },
            );
            table.stats.total += 1;
            table.stats.pending += 1;
            id
        };

        info(
            Domain::Scheduler,
            "scheduled",
            obj(&[
                ("schedule_id", v_str(&id)),
                ("action", v_str(&name)),
                ("delay_seconds", v_u64(delay_seconds)),
                ("execute_at", v_str(&execute_at.to_rfc3339())),
            ]),
        );
        id
    }

    /// Dispatches a pending schedule to the listeners. Missing or non-pending
    /// schedules are left alone.
    pub fn execute_scheduled_action(&self, id: &str) {
        let envelope = {
            let mut table = self.table();
            let entry = match table.entries.get_mut(id) {
                Some(entry) => entry,
                None => {
                    debug(Domain::Scheduler, "execute_missing", obj(&[("schedule_id", v_str(id))]));
                    return;
                }
            };
            if entry.schedule.status != ScheduleStatus::Pending {
                debug(
                    Domain::Scheduler,
                    "execute_skipped",
                    obj(&[
                        ("schedule_id", v_str(id)),
                        ("status", v_str(entry.schedule.status.as_str())),
                    ]),
                );
                return;
            }
            entry.schedule.status = ScheduleStatus::Executing;
            entry.timer = None;
            entry.schedule.envelope.clone()
        };
        log_schedule_transition(id, envelope.name(), "pending", "executing");

        let listeners: Vec<Arc<dyn ExecuteListener>> = locked(&self.inner.listeners).clone();
        let mut failure = None;
        for listener in &listeners {
            if let Err(e) = listener.on_execute(id, &envelope) {
                failure = Some(e.to_string());
                break;
            }
        }

        let mut table = self.table();
        let Table { entries, stats, .. } = &mut *table;
        let entry = match entries.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };
        stats.pending = stats.pending.saturating_sub(1);
        match failure {
            None => {
                entry.schedule.status = ScheduleStatus::Completed;
                entry.schedule.result = Some(ScheduleResult { success: true, executed_at: Utc::now() });
                stats.completed += 1;
                drop(table);
                log_schedule_transition(id, envelope.name(), "executing", "completed");
            }
            Some(msg) => {
                entry.schedule.status = ScheduleStatus::Failed;
                entry.schedule.error = Some(msg.clone());
                stats.failed += 1;
                drop(table);
                log_schedule_transition(id, envelope.name(), "executing", "failed");
                error(
                    Domain::Scheduler,
                    "dispatch_failed",
                    obj(&[("schedule_id", v_str(id)), ("error", v_str(&msg))]),
                );
            }
        }
    }

    /// Returns false if the schedule is unknown or no longer pending.
    pub fn cancel_schedule(&self, id: &str) -> bool {
        let name = {
            let mut table = self.table();
            let Table { entries, stats, .. } = &mut *table;
            let entry = match entries.get_mut(id) {
                Some(entry) if entry.schedule.status == ScheduleStatus::Pending => entry,
                _ => return false,
            };
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.schedule.status = ScheduleStatus::Cancelled;
            entry.schedule.cancelled_at = Some(Utc::now());
            stats.pending = stats.pending.saturating_sub(1);
            stats.cancelled += 1;
            entry.schedule.envelope.name().to_string()
        };
        log_schedule_transition(id, &name, "pending", "cancelled");
        true
    }

    pub fn get_schedule(&self, id: &str) -> Option<Schedule> {
        self.table().entries.get(id).map(|e| e.schedule.clone())
    }

    /// Pending schedules, soonest first.
    pub fn get_pending_schedules(&self) -> Vec<Schedule> {
        let table = self.table();
        let mut pending: Vec<(&Entry, DateTime<Utc>)> = table
            .entries
            .values()
            .filter(|e| e.schedule.status == ScheduleStatus::Pending)
            .map(|e| (e, e.schedule.execute_at))
            .collect();
        pending.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.seq.cmp(&b.0.seq)));
        pending.into_iter().map(|(e, _)| e.schedule.clone()).collect()
    }

    /// Every schedule in the table, newest first.
    pub fn get_all_schedules(&self) -> Vec<Schedule> {
        let table = self.table();
        let mut all: Vec<&Entry> = table.entries.values().collect();
        all.sort_by(|a, b| {
            b.schedule
                .created_at
                .cmp(&a.schedule.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        all.into_iter().map(|e| e.schedule.clone()).collect()
    }

    pub fn get_stats(&self) -> Stats {
        let table = self.table();
        Stats { schedules: table.entries.len(), ..table.stats }
    }

    /// Removes terminal schedules created more than `max_age` ago.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_as_of(Utc::now(), max_age)
    }

    pub fn cleanup_as_of(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = {
            let mut table = self.table();
            let expired: HashSet<ScheduleId> = table
                .entries
                .iter()
                .filter(|(_, e)| e.schedule.status.is_terminal() && e.schedule.created_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            table.entries.retain(|id, _| !expired.contains(id));
            table.forget_schedules(&expired);
            expired.len()
        };
        if removed > 0 {
            info(Domain::Scheduler, "cleanup", obj(&[("removed", v_u64(removed as u64))]));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ActionType, Arg};
    use anyhow::anyhow;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope() -> ActionEnvelope {
        ActionEnvelope::new(
            "Deposit Funds",
            ActionType::Deposit,
            "transaction(amount: UFix64) {}".to_string(),
            vec![Arg::ufix64("1.00000000".to_string())],
            Map::new(),
        )
    }

    fn assert_invariant(s: &Stats) {
        assert_eq!(s.total, s.pending + s.completed + s.failed + s.cancelled);
    }

    fn counting(s: &Scheduler) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        s.add_listener(Arc::new(move |_: &str, _: &ActionEnvelope| -> Result<()> {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        hits
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_completes() {
        let s = Scheduler::new();
        let hits = counting(&s);
        let id = s.schedule_action(envelope(), 60);
        assert_eq!(id, "schedule_1");
        assert_eq!(s.get_stats().pending, 1);

        sleep(Duration::from_secs(61)).await;
        let sched = s.get_schedule(&id).unwrap();
        assert_eq!(sched.status, ScheduleStatus::Completed);
        assert!(sched.result.unwrap().success);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = s.get_stats();
        assert_eq!((stats.pending, stats.completed), (0, 1));
        assert_invariant(&stats);
        assert!(!s.cancel_schedule(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_dispatch() {
        let s = Scheduler::new();
        let hits = counting(&s);
        let id = s.schedule_action(envelope(), 30);
        assert!(s.cancel_schedule(&id));
        assert!(!s.cancel_schedule(&id));
        assert!(!s.cancel_schedule("schedule_999"));

        sleep(Duration::from_secs(31)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(s.get_schedule(&id).unwrap().status, ScheduleStatus::Cancelled);
        // A late manual execute is ignored too.
        s.execute_scheduled_action(&id);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_invariant(&s.get_stats());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_error_marks_failed() {
        let s = Scheduler::new();
        s.add_listener(Arc::new(|_: &str, _: &ActionEnvelope| -> Result<()> { Err(anyhow!("channel closed")) }));
        let id = s.schedule_action(envelope(), 0);
        s.execute_scheduled_action(&id);
        let sched = s.get_schedule(&id).unwrap();
        assert_eq!(sched.status, ScheduleStatus::Failed);
        assert_eq!(sched.error.as_deref(), Some("channel closed"));
        let stats = s.get_stats();
        assert_eq!(stats.failed, 1);
        assert_invariant(&stats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_order() {
        let s = Scheduler::new();
        let late = s.schedule_action(envelope(), 300);
        let soon = s.schedule_action(envelope(), 10);
        let pending: Vec<String> = s.get_pending_schedules().into_iter().map(|x| x.id).collect();
        assert_eq!(pending, vec![soon.clone(), late.clone()]);
        let all: Vec<String> = s.get_all_schedules().into_iter().map(|x| x.id).collect();
        assert_eq!(all, vec![soon, late]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_spares_pending() {
        let s = Scheduler::new();
        let done = s.schedule_action(envelope(), 0);
        s.execute_scheduled_action(&done);
        let waiting = s.schedule_action(envelope(), 100_000);

        let day = Duration::from_secs(24 * 3600);
        assert_eq!(s.cleanup(day), 0);
        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(s.cleanup_as_of(later, day), 1);
        assert!(s.get_schedule(&done).is_none());
        assert!(s.get_schedule(&waiting).is_some());

        let stats = s.get_stats();
        assert_eq!(stats.schedules, 1);
        assert_invariant(&stats);
    }
}
