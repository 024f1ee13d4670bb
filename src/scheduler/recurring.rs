use std::collections::HashSet;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use super::{ScheduleId, Scheduler, Table};
use crate::builder::ActionEnvelope;
use crate::logging::{info, obj, v_str, v_u64, Domain};

/// Snapshot of a recurring sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringSchedule {
    pub id: String,
    pub action: String,
    pub interval_seconds: u64,
    pub max_executions: Option<u32>,
    pub executions: u32,
    pub active: bool,
    pub schedule_ids: Vec<ScheduleId>,
}

pub(crate) struct RecurringEntry {
    info: RecurringSchedule,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Creates one schedule with delay `interval_seconds` now, then another
    /// every `interval_seconds` until `max_executions` have been created.
    /// Each repetition is an ordinary schedule and can be cancelled alone.
    pub fn schedule_recurring(
        &self,
        envelope: ActionEnvelope,
        interval_seconds: u64,
        max_executions: Option<u32>,
    ) -> String {
        let id = {
            let mut table = self.table();
            let seq = table.next_recurring;
            table.next_recurring += 1;
            let id = format!("recurring_{}", seq);
            table.recurring.insert(
                id.clone(),
                RecurringEntry {
                    info: RecurringSchedule {
                        id: id.clone(),
                        action: envelope.name().to_string(),
                        interval_seconds,
                        max_executions,
                        executions: 0,
                        active: true,
                        schedule_ids: Vec::new(),
                    },
                    task: None,
                },
            );
            id
        };
        info(
            Domain::Scheduler,
            "recurring_scheduled",
            obj(&[
                ("recurring_id", v_str(&id)),
                ("action", v_str(envelope.name())),
                ("interval_seconds", v_u64(interval_seconds)),
                ("max_executions", max_executions.map(|m| v_u64(m as u64)).unwrap_or(serde_json::Value::Null)),
            ]),
        );

        if !self.spawn_repetition(&id, &envelope, interval_seconds) {
            return id;
        }

        let scheduler = self.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(interval_seconds)).await;
                if !scheduler.spawn_repetition(&task_id, &envelope, interval_seconds) {
                    break;
                }
            }
        });

        let mut table = self.table();
        match table.recurring.get_mut(&id) {
            Some(entry) if entry.info.active => entry.task = Some(task),
            _ => task.abort(),
        }
        drop(table);
        id
    }

    /// Schedules the next repetition if the sequence is still active.
    /// Returns whether further repetitions should follow.
    fn spawn_repetition(&self, id: &str, envelope: &ActionEnvelope, interval_seconds: u64) -> bool {
        {
            let mut table = self.table();
            let entry = match table.recurring.get_mut(id) {
                Some(entry) if entry.info.active => entry,
                _ => return false,
            };
            if reached(&entry.info) {
                entry.info.active = false;
                drop(table);
                self.log_recurring_done(id);
                return false;
            }
        }

        let schedule_id = self.schedule_action(envelope.clone(), interval_seconds);

        let mut table = self.table();
        let entry = match table.recurring.get_mut(id) {
            Some(entry) => entry,
            None => return false,
        };
        entry.info.executions += 1;
        entry.info.schedule_ids.push(schedule_id);
        if reached(&entry.info) {
            entry.info.active = false;
            entry.task = None;
            drop(table);
            self.log_recurring_done(id);
            return false;
        }
        entry.info.active
    }

    fn log_recurring_done(&self, id: &str) {
        let executions = self.get_recurring(id).map(|r| r.executions).unwrap_or(0);
        info(
            Domain::Scheduler,
            "recurring_finished",
            obj(&[("recurring_id", v_str(id)), ("executions", v_u64(executions as u64))]),
        );
    }

    /// Stops future repetitions. Schedules already created are untouched.
    pub fn cancel_recurring(&self, id: &str) -> bool {
        let mut table = self.table();
        let entry = match table.recurring.get_mut(id) {
            Some(entry) if entry.info.active => entry,
            _ => return false,
        };
        entry.info.active = false;
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        drop(table);
        info(Domain::Scheduler, "recurring_cancelled", obj(&[("recurring_id", v_str(id))]));
        true
    }

    pub fn get_recurring(&self, id: &str) -> Option<RecurringSchedule> {
        self.table().recurring.get(id).map(|e| e.info.clone())
    }
}

impl Table {
    /// Drops removed schedule ids from every sequence, then forgets finished
    /// sequences with nothing left to show.
    pub(super) fn forget_schedules(&mut self, removed: &HashSet<ScheduleId>) {
        if removed.is_empty() {
            return;
        }
        for entry in self.recurring.values_mut() {
            entry.info.schedule_ids.retain(|id| !removed.contains(id));
        }
        self.recurring
            .retain(|_, entry| entry.info.active || !entry.info.schedule_ids.is_empty());
    }
}

fn reached(info: &RecurringSchedule) -> bool {
    info.max_executions.map(|max| info.executions >= max).unwrap_or(false)
}
