//! Time-of-day window scheduling.
//!
//! At each decision point the lowest-order schedulable task whose window
//! contains the current instant runs; no match idles on a short bounded
//! poll. Windows are wall-clock: pausing freezes attempts but the window
//! keeps elapsing, and restart downtime is not credited back. A
//! terminate only disables the task for its current window occurrence.

use std::collections::HashMap;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::Result;
use crate::registry::{ResolvedTask, TaskRuntimeState, TaskStatus};

use super::{idle_notice_due, AttemptDriver, TaskRunner};

/// Parse an "HH:MM" bound; empty input means no bound.
pub fn parse_hhmm(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    NaiveTime::parse_from_str(text, "%H:%M").ok()
}

/// Whether `t` falls inside the window, bounds inclusive. Both bounds
/// empty always matches; `end < start` denotes a window crossing
/// midnight (e.g. 22:00-02:00 covers 23:30 and 01:30 but not 12:00).
pub fn window_contains(t: NaiveTime, start: Option<NaiveTime>, end: Option<NaiveTime>) -> bool {
    if start.is_none() && end.is_none() {
        return true;
    }
    let start = start.unwrap_or(NaiveTime::MIN);
    let end = end.unwrap_or_else(|| NaiveTime::from_hms_opt(23, 59, 59).unwrap());
    if end >= start {
        start <= t && t <= end
    } else {
        t >= start || t <= end
    }
}

/// Absolute end of the window occurrence containing `now`. `None` when
/// the window has no end bound. A midnight-crossing window entered on
/// the evening side ends tomorrow.
pub(crate) fn window_end_bound(
    now: DateTime<Local>,
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
) -> Option<DateTime<Local>> {
    let end_time = end?;
    let crosses = matches!(start, Some(start) if end_time < start);
    let mut end_date = now.date_naive();
    if crosses && matches!(start, Some(start) if now.time() >= start) {
        end_date = end_date.succ_opt()?;
    }
    Local
        .from_local_datetime(&end_date.and_time(end_time))
        .earliest()
}

/// Why a window run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowExit {
    WindowEnded,
    TargetReached,
    Halted,
    /// A lower-order overlapping window became active.
    Preempted,
    PausedTask,
    Terminated,
    Stopping,
}

impl TaskRunner {
    pub(crate) async fn run_time_window(&self, driver: &mut dyn AttemptDriver) -> Result<()> {
        let tasks = self.registry.tasks().to_vec();
        let mut states = self.fresh_states();
        // Per-occurrence terminate bans: task id -> banned-until
        // (None = the occurrence has no end, banned until stop).
        let mut bans: HashMap<String, Option<DateTime<Local>>> = HashMap::new();
        let mut last_idle_notice = None;

        loop {
            if self.is_stopping().await {
                break;
            }
            self.apply_commands(&mut states);

            if self.is_paused_globally().await {
                sleep(self.pause_poll()).await;
                continue;
            }

            let now = Local::now();
            bans.retain(|_, until| match until {
                Some(until) => now < *until,
                None => true,
            });

            let Some(task) = tasks
                .iter()
                .find(|t| eligible(t, &states, &bans, now))
            else {
                if idle_notice_due(&mut last_idle_notice) {
                    info!("No task window matches the current time, waiting");
                }
                sleep(self.idle_poll()).await;
                continue;
            };
            let task_id = task.def.id.clone();
            let start_bound = parse_hhmm(&task.def.time_start);
            let end_bound = parse_hhmm(&task.def.time_end);
            let window_end = window_end_bound(now, start_bound, end_bound);

            states.get_mut(&task_id).unwrap().status = TaskStatus::Running;
            self.emit_task(
                task,
                &states[&task_id],
                format!(
                    "window entered (ends {})",
                    window_end
                        .map(|e| e.format("%H:%M").to_string())
                        .unwrap_or_else(|| "open".to_string())
                ),
            );

            if !driver.establish_context(task).await? {
                info!(item = %task.display_name(), "Search context failed, retrying shortly");
                states.get_mut(&task_id).unwrap().status = TaskStatus::Idle;
                sleep(self.idle_poll()).await;
                continue;
            }
            let mut context_ready = true;

            let exit = loop {
                if self.is_stopping().await {
                    break WindowExit::Stopping;
                }
                self.apply_commands(&mut states);
                {
                    let state = &states[&task_id];
                    if state.status == TaskStatus::Terminated {
                        bans.insert(task_id.clone(), window_end);
                        break WindowExit::Terminated;
                    }
                    if state.status == TaskStatus::Paused {
                        break WindowExit::PausedTask;
                    }
                }
                if self.is_paused_globally().await {
                    // Attempts freeze; the window clock keeps flowing, so
                    // the occurrence may expire while paused.
                    driver.on_pause().await;
                    self.emit_task(task, &states[&task_id], "paused");
                    loop {
                        if self.is_stopping().await {
                            break;
                        }
                        if !self.is_paused_globally().await {
                            break;
                        }
                        sleep(self.pause_poll()).await;
                    }
                    continue;
                }

                let now = Local::now();
                if let Some(end) = window_end {
                    if now >= end {
                        break WindowExit::WindowEnded;
                    }
                }
                if !window_contains(now.time(), start_bound, end_bound) {
                    break WindowExit::WindowEnded;
                }
                // A higher-priority task whose window just opened wins.
                let preempted = tasks
                    .iter()
                    .take_while(|t| t.def.id != task_id)
                    .any(|t| eligible(t, &states, &bans, now));
                if preempted {
                    break WindowExit::Preempted;
                }

                if driver.restart_if_due().await?.is_some() {
                    // Downtime elapses against the window like any other
                    // wall time; only the context is stale now.
                    context_ready = false;
                    continue;
                }
                if !context_ready {
                    let _ = driver.establish_context(task).await?;
                    context_ready = true;
                }

                let purchased = states[&task_id].purchased;
                let result = driver.attempt(task, purchased).await?;
                if result.quantity > 0 {
                    let state = states.get_mut(&task_id).unwrap();
                    state.purchased += i64::from(result.quantity);
                    let snapshot = state.clone();
                    self.emit_task(task, &snapshot, format!("purchased {}", result.quantity));
                }
                if !result.proceed {
                    break WindowExit::Halted;
                }
                if task.target_reached(states[&task_id].purchased) {
                    break WindowExit::TargetReached;
                }
                sleep(self.attempt_gap()).await;
            };

            debug!(item = %task.display_name(), exit = ?exit, "Window run closed");
            match exit {
                WindowExit::WindowEnded
                | WindowExit::TargetReached
                | WindowExit::Halted
                | WindowExit::Preempted => {
                    states.get_mut(&task_id).unwrap().status = TaskStatus::Idle;
                    self.emit_task(task, &states[&task_id], "window exited");
                }
                WindowExit::Terminated => {
                    self.emit_task(task, &states[&task_id], "terminated for this window");
                }
                WindowExit::PausedTask => {
                    self.emit_task(task, &states[&task_id], "task paused");
                }
                WindowExit::Stopping => break,
            }
        }
        Ok(())
    }
}

fn eligible(
    task: &ResolvedTask,
    states: &HashMap<String, TaskRuntimeState>,
    bans: &HashMap<String, Option<DateTime<Local>>>,
    now: DateTime<Local>,
) -> bool {
    let state = &states[&task.def.id];
    if state.status == TaskStatus::Paused {
        return false;
    }
    if task.target_reached(state.purchased) {
        return false;
    }
    match bans.get(&task.def.id) {
        Some(None) => return false,
        Some(Some(until)) if now < *until => return false,
        _ => {}
    }
    window_contains(
        now.time(),
        parse_hhmm(&task.def.time_start),
        parse_hhmm(&task.def.time_end),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, SchedulerMode};
    use crate::error::FatalError;
    use crate::scheduler::testing::{registry_of, task_def, MockDriver};
    use crate::scheduler::RunnerEvent;
    use std::sync::Arc;
    use std::time::Duration;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("09:30"), Some(t(9, 30)));
        assert_eq!(parse_hhmm(" 22:00 "), Some(t(22, 0)));
        assert_eq!(parse_hhmm(""), None);
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("soon"), None);
    }

    #[test]
    fn test_window_contains_plain() {
        let (start, end) = (Some(t(9, 0)), Some(t(17, 0)));
        assert!(window_contains(t(9, 0), start, end));
        assert!(window_contains(t(12, 0), start, end));
        assert!(window_contains(t(17, 0), start, end));
        assert!(!window_contains(t(8, 59), start, end));
        assert!(!window_contains(t(17, 1), start, end));
    }

    #[test]
    fn test_window_contains_crossing_midnight() {
        let (start, end) = (Some(t(22, 0)), Some(t(2, 0)));
        assert!(window_contains(t(23, 30), start, end));
        assert!(window_contains(t(1, 30), start, end));
        assert!(!window_contains(t(12, 0), start, end));
        // Bounds inclusive on both sides
        assert!(window_contains(t(22, 0), start, end));
        assert!(window_contains(t(2, 0), start, end));
    }

    #[test]
    fn test_window_contains_open_bounds() {
        assert!(window_contains(t(3, 0), None, None));
        assert!(window_contains(t(3, 0), None, Some(t(4, 0))));
        assert!(!window_contains(t(5, 0), None, Some(t(4, 0))));
        assert!(window_contains(t(23, 59), Some(t(6, 0)), None));
        assert!(!window_contains(t(5, 0), Some(t(6, 0)), None));
    }

    #[test]
    fn test_window_end_bound_crossing_midnight() {
        let (start, end) = (Some(t(22, 0)), Some(t(2, 0)));

        // Entered on the evening side: ends tomorrow at 02:00
        let now = Local.with_ymd_and_hms(2026, 8, 6, 23, 30, 0).unwrap();
        let bound = window_end_bound(now, start, end).unwrap();
        assert_eq!(bound.time(), t(2, 0));
        assert_eq!(bound.date_naive(), now.date_naive().succ_opt().unwrap());

        // Entered after midnight: ends today at 02:00
        let now = Local.with_ymd_and_hms(2026, 8, 7, 1, 30, 0).unwrap();
        let bound = window_end_bound(now, start, end).unwrap();
        assert_eq!(bound.time(), t(2, 0));
        assert_eq!(bound.date_naive(), now.date_naive());
    }

    #[test]
    fn test_window_end_bound_open_end() {
        let now = Local.with_ymd_and_hms(2026, 8, 6, 23, 30, 0).unwrap();
        assert!(window_end_bound(now, Some(t(22, 0)), None).is_none());
    }

    // ------------------------------------------------------------------
    // Scheduler behavior with always-open windows (wall-clock windows
    // cannot be steered under test time; the bound math is covered above)
    // ------------------------------------------------------------------

    fn runner_with(
        defs: Vec<crate::config::TaskDefinition>,
        driver: MockDriver,
    ) -> Arc<TaskRunner> {
        Arc::new(TaskRunner::with_driver(
            Arc::new(AppConfig::default()),
            registry_of(defs),
            SchedulerMode::Time,
            Box::new(driver),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowest_order_task_wins_selection() {
        let driver = MockDriver::new(Duration::from_secs(10), 0);
        let attempts = driver.attempts.clone();
        let runner = runner_with(
            vec![task_def("b", 1, 10), task_def("a", 0, 10)],
            driver,
        );

        let handle = runner.start();
        tokio::time::sleep(Duration::from_secs(45)).await;
        runner.stop().await;
        handle.await.unwrap().unwrap();

        let attempts = attempts.lock().unwrap().clone();
        assert!(!attempts.is_empty());
        assert!(attempts.iter().all(|(id, _)| id == "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_disables_only_current_occurrence() {
        let driver = MockDriver::new(Duration::from_secs(10), 0);
        let attempts = driver.attempts.clone();
        let runner = runner_with(
            vec![task_def("a", 0, 10), task_def("b", 1, 10)],
            driver,
        );

        let handle = runner.start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        runner.terminate_task("a");
        tokio::time::sleep(Duration::from_secs(45)).await;
        runner.stop().await;
        handle.await.unwrap().unwrap();

        let attempts = attempts.lock().unwrap().clone();
        let first_b = attempts
            .iter()
            .position(|(id, _)| id == "b")
            .expect("the next task takes the slot over");
        // Once banned for its (open-ended) occurrence, a never comes back
        assert!(attempts[first_b..].iter().all(|(id, _)| id == "b"));
        assert!(attempts[..first_b].iter().all(|(id, _)| id == "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_fatal_aborts_the_run() {
        let mut driver = MockDriver::new(Duration::from_secs(1), 0);
        driver.fatal_at = Some(2);
        let runner = runner_with(vec![task_def("a", 0, 10)], driver);
        let mut rx = runner.subscribe();

        let handle = runner.start();
        let result = handle.await.unwrap();
        match result {
            Err(FatalError::ServiceFatal(_)) => {}
            other => panic!("expected ServiceFatal, got {other:?}"),
        }

        let mut saw_fatal = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RunnerEvent::Fatal { .. }) {
                saw_fatal = true;
            }
        }
        assert!(saw_fatal);
    }
}
