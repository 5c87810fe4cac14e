//! Fixed-duration round-robin scheduling.
//!
//! The resolved queue is walked with a circular cursor; each activation
//! dedicates one segment of `duration_min` to the task. Pausing records
//! the segment remainder (the next activation resumes it), terminating
//! drops the timer entirely, and restart downtime is excluded from the
//! accumulated segment time.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::Result;
use crate::registry::TaskStatus;
use crate::restart::DowntimePolicy;

use super::{idle_notice_due, AttemptDriver, TaskRunner};

/// Why a segment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentExit {
    /// The segment clock ran out.
    Elapsed,
    /// The task reached its purchase goal.
    TargetReached,
    /// An attempt demanded an immediate halt.
    Halted,
    /// Global pause; the same task resumes the segment afterwards.
    PausedGlobal,
    /// Per-task pause; the cursor moves on.
    PausedTask,
    Terminated,
    Stopping,
}

impl TaskRunner {
    pub(crate) async fn run_round_robin(&self, driver: &mut dyn AttemptDriver) -> Result<()> {
        let tasks = self.registry.tasks().to_vec();
        let mut states = self.fresh_states();
        let mut cursor = 0usize;
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

            if tasks.is_empty() {
                if idle_notice_due(&mut last_idle_notice) {
                    info!("Task list empty, waiting");
                }
                sleep(self.idle_poll()).await;
                continue;
            }

            let runnable = tasks
                .iter()
                .filter(|t| {
                    let state = &states[&t.def.id];
                    state.status != TaskStatus::Paused && !t.target_reached(state.purchased)
                })
                .count();
            if runnable == 0 {
                if idle_notice_due(&mut last_idle_notice) {
                    info!("No runnable task (paused or target reached), waiting");
                }
                sleep(self.idle_poll()).await;
                continue;
            }

            let task = &tasks[cursor % tasks.len()];
            let task_id = task.def.id.clone();
            {
                let state = &states[&task_id];
                if state.status == TaskStatus::Paused || task.target_reached(state.purchased) {
                    cursor += 1;
                    continue;
                }
            }

            // Activate: a paused remainder resumes, anything else gets a
            // full fresh segment.
            let segment_len = {
                let state = states.get_mut(&task_id).unwrap();
                state.status = TaskStatus::Running;
                state
                    .remaining_ms
                    .take()
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| Duration::from_secs(u64::from(task.def.duration_min) * 60))
            };
            self.emit_task(
                task,
                &states[&task_id],
                format!("segment started ({}s)", segment_len.as_secs()),
            );

            if !driver.establish_context(task).await? {
                info!(item = %task.display_name(), "Search context failed, skipping segment");
                states.get_mut(&task_id).unwrap().status = TaskStatus::Idle;
                cursor += 1;
                continue;
            }

            let segment_start = Instant::now();
            let segment_end = segment_start + segment_len;
            let mut downtime = Duration::ZERO;
            let mut context_ready = true;

            let exit = loop {
                // Checkpoints: cooperative cancellation only between
                // attempts, never mid-attempt.
                if self.is_stopping().await {
                    break SegmentExit::Stopping;
                }
                self.apply_commands(&mut states);
                {
                    let state = &states[&task_id];
                    if state.status == TaskStatus::Terminated {
                        break SegmentExit::Terminated;
                    }
                    if state.status == TaskStatus::Paused {
                        let remaining = segment_end.saturating_duration_since(Instant::now());
                        states
                            .get_mut(&task_id)
                            .unwrap()
                            .pause_with_remaining(remaining.as_millis() as u64);
                        break SegmentExit::PausedTask;
                    }
                }
                if self.is_paused_globally().await {
                    let remaining = segment_end.saturating_duration_since(Instant::now());
                    states
                        .get_mut(&task_id)
                        .unwrap()
                        .pause_with_remaining(remaining.as_millis() as u64);
                    break SegmentExit::PausedGlobal;
                }
                if Instant::now() >= segment_end {
                    break SegmentExit::Elapsed;
                }

                if let Some(d) = driver.restart_if_due().await? {
                    downtime += d;
                    context_ready = false;
                    continue;
                }
                if !context_ready {
                    // Re-check happens inside the attempt's recovery path
                    // if this fails; mirror that tolerance here.
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
                    break SegmentExit::Halted;
                }
                if task.target_reached(states[&task_id].purchased) {
                    break SegmentExit::TargetReached;
                }
                sleep(self.attempt_gap()).await;
            };

            // Timer accounting: wall time of the segment minus restart
            // downtime. A terminate has already zeroed the timer.
            if exit != SegmentExit::Terminated {
                let mut active = segment_start.elapsed();
                if driver.downtime_policy() == DowntimePolicy::ExcludeFromTimer {
                    active = active.saturating_sub(downtime);
                }
                let state = states.get_mut(&task_id).unwrap();
                state.executed_ms += active.as_millis() as u64;
            }
            debug!(
                item = %task.display_name(),
                exit = ?exit,
                downtime_ms = downtime.as_millis() as u64,
                "Segment closed"
            );

            match exit {
                SegmentExit::Elapsed | SegmentExit::TargetReached | SegmentExit::Halted => {
                    let state = states.get_mut(&task_id).unwrap();
                    state.status = TaskStatus::Idle;
                    state.remaining_ms = None;
                    let snapshot = state.clone();
                    self.emit_task(task, &snapshot, "segment ended");
                    cursor += 1;
                }
                SegmentExit::PausedTask => {
                    self.emit_task(task, &states[&task_id], "task paused");
                    cursor += 1;
                }
                SegmentExit::PausedGlobal => {
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
                    // The cursor stays put: the interrupted task resumes
                    // its remainder unless it was re-signaled meanwhile.
                    let state = states.get_mut(&task_id).unwrap();
                    if state.status == TaskStatus::Paused {
                        state.status = TaskStatus::Idle;
                    }
                }
                SegmentExit::Terminated => {
                    self.emit_task(task, &states[&task_id], "terminated");
                    cursor += 1;
                }
                SegmentExit::Stopping => break,
            }
        }
        Ok(())
    }
}
