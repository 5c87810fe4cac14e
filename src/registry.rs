//! Task registry: definitions, runtime state, and selection filtering.
//!
//! The registry resolves each configured task against the goods catalog
//! once per run. Tasks that cannot be resolved are excluded with a
//! recorded issue instead of aborting the run; the schedulers only ever
//! see the resolved, order-sorted queue.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{GoodsEntry, QuantityConfig, TaskDefinition};

/// Runtime status of a task, as published in status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Terminated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }
}

/// Per-task mutable state. Owned exclusively by the worker; observers see
/// snapshots through status events only.
#[derive(Debug, Clone)]
pub struct TaskRuntimeState {
    pub status: TaskStatus,
    /// Total units purchased. Monotonic; never rolled back.
    pub purchased: i64,
    /// Accumulated active segment time. Survives pause, zeroed on
    /// terminate.
    pub executed_ms: u64,
    /// Remainder of an interrupted segment, consumed by the next
    /// activation after a pause.
    pub remaining_ms: Option<u64>,
}

impl Default for TaskRuntimeState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Idle,
            purchased: 0,
            executed_ms: 0,
            remaining_ms: None,
        }
    }
}

impl TaskRuntimeState {
    /// Record a pause mid-segment: keep progress, remember the remainder.
    pub fn pause_with_remaining(&mut self, remaining_ms: u64) {
        self.status = TaskStatus::Paused;
        self.remaining_ms = Some(remaining_ms);
    }

    /// Terminate: drop the segment timer entirely, keep purchases.
    pub fn terminate(&mut self) {
        self.status = TaskStatus::Terminated;
        self.executed_ms = 0;
        self.remaining_ms = None;
    }
}

/// How the quantity field is driven in the detail view, resolved once per
/// goods entry from its category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityPolicy {
    /// The detail view exposes a maximum-quantity control (e.g. ammo).
    MaxControl { cap: u32 },
    /// Quantity is typed manually; small fixed batch.
    FixedManual { value: u32 },
}

impl QuantityPolicy {
    /// Resolve a goods category against the configured policy mapping.
    pub fn resolve(big_category: &str, config: &QuantityConfig) -> Self {
        let category = big_category.trim();
        if config
            .max_control_categories
            .iter()
            .any(|c| c.trim() == category && !category.is_empty())
        {
            Self::MaxControl {
                cap: config.max_control_cap,
            }
        } else {
            Self::FixedManual {
                value: config.fixed_manual_value,
            }
        }
    }

    /// The restock-branch quantity before clamping.
    pub fn amount(&self) -> u32 {
        match self {
            Self::MaxControl { cap } => *cap,
            Self::FixedManual { value } => *value,
        }
    }
}

/// A task that passed the selection filter, bound to its goods entry,
/// search keyword, and quantity policy.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub def: TaskDefinition,
    pub goods: GoodsEntry,
    /// Keyword from the fallback chain search_name -> name -> item_name.
    pub keyword: String,
    pub policy: QuantityPolicy,
}

impl ResolvedTask {
    /// Display label for logs and events.
    pub fn display_name(&self) -> &str {
        if !self.goods.name.is_empty() {
            &self.goods.name
        } else if !self.goods.search_name.is_empty() {
            &self.goods.search_name
        } else {
            &self.def.item_name
        }
    }

    /// Whether the purchase goal is met. `target_total <= 0` never
    /// completes.
    pub fn target_reached(&self, purchased: i64) -> bool {
        self.def.target_total > 0 && purchased >= self.def.target_total
    }
}

/// A recorded reason a configured task was excluded.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub task_id: String,
    pub item_name: String,
    pub reason: String,
}

/// Resolved task queue plus the issues found while building it.
pub struct TaskRegistry {
    tasks: Vec<ResolvedTask>,
    issues: Vec<ConfigIssue>,
}

impl TaskRegistry {
    /// Resolve the configured tasks against the goods catalog.
    ///
    /// The result is sorted ascending by `order`; ties keep declaration
    /// order (stable sort). Tasks missing their goods entry, a usable
    /// search keyword, or the detail-entry image are excluded with an
    /// issue and do not affect the others.
    pub fn build(
        definitions: &[TaskDefinition],
        goods: &[GoodsEntry],
        quantity: &QuantityConfig,
    ) -> Self {
        let mut tasks = Vec::new();
        let mut issues = Vec::new();

        for def in definitions {
            if !def.enabled {
                continue;
            }

            let mut def = def.clone();
            if def.id.is_empty() {
                def.id = uuid::Uuid::new_v4().to_string();
            }

            let entry = goods.iter().find(|g| !g.id.is_empty() && g.id == def.item_id);
            let entry = match entry {
                Some(entry) => entry.clone(),
                None => {
                    Self::record(&mut issues, &def, "no goods entry for item_id");
                    continue;
                }
            };

            let keyword = [&entry.search_name, &entry.name, &def.item_name]
                .into_iter()
                .map(|s| s.trim())
                .find(|s| !s.is_empty())
                .map(str::to_string);
            let keyword = match keyword {
                Some(keyword) => keyword,
                None => {
                    Self::record(&mut issues, &def, "no usable search keyword");
                    continue;
                }
            };

            if entry.image_path.is_empty() || !std::path::Path::new(&entry.image_path).exists() {
                Self::record(&mut issues, &def, "detail-entry image missing");
                continue;
            }

            let policy = QuantityPolicy::resolve(&entry.big_category, quantity);
            tasks.push(ResolvedTask {
                def,
                goods: entry,
                keyword,
                policy,
            });
        }

        tasks.sort_by_key(|t| t.def.order);

        Self { tasks, issues }
    }

    fn record(issues: &mut Vec<ConfigIssue>, def: &TaskDefinition, reason: &str) {
        warn!(
            task_id = %def.id,
            item_name = %def.item_name,
            reason,
            "Task excluded from scheduling"
        );
        issues.push(ConfigIssue {
            task_id: def.id.clone(),
            item_name: def.item_name.clone(),
            reason: reason.to_string(),
        });
    }

    /// The schedulable queue, ascending by order.
    pub fn tasks(&self) -> &[ResolvedTask] {
        &self.tasks
    }

    pub fn issues(&self) -> &[ConfigIssue] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
