//! Tick-scheduler bridging into script-side deferred values.
//!
//! The host scheduler never touches Lua. It is handed a closure holding a
//! [`TaskToken`]; firing it posts the token into the script thread's inbox,
//! where the pending entry is looked up and settled.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mlua::{Function, Lua, Table, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bridge::{BridgeMode, ScriptState};
use super::engine::ContextId;

const PRELUDE: &str = include_str!("prelude.lua");
const DEFERRED_KEY: &str = "lodestone.deferred";

const ALLOCATE_CHUNK: &str = r#"
local Deferred = ...
local d = Deferred.new()
return d, function(v) d:resolve(v) end, function(e) d:reject(e) end
"#;

/// Identifier of a pending scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub(crate) fn generate() -> Self {
        Self(format!("task_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle given to the host scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskToken {
    pub context_id: ContextId,
    pub task_id: TaskId,
}

/// Resolve and reject handles of one scheduled task.
pub(crate) struct PendingTask {
    pub resolve: Value,
    pub reject: Value,
    pub script_name: String,
}

/// Pending tasks of one context, keyed by id.
#[derive(Default)]
pub(crate) struct PendingTaskRegistry {
    tasks: HashMap<TaskId, PendingTask>,
}

impl PendingTaskRegistry {
    pub fn insert(&mut self, id: TaskId, task: PendingTask) {
        self.tasks.insert(id, task);
    }

    pub fn take(&mut self, id: &TaskId) -> Option<PendingTask> {
        self.tasks.remove(id)
    }

    /// Drop every entry, returning how many were pending.
    pub fn clear(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        count
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Run the prelude and keep the `Deferred` class in the registry.
pub(crate) fn install_prelude(lua: &Lua, exhausted: Arc<AtomicBool>) -> mlua::Result<()> {
    let probe = lua.create_function(move |_, ()| Ok(exhausted.load(Ordering::SeqCst)))?;
    let module: Table = lua.load(PRELUDE).set_name("=prelude").call(probe)?;
    let class: Table = module.get("Deferred")?;
    lua.set_named_registry_value(DEFERRED_KEY, class)
}

/// Allocate a deferred and return it with its resolve/reject functions.
fn allocate(lua: &Lua) -> mlua::Result<(Table, Function, Function)> {
    let class: Table = lua.named_registry_value(DEFERRED_KEY)?;
    lua.load(ALLOCATE_CHUNK).set_name("=deferred").call(class)
}

/// `server.schedule(delayTicks)`.
pub(crate) fn schedule(lua: &Lua, state: &Rc<ScriptState>, delay_ticks: i64) -> mlua::Result<Table> {
    let (deferred, resolve, reject) = allocate(lua)?;

    if delay_ticks > 0 {
        if let BridgeMode::Isolated = state.mode {
            reject.call::<()>("scheduling is unavailable in ad-hoc evaluation")?;
            return Ok(deferred);
        }
    }

    let task_id = TaskId::generate();
    state.tasks.borrow_mut().insert(
        task_id.clone(),
        PendingTask {
            resolve: Value::Function(resolve),
            reject: Value::Function(reject),
            script_name: state.script_name.clone(),
        },
    );

    match &state.mode {
        BridgeMode::Active(runtime) if delay_ticks > 0 => {
            let token = TaskToken {
                context_id: state.id,
                task_id: task_id.clone(),
            };
            let runtime = runtime.clone();
            state.services.scheduler.schedule_task(
                delay_ticks.unsigned_abs(),
                Box::new(move || runtime.post_task(token)),
            );
            debug!(script = %state.script_name, task = %task_id, delay_ticks, "task scheduled");
        }
        _ => {
            settle(state, &task_id);
        }
    }

    Ok(deferred)
}

/// Settle a pending task. Returns `false` if the id was not pending.
///
/// The entry is removed before any guest code runs. Errors are logged and
/// turned into a best-effort rejection.
pub(crate) fn settle(state: &ScriptState, task_id: &TaskId) -> bool {
    let Some(task) = state.tasks.borrow_mut().take(task_id) else {
        warn!(script = %state.script_name, task = %task_id, "task not pending; already settled or cleared");
        return false;
    };

    match &task.resolve {
        Value::Function(resolve) => {
            if let Err(e) = resolve.call::<()>(()) {
                warn!(script = %task.script_name, task = %task_id, "error resolving scheduled task: {e}");
                state
                    .output
                    .push_stderr(&format!("Error resolving scheduled task {task_id}: {e}\n"));
                reject(&task, task_id, &e.to_string());
            }
        }
        _ => {
            warn!(script = %task.script_name, task = %task_id, "resolve function missing for scheduled task");
            reject(
                &task,
                task_id,
                &format!("Internal error: resolve function not found for scheduled task {task_id}"),
            );
        }
    }
    true
}

fn reject(task: &PendingTask, task_id: &TaskId, reason: &str) {
    let Value::Function(reject) = &task.reject else {
        warn!(script = %task.script_name, task = %task_id, "reject function missing for scheduled task");
        return;
    };
    if let Err(e) = reject.call::<()>(reason) {
        warn!(script = %task.script_name, task = %task_id, "error rejecting scheduled task: {e}");
    }
}
