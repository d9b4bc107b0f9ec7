//! Sandboxed Lua execution context.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Function, HookTriggers, IntoLuaMulti, Lua, MultiValue, Table, Value, Variadic, VmState};
use tracing::{debug, info, warn};

use super::bridge::{self, HostBridge, ScriptState};
use super::deferred::{self, TaskId};
use crate::config::{BudgetScope, ScriptingConfig};
use crate::vfs::{FsOverlay, Resolved};
use crate::{Result, SandboxError};

/// Globals removed from every context.
const DISABLED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "loadfile",
    "dofile",
    "load",
    "require",
    "package",
    "debug",
    "collectgarbage",
    "coroutine",
];

const LOADED_KEY: &str = "lodestone.loaded";
const LOADING_KEY: &str = "lodestone.loading";
const TOSTRING_KEY: &str = "lodestone.tostring";

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";
const INSTRUCTION_LIMIT_MESSAGE: &str = "script exceeded instruction limit";

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a script context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Resource limits and naming for a context.
#[derive(Debug, Clone)]
pub struct ScriptLimits {
    /// Maximum number of VM instructions (0 = unlimited).
    pub max_instructions: u64,
    /// Hook granularity in VM instructions.
    pub check_interval: u32,
    pub budget_scope: BudgetScope,
    /// Maximum Lua heap in bytes (0 = unlimited).
    pub max_memory: usize,
    /// Cap for each output buffer in bytes.
    pub max_output_bytes: usize,
    /// Global the bridge table is bound to.
    pub global_name: String,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self::from(&ScriptingConfig::default())
    }
}

impl From<&ScriptingConfig> for ScriptLimits {
    fn from(config: &ScriptingConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            check_interval: config.instruction_check_interval,
            budget_scope: config.budget_scope,
            max_memory: config.max_memory_mb.saturating_mul(1024 * 1024),
            max_output_bytes: config.max_output_bytes,
            global_name: config.global_name.clone(),
        }
    }
}

/// What went wrong inside guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Syntax,
    Runtime,
    /// Aborted by the instruction ceiling.
    Cancelled,
}

/// A guest failure caught at an execution boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", .kind.label())]
pub struct ExecutionFault {
    pub kind: FaultKind,
    pub message: String,
}

impl FaultKind {
    fn label(&self) -> &'static str {
        match self {
            FaultKind::Syntax => "syntax error",
            FaultKind::Runtime => "runtime error",
            FaultKind::Cancelled => "cancelled",
        }
    }
}

impl ExecutionFault {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Runtime,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FaultKind::Cancelled,
            message: INSTRUCTION_LIMIT_MESSAGE.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FaultKind::Cancelled
    }

    pub(crate) fn from_lua(err: &mlua::Error, budget_exhausted: bool) -> Self {
        if budget_exhausted {
            return Self::cancelled();
        }
        match root_cause(err) {
            mlua::Error::SyntaxError { message, .. } => Self {
                kind: FaultKind::Syntax,
                message: message.clone(),
            },
            mlua::Error::RuntimeError(message) => Self::runtime(message.clone()),
            mlua::Error::MemoryError(message) => Self::runtime(format!("out of memory: {message}")),
            other => Self::runtime(other.to_string()),
        }
    }
}

fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::WithContext { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// A string buffer that stops growing at its cap.
#[derive(Debug)]
struct CappedBuffer {
    text: String,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, s: &str) {
        if self.truncated {
            return;
        }
        let room = self.cap.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
        self.text.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }

    fn drain(&mut self) -> String {
        self.truncated = false;
        std::mem::take(&mut self.text)
    }
}

/// Captured stdout and stderr of a context.
#[derive(Debug)]
pub(crate) struct OutputBuffers {
    stdout: RefCell<CappedBuffer>,
    stderr: RefCell<CappedBuffer>,
}

impl OutputBuffers {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            stdout: RefCell::new(CappedBuffer::new(cap)),
            stderr: RefCell::new(CappedBuffer::new(cap)),
        }
    }

    pub(crate) fn push_stdout(&self, s: &str) {
        self.stdout.borrow_mut().push(s);
    }

    pub(crate) fn push_stderr(&self, s: &str) {
        self.stderr.borrow_mut().push(s);
    }

    pub(crate) fn drain_stdout(&self) -> String {
        self.stdout.borrow_mut().drain()
    }

    pub(crate) fn drain_stderr(&self) -> String {
        self.stderr.borrow_mut().drain()
    }
}

/// Instruction accounting shared with the VM hook.
#[derive(Debug, Clone)]
struct InstructionBudget {
    used: Arc<AtomicU64>,
    exhausted: Arc<AtomicBool>,
    limit: u64,
    step: u32,
    scope: BudgetScope,
}

impl InstructionBudget {
    fn new(limits: &ScriptLimits) -> Self {
        let interval = u64::from(limits.check_interval.max(1));
        let step = interval.min(limits.max_instructions.max(1));
        Self {
            used: Arc::new(AtomicU64::new(0)),
            exhausted: Arc::new(AtomicBool::new(false)),
            limit: limits.max_instructions,
            step: u32::try_from(step).unwrap_or(u32::MAX),
            scope: limits.budget_scope,
        }
    }

    fn install(&self, lua: &Lua) {
        if self.limit == 0 {
            return;
        }
        let used = Arc::clone(&self.used);
        let exhausted = Arc::clone(&self.exhausted);
        let limit = self.limit;
        let step = u64::from(self.step);

        lua.set_hook(
            HookTriggers::new().every_nth_instruction(self.step),
            move |_lua, _debug| {
                let current = used.fetch_add(step, Ordering::SeqCst) + step;
                if current > limit {
                    exhausted.store(true, Ordering::SeqCst);
                    Err(mlua::Error::RuntimeError(INSTRUCTION_LIMIT_MESSAGE.to_string()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    /// Called on every entry into the context.
    fn begin(&self) {
        if self.scope == BudgetScope::PerInvocation {
            self.used.store(0, Ordering::SeqCst);
            self.exhausted.store(false, Ordering::SeqCst);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

/// One sandboxed Lua instance with its bridge, output buffers and registries.
///
/// A context is single-threaded. The active one lives on the script thread;
/// ad-hoc contexts live on the thread that evaluates them.
pub struct ScriptContext {
    id: ContextId,
    lua: Option<Lua>,
    state: Rc<ScriptState>,
    overlay: Rc<FsOverlay>,
    budget: InstructionBudget,
}

impl ScriptContext {
    /// Build a sandboxed context around `bridge` and `overlay`.
    pub fn new(bridge: HostBridge, overlay: FsOverlay, limits: &ScriptLimits) -> Result<Self> {
        let id = ContextId::next();
        let lua = Lua::new();
        Self::apply_sandbox(&lua)?;

        let state = Rc::new(bridge.into_state(id, limits.max_output_bytes));
        let overlay = Rc::new(overlay);
        let budget = InstructionBudget::new(limits);

        Self::install_output(&lua, &state)
            .map_err(|e| SandboxError::Script(format!("failed to install output functions: {e}")))?;
        install_require(&lua, Rc::clone(&overlay))
            .map_err(|e| SandboxError::Script(format!("failed to install require: {e}")))?;
        deferred::install_prelude(&lua, Arc::clone(&budget.exhausted))
            .map_err(|e| SandboxError::Script(format!("failed to load prelude: {e}")))?;
        bridge::install(&lua, &state, &limits.global_name)
            .map_err(|e| SandboxError::Script(format!("failed to install bridge: {e}")))?;

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory)
                .map_err(|e| SandboxError::Script(format!("failed to set memory limit: {e}")))?;
        }
        budget.install(&lua);

        debug!(context = %id, script = %state.script_name, "script context created");
        Ok(Self {
            id,
            lua: Some(lua),
            state,
            overlay,
            budget,
        })
    }

    /// Remove host access from the global environment.
    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();

        for name in DISABLED_GLOBALS {
            globals
                .set(*name, Value::Nil)
                .map_err(|e| SandboxError::Script(format!("failed to disable {name}: {e}")))?;
        }

        let string: Table = globals.get("string")?;
        string
            .set("dump", Value::Nil)
            .map_err(|e| SandboxError::Script(format!("failed to disable string.dump: {e}")))?;

        let tostring: Function = globals.get("tostring")?;
        lua.set_named_registry_value(TOSTRING_KEY, tostring)?;

        Ok(())
    }

    /// Route `print` and `warn` into the context's buffers.
    fn install_output(lua: &Lua, state: &Rc<ScriptState>) -> mlua::Result<()> {
        let globals = lua.globals();

        let stdout_state = Rc::clone(state);
        let print = lua.create_function(move |lua, args: MultiValue| {
            let mut parts = Vec::with_capacity(args.len());
            for value in args {
                parts.push(tostring(lua, value)?);
            }
            stdout_state.output.push_stdout(&parts.join("\t"));
            stdout_state.output.push_stdout("\n");
            Ok(())
        })?;
        globals.set("print", print)?;

        let stderr_state = Rc::clone(state);
        let warn_fn = lua.create_function(move |_, parts: Variadic<String>| {
            // "@on" / "@off" style control messages
            if parts.len() == 1 && parts[0].starts_with('@') {
                return Ok(());
            }
            stderr_state.output.push_stderr(&parts.concat());
            stderr_state.output.push_stderr("\n");
            Ok(())
        })?;
        globals.set("warn", warn_fn)?;

        Ok(())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn script_name(&self) -> &str {
        &self.state.script_name
    }

    pub fn is_closed(&self) -> bool {
        self.lua.is_none()
    }

    /// Instructions counted by the hook (granularity is the check interval).
    pub fn instructions_used(&self) -> u64 {
        self.budget.used()
    }

    pub fn overlay(&self) -> &FsOverlay {
        &self.overlay
    }

    pub(crate) fn state(&self) -> &Rc<ScriptState> {
        &self.state
    }

    pub(crate) fn lua(&self) -> Result<&Lua> {
        self.lua.as_ref().ok_or_else(|| {
            SandboxError::InvalidState(format!("script context {} is closed", self.id))
        })
    }

    fn guarded<T>(&self, f: impl FnOnce() -> mlua::Result<T>) -> std::result::Result<T, ExecutionFault> {
        self.budget.begin();
        f().map_err(|e| ExecutionFault::from_lua(&e, self.budget.is_exhausted()))
    }

    /// Log a fault and append it to stderr; returns the value on success.
    fn report(&self, what: &str, outcome: std::result::Result<Value, ExecutionFault>) -> Option<Value> {
        match outcome {
            Ok(value) => Some(value),
            Err(fault) => {
                warn!(script = %self.state.script_name, "{what} failed: {fault}");
                self.state.output.push_stderr(&format!("{fault}\n"));
                None
            }
        }
    }

    /// Evaluate a snippet. Faults go to stderr and yield `Ok(None)`.
    pub fn evaluate_inline(&self, code: &str) -> Result<Option<Value>> {
        let lua = self.lua()?;
        let outcome = self.guarded(|| lua.load(code).set_name("=inline").eval::<Value>());
        Ok(self.report("inline evaluation", outcome))
    }

    /// Run `path` as the entry module. Faults go to stderr and yield `Ok(None)`.
    pub fn evaluate_module(&self, path: impl AsRef<Path>) -> Result<Option<Value>> {
        let lua = self.lua()?;
        let path = path.as_ref();
        let outcome = match read_module(&self.overlay, path) {
            Ok((key, source)) => self.guarded(|| load_module(lua, &key, &source)),
            Err(e) => Err(ExecutionFault::runtime(format!(
                "cannot load module {}: {e}",
                path.display()
            ))),
        };
        Ok(self.report(&format!("module {}", path.display()), outcome))
    }

    /// Call a guest function under the sandbox limits.
    pub fn call(&self, function: &Function, args: impl IntoLuaMulti) -> Result<Value> {
        self.lua()?;
        self.guarded(|| function.call::<Value>(args))
            .map_err(SandboxError::from)
    }

    /// Resolve a pending task. Returns `false` if the id was unknown.
    pub(crate) fn settle_task(&self, task_id: &TaskId) -> Result<bool> {
        self.lua()?;
        self.budget.begin();
        Ok(deferred::settle(&self.state, task_id))
    }

    /// Render a value the way `tostring` does.
    pub fn render(&self, value: Value) -> Result<String> {
        let lua = self.lua()?;
        Ok(tostring(lua, value)?)
    }

    pub fn drain_stdout(&self) -> String {
        self.state.output.drain_stdout()
    }

    pub fn drain_stderr(&self) -> String {
        self.state.output.drain_stderr()
    }

    /// Clear every registry, then drop the Lua instance. Idempotent.
    pub fn close(&mut self) {
        let Some(lua) = self.lua.take() else {
            return;
        };
        self.state.teardown();
        let _ = lua.remove_hook();
        drop(lua);
        info!(context = %self.id, script = %self.state.script_name, "script context closed");
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("id", &self.id)
            .field("script", &self.state.script_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn tostring(lua: &Lua, value: Value) -> mlua::Result<String> {
    let tostring: Function = lua.named_registry_value(TOSTRING_KEY)?;
    tostring.call::<String>(value)
}

/// `a.b` becomes `a/b.lua`; names ending in `.lua` are kept.
fn module_path(name: &str) -> String {
    if name.ends_with(".lua") {
        name.to_string()
    } else {
        format!("{}.lua", name.replace('.', "/"))
    }
}

/// Read a module through the overlay. Modules must resolve inside the root.
fn read_module(overlay: &FsOverlay, path: &Path) -> io::Result<(String, String)> {
    match overlay.resolve(path) {
        Resolved::Override(key) => {
            let source = overlay.read_to_string(&key)?;
            Ok((key.to_string_lossy().replace('\\', "/"), source))
        }
        Resolved::Disk {
            path,
            contained: false,
        } => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} resolves outside the script root", path.display()),
        )),
        Resolved::Disk { path, .. } => {
            let source = overlay.read_to_string(&path)?;
            let key = path
                .strip_prefix(overlay.root())
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            Ok((key, source))
        }
    }
}

/// Run a module chunk once per context, caching its result.
fn load_module(lua: &Lua, key: &str, source: &str) -> mlua::Result<Value> {
    let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
    let cached: Value = loaded.raw_get(key)?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    let loading: Table = lua.named_registry_value(LOADING_KEY)?;
    let in_progress: Value = loading.raw_get(key)?;
    if !in_progress.is_nil() {
        return Err(mlua::Error::RuntimeError(format!(
            "cyclic require of module '{key}'"
        )));
    }

    loading.raw_set(key, true)?;
    let result = lua
        .load(source)
        .set_name(format!("@{key}"))
        .call::<Value>(key);
    loading.raw_set(key, Value::Nil)?;

    let value = match result? {
        Value::Nil => Value::Boolean(true),
        other => other,
    };
    loaded.raw_set(key, value.clone())?;
    Ok(value)
}

fn install_require(lua: &Lua, overlay: Rc<FsOverlay>) -> mlua::Result<()> {
    lua.set_named_registry_value(LOADED_KEY, lua.create_table()?)?;
    lua.set_named_registry_value(LOADING_KEY, lua.create_table()?)?;

    let require = lua.create_function(move |lua, name: String| {
        let path = module_path(&name);
        let (key, source) = read_module(&overlay, Path::new(&path)).map_err(|e| {
            mlua::Error::external(io::Error::new(e.kind(), format!("module '{name}': {e}")))
        })?;
        load_module(lua, &key, &source)
    })?;
    lua.globals().set("require", require)
}
