//! The script thread.
//!
//! Lua state is not `Send`, so the active context lives on one dedicated
//! thread. Everything that touches it arrives as a [`Request`] on a single
//! FIFO channel, which makes load, dispatch, command invocation and task
//! resolution mutually exclusive.

use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, info, warn};

use super::bridge::HostBridge;
use super::command::{self, CommandInvocation};
use super::deferred::TaskToken;
use super::engine::{ScriptContext, ScriptLimits};
use super::manager::{DispatchReport, LifecycleState, LoadReport};
use super::snapshot::EventSnapshot;
use crate::config::ScriptingConfig;
use crate::host::{CommandSource, HostPlayer, HostServices};
use crate::vfs::{FsOverlay, OverrideMap};
use crate::{Result, SandboxError};

const THREAD_NAME: &str = "lodestone-script";

/// Messages handled by the script thread.
pub(crate) enum Request {
    Load {
        file_name: String,
        requester: Option<Arc<dyn CommandSource>>,
        reply: Sender<Result<LoadReport>>,
    },
    Fire {
        snapshot: EventSnapshot,
        recipient: Option<Arc<dyn HostPlayer>>,
        reply: Option<Sender<DispatchReport>>,
    },
    InvokeCommand {
        invocation: CommandInvocation,
        reply: Option<Sender<()>>,
    },
    ResolveTask(TaskToken),
    Shutdown {
        reply: Sender<()>,
    },
}

/// Published view of the script thread's state.
#[derive(Debug, Clone)]
pub(crate) struct Status {
    pub state: LifecycleState,
    pub script: Option<String>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: LifecycleState::Unloaded,
            script: None,
        }
    }
}

/// Sending side of the script thread's inbox.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: Sender<Request>,
    script_thread: Arc<OnceLock<ThreadId>>,
}

impl RuntimeHandle {
    pub(crate) fn post(&self, request: Request) -> bool {
        self.tx.send(request).is_ok()
    }

    /// Whether the caller is the script thread itself.
    pub fn on_script_thread(&self) -> bool {
        self.script_thread.get() == Some(&thread::current().id())
    }

    /// Send a request and wait for its reply.
    pub(crate) fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Request) -> Result<T> {
        if self.on_script_thread() {
            return Err(SandboxError::InvalidState(
                "cannot wait for the script thread from itself".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel();
        if !self.post(make(tx)) {
            return Err(SandboxError::InvalidState(
                "script runtime has stopped".to_string(),
            ));
        }
        rx.recv().map_err(|_| {
            SandboxError::InvalidState("script runtime dropped the request".to_string())
        })
    }

    /// Called from the host scheduler; never blocks.
    pub(crate) fn post_task(&self, token: TaskToken) {
        let task = token.task_id.clone();
        if !self.post(Request::ResolveTask(token)) {
            debug!(task = %task, "script runtime stopped; task dropped");
        }
    }

    /// Route a host command invocation to the script thread.
    ///
    /// Waits for the handler unless already on the script thread.
    pub(crate) fn invoke_command(&self, invocation: CommandInvocation) {
        let sender = Arc::clone(&invocation.sender);
        let name = invocation.command.clone();

        let delivered = if self.on_script_thread() {
            self.post(Request::InvokeCommand {
                invocation,
                reply: None,
            })
        } else {
            self.request(|reply| Request::InvokeCommand {
                invocation,
                reply: Some(reply),
            })
            .is_ok()
        };

        if !delivered {
            sender.send_message(&format!(
                "Error: Scripting engine is not ready for command {name}"
            ));
        }
    }
}

/// Start the script thread.
pub(crate) fn spawn(
    config: ScriptingConfig,
    services: HostServices,
    status: Arc<Mutex<Status>>,
) -> Result<(RuntimeHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let handle = RuntimeHandle {
        tx,
        script_thread: Arc::new(OnceLock::new()),
    };

    let runtime = handle.clone();
    let slot = Arc::clone(&handle.script_thread);
    let join = thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let _ = slot.set(thread::current().id());
            // Lua state is not Send; the host is built on its own thread.
            let host = ScriptHost {
                limits: ScriptLimits::from(&config),
                config,
                services,
                runtime,
                lifecycle: Lifecycle::Unloaded,
                status,
            };
            host.run(rx);
        })?;

    Ok((handle, join))
}

enum Lifecycle {
    Unloaded,
    Loaded(ScriptContext),
    Closed,
}

/// Owner of the active context; lives on the script thread.
struct ScriptHost {
    config: ScriptingConfig,
    limits: ScriptLimits,
    services: HostServices,
    runtime: RuntimeHandle,
    lifecycle: Lifecycle,
    status: Arc<Mutex<Status>>,
}

impl ScriptHost {
    fn run(mut self, rx: Receiver<Request>) {
        debug!("script thread started");
        while let Ok(request) = rx.recv() {
            match request {
                Request::Load {
                    file_name,
                    requester,
                    reply,
                } => {
                    let _ = reply.send(self.load(&file_name, requester));
                }
                Request::Fire {
                    snapshot,
                    recipient,
                    reply,
                } => {
                    let report = self.fire(&snapshot, recipient);
                    if let Some(reply) = reply {
                        let _ = reply.send(report);
                    }
                }
                Request::InvokeCommand { invocation, reply } => {
                    self.invoke(invocation);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                Request::ResolveTask(token) => self.resolve(token),
                Request::Shutdown { reply } => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.shutdown();
        debug!("script thread stopped");
    }

    fn publish(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        match &self.lifecycle {
            Lifecycle::Unloaded => {
                status.state = LifecycleState::Unloaded;
                status.script = None;
            }
            Lifecycle::Loaded(ctx) => {
                status.state = LifecycleState::Loaded;
                status.script = Some(ctx.script_name().to_string());
            }
            Lifecycle::Closed => {
                status.state = LifecycleState::Closed;
                status.script = None;
            }
        }
    }

    fn active(&self) -> Option<&ScriptContext> {
        match &self.lifecycle {
            Lifecycle::Loaded(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Close the active context, if any, and go back to `Unloaded`.
    fn teardown(&mut self) {
        if let Lifecycle::Loaded(mut ctx) = std::mem::replace(&mut self.lifecycle, Lifecycle::Unloaded) {
            info!(script = %ctx.script_name(), context = %ctx.id(), "tearing down script");
            ctx.close();
        }
        self.publish();
    }

    fn load(&mut self, file_name: &str, requester: Option<Arc<dyn CommandSource>>) -> Result<LoadReport> {
        if matches!(self.lifecycle, Lifecycle::Closed) {
            return Err(SandboxError::InvalidState(
                "script manager has been shut down".to_string(),
            ));
        }

        let reply = |message: &str| match &requester {
            Some(r) => r.send_message(message),
            None => info!("{message}"),
        };

        let script = if file_name.ends_with(".lua") {
            file_name.to_string()
        } else {
            format!("{file_name}.lua")
        };

        let scripts_dir = self.config.scripts_path();
        if let Err(e) = fs::create_dir_all(&scripts_dir) {
            let message = format!("Error: Could not create 'scripts' directory: {e}");
            error!(dir = %scripts_dir.display(), "{message}");
            reply(&message);
            return Err(SandboxError::Io(e));
        }

        self.teardown();

        let path = scripts_dir.join(&script);
        if !path.is_file() {
            let message = format!("Error: Script file not found: {}", path.display());
            warn!(script = %script, "{message}");
            reply(&message);
            return Ok(LoadReport::failed(&script, message));
        }

        let ctx = match self.create_context(&scripts_dir, &script) {
            Ok(ctx) => ctx,
            Err(e) => {
                let message = format!("Error executing script '{script}': {e}");
                error!(script = %script, "{message}");
                reply(&message);
                return Ok(LoadReport::failed(&script, message));
            }
        };

        let success = ctx.evaluate_module(&script)?.is_some();
        let stdout = ctx.drain_stdout();
        let stderr = ctx.drain_stderr();

        if !stdout.is_empty() {
            info!(script = %script, "Script stdout:\n{}", stdout.trim_end());
        }
        if !stderr.is_empty() {
            warn!(script = %script, "Script stderr:\n{}", stderr.trim_end());
        }

        if let Some(requester) = &requester {
            if !stderr.is_empty() {
                requester.send_message(&format!("Script stderr:\n{}", stderr.trim_end()));
            }
        }

        if success {
            reply(&format!("Script loaded and executed: {script}"));
            self.lifecycle = Lifecycle::Loaded(ctx);
        } else {
            let mut ctx = ctx;
            ctx.close();
            warn!(script = %script, "script failed during load; not activated");
        }
        self.publish();

        Ok(LoadReport {
            script,
            success,
            stdout,
            stderr,
        })
    }

    fn create_context(&self, scripts_dir: &Path, script: &str) -> Result<ScriptContext> {
        let overrides = OverrideMap::from_shared_files(scripts_dir, &self.config.shared_modules);
        let overlay = FsOverlay::new(scripts_dir, overrides)?;
        let bridge = HostBridge::active(self.services.clone(), self.runtime.clone(), script);
        ScriptContext::new(bridge, overlay, &self.limits)
    }

    fn fire(&mut self, snapshot: &EventSnapshot, recipient: Option<Arc<dyn HostPlayer>>) -> DispatchReport {
        let event = snapshot.event_name();
        let mut report = DispatchReport {
            event: event.to_string(),
            listeners: 0,
            failures: 0,
            queued: false,
        };

        let Some(ctx) = self.active() else {
            debug!(event, "no active script; event ignored");
            return report;
        };

        let listeners = ctx.state().listeners.borrow().get(event);
        if listeners.is_empty() {
            return report;
        }

        // The event's own player, even if the host has already dropped it.
        let recipient: Option<Arc<dyn HostPlayer>> = if self.config.echo_errors_to_player {
            recipient.or_else(|| self.services.players.lookup_by_id(snapshot.player().id))
        } else {
            None
        };

        for listener in listeners {
            report.listeners += 1;
            let outcome = ctx.lua().and_then(|lua| {
                let argument = snapshot.to_lua(lua, ctx.state())?;
                ctx.call(&listener, argument)
            });

            let stdout = ctx.drain_stdout();
            if !stdout.is_empty() {
                info!(script = %ctx.script_name(), event, "Event stdout:\n{}", stdout.trim_end());
            }
            let stderr = ctx.drain_stderr();
            if !stderr.is_empty() {
                warn!(script = %ctx.script_name(), event, "Event stderr:\n{}", stderr.trim_end());
                if let Some(player) = &recipient {
                    player.send_message(&format!("Event ({event}) stderr:\n{}", stderr.trim_end()));
                }
            }

            if let Err(e) = outcome {
                report.failures += 1;
                let message = format!("Error executing script listener for '{event}': {e}");
                warn!(script = %ctx.script_name(), event, "{message}");
                if let Some(player) = &recipient {
                    player.send_message(&message);
                }
            }
        }

        report
    }

    fn invoke(&mut self, invocation: CommandInvocation) {
        match self.active() {
            Some(ctx) if ctx.id() == invocation.context_id => {
                let name = invocation.command.clone();
                if let Err(e) = command::invoke(ctx, invocation) {
                    error!(script = %ctx.script_name(), command = %name, "command invocation failed: {e}");
                }
            }
            _ => {
                debug!(command = %invocation.command, context = %invocation.context_id, "command from inactive context");
                invocation.sender.send_message(&format!(
                    "Error: Scripting engine is not ready for command {}",
                    invocation.command
                ));
            }
        }
    }

    fn resolve(&mut self, token: TaskToken) {
        let Some(ctx) = self.active().filter(|ctx| ctx.id() == token.context_id) else {
            debug!(task = %token.task_id, context = %token.context_id, "stale task skipped");
            return;
        };

        match ctx.settle_task(&token.task_id) {
            Ok(_) => {
                let stdout = ctx.drain_stdout();
                if !stdout.is_empty() {
                    info!(script = %ctx.script_name(), task = %token.task_id, "Task stdout:\n{}", stdout.trim_end());
                }
                let stderr = ctx.drain_stderr();
                if !stderr.is_empty() {
                    warn!(script = %ctx.script_name(), task = %token.task_id, "Task stderr:\n{}", stderr.trim_end());
                }
            }
            Err(e) => error!(task = %token.task_id, "task resolution failed: {e}"),
        }
    }

    fn shutdown(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Closed) {
            return;
        }
        self.teardown();
        self.lifecycle = Lifecycle::Closed;
        self.publish();
        info!("script manager closed");
    }
}
