//! Public entry point for hosts: load scripts, fire events, evaluate snippets.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use mlua::{LuaSerdeExt, Value};
use serde::Serialize;
use tracing::{info, warn};

use super::bridge::HostBridge;
use super::engine::{ScriptContext, ScriptLimits};
use super::runtime::{self, Request, RuntimeHandle, Status};
use super::snapshot::{EventSnapshot, Hand};
use crate::config::ScriptingConfig;
use crate::host::{BlockPos, CommandSource, HostPlayer, HostServices, Position};
use crate::vfs::{FsOverlay, OverrideMap};
use crate::{Result, SandboxError};

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No script is active.
    Unloaded,
    /// A script is active.
    Loaded,
    /// Shut down; terminal.
    Closed,
}

/// Outcome of a load request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub script: String,
    /// The entry module ran to completion and is now active.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl LoadReport {
    pub(crate) fn failed(script: &str, stderr: String) -> Self {
        Self {
            script: script.to_string(),
            success: false,
            stdout: String::new(),
            stderr,
        }
    }
}

/// Outcome of firing one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub event: String,
    /// Listeners invoked.
    pub listeners: usize,
    /// Listeners that raised.
    pub failures: usize,
    /// Posted without waiting (fired from the script thread).
    pub queued: bool,
}

/// Result of an ad-hoc evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdhocResult {
    /// Rendered value; `None` when evaluation failed.
    pub value: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// Owns the script thread and the single active script.
pub struct ScriptManager {
    config: ScriptingConfig,
    services: HostServices,
    runtime: RuntimeHandle,
    status: Arc<Mutex<Status>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptManager {
    /// Start the script thread. No script is loaded yet.
    pub fn new(config: ScriptingConfig, services: HostServices) -> Result<Self> {
        let status = Arc::new(Mutex::new(Status::default()));
        let (runtime, thread) = runtime::spawn(config.clone(), services.clone(), Arc::clone(&status))?;
        info!(scripts_dir = %config.scripts_dir, "script manager started");
        Ok(Self {
            config,
            services,
            runtime,
            status,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn config(&self) -> &ScriptingConfig {
        &self.config
    }

    /// Load (or reload) `file_name` from the scripts directory.
    ///
    /// The previous script is torn down first. Only a failure to create the
    /// scripts directory is returned as an error; every other problem is in
    /// the report.
    pub fn load_script(&self, file_name: &str, requester: Option<Arc<dyn CommandSource>>) -> Result<LoadReport> {
        self.runtime.request(|reply| Request::Load {
            file_name: file_name.to_string(),
            requester,
            reply,
        })?
    }

    /// Load the configured entry script.
    pub fn load_entry(&self) -> Result<LoadReport> {
        self.load_script(&self.config.entry_script, None)
    }

    /// Deliver an event to the active script's listeners.
    pub fn fire(&self, snapshot: EventSnapshot) -> Result<DispatchReport> {
        self.dispatch(snapshot, None)
    }

    fn dispatch(&self, snapshot: EventSnapshot, recipient: Option<Arc<dyn HostPlayer>>) -> Result<DispatchReport> {
        if self.runtime.on_script_thread() {
            let event = snapshot.event_name().to_string();
            self.runtime.post(Request::Fire {
                snapshot,
                recipient,
                reply: None,
            });
            return Ok(DispatchReport {
                event,
                listeners: 0,
                failures: 0,
                queued: true,
            });
        }
        self.runtime
            .request(|reply| Request::Fire {
                snapshot,
                recipient,
                reply: Some(reply),
            })
    }

    pub fn fire_player_join(&self, player: &dyn HostPlayer) -> Result<DispatchReport> {
        self.fire(EventSnapshot::join(player))
    }

    /// Fire `playerLeave`. The handle is kept so listener errors still reach
    /// a player the host has already removed from its directory.
    pub fn fire_player_leave(&self, player: Arc<dyn HostPlayer>) -> Result<DispatchReport> {
        let snapshot = EventSnapshot::leave(player.as_ref());
        self.dispatch(snapshot, Some(player))
    }

    pub fn fire_player_move(&self, player: &dyn HostPlayer, position: Position, on_ground: bool) -> Result<DispatchReport> {
        self.fire(EventSnapshot::moved(player, position, on_ground))
    }

    pub fn fire_player_block_interact(
        &self,
        player: &dyn HostPlayer,
        pos: BlockPos,
        block_id: &str,
        hand: Hand,
    ) -> Result<DispatchReport> {
        self.fire(EventSnapshot::interact(player, pos, block_id, hand))
    }

    /// Evaluate `code` in a throwaway context on the calling thread.
    ///
    /// The context gets an isolated bridge: its listeners and commands never
    /// reach the host and vanish with it.
    pub fn eval_adhoc(&self, code: &str) -> Result<AdhocResult> {
        let root = self.config.scripts_path();
        let overrides = OverrideMap::from_shared_files(&root, &self.config.shared_modules);
        let overlay = FsOverlay::new(&root, overrides)?;
        let mut ctx = ScriptContext::new(
            HostBridge::isolated(self.services.clone()),
            overlay,
            &ScriptLimits::from(&self.config),
        )?;

        let result = ctx
            .evaluate_inline(code)
            .and_then(|value| value.map(|v| render(&ctx, v)).transpose());
        let stdout = ctx.drain_stdout();
        let stderr = ctx.drain_stderr();
        ctx.close();

        Ok(AdhocResult {
            value: result?,
            stdout,
            stderr,
        })
    }

    /// Name of the active script, if any.
    pub fn active_script(&self) -> Option<String> {
        self.status().script
    }

    pub fn state(&self) -> LifecycleState {
        self.status().state
    }

    fn status(&self) -> Status {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear down the active script and stop the script thread. Idempotent.
    pub fn shutdown(&self) {
        let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        if let Err(e) = self.runtime.request(|reply| Request::Shutdown { reply }) {
            warn!("script thread did not acknowledge shutdown: {e}");
        }
        if thread.join().is_err() {
            warn!("script thread panicked");
        }
    }
}

impl Drop for ScriptManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Plain data renders as JSON; anything else goes through `tostring`.
fn render(ctx: &ScriptContext, value: Value) -> Result<String> {
    match value {
        Value::Nil => Ok("nil".to_string()),
        Value::String(ref s) => Ok(s.to_str()?.to_string()),
        Value::Table(_) => {
            let lua = ctx.lua()?;
            match lua.from_value::<serde_json::Value>(value.clone()) {
                Ok(json) => serde_json::to_string(&json)
                    .map_err(|e| SandboxError::Script(format!("failed to render value: {e}"))),
                Err(_) => ctx.render(value),
            }
        }
        other => ctx.render(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::LocalServer;
    use std::fs;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, server: &LocalServer) -> ScriptManager {
        let config = ScriptingConfig {
            scripts_dir: dir.path().to_string_lossy().into_owned(),
            ..ScriptingConfig::default()
        };
        ScriptManager::new(config, server.services()).unwrap()
    }

    #[test]
    fn test_initial_state() {
        let dir = TempDir::new().unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);

        assert_eq!(manager.state(), LifecycleState::Unloaded);
        assert_eq!(manager.active_script(), None);
    }

    #[test]
    fn test_load_appends_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hello.lua"), "print('hi')").unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);

        let report = manager.load_script("hello", None).unwrap();

        assert!(report.success);
        assert_eq!(report.script, "hello.lua");
        assert_eq!(report.stdout, "hi\n");
        assert_eq!(manager.state(), LifecycleState::Loaded);
        assert_eq!(manager.active_script().as_deref(), Some("hello.lua"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);
        let console: Arc<dyn CommandSource> = server.console().clone();

        let report = manager.load_script("absent", Some(console)).unwrap();

        assert!(!report.success);
        assert!(report.stderr.starts_with("Error: Script file not found:"));
        let messages = server.console().take_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Error: Script file not found:"));
    }

    #[test]
    fn test_load_creates_scripts_dir() {
        let dir = TempDir::new().unwrap();
        let scripts = dir.path().join("nested").join("scripts");
        let server = LocalServer::new();
        let config = ScriptingConfig {
            scripts_dir: scripts.to_string_lossy().into_owned(),
            ..ScriptingConfig::default()
        };
        let manager = ScriptManager::new(config, server.services()).unwrap();

        let report = manager.load_script("main", None).unwrap();
        assert!(!report.success);
        assert!(scripts.is_dir());
    }

    #[test]
    fn test_requester_told_about_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.lua"), "warn('careful')").unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);
        let console: Arc<dyn CommandSource> = server.console().clone();

        manager.load_script("main.lua", Some(console)).unwrap();

        assert_eq!(
            server.console().take_messages(),
            vec![
                "Script stderr:\ncareful".to_string(),
                "Script loaded and executed: main.lua".to_string(),
            ]
        );
    }

    #[test]
    fn test_eval_adhoc_renders_values() {
        let dir = TempDir::new().unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);

        let result = manager.eval_adhoc("return { a = 1 }").unwrap();
        assert_eq!(result.value.as_deref(), Some(r#"{"a":1}"#));

        let result = manager.eval_adhoc("print('x'); return 40 + 2").unwrap();
        assert_eq!(result.value.as_deref(), Some("42"));
        assert_eq!(result.stdout, "x\n");

        let result = manager.eval_adhoc("return function() end").unwrap();
        assert!(result.value.unwrap().starts_with("function"));
    }

    #[test]
    fn test_eval_adhoc_error() {
        let dir = TempDir::new().unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);

        let result = manager.eval_adhoc("error('bad input')").unwrap();
        assert_eq!(result.value, None);
        assert!(result.stderr.contains("bad input"));
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.lua"), "").unwrap();
        let server = LocalServer::new();
        let manager = manager(&dir, &server);

        manager.load_script("main", None).unwrap();
        manager.shutdown();
        manager.shutdown();

        assert_eq!(manager.state(), LifecycleState::Closed);
        assert!(manager.load_script("main", None).is_err());
    }
}
