//! The capability table injected into every context.
//!
//! Every host-affecting operation a script can perform goes through the
//! functions installed here. Each context owns its listener, task and
//! command registries through [`ScriptState`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use mlua::{Function, Lua, MultiValue, Table, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{self, RegisteredCommandSet};
use super::deferred::{self, PendingTaskRegistry};
use super::engine::{self, ContextId, OutputBuffers};
use super::runtime::RuntimeHandle;
use crate::host::{GameMode, HostPlayer, HostServices, PlayerDirectory};

const ISOLATED_SCRIPT_NAME: &str = "<adhoc>";

/// How the bridge reaches back into the host.
#[derive(Clone)]
pub enum BridgeMode {
    /// Bound to the active context on the script thread.
    Active(RuntimeHandle),
    /// Ad-hoc evaluation: registrations are discarded with the context.
    Isolated,
}

/// Host handles for a context that has not been created yet.
pub struct HostBridge {
    services: HostServices,
    mode: BridgeMode,
    script_name: String,
}

impl HostBridge {
    pub fn active(services: HostServices, runtime: RuntimeHandle, script_name: impl Into<String>) -> Self {
        Self {
            services,
            mode: BridgeMode::Active(runtime),
            script_name: script_name.into(),
        }
    }

    pub fn isolated(services: HostServices) -> Self {
        Self {
            services,
            mode: BridgeMode::Isolated,
            script_name: ISOLATED_SCRIPT_NAME.to_string(),
        }
    }

    pub(crate) fn into_state(self, id: ContextId, max_output_bytes: usize) -> ScriptState {
        ScriptState {
            id,
            script_name: self.script_name,
            services: self.services,
            mode: self.mode,
            output: OutputBuffers::new(max_output_bytes),
            listeners: RefCell::new(ListenerRegistry::default()),
            tasks: RefCell::new(PendingTaskRegistry::default()),
            commands: RefCell::new(RegisteredCommandSet::default()),
        }
    }
}

/// Event name to callbacks, in registration order.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: HashMap<String, Vec<Function>>,
}

impl ListenerRegistry {
    pub fn add(&mut self, event: &str, callback: Function) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    /// Snapshot of the callbacks for `event`.
    pub fn get(&self, event: &str) -> Vec<Function> {
        self.listeners.get(event).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) -> usize {
        let total = self.total();
        self.listeners.clear();
        total
    }
}

/// Per-context state shared by the bridge functions.
pub(crate) struct ScriptState {
    pub id: ContextId,
    pub script_name: String,
    pub services: HostServices,
    pub mode: BridgeMode,
    pub output: OutputBuffers,
    pub listeners: RefCell<ListenerRegistry>,
    pub tasks: RefCell<PendingTaskRegistry>,
    pub commands: RefCell<RegisteredCommandSet>,
}

impl ScriptState {
    pub fn is_active(&self) -> bool {
        matches!(self.mode, BridgeMode::Active(_))
    }

    /// Drop every registration made by the script.
    ///
    /// Commands are removed from the host table only for the active bridge.
    pub fn teardown(&self) {
        let listeners = self.listeners.borrow_mut().clear();
        let tasks = self.tasks.borrow_mut().clear();
        let names = self.commands.borrow_mut().drain();

        if self.is_active() {
            for name in &names {
                if self.services.commands.unregister(name) {
                    debug!(script = %self.script_name, command = %name, "command unregistered");
                } else {
                    warn!(script = %self.script_name, command = %name, "command was already gone from the host table");
                }
            }
        }

        if listeners + tasks + names.len() > 0 {
            info!(
                script = %self.script_name,
                listeners,
                tasks,
                commands = names.len(),
                "script registrations cleared"
            );
        }
    }
}

/// Report a script mistake to the log and the context's stderr.
pub(crate) fn diagnostic(state: &ScriptState, message: &str) {
    warn!(script = %state.script_name, "{message}");
    state.output.push_stderr(message);
    state.output.push_stderr("\n");
}

/// Find an online player by uuid, falling back to a name lookup.
pub(crate) fn resolve_player(players: &dyn PlayerDirectory, identifier: &str) -> Option<Arc<dyn HostPlayer>> {
    match Uuid::parse_str(identifier.trim()) {
        Ok(id) => players.lookup_by_id(id),
        Err(_) => players.lookup_by_name(identifier.trim()),
    }
}

/// Drop a leading `self` table so both `server.f(...)` and `server:f(...)` work.
pub(crate) fn method_args(mut args: MultiValue, arity: usize) -> MultiValue {
    if args.len() > arity && matches!(args.front(), Some(Value::Table(_))) {
        args.pop_front();
    }
    args
}

/// Accept a string or number argument as an identifier. Anything else is `None`.
pub(crate) fn identifier_arg(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => s.to_str().ok().map(|s| s.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn text_arg(lua: &Lua, value: Value) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        other => engine::tostring(lua, other),
    }
}

/// Install the bridge table at `global_name`.
pub(crate) fn install(lua: &Lua, state: &Rc<ScriptState>, global_name: &str) -> mlua::Result<()> {
    let bridge = lua.create_table()?;

    register_events(lua, &bridge, state)?;
    register_messaging(lua, &bridge, state)?;
    register_players(lua, &bridge, state)?;
    register_scheduling(lua, &bridge, state)?;

    lua.globals().set(global_name, bridge)?;
    Ok(())
}

fn register_events(lua: &Lua, bridge: &Table, state: &Rc<ScriptState>) -> mlua::Result<()> {
    // server.on(eventName, callback)
    let on_state = Rc::clone(state);
    let on = lua.create_function(move |lua, args: MultiValue| {
        let (event, callback): (Value, Value) = lua.unpack_multi(method_args(args, 2))?;
        let Some(event) = identifier_arg(&event) else {
            diagnostic(&on_state, "Invalid arguments for server.on. Expected (eventName, callback).");
            return Ok(());
        };
        match callback {
            Value::Function(callback) => {
                on_state.listeners.borrow_mut().add(&event, callback);
                debug!(script = %on_state.script_name, event = %event, "listener registered");
            }
            other => diagnostic(
                &on_state,
                &format!(
                    "server.on('{event}') expects a function callback, got {}",
                    other.type_name()
                ),
            ),
        }
        Ok(())
    })?;
    bridge.set("on", on)?;

    // server.registerCommand(definition)
    let command_state = Rc::clone(state);
    let register = lua.create_function(move |lua, args: MultiValue| {
        let definition: Value = lua.unpack_multi(method_args(args, 1))?;
        Ok(command::register(lua, &command_state, definition))
    })?;
    bridge.set("registerCommand", register)?;

    Ok(())
}

fn register_messaging(lua: &Lua, bridge: &Table, state: &Rc<ScriptState>) -> mlua::Result<()> {
    // server.sendMessage(playerId, text)
    let send_state = Rc::clone(state);
    let send = lua.create_function(move |lua, args: MultiValue| {
        let (identifier, text): (Value, Value) = lua.unpack_multi(method_args(args, 2))?;
        let Some(identifier) = identifier_arg(&identifier) else {
            diagnostic(&send_state, "Invalid arguments for sendMessage. Expected (playerId, message).");
            return Ok(false);
        };
        let text = text_arg(lua, text)?;
        match resolve_player(send_state.services.players.as_ref(), &identifier) {
            Some(player) => {
                player.send_message(&text);
                Ok(true)
            }
            None => {
                diagnostic(&send_state, &format!("sendMessage: player '{identifier}' is not online"));
                Ok(false)
            }
        }
    })?;
    bridge.set("sendMessage", send)?;

    // server.broadcastMessage(text)
    let broadcast_state = Rc::clone(state);
    let broadcast = lua.create_function(move |lua, args: MultiValue| {
        let text: Value = lua.unpack_multi(method_args(args, 1))?;
        let text = text_arg(lua, text)?;
        broadcast_state.services.players.broadcast(&text);
        Ok(())
    })?;
    bridge.set("broadcastMessage", broadcast)?;

    Ok(())
}

fn register_players(lua: &Lua, bridge: &Table, state: &Rc<ScriptState>) -> mlua::Result<()> {
    // server.setPlayerGamemode(playerId, mode) -> boolean
    let mode_state = Rc::clone(state);
    let set_mode = lua.create_function(move |lua, args: MultiValue| {
        let (identifier, mode): (Value, Value) = lua.unpack_multi(method_args(args, 2))?;
        let (Some(identifier), Some(mode)) = (identifier_arg(&identifier), identifier_arg(&mode)) else {
            diagnostic(
                &mode_state,
                "Invalid arguments for setPlayerGamemode. Expected (playerId, gameMode).",
            );
            return Ok(false);
        };
        Ok(set_player_gamemode(&mode_state, &identifier, &mode))
    })?;
    bridge.set("setPlayerGamemode", set_mode)?;

    // server.onlinePlayers() -> { {uuid, name}, ... }
    let list_state = Rc::clone(state);
    let online = lua.create_function(move |lua, _: MultiValue| {
        let list = lua.create_table()?;
        for (i, player) in list_state.services.players.all_online().iter().enumerate() {
            let entry = lua.create_table()?;
            entry.set("uuid", player.id().to_string())?;
            entry.set("name", player.name())?;
            list.raw_set(i + 1, entry)?;
        }
        Ok(list)
    })?;
    bridge.set("onlinePlayers", online)?;

    Ok(())
}

fn register_scheduling(lua: &Lua, bridge: &Table, state: &Rc<ScriptState>) -> mlua::Result<()> {
    // server.schedule(delayTicks) -> Deferred
    let schedule_state = Rc::clone(state);
    let schedule = lua.create_function(move |lua, args: MultiValue| {
        let delay: Option<f64> = lua.unpack_multi(method_args(args, 1))?;
        let delay = delay.unwrap_or(0.0).floor() as i64;
        deferred::schedule(lua, &schedule_state, delay)
    })?;
    bridge.set("schedule", schedule)?;

    Ok(())
}

pub(crate) fn set_player_gamemode(state: &ScriptState, identifier: &str, mode: &str) -> bool {
    let Ok(mode) = mode.parse::<GameMode>() else {
        diagnostic(
            state,
            &format!(
                "Invalid game mode '{mode}'. Valid modes are: survival, creative, adventure, spectator."
            ),
        );
        return false;
    };
    let Some(player) = resolve_player(state.services.players.as_ref(), identifier) else {
        diagnostic(state, &format!("setPlayerGamemode: player '{identifier}' is not online"));
        return false;
    };

    player.set_game_mode(mode);
    player.send_message(&format!("Your gamemode has been set to {}.", mode.as_str()));
    info!(script = %state.script_name, player = %player.name(), mode = %mode, "game mode changed by script");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::LocalServer;
    use crate::script::engine::{ScriptContext, ScriptLimits};
    use crate::vfs::{FsOverlay, OverrideMap};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        server: LocalServer,
        ctx: ScriptContext,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let server = LocalServer::new();
        let overlay = FsOverlay::new(dir.path(), OverrideMap::new()).unwrap();
        let ctx = ScriptContext::new(
            HostBridge::isolated(server.services()),
            overlay,
            &ScriptLimits::default(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            server,
            ctx,
        }
    }

    fn eval(f: &Fixture, code: &str) -> Option<Value> {
        f.ctx.evaluate_inline(code).unwrap()
    }

    #[test]
    fn test_on_registers_listener() {
        let f = fixture();
        eval(&f, "server.on('playerJoin', function() end); server:on('playerJoin', function() end)");

        assert_eq!(f.ctx.state().listeners.borrow().count("playerJoin"), 2);
        assert_eq!(f.ctx.drain_stderr(), "");
    }

    #[test]
    fn test_on_rejects_non_function() {
        let f = fixture();
        eval(&f, "server.on('playerJoin', 42)");

        assert_eq!(f.ctx.state().listeners.borrow().total(), 0);
        assert!(f.ctx.drain_stderr().contains("expects a function callback"));
    }

    #[test]
    fn test_send_message_by_name_and_uuid() {
        let f = fixture();
        let alice = f.server.join("Alice");

        eval(&f, "server.sendMessage('alice', 'hi by name')");
        eval(&f, &format!("server:sendMessage('{}', 'hi by id')", alice.id()));

        assert_eq!(alice.take_messages(), vec!["hi by name", "hi by id"]);
    }

    #[test]
    fn test_send_message_unknown_player() {
        let f = fixture();
        let value = eval(&f, "return server.sendMessage('nobody', 'hello')");

        assert_eq!(value, Some(Value::Boolean(false)));
        assert!(f.ctx.drain_stderr().contains("'nobody' is not online"));
    }

    #[test]
    fn test_broadcast() {
        let f = fixture();
        let alice = f.server.join("Alice");
        let bob = f.server.join("Bob");

        eval(&f, "server.broadcastMessage('restart soon')");

        assert_eq!(alice.take_messages(), vec!["restart soon"]);
        assert_eq!(bob.take_messages(), vec!["restart soon"]);
    }

    #[test]
    fn test_set_player_gamemode() {
        let f = fixture();
        let alice = f.server.join("Alice");

        let value = eval(&f, "return server.setPlayerGamemode('Alice', 'CREATIVE')");

        assert_eq!(value, Some(Value::Boolean(true)));
        assert_eq!(alice.game_mode(), GameMode::Creative);
        assert_eq!(
            alice.take_messages(),
            vec!["Your gamemode has been set to creative."]
        );
    }

    #[test]
    fn test_set_player_gamemode_invalid_mode() {
        let f = fixture();
        let alice = f.server.join("Alice");

        let value = eval(&f, "return server.setPlayerGamemode('Alice', 'hardcore')");

        assert_eq!(value, Some(Value::Boolean(false)));
        assert_eq!(alice.game_mode(), GameMode::Survival);
        assert!(f
            .ctx
            .drain_stderr()
            .contains("Invalid game mode 'hardcore'. Valid modes are: survival, creative, adventure, spectator."));
    }

    #[test]
    fn test_set_player_gamemode_bad_arguments_return_false() {
        let f = fixture();
        let alice = f.server.join("Alice");

        for call in [
            "server.setPlayerGamemode('Alice', nil)",
            "server.setPlayerGamemode(nil, 'creative')",
            "server.setPlayerGamemode('Alice', {})",
        ] {
            let value = eval(&f, &format!("local ok = {call}; return tostring(ok) .. ' after'"))
                .unwrap_or_else(|| panic!("{call} did not finish"));
            assert_eq!(f.ctx.render(value).unwrap(), "false after");
            assert!(f
                .ctx
                .drain_stderr()
                .contains("Invalid arguments for setPlayerGamemode"));
        }
        assert_eq!(alice.game_mode(), GameMode::Survival);
    }

    #[test]
    fn test_send_message_nil_player_returns_false() {
        let f = fixture();

        let value = eval(&f, "return server.sendMessage(nil, 'hi')");

        assert_eq!(value, Some(Value::Boolean(false)));
        assert!(f.ctx.drain_stderr().contains("Invalid arguments for sendMessage"));
    }

    #[test]
    fn test_online_players() {
        let f = fixture();
        f.server.join("Bob");
        f.server.join("Alice");

        let value = eval(
            &f,
            "local names = {} for _, p in ipairs(server.onlinePlayers()) do names[#names + 1] = p.name end return table.concat(names, ',')",
        );
        assert_eq!(f.ctx.render(value.unwrap()).unwrap(), "Alice,Bob");
    }

    #[test]
    fn test_isolated_register_command_not_in_host() {
        let f = fixture();
        let value = eval(
            &f,
            "return server.registerCommand({ name = 'hello', syntaxes = { { handler = function() end } } })",
        );

        assert_eq!(value, Some(Value::Boolean(true)));
        assert!(!f.server.commands().names().contains(&"hello".to_string()));
    }

    #[test]
    fn test_teardown_clears_registries() {
        let mut f = fixture();
        eval(&f, "server.on('playerLeave', function() end)");
        assert_eq!(f.ctx.state().listeners.borrow().total(), 1);

        f.ctx.state().teardown();
        assert_eq!(f.ctx.state().listeners.borrow().total(), 0);
        f.ctx.close();
    }

    #[test]
    fn test_custom_global_name() {
        let dir = TempDir::new().unwrap();
        let server = LocalServer::new();
        let overlay = FsOverlay::new(dir.path(), OverrideMap::new()).unwrap();
        let limits = ScriptLimits {
            global_name: "host".to_string(),
            ..ScriptLimits::default()
        };
        let ctx = ScriptContext::new(HostBridge::isolated(server.services()), overlay, &limits).unwrap();

        assert_eq!(
            ctx.evaluate_inline("return server == nil and type(host.on) == 'function'")
                .unwrap(),
            Some(Value::Boolean(true))
        );
    }
}
