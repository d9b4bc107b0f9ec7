//! Script-declared commands.
//!
//! A definition table from `server.registerCommand` is validated, decoded
//! and turned into a [`HostCommand`]. Host invocations come back through the
//! script thread's inbox and are handed to the Lua handler together with a
//! sender proxy and an argument accessor.

use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;

use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Table, Value};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bridge::{diagnostic, identifier_arg, method_args, set_player_gamemode, text_arg, BridgeMode, ScriptState};
use super::engine::{ContextId, ScriptContext};
use super::runtime::RuntimeHandle;
use crate::host::{
    ArgValue, ArgumentParser, CommandExecutor, CommandSource, HostCommand, HostSyntax,
    ParsedArguments,
};
use crate::Result;

/// Argument types a script may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    String,
    Word,
    GreedyString,
    Integer,
    Float,
    Double,
    Long,
    Boolean,
    Player,
    Entity,
    Uuid,
    Enum,
    Command,
    Component,
    ItemStack,
    BlockPosition,
    Vec2,
    Vec3,
    Color,
    Time,
    ResourceLocation,
}

impl FromStr for ArgumentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().as_str() {
            "string" => ArgumentKind::String,
            "word" => ArgumentKind::Word,
            "greedystring" => ArgumentKind::GreedyString,
            "integer" => ArgumentKind::Integer,
            "float" => ArgumentKind::Float,
            "double" => ArgumentKind::Double,
            "long" => ArgumentKind::Long,
            "boolean" => ArgumentKind::Boolean,
            "player" => ArgumentKind::Player,
            "entity" => ArgumentKind::Entity,
            "uuid" => ArgumentKind::Uuid,
            "enum" => ArgumentKind::Enum,
            "command" => ArgumentKind::Command,
            "component" => ArgumentKind::Component,
            "itemstack" => ArgumentKind::ItemStack,
            "blockposition" => ArgumentKind::BlockPosition,
            "vec2" => ArgumentKind::Vec2,
            "vec3" => ArgumentKind::Vec3,
            "color" => ArgumentKind::Color,
            "time" => ArgumentKind::Time,
            "resourcelocation" => ArgumentKind::ResourceLocation,
            _ => return Err(format!("unsupported argument type '{s}'")),
        };
        Ok(kind)
    }
}

/// One entry of a syntax's `arguments` array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentDecl {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub enum_values: Vec<String>,
    pub single_only: Option<bool>,
    pub players_only: Option<bool>,
}

impl ArgumentDecl {
    /// Translate into the host parser.
    pub fn to_parser(&self) -> std::result::Result<ArgumentParser, String> {
        if self.name.trim().is_empty() {
            return Err("argument name is required".to_string());
        }
        let kind: ArgumentKind = self.kind.parse()?;
        let int_bound = |v: Option<f64>| v.map(|v| v as i64);

        let parser = match kind {
            ArgumentKind::String => ArgumentParser::String,
            ArgumentKind::Word => ArgumentParser::Word,
            ArgumentKind::GreedyString => ArgumentParser::GreedyString,
            ArgumentKind::Integer => ArgumentParser::Integer {
                min: int_bound(self.min),
                max: int_bound(self.max),
            },
            ArgumentKind::Long => ArgumentParser::Long {
                min: int_bound(self.min),
                max: int_bound(self.max),
            },
            ArgumentKind::Float => ArgumentParser::Float {
                min: self.min,
                max: self.max,
            },
            ArgumentKind::Double => ArgumentParser::Double {
                min: self.min,
                max: self.max,
            },
            ArgumentKind::Boolean => ArgumentParser::Boolean,
            ArgumentKind::Player => ArgumentParser::Entity {
                single: self.single_only.unwrap_or(true),
                players_only: true,
            },
            ArgumentKind::Entity => ArgumentParser::Entity {
                single: self.single_only.unwrap_or(true),
                players_only: self.players_only.unwrap_or(false),
            },
            ArgumentKind::Uuid => ArgumentParser::Uuid,
            ArgumentKind::Enum => {
                if self.enum_values.is_empty() {
                    return Err(format!(
                        "enum argument '{}' requires an 'enumValues' array",
                        self.name
                    ));
                }
                ArgumentParser::Enum(self.enum_values.clone())
            }
            ArgumentKind::Command => ArgumentParser::Command,
            ArgumentKind::Component => ArgumentParser::Component,
            ArgumentKind::ItemStack => ArgumentParser::ItemStack,
            ArgumentKind::BlockPosition => ArgumentParser::BlockPosition,
            ArgumentKind::Vec2 => ArgumentParser::Vec2,
            ArgumentKind::Vec3 => ArgumentParser::Vec3,
            ArgumentKind::Color => ArgumentParser::Color,
            ArgumentKind::Time => ArgumentParser::Time,
            ArgumentKind::ResourceLocation => ArgumentParser::ResourceLocation,
        };
        Ok(parser)
    }
}

/// A handler and its declared argument layout.
#[derive(Clone)]
pub(crate) struct RegisteredSyntax {
    pub handler: Function,
    pub arguments: Vec<(String, ArgumentParser)>,
}

/// Commands registered by one context.
#[derive(Default)]
pub(crate) struct RegisteredCommandSet {
    commands: HashMap<String, Vec<RegisteredSyntax>>,
}

impl RegisteredCommandSet {
    pub fn insert(&mut self, name: &str, syntaxes: Vec<RegisteredSyntax>) {
        self.commands.insert(name.to_string(), syntaxes);
    }

    pub fn syntax(&self, name: &str, index: usize) -> Option<RegisteredSyntax> {
        self.commands.get(name)?.get(index).cloned()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Remove everything, returning the command names.
    pub fn drain(&mut self) -> Vec<String> {
        self.commands.drain().map(|(name, _)| name).collect()
    }
}

/// A host invocation on its way to the script thread.
pub(crate) struct CommandInvocation {
    pub context_id: ContextId,
    pub command: String,
    pub syntax: usize,
    pub sender: Arc<dyn CommandSource>,
    pub args: ParsedArguments,
}

/// Host-side executor for one syntax of a script command.
struct ScriptCommandExecutor {
    runtime: RuntimeHandle,
    context_id: ContextId,
    command: String,
    syntax: usize,
}

impl CommandExecutor for ScriptCommandExecutor {
    fn execute(&self, sender: Arc<dyn CommandSource>, args: ParsedArguments) {
        self.runtime.invoke_command(CommandInvocation {
            context_id: self.context_id,
            command: self.command.clone(),
            syntax: self.syntax,
            sender,
            args,
        });
    }
}

/// `server.registerCommand(definition)`. Returns whether anything was registered.
pub(crate) fn register(lua: &Lua, state: &Rc<ScriptState>, definition: Value) -> bool {
    let Value::Table(definition) = definition else {
        warn!(script = %state.script_name, "command definition must be a table");
        return false;
    };

    let name = definition
        .get::<Option<String>>("name")
        .ok()
        .flatten()
        .map(|n| n.trim().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        warn!(script = %state.script_name, "command name is required in definition");
        return false;
    }

    let syntaxes = match definition.get::<Option<Table>>("syntaxes") {
        Ok(Some(t)) if t.raw_len() > 0 => t,
        _ => {
            warn!(script = %state.script_name, command = %name, "command must have at least one syntax defined");
            return false;
        }
    };

    let registered = decode_syntaxes(lua, state, &name, &syntaxes);
    if registered.is_empty() {
        warn!(script = %state.script_name, command = %name, "no valid syntax; command not registered");
        return false;
    }

    let aliases = definition
        .get::<Option<Vec<String>>>("aliases")
        .ok()
        .flatten()
        .unwrap_or_default();
    let description = definition
        .get::<Option<String>>("description")
        .ok()
        .flatten();

    if let BridgeMode::Active(runtime) = &state.mode {
        let command = build_host_command(runtime, state.id, &name, aliases, description, &registered);
        if state.services.commands.contains(&name) {
            warn!(
                script = %state.script_name,
                command = %name,
                "Command '{name}' is already registered. It will be overwritten by the script."
            );
        }
        state.services.commands.register(command);
        info!(script = %state.script_name, command = %name, syntaxes = registered.len(), "registered dynamic command");
    } else {
        debug!(script = %state.script_name, command = %name, "command recorded in isolated context");
    }

    state.commands.borrow_mut().insert(&name, registered);
    true
}

fn decode_syntaxes(lua: &Lua, state: &ScriptState, name: &str, syntaxes: &Table) -> Vec<RegisteredSyntax> {
    let mut registered = Vec::new();

    for (i, syntax) in syntaxes.clone().sequence_values::<Value>().enumerate() {
        let Ok(Value::Table(syntax)) = syntax else {
            warn!(script = %state.script_name, command = %name, "syntax {i} is not a table; skipping");
            continue;
        };
        let Ok(Some(handler)) = syntax.get::<Option<Function>>("handler") else {
            warn!(
                script = %state.script_name,
                command = %name,
                "Syntax {i} for command '{name}' is missing a valid handler function."
            );
            continue;
        };

        match decode_arguments(lua, &syntax) {
            Ok(arguments) => registered.push(RegisteredSyntax { handler, arguments }),
            Err(reason) => {
                warn!(script = %state.script_name, command = %name, "syntax {i} skipped: {reason}");
            }
        }
    }

    registered
}

fn decode_arguments(lua: &Lua, syntax: &Table) -> std::result::Result<Vec<(String, ArgumentParser)>, String> {
    let arguments = match syntax.get::<Option<Table>>("arguments") {
        Ok(Some(t)) => t,
        Ok(None) => return Ok(Vec::new()),
        Err(e) => return Err(format!("'arguments' must be an array: {e}")),
    };

    let mut decoded = Vec::new();
    for (j, value) in arguments.sequence_values::<Value>().enumerate() {
        let value = value.map_err(|e| format!("argument {j}: {e}"))?;
        let decl: ArgumentDecl = lua
            .from_value(value)
            .map_err(|e| format!("argument {j} could not be decoded: {e}"))?;
        let parser = decl
            .to_parser()
            .map_err(|e| format!("argument {j} ('{}'): {e}", decl.name))?;
        decoded.push((decl.name, parser));
    }
    Ok(decoded)
}

fn build_host_command(
    runtime: &RuntimeHandle,
    context_id: ContextId,
    name: &str,
    aliases: Vec<String>,
    description: Option<String>,
    registered: &[RegisteredSyntax],
) -> HostCommand {
    let mut command = HostCommand {
        name: name.to_string(),
        aliases,
        description,
        syntaxes: Vec::new(),
        default_executor: None,
    };

    for (index, syntax) in registered.iter().enumerate() {
        let host_syntax = HostSyntax {
            arguments: syntax.arguments.clone(),
            executor: Arc::new(ScriptCommandExecutor {
                runtime: runtime.clone(),
                context_id,
                command: name.to_string(),
                syntax: index,
            }),
        };
        if host_syntax.arguments.is_empty() {
            if command.default_executor.is_none() {
                command.default_executor = Some(host_syntax);
            } else {
                warn!(command = %name, "syntax {index} duplicates the no-argument syntax; ignored");
            }
        } else {
            command.syntaxes.push(host_syntax);
        }
    }

    command
}

/// Run a command handler in `ctx`.
pub(crate) fn invoke(ctx: &ScriptContext, invocation: CommandInvocation) -> Result<()> {
    let CommandInvocation {
        command,
        syntax,
        sender,
        args,
        ..
    } = invocation;

    let Some(registered) = ctx.state().commands.borrow().syntax(&command, syntax) else {
        sender.send_message(&format!(
            "Error: Scripting engine is not ready for command {command}"
        ));
        return Ok(());
    };

    let lua = ctx.lua()?;
    let sender_proxy = sender_table(lua, &sender)?;
    let context_proxy = context_table(lua, ctx.state(), args, registered.arguments)?;

    let outcome = ctx.call(&registered.handler, (sender_proxy, context_proxy));

    let stdout = ctx.drain_stdout();
    if !stdout.is_empty() {
        info!(script = %ctx.script_name(), command = %command, "stdout: {}", stdout.trim_end());
    }
    let stderr = ctx.drain_stderr();
    if !stderr.is_empty() {
        warn!(script = %ctx.script_name(), command = %command, "stderr: {}", stderr.trim_end());
        let first = stderr.lines().next().unwrap_or("Unknown error");
        sender.send_message(&format!("Script Error (see console): {first}"));
    }

    if let Err(e) = outcome {
        warn!(script = %ctx.script_name(), command = %command, "error executing command handler: {e}");
        sender.send_message(&format!("Internal error executing command {command}"));
    }
    Ok(())
}

/// `{name, sendMessage, isPlayer, uuid}` for whoever issued the command.
fn sender_table(lua: &Lua, sender: &Arc<dyn CommandSource>) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let player_id = sender.player_id();
    table.set("name", if player_id.is_some() { sender.name() } else { "CONSOLE".to_string() })?;
    table.set("uuid", player_id.map(|id| id.to_string()))?;

    let send_to = Arc::clone(sender);
    table.set(
        "sendMessage",
        lua.create_function(move |lua, args: MultiValue| {
            let text: Value = lua.unpack_multi(method_args(args, 1))?;
            send_to.send_message(&text_arg(lua, text)?);
            Ok(())
        })?,
    )?;

    let is_player = player_id.is_some();
    table.set("isPlayer", lua.create_function(move |_, _: MultiValue| Ok(is_player))?)?;
    Ok(table)
}

/// Argument accessor exposing `get(name)`.
fn context_table(
    lua: &Lua,
    state: &Rc<ScriptState>,
    args: ParsedArguments,
    declared: Vec<(String, ArgumentParser)>,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let state = Rc::clone(state);
    let parsers: HashMap<String, ArgumentParser> = declared.into_iter().collect();

    table.set(
        "get",
        lua.create_function(move |lua, call_args: MultiValue| {
            let name: String = lua.unpack_multi(method_args(call_args, 1))?;
            match args.get(&name) {
                Some(value) => arg_to_lua(lua, &state, value, parsers.get(&name)),
                None => Ok(Value::Nil),
            }
        })?,
    )?;
    Ok(table)
}

fn is_single(parser: Option<&ArgumentParser>) -> bool {
    matches!(parser, Some(ArgumentParser::Entity { single: true, .. }))
}

fn arg_to_lua(
    lua: &Lua,
    state: &Rc<ScriptState>,
    value: &ArgValue,
    parser: Option<&ArgumentParser>,
) -> mlua::Result<Value> {
    let value = match value {
        ArgValue::Text(s) | ArgValue::Color(s) => Value::String(lua.create_string(s)?),
        ArgValue::Integer(n) | ArgValue::Ticks(n) => Value::Integer(*n),
        ArgValue::Float(f) => Value::Number(*f),
        ArgValue::Boolean(b) => Value::Boolean(*b),
        ArgValue::Uuid(id) => Value::String(lua.create_string(id.to_string())?),
        ArgValue::Coordinates(c) => {
            let table = lua.create_table()?;
            match c.as_slice() {
                [x, z] => {
                    table.set("x", *x)?;
                    table.set("z", *z)?;
                }
                [x, y, z, ..] => {
                    table.set("x", *x)?;
                    table.set("y", *y)?;
                    table.set("z", *z)?;
                }
                _ => {}
            }
            Value::Table(table)
        }
        ArgValue::Players(ids) => {
            if is_single(parser) {
                match ids.first() {
                    Some(id) => player_proxy(lua, state, *id)?,
                    None => Value::Nil,
                }
            } else {
                let list = lua.create_table()?;
                for id in ids {
                    list.raw_push(player_proxy(lua, state, *id)?)?;
                }
                Value::Table(list)
            }
        }
        ArgValue::Entities(ids) => {
            let entity = |id: &Uuid| -> mlua::Result<Table> {
                let t = lua.create_table()?;
                t.set("uuid", id.to_string())?;
                Ok(t)
            };
            if is_single(parser) {
                match ids.first() {
                    Some(id) => Value::Table(entity(id)?),
                    None => Value::Nil,
                }
            } else {
                let list = lua.create_table()?;
                for id in ids {
                    list.raw_push(entity(id)?)?;
                }
                Value::Table(list)
            }
        }
    };
    Ok(value)
}

/// `{name, uuid, sendMessage, setGameMode}` for a player argument.
fn player_proxy(lua: &Lua, state: &Rc<ScriptState>, id: Uuid) -> mlua::Result<Value> {
    let Some(player) = state.services.players.lookup_by_id(id) else {
        return Ok(Value::Nil);
    };
    let table = lua.create_table()?;
    table.set("name", player.name())?;
    table.set("uuid", id.to_string())?;

    let send_state = Rc::clone(state);
    table.set(
        "sendMessage",
        lua.create_function(move |lua, args: MultiValue| {
            let text: Value = lua.unpack_multi(method_args(args, 1))?;
            let text = text_arg(lua, text)?;
            if let Some(p) = send_state.services.players.lookup_by_id(id) {
                p.send_message(&text);
            }
            Ok(())
        })?,
    )?;

    let mode_state = Rc::clone(state);
    table.set(
        "setGameMode",
        lua.create_function(move |lua, args: MultiValue| {
            let mode: Value = lua.unpack_multi(method_args(args, 1))?;
            let Some(mode) = identifier_arg(&mode) else {
                diagnostic(&mode_state, "Invalid arguments for setGameMode. Expected (gameMode).");
                return Ok(false);
            };
            Ok(set_player_gamemode(&mode_state, &id.to_string(), &mode))
        })?,
    )?;

    Ok(Value::Table(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::local::{ConsoleSource, LocalServer, PlayerSource};
    use crate::host::{GameMode, HostPlayer};
    use crate::script::bridge::HostBridge;
    use crate::script::engine::ScriptLimits;
    use crate::vfs::{FsOverlay, OverrideMap};
    use tempfile::TempDir;

    fn context(server: &LocalServer, dir: &TempDir) -> ScriptContext {
        let overlay = FsOverlay::new(dir.path(), OverrideMap::new()).unwrap();
        ScriptContext::new(
            HostBridge::isolated(server.services()),
            overlay,
            &ScriptLimits::default(),
        )
        .unwrap()
    }

    fn registered(ctx: &ScriptContext, code: &str) -> bool {
        match ctx.evaluate_inline(code).unwrap() {
            Some(Value::Boolean(b)) => b,
            other => panic!("unexpected result {other:?}: {}", ctx.drain_stderr()),
        }
    }

    fn invocation(ctx: &ScriptContext, command: &str, syntax: usize, sender: Arc<dyn CommandSource>, args: ParsedArguments) -> CommandInvocation {
        CommandInvocation {
            context_id: ctx.id(),
            command: command.to_string(),
            syntax,
            sender,
            args,
        }
    }

    #[test]
    fn test_argument_kind_parse() {
        assert_eq!("GreedyString".parse::<ArgumentKind>(), Ok(ArgumentKind::GreedyString));
        assert_eq!("resourcelocation".parse::<ArgumentKind>(), Ok(ArgumentKind::ResourceLocation));
        assert_eq!("PLAYER".parse::<ArgumentKind>(), Ok(ArgumentKind::Player));
        assert!("banana".parse::<ArgumentKind>().is_err());
    }

    #[test]
    fn test_player_and_entity_defaults() {
        let player = ArgumentDecl {
            name: "target".into(),
            kind: "player".into(),
            ..Default::default()
        };
        assert_eq!(
            player.to_parser(),
            Ok(ArgumentParser::Entity {
                single: true,
                players_only: true
            })
        );

        let entities = ArgumentDecl {
            name: "targets".into(),
            kind: "entity".into(),
            single_only: Some(false),
            ..Default::default()
        };
        assert_eq!(
            entities.to_parser(),
            Ok(ArgumentParser::Entity {
                single: false,
                players_only: false
            })
        );
    }

    #[test]
    fn test_numeric_bounds() {
        let decl = ArgumentDecl {
            name: "count".into(),
            kind: "integer".into(),
            min: Some(1.0),
            max: Some(64.0),
            ..Default::default()
        };
        assert_eq!(
            decl.to_parser(),
            Ok(ArgumentParser::Integer {
                min: Some(1),
                max: Some(64)
            })
        );
    }

    #[test]
    fn test_invalid_declarations() {
        let no_values = ArgumentDecl {
            name: "mode".into(),
            kind: "enum".into(),
            ..Default::default()
        };
        assert!(no_values.to_parser().is_err());

        let nameless = ArgumentDecl {
            kind: "word".into(),
            ..Default::default()
        };
        assert!(nameless.to_parser().is_err());

        let unknown = ArgumentDecl {
            name: "x".into(),
            kind: "quaternion".into(),
            ..Default::default()
        };
        assert!(unknown.to_parser().is_err());
    }

    #[test]
    fn test_register_validation() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);

        assert!(!registered(&ctx, "return server.registerCommand('nope')"));
        assert!(!registered(&ctx, "return server.registerCommand({ name = '  ', syntaxes = { { handler = print } } })"));
        assert!(!registered(&ctx, "return server.registerCommand({ name = 'a', syntaxes = {} })"));
        assert!(!registered(&ctx, "return server.registerCommand({ name = 'a', syntaxes = { { } } })"));
        assert!(!registered(
            &ctx,
            "return server.registerCommand({ name = 'a', syntaxes = { { handler = print, arguments = { { name = 'x', type = 'bogus' } } } } })"
        ));
        assert_eq!(ctx.state().commands.borrow().len(), 0);
    }

    #[test]
    fn test_register_skips_bad_syntax_keeps_good() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);

        assert!(registered(
            &ctx,
            r#"return server:registerCommand({
                name = "give",
                syntaxes = {
                    { arguments = { { name = "n", type = "integer" } } },
                    { handler = function() end, arguments = { { name = "n", type = "integer", min = 1 } } },
                },
            })"#
        ));
        let commands = ctx.state().commands.borrow();
        let syntax = commands.syntax("give", 0).unwrap();
        assert_eq!(
            syntax.arguments,
            vec![(
                "n".to_string(),
                ArgumentParser::Integer {
                    min: Some(1),
                    max: None
                }
            )]
        );
        assert!(commands.syntax("give", 1).is_none());
    }

    #[test]
    fn test_invoke_with_console_sender() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);

        registered(
            &ctx,
            r#"return server.registerCommand({
                name = "whoami",
                syntaxes = { { handler = function(sender, ctx)
                    sender:sendMessage(sender.name .. " " .. tostring(sender:isPlayer()) .. " " .. tostring(sender.uuid))
                end } },
            })"#,
        );

        let console = Arc::new(ConsoleSource::new());
        invoke(&ctx, invocation(&ctx, "whoami", 0, console.clone(), ParsedArguments::new())).unwrap();

        assert_eq!(console.take_messages(), vec!["CONSOLE false nil"]);
    }

    #[test]
    fn test_invoke_with_player_argument() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);
        let alice = server.join("Alice");
        let bob = server.join("Bob");

        registered(
            &ctx,
            r#"return server.registerCommand({
                name = "creative",
                syntaxes = { {
                    arguments = { { name = "target", type = "player" }, { name = "note", type = "greedystring" } },
                    handler = function(sender, ctx)
                        local target = ctx:get("target")
                        target.setGameMode("creative")
                        target.sendMessage(ctx.get("note"))
                        sender.sendMessage("done for " .. target.name)
                    end,
                } },
            })"#,
        );

        let mut args = ParsedArguments::new();
        args.insert("target", ArgValue::Players(vec![bob.id()]));
        args.insert("note", ArgValue::Text("have fun".into()));
        let sender: Arc<dyn CommandSource> = Arc::new(PlayerSource(alice.clone()));
        invoke(&ctx, invocation(&ctx, "creative", 0, sender, args)).unwrap();

        assert_eq!(bob.game_mode(), GameMode::Creative);
        assert_eq!(
            bob.take_messages(),
            vec!["Your gamemode has been set to creative.", "have fun"]
        );
        assert_eq!(alice.take_messages(), vec!["done for Bob"]);
    }

    #[test]
    fn test_invoke_multi_player_and_coordinates() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);
        let alice = server.join("Alice");
        let bob = server.join("Bob");

        registered(
            &ctx,
            r#"return server.registerCommand({
                name = "tp",
                syntaxes = { {
                    arguments = {
                        { name = "who", type = "player", singleOnly = false },
                        { name = "where", type = "vec3" },
                    },
                    handler = function(sender, ctx)
                        local names = {}
                        for _, p in ipairs(ctx.get("who")) do names[#names + 1] = p.name end
                        local w = ctx.get("where")
                        sender.sendMessage(table.concat(names, ",") .. " -> " .. w.x .. " " .. w.y .. " " .. w.z)
                    end,
                } },
            })"#,
        );

        let mut args = ParsedArguments::new();
        args.insert("who", ArgValue::Players(vec![alice.id(), bob.id()]));
        args.insert("where", ArgValue::Coordinates(vec![1.0, 2.5, 3.0]));
        let console = Arc::new(ConsoleSource::new());
        invoke(&ctx, invocation(&ctx, "tp", 0, console.clone(), args)).unwrap();

        assert_eq!(console.take_messages(), vec!["Alice,Bob -> 1.0 2.5 3.0"]);
    }

    #[test]
    fn test_invoke_handler_error() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);

        registered(
            &ctx,
            r#"return server.registerCommand({
                name = "explode",
                syntaxes = { { handler = function() error("kaboom") end } },
            })"#,
        );

        let console = Arc::new(ConsoleSource::new());
        invoke(&ctx, invocation(&ctx, "explode", 0, console.clone(), ParsedArguments::new())).unwrap();

        assert_eq!(
            console.take_messages(),
            vec!["Internal error executing command explode"]
        );
    }

    #[test]
    fn test_invoke_reports_stderr_first_line() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);

        registered(
            &ctx,
            r#"return server.registerCommand({
                name = "grumble",
                syntaxes = { { handler = function() warn("first"); warn("second") end } },
            })"#,
        );

        let console = Arc::new(ConsoleSource::new());
        invoke(&ctx, invocation(&ctx, "grumble", 0, console.clone(), ParsedArguments::new())).unwrap();

        assert_eq!(
            console.take_messages(),
            vec!["Script Error (see console): first"]
        );
    }

    #[test]
    fn test_invoke_unknown_command() {
        let server = LocalServer::new();
        let dir = TempDir::new().unwrap();
        let ctx = context(&server, &dir);

        let console = Arc::new(ConsoleSource::new());
        invoke(&ctx, invocation(&ctx, "ghost", 0, console.clone(), ParsedArguments::new())).unwrap();

        assert_eq!(
            console.take_messages(),
            vec!["Error: Scripting engine is not ready for command ghost"]
        );
    }
}
