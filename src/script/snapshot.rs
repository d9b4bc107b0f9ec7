//! Plain-data event snapshots and their Lua views.
//!
//! Host objects are read once, on the host thread, when a snapshot is built.
//! The Lua tables produced from a snapshot carry copies of that data plus
//! functions that look the player up again by id when called.

use std::rc::Rc;

use mlua::{Lua, MultiValue, Table, Value};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::bridge::{diagnostic, identifier_arg, method_args, text_arg, ScriptState};
use crate::host::{BlockPos, GameMode, HostPlayer, Position};

/// Which hand triggered an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hand {
    Main,
    Off,
}

impl Hand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hand::Main => "main_hand",
            Hand::Off => "off_hand",
        }
    }
}

/// Whether world functions on a player view do anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldAccess {
    Live,
    /// The player is leaving; world functions are no-ops.
    Detached,
}

/// A player as seen at event time.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub id: Uuid,
    pub name: String,
    pub position: Position,
    pub world: WorldAccess,
}

impl PlayerSnapshot {
    pub fn capture(player: &dyn HostPlayer, world: WorldAccess) -> Self {
        Self {
            id: player.id(),
            name: player.name(),
            position: player.position(),
            world,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSnapshot {
    pub player: PlayerSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveSnapshot {
    pub player: PlayerSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveSnapshot {
    pub player: PlayerSnapshot,
    /// Destination of the move.
    pub position: Position,
    pub on_ground: bool,
}

/// The block that was interacted with.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSnapshot {
    pub pos: BlockPos,
    /// Path part of the block id (`stone`).
    pub id: String,
    /// Full namespaced id (`minecraft:stone`).
    pub namespace_id: String,
}

impl BlockSnapshot {
    pub fn new(pos: BlockPos, block_id: &str) -> Self {
        let namespace_id = if block_id.contains(':') {
            block_id.to_string()
        } else {
            format!("minecraft:{block_id}")
        };
        let id = namespace_id
            .split_once(':')
            .map(|(_, path)| path.to_string())
            .unwrap_or_default();
        Self {
            pos,
            id,
            namespace_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractSnapshot {
    pub player: PlayerSnapshot,
    pub block: BlockSnapshot,
    pub hand: Hand,
}

/// Data handed to listeners, one variant per event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventSnapshot {
    Join(JoinSnapshot),
    Leave(LeaveSnapshot),
    Move(MoveSnapshot),
    Interact(InteractSnapshot),
}

impl EventSnapshot {
    pub fn join(player: &dyn HostPlayer) -> Self {
        EventSnapshot::Join(JoinSnapshot {
            player: PlayerSnapshot::capture(player, WorldAccess::Live),
        })
    }

    pub fn leave(player: &dyn HostPlayer) -> Self {
        EventSnapshot::Leave(LeaveSnapshot {
            player: PlayerSnapshot::capture(player, WorldAccess::Detached),
        })
    }

    pub fn moved(player: &dyn HostPlayer, position: Position, on_ground: bool) -> Self {
        EventSnapshot::Move(MoveSnapshot {
            player: PlayerSnapshot::capture(player, WorldAccess::Live),
            position,
            on_ground,
        })
    }

    pub fn interact(player: &dyn HostPlayer, pos: BlockPos, block_id: &str, hand: Hand) -> Self {
        EventSnapshot::Interact(InteractSnapshot {
            player: PlayerSnapshot::capture(player, WorldAccess::Live),
            block: BlockSnapshot::new(pos, block_id),
            hand,
        })
    }

    /// Name listeners register under.
    pub fn event_name(&self) -> &'static str {
        match self {
            EventSnapshot::Join(_) => "playerJoin",
            EventSnapshot::Leave(_) => "playerLeave",
            EventSnapshot::Move(_) => "playerMove",
            EventSnapshot::Interact(_) => "playerBlockInteract",
        }
    }

    pub fn player(&self) -> &PlayerSnapshot {
        match self {
            EventSnapshot::Join(s) => &s.player,
            EventSnapshot::Leave(s) => &s.player,
            EventSnapshot::Move(s) => &s.player,
            EventSnapshot::Interact(s) => &s.player,
        }
    }

    /// Build the listener argument. Called once per listener.
    pub(crate) fn to_lua(&self, lua: &Lua, state: &Rc<ScriptState>) -> mlua::Result<Value> {
        let table = match self {
            EventSnapshot::Join(s) => player_table(lua, state, &s.player)?,
            EventSnapshot::Leave(s) => player_table(lua, state, &s.player)?,
            EventSnapshot::Move(s) => {
                let event = lua.create_table()?;
                event.set("player", player_table(lua, state, &s.player)?)?;
                event.set("position", position_table(lua, s.position)?)?;
                event.set("onGround", s.on_ground)?;
                event
            }
            EventSnapshot::Interact(s) => {
                let block = lua.create_table()?;
                block.set("x", s.block.pos.x)?;
                block.set("y", s.block.pos.y)?;
                block.set("z", s.block.pos.z)?;
                block.set("id", s.block.id.as_str())?;
                block.set("namespaceId", s.block.namespace_id.as_str())?;

                let event = lua.create_table()?;
                event.set("player", player_table(lua, state, &s.player)?)?;
                event.set("block", block)?;
                event.set("hand", s.hand.as_str())?;
                event
            }
        };
        Ok(Value::Table(table))
    }
}

pub(crate) fn position_table(lua: &Lua, position: Position) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("x", position.x)?;
    table.set("y", position.y)?;
    table.set("z", position.z)?;
    Ok(table)
}

/// Player view: identity data plus functions that re-resolve the player.
fn player_table(lua: &Lua, state: &Rc<ScriptState>, snapshot: &PlayerSnapshot) -> mlua::Result<Table> {
    let player = lua.create_table()?;
    player.set("name", snapshot.name.as_str())?;
    player.set("uuid", snapshot.id.to_string())?;

    let id = snapshot.id;

    let send_state = Rc::clone(state);
    player.set(
        "sendMessage",
        lua.create_function(move |lua, args: MultiValue| {
            let text: Value = lua.unpack_multi(method_args(args, 1))?;
            let text = text_arg(lua, text)?;
            match send_state.services.players.lookup_by_id(id) {
                Some(p) => p.send_message(&text),
                None => debug!(script = %send_state.script_name, player = %id, "message to offline player dropped"),
            }
            Ok(())
        })?,
    )?;

    let position_state = Rc::clone(state);
    let fallback = snapshot.position;
    player.set(
        "getPosition",
        lua.create_function(move |lua, _: MultiValue| {
            let position = position_state
                .services
                .players
                .lookup_by_id(id)
                .map_or(fallback, |p| p.position());
            position_table(lua, position)
        })?,
    )?;

    let mode_state = Rc::clone(state);
    player.set(
        "setGameMode",
        lua.create_function(move |lua, args: MultiValue| {
            let mode: Value = lua.unpack_multi(method_args(args, 1))?;
            let Some(mode) = identifier_arg(&mode) else {
                diagnostic(&mode_state, "Invalid arguments for setGameMode. Expected (gameMode).");
                return Ok(false);
            };
            let Ok(mode) = mode.parse::<GameMode>() else {
                diagnostic(
                    &mode_state,
                    &format!("Invalid game mode '{mode}'. Valid modes are: survival, creative, adventure, spectator."),
                );
                return Ok(false);
            };
            match mode_state.services.players.lookup_by_id(id) {
                Some(p) => {
                    p.set_game_mode(mode);
                    Ok(true)
                }
                None => Ok(false),
            }
        })?,
    )?;

    player.set("instance", instance_table(lua, state, id, snapshot.world)?)?;
    Ok(player)
}

fn instance_table(lua: &Lua, state: &Rc<ScriptState>, id: Uuid, access: WorldAccess) -> mlua::Result<Table> {
    let instance = lua.create_table()?;

    if access == WorldAccess::Detached {
        instance.set("sendMessage", lua.create_function(|_, _: MultiValue| Ok(()))?)?;
        instance.set("setBlock", lua.create_function(|_, _: MultiValue| Ok(false))?)?;
        return Ok(instance);
    }

    let send_state = Rc::clone(state);
    instance.set(
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

    let block_state = Rc::clone(state);
    instance.set(
        "setBlock",
        lua.create_function(move |lua, args: MultiValue| {
            let args = method_args(args, 4);
            let Ok((x, y, z, block_id)) = lua.unpack_multi::<(i32, i32, i32, String)>(args) else {
                diagnostic(
                    &block_state,
                    "Invalid arguments for instance.setBlock. Expected (x, y, z, blockId).",
                );
                return Ok(false);
            };
            let world = block_state
                .services
                .players
                .lookup_by_id(id)
                .and_then(|p| p.world());
            let Some(world) = world else {
                diagnostic(&block_state, "Player is not in an instance for setBlock.");
                return Ok(false);
            };
            match world.set_block(x, y, z, &block_id) {
                Ok(()) => Ok(true),
                Err(e) => {
                    diagnostic(&block_state, &format!("setBlock rejected for '{block_id}': {e}"));
                    Ok(false)
                }
            }
        })?,
    )?;

    Ok(instance)
}
