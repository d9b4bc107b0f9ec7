//! Host-side collaborators consumed by the scripting core.
//!
//! The core never owns the game world, the network layer or the tick loop.
//! It talks to them through the traits in this module, and only ever reads
//! native objects while building data snapshots for scripts.

pub mod local;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

/// A point in a world.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Integer block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Player game mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameMode {
    #[default]
    Survival,
    Creative,
    Adventure,
    Spectator,
}

impl GameMode {
    /// Lowercase name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Survival => "survival",
            GameMode::Creative => "creative",
            GameMode::Adventure => "adventure",
            GameMode::Spectator => "spectator",
        }
    }

    /// Upper-case name as shown to players.
    pub fn display_name(&self) -> &'static str {
        match self {
            GameMode::Survival => "SURVIVAL",
            GameMode::Creative => "CREATIVE",
            GameMode::Adventure => "ADVENTURE",
            GameMode::Spectator => "SPECTATOR",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "survival" => Ok(GameMode::Survival),
            "creative" => Ok(GameMode::Creative),
            "adventure" => Ok(GameMode::Adventure),
            "spectator" => Ok(GameMode::Spectator),
            _ => Err(format!("unknown game mode: {s}")),
        }
    }
}

/// A world (instance) that scripts may modify through a snapshot.
pub trait HostWorld: Send + Sync {
    /// World name, for logs.
    fn name(&self) -> String;

    /// Place a block by namespaced id.
    fn set_block(&self, x: i32, y: i32, z: i32, block_id: &str) -> Result<(), String>;
}

/// A connected player as the host sees it.
pub trait HostPlayer: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> String;
    fn position(&self) -> Position;
    fn send_message(&self, text: &str);
    fn set_game_mode(&self, mode: GameMode);
    /// The world the player is currently in, if any.
    fn world(&self) -> Option<Arc<dyn HostWorld>>;
}

/// Lookup of online players.
pub trait PlayerDirectory: Send + Sync {
    fn lookup_by_id(&self, id: Uuid) -> Option<Arc<dyn HostPlayer>>;
    fn lookup_by_name(&self, name: &str) -> Option<Arc<dyn HostPlayer>>;
    fn all_online(&self) -> Vec<Arc<dyn HostPlayer>>;

    /// Send a message to every online player.
    fn broadcast(&self, text: &str) {
        for player in self.all_online() {
            player.send_message(text);
        }
    }
}

/// Work handed to the host scheduler.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// The host's tick scheduler.
pub trait TickScheduler: Send + Sync {
    /// Run `task` after `delay_ticks` ticks on a host thread.
    fn schedule_task(&self, delay_ticks: u64, task: ScheduledTask);
}

/// Whoever issued a command: a player or the console.
pub trait CommandSource: Send + Sync {
    fn name(&self) -> String;
    fn send_message(&self, text: &str);
    /// Set when the source is a player.
    fn player_id(&self) -> Option<Uuid>;
}

/// Native argument parsers understood by the host command table.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentParser {
    String,
    Word,
    GreedyString,
    Integer { min: Option<i64>, max: Option<i64> },
    Long { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Double { min: Option<f64>, max: Option<f64> },
    Boolean,
    /// Entity selector; `players_only` narrows the result to players.
    Entity { single: bool, players_only: bool },
    Uuid,
    Enum(Vec<String>),
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

impl ArgumentParser {
    /// Placeholder shown in usage messages.
    pub fn placeholder(&self, name: &str) -> String {
        match self {
            ArgumentParser::Enum(values) => format!("<{}>", values.join("|")),
            ArgumentParser::GreedyString | ArgumentParser::Command | ArgumentParser::Component => {
                format!("<{name}...>")
            }
            _ => format!("<{name}>"),
        }
    }
}

/// A parsed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Uuid(Uuid),
    /// Player selector result.
    Players(Vec<Uuid>),
    /// Entity selector result.
    Entities(Vec<Uuid>),
    /// Two or three components: `[x, z]` or `[x, y, z]`.
    Coordinates(Vec<f64>),
    /// `#rrggbb` or a named color.
    Color(String),
    /// Duration in ticks.
    Ticks(i64),
}

/// Arguments of one command invocation, by declared name.
#[derive(Debug, Clone, Default)]
pub struct ParsedArguments {
    values: HashMap<String, ArgValue>,
}

impl ParsedArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Runs a command once the host has parsed its arguments.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, sender: Arc<dyn CommandSource>, args: ParsedArguments);
}

/// One argument layout of a command.
#[derive(Clone)]
pub struct HostSyntax {
    pub arguments: Vec<(String, ArgumentParser)>,
    pub executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for HostSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSyntax")
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// A command ready to be placed into the host command table.
#[derive(Clone, Debug)]
pub struct HostCommand {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub syntaxes: Vec<HostSyntax>,
    /// Runs when the command is invoked without arguments.
    pub default_executor: Option<HostSyntax>,
}

impl HostCommand {
    /// One usage line per syntax.
    pub fn usage(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.default_executor.is_some() {
            lines.push(format!("/{}", self.name));
        }
        for syntax in &self.syntaxes {
            let args: Vec<String> = syntax
                .arguments
                .iter()
                .map(|(name, parser)| parser.placeholder(name))
                .collect();
            lines.push(format!("/{} {}", self.name, args.join(" ")));
        }
        lines
    }
}

/// The host's command registry.
pub trait CommandTable: Send + Sync {
    /// Register a command; returns `true` when an existing one was replaced.
    fn register(&self, command: HostCommand) -> bool;
    /// Remove a command; returns `true` when it existed.
    fn unregister(&self, name: &str) -> bool;
    fn contains(&self, name: &str) -> bool;
}

/// Bundle of host collaborators handed to the scripting core.
#[derive(Clone)]
pub struct HostServices {
    pub scheduler: Arc<dyn TickScheduler>,
    pub commands: Arc<dyn CommandTable>,
    pub players: Arc<dyn PlayerDirectory>,
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}
