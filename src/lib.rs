//! Lodestone - embedded Lua script sandbox for a game server.
//!
//! Loads operator scripts into an isolated Lua context, exposes a narrow set
//! of host capabilities to them, and forwards host events and scheduler
//! ticks into the script.

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod script;
pub mod vfs;

pub use config::{BudgetScope, Config, LoggingConfig, ScriptingConfig, ServerConfig};
pub use error::{Result, SandboxError};
pub use host::{
    ArgValue, ArgumentParser, BlockPos, CommandExecutor, CommandSource, CommandTable, GameMode,
    HostCommand, HostPlayer, HostServices, HostSyntax, HostWorld, ParsedArguments,
    PlayerDirectory, Position, TickScheduler,
};
pub use script::{
    AdhocResult, DispatchReport, EventSnapshot, ExecutionFault, FaultKind, Hand, LifecycleState,
    LoadReport, ScriptContext, ScriptLimits, ScriptManager,
};
pub use vfs::{FsOverlay, OverrideMap};
