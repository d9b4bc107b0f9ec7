//! Sandboxed Lua scripting for the game server.
//!
//! A [`ScriptManager`] owns one active script on a dedicated thread. Scripts
//! see the host only through the capability table installed by [`bridge`],
//! read files through the [`crate::vfs`] overlay, and receive events as
//! plain-data [`EventSnapshot`]s.

pub mod bridge;
pub mod command;
pub mod deferred;
pub mod engine;
pub mod manager;
pub mod runtime;
pub mod snapshot;

pub use bridge::HostBridge;
pub use command::{ArgumentDecl, ArgumentKind};
pub use deferred::{TaskId, TaskToken};
pub use engine::{ContextId, ExecutionFault, FaultKind, ScriptContext, ScriptLimits};
pub use manager::{AdhocResult, DispatchReport, LifecycleState, LoadReport, ScriptManager};
pub use runtime::RuntimeHandle;
pub use snapshot::{
    BlockSnapshot, EventSnapshot, Hand, InteractSnapshot, JoinSnapshot, LeaveSnapshot,
    MoveSnapshot, PlayerSnapshot, WorldAccess,
};
