//! Armature embeds a kinematics solver behind a flat, handle-based call
//! interface for host scripting environments.
//!
//! The solver itself lives behind the [`SolverEngine`] boundary and keeps
//! exactly one mutable *current environment* at a time; callers address one
//! of many independent environments by opaque handle through a
//! switch-then-operate protocol. What this crate actually implements is the
//! machinery that makes such an engine safe to drive from a host that may
//! call in from several threads, needs the plugin to call back into script
//! code mid-solve, and can destroy a script context at any moment:
//!
//! - a process-wide [`guard::InterfaceGuard`] wrapping every entry point,
//! - the [`registry::EnvironmentRegistry`] tying environments to the script
//!   context that created them,
//! - the [`bridge`] protocol that releases the guard around every host
//!   callback and restores the current-environment cursor afterwards,
//! - the [`plugin::KinematicsPlugin`] façade tying it all together.
//!
//! The bundled [`engine::memory::MemoryEngine`] is a deterministic reference
//! implementation of the engine boundary so the whole protocol can run and
//! be tested without linking a real solver. Enable the `scripting-lua`
//! feature for ready-made Lua bindings.

pub mod bridge;
pub mod engine;
pub mod error;
pub mod guard;
pub mod host;
pub mod plugin;
pub mod registry;
pub mod transform;

#[cfg(feature = "scripting-lua")]
pub mod scripting;

pub use engine::memory::MemoryEngine;
pub use engine::{
    constants, ConfigSearch, EnvironmentHandle, GroupCalculation, GroupHandle, JointMode,
    JointType, ObjectHandle, SolveResult, SolveResultCode, SolverEngine,
};
pub use error::{EngineError, PluginError, PluginResult};
pub use host::{ContextId, HostFunction, ScriptHost, ScriptValue};
pub use plugin::KinematicsPlugin;
pub use transform::{Pose, Quaternion};
