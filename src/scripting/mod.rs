//! Embedded scripting surface.
//!
//! Exposes the plugin's flat call interface to a Lua VM: one global `ik`
//! table of functions, the integer constants, and a [`ScriptHost`]
//! implementation over the same VM so that refinement, validation and
//! dependency callbacks land in Lua functions addressed by name.
//!
//! [`ScriptHost`]: crate::host::ScriptHost

pub mod lua_engine;

pub use lua_engine::{install, LuaHost};
