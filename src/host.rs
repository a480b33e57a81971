//! Host scripting boundary.
//!
//! The plugin never owns script state; it addresses host functions by name
//! against an opaque context identifier and exchanges values through the
//! small [`ScriptValue`] vocabulary. Implementations marshal to whatever the
//! actual host speaks (the `scripting-lua` feature ships one over a Lua VM).

/// Identifies one host script context. Used for environment ownership and to
/// address callback functions; never interpreted by the plugin.
pub type ContextId = i32;

/// Value vocabulary of the host calling convention.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
    IntArray(Vec<i32>),
    NumberArray(Vec<f64>),
}

impl ScriptValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_number_array(&self) -> Option<&[f64]> {
        match self {
            ScriptValue::NumberArray(v) => Some(v),
            _ => None,
        }
    }
}

/// A host function addressed by name and owning context: the identity half of
/// a callback binding. The bridges add the owning environment and any
/// fixed-size parameters when they record the binding for one engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFunction {
    pub context: ContextId,
    pub name: String,
}

impl HostFunction {
    pub fn new(context: ContextId, name: impl Into<String>) -> Self {
        Self {
            context,
            name: name.into(),
        }
    }
}

/// Synchronous call into host script code.
///
/// Called only while the interface guard is *released*; the host code invoked
/// here may legally reenter any plugin entry point. Errors are descriptive
/// strings, mirroring the host-visible error convention.
pub trait ScriptHost {
    fn call_function(
        &self,
        context: ContextId,
        function: &str,
        args: Vec<ScriptValue>,
    ) -> Result<Vec<ScriptValue>, String>;
}
