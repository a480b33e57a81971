use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mlua::prelude::*;
use mlua::{MultiValue, Value, Variadic};

use crate::engine::{
    constants, ConfigSearch, EnvironmentHandle, GroupCalculation, JointMode, JointType,
    ObjectHandle, SolverEngine,
};
use crate::error::PluginResult;
use crate::host::{ContextId, HostFunction, ScriptHost, ScriptValue};
use crate::plugin::KinematicsPlugin;
use crate::transform::{Pose, Quaternion};

/// Host-visible error slot: failed calls record a message here and return a
/// failure sentinel instead of raising across the scripting boundary.
type ErrorSlot = Arc<Mutex<Option<String>>>;

fn set_error(slot: &ErrorSlot, command: &str, error: impl std::fmt::Display) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(format!("{command}: {error}"));
}

fn value_or_nil<T: IntoLuaMulti>(
    lua: &Lua,
    slot: &ErrorSlot,
    command: &str,
    result: PluginResult<T>,
) -> LuaResult<MultiValue> {
    match result {
        Ok(value) => value.into_lua_multi(lua),
        Err(error) => {
            set_error(slot, command, error);
            Value::Nil.into_lua_multi(lua)
        }
    }
}

fn status(
    lua: &Lua,
    slot: &ErrorSlot,
    command: &str,
    result: PluginResult<()>,
) -> LuaResult<MultiValue> {
    match result {
        Ok(()) => true.into_lua_multi(lua),
        Err(error) => {
            set_error(slot, command, error);
            false.into_lua_multi(lua)
        }
    }
}

fn optional_handle(handle: ObjectHandle) -> Option<ObjectHandle> {
    (handle >= 0).then_some(handle)
}

fn handle_or_world(handle: Option<ObjectHandle>) -> ObjectHandle {
    handle.unwrap_or(constants::HANDLE_WORLD)
}

/// Accepts a pose either as 7 values (position + quaternion x,y,z,w) or as a
/// 12-value row-major 3×4 matrix.
fn pose_from_values(values: &[f64]) -> Result<Pose, String> {
    match values.len() {
        7 => Ok(Pose::new(
            [values[0], values[1], values[2]],
            Quaternion::from_xyzw([values[3], values[4], values[5], values[6]]),
        )),
        12 => {
            let mut matrix = [0.0; 12];
            matrix.copy_from_slice(values);
            Ok(Pose::from_matrix12(matrix))
        }
        n => Err(format!("expected 7 or 12 pose values, got {n}")),
    }
}

/// Accepts a rotation either as 3 Euler angles or as a quaternion x,y,z,w.
fn rotation_from_values(values: &[f64]) -> Result<Quaternion, String> {
    match values.len() {
        3 => Ok(Quaternion::from_euler([values[0], values[1], values[2]])),
        4 => Ok(Quaternion::from_xyzw([
            values[0], values[1], values[2], values[3],
        ])),
        n => Err(format!("expected 3 or 4 rotation values, got {n}")),
    }
}

fn pose_to_lua(lua: &Lua, pose: Pose) -> LuaResult<MultiValue> {
    let position = lua.create_sequence_from(pose.position)?;
    let quaternion = lua.create_sequence_from(pose.orientation.to_xyzw())?;
    let euler = lua.create_sequence_from(pose.orientation.to_euler())?;
    (position, quaternion, euler).into_lua_multi(lua)
}

fn script_value_to_lua(lua: &Lua, value: ScriptValue) -> LuaResult<Value> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(b),
        ScriptValue::Int(i) => Value::Integer(i),
        ScriptValue::Number(n) => Value::Number(n),
        ScriptValue::Str(s) => Value::String(lua.create_string(&s)?),
        ScriptValue::IntArray(v) => Value::Table(lua.create_sequence_from(v)?),
        ScriptValue::NumberArray(v) => Value::Table(lua.create_sequence_from(v)?),
    })
}

fn lua_to_script_value(value: &Value) -> ScriptValue {
    match value {
        Value::Boolean(b) => ScriptValue::Bool(*b),
        Value::Integer(i) => ScriptValue::Int(*i),
        Value::Number(n) => ScriptValue::Number(*n),
        Value::String(s) => ScriptValue::Str(s.to_string_lossy().to_string()),
        Value::Table(t) => {
            let numbers: Result<Vec<f64>, _> = t.clone().sequence_values::<f64>().collect();
            match numbers {
                Ok(numbers) => ScriptValue::NumberArray(numbers),
                Err(_) => ScriptValue::Nil,
            }
        }
        _ => ScriptValue::Nil,
    }
}

/// [`ScriptHost`] over a Lua VM: callback functions are global Lua functions
/// addressed by name. All script contexts installed into the same VM share
/// one global namespace, so the context id is not consulted for dispatch.
pub struct LuaHost {
    lua: Lua,
}

impl LuaHost {
    pub fn new(lua: Lua) -> Self {
        Self { lua }
    }
}

impl ScriptHost for LuaHost {
    fn call_function(
        &self,
        _context: ContextId,
        function: &str,
        args: Vec<ScriptValue>,
    ) -> Result<Vec<ScriptValue>, String> {
        let callee: mlua::Function = self
            .lua
            .globals()
            .get(function)
            .map_err(|e| format!("unknown host function {function}: {e}"))?;
        let mut lua_args = Vec::with_capacity(args.len());
        for arg in args {
            lua_args.push(
                script_value_to_lua(&self.lua, arg)
                    .map_err(|e| format!("argument marshaling failed: {e}"))?,
            );
        }
        let returned: MultiValue = callee
            .call(MultiValue::from_vec(lua_args))
            .map_err(|e| format!("{function} failed: {e}"))?;
        Ok(returned.iter().map(lua_to_script_value).collect())
    }
}

/// Registers the `ik` table and its constants in `lua`, wiring every call to
/// a fresh [`KinematicsPlugin`] over `engine`. Environments created from this
/// VM are owned by `context`; hand the returned plugin to the embedder so it
/// can signal `on_context_destroyed(context)` when the VM goes away.
pub fn install<E>(
    lua: &Lua,
    engine: E,
    context: ContextId,
) -> LuaResult<KinematicsPlugin<E, LuaHost>>
where
    E: SolverEngine + Send + Sync + 'static,
{
    let plugin = KinematicsPlugin::new(engine, LuaHost::new(lua.clone()));
    let errors: ErrorSlot = Arc::new(Mutex::new(None));
    let table = lua.create_table()?;

    register_environment_fns(lua, &table, &plugin, &errors, context)?;
    register_object_fns(lua, &table, &plugin, &errors)?;
    register_joint_fns(lua, &table, &plugin, &errors, context)?;
    register_group_fns(lua, &table, &plugin, &errors)?;
    register_solve_fns(lua, &table, &plugin, &errors, context)?;
    register_constants(&table)?;

    {
        let errors = errors.clone();
        table.set(
            "getLastError",
            lua.create_function(move |_, ()| {
                Ok(errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take())
            })?,
        )?;
    }

    lua.globals().set("ik", table)?;
    Ok(plugin)
}

macro_rules! lua_fn {
    ($lua:expr, $table:expr, $plugin:expr, $errors:expr, $name:literal, |$l:ident, $p:ident, $e:ident, $args:tt : $ty:ty| $body:expr) => {{
        let $p = $plugin.clone();
        let $e = $errors.clone();
        $table.set(
            $name,
            $lua.create_function(move |$l, $args: $ty| $body)?,
        )?;
    }};
}

fn register_environment_fns<E: SolverEngine + Send + Sync + 'static>(
    lua: &Lua,
    table: &mlua::Table,
    plugin: &KinematicsPlugin<E, LuaHost>,
    errors: &ErrorSlot,
    context: ContextId,
) -> LuaResult<()> {
    lua_fn!(lua, table, plugin, errors, "createEnvironment", |l, p, e, (): ()| {
        value_or_nil(l, &e, "ik.createEnvironment", p.create_environment(context))
    });
    lua_fn!(lua, table, plugin, errors, "eraseEnvironment", |l, p, e, env: EnvironmentHandle| {
        status(l, &e, "ik.eraseEnvironment", p.erase_environment(env))
    });
    lua_fn!(lua, table, plugin, errors, "duplicateEnvironment", |l, p, e, env: EnvironmentHandle| {
        value_or_nil(l, &e, "ik.duplicateEnvironment", p.duplicate_environment(env, context))
    });
    lua_fn!(lua, table, plugin, errors, "load", |l, p, e, (env, data): (EnvironmentHandle, mlua::String)| {
        status(l, &e, "ik.load", p.load(env, &data.as_bytes()))
    });
    lua_fn!(lua, table, plugin, errors, "save", |l, p, e, env: EnvironmentHandle| {
        match p.save(env) {
            Ok(bytes) => l.create_string(&bytes)?.into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.save", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    Ok(())
}

fn register_object_fns<E: SolverEngine + Send + Sync + 'static>(
    lua: &Lua,
    table: &mlua::Table,
    plugin: &KinematicsPlugin<E, LuaHost>,
    errors: &ErrorSlot,
) -> LuaResult<()> {
    lua_fn!(lua, table, plugin, errors, "getObjects", |l, p, e, (env, index): (EnvironmentHandle, usize)| {
        match p.object_at_index(env, index) {
            Ok(Some(summary)) => {
                let is_joint = summary.joint_type.is_some();
                let joint_type = summary.joint_type.map(JointType::as_raw).unwrap_or(-1);
                (summary.handle, summary.name, is_joint, joint_type).into_lua_multi(l)
            }
            Ok(None) => Value::Nil.into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.getObjects", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "getObjectHandle", |l, p, e, (env, name): (EnvironmentHandle, String)| {
        value_or_nil(l, &e, "ik.getObjectHandle", p.object_handle(env, &name))
    });
    lua_fn!(lua, table, plugin, errors, "doesObjectExist", |l, p, e, (env, name): (EnvironmentHandle, String)| {
        value_or_nil(l, &e, "ik.doesObjectExist", p.does_object_exist(env, &name))
    });
    lua_fn!(lua, table, plugin, errors, "eraseObject", |l, p, e, (env, object): (EnvironmentHandle, ObjectHandle)| {
        status(l, &e, "ik.eraseObject", p.erase_object(env, object))
    });
    lua_fn!(lua, table, plugin, errors, "getObjectParent", |l, p, e, (env, object): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getObjectParent", p.object_parent(env, object).map(handle_or_world))
    });
    lua_fn!(lua, table, plugin, errors, "setObjectParent", |l, p, e, (env, object, parent, keep): (EnvironmentHandle, ObjectHandle, ObjectHandle, Option<bool>)| {
        status(
            l,
            &e,
            "ik.setObjectParent",
            p.set_object_parent(env, object, optional_handle(parent), keep.unwrap_or(true)),
        )
    });
    lua_fn!(lua, table, plugin, errors, "createDummy", |l, p, e, (env, name): (EnvironmentHandle, Option<String>)| {
        value_or_nil(l, &e, "ik.createDummy", p.create_dummy(env, name.as_deref()))
    });
    lua_fn!(lua, table, plugin, errors, "getLinkedDummy", |l, p, e, (env, dummy): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getLinkedDummy", p.linked_dummy(env, dummy).map(handle_or_world))
    });
    lua_fn!(lua, table, plugin, errors, "setLinkedDummy", |l, p, e, (env, dummy, linked): (EnvironmentHandle, ObjectHandle, ObjectHandle)| {
        status(
            l,
            &e,
            "ik.setLinkedDummy",
            p.set_linked_dummy(env, dummy, optional_handle(linked)),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getObjectTransformation", |l, p, e, (env, object, relative): (EnvironmentHandle, ObjectHandle, ObjectHandle)| {
        match p.object_transformation(env, object, relative) {
            Ok(pose) => pose_to_lua(l, pose),
            Err(error) => {
                set_error(&e, "ik.getObjectTransformation", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setObjectTransformation", |l, p, e, (env, object, relative, position, rotation): (EnvironmentHandle, ObjectHandle, ObjectHandle, Vec<f64>, Vec<f64>)| {
        if position.len() != 3 {
            set_error(&e, "ik.setObjectTransformation", "expected 3 position values");
            return false.into_lua_multi(l);
        }
        let orientation = match rotation_from_values(&rotation) {
            Ok(q) => q,
            Err(error) => {
                set_error(&e, "ik.setObjectTransformation", error);
                return false.into_lua_multi(l);
            }
        };
        let pose = Pose::new([position[0], position[1], position[2]], orientation);
        status(
            l,
            &e,
            "ik.setObjectTransformation",
            p.set_object_transformation(env, object, relative, &pose),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getObjectMatrix", |l, p, e, (env, object, relative): (EnvironmentHandle, ObjectHandle, ObjectHandle)| {
        match p.object_matrix(env, object, relative) {
            Ok(matrix) => l.create_sequence_from(matrix)?.into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.getObjectMatrix", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setObjectMatrix", |l, p, e, (env, object, relative, matrix): (EnvironmentHandle, ObjectHandle, ObjectHandle, Vec<f64>)| {
        if matrix.len() != 12 {
            set_error(&e, "ik.setObjectMatrix", "expected 12 matrix values");
            return false.into_lua_multi(l);
        }
        let mut values = [0.0; 12];
        values.copy_from_slice(&matrix);
        status(
            l,
            &e,
            "ik.setObjectMatrix",
            p.set_object_matrix(env, object, relative, values),
        )
    });
    Ok(())
}

fn register_joint_fns<E: SolverEngine + Send + Sync + 'static>(
    lua: &Lua,
    table: &mlua::Table,
    plugin: &KinematicsPlugin<E, LuaHost>,
    errors: &ErrorSlot,
    context: ContextId,
) -> LuaResult<()> {
    lua_fn!(lua, table, plugin, errors, "createJoint", |l, p, e, (env, joint_type, name): (EnvironmentHandle, i32, Option<String>)| {
        let Some(joint_type) = JointType::from_raw(joint_type) else {
            set_error(&e, "ik.createJoint", "invalid joint type");
            return Value::Nil.into_lua_multi(l);
        };
        value_or_nil(l, &e, "ik.createJoint", p.create_joint(env, joint_type, name.as_deref()))
    });
    lua_fn!(lua, table, plugin, errors, "getJointType", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointType", p.joint_type(env, joint).map(JointType::as_raw))
    });
    lua_fn!(lua, table, plugin, errors, "getJointMode", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointMode", p.joint_mode(env, joint).map(JointMode::as_raw))
    });
    lua_fn!(lua, table, plugin, errors, "setJointMode", |l, p, e, (env, joint, mode): (EnvironmentHandle, ObjectHandle, i32)| {
        let Some(mode) = JointMode::from_raw(mode) else {
            set_error(&e, "ik.setJointMode", "invalid joint mode");
            return false.into_lua_multi(l);
        };
        status(l, &e, "ik.setJointMode", p.set_joint_mode(env, joint, mode))
    });
    lua_fn!(lua, table, plugin, errors, "getJointInterval", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        match p.joint_interval(env, joint) {
            Ok((cyclic, interval)) => {
                (cyclic, l.create_sequence_from(interval)?).into_lua_multi(l)
            }
            Err(error) => {
                set_error(&e, "ik.getJointInterval", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setJointInterval", |l, p, e, (env, joint, cyclic, interval): (EnvironmentHandle, ObjectHandle, bool, Option<Vec<f64>>)| {
        let interval = match interval {
            Some(values) if values.len() == 2 => Some([values[0], values[1]]),
            Some(_) => {
                set_error(&e, "ik.setJointInterval", "expected 2 interval values");
                return false.into_lua_multi(l);
            }
            None => None,
        };
        status(
            l,
            &e,
            "ik.setJointInterval",
            p.set_joint_interval(env, joint, cyclic, interval),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getJointScrewLead", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointScrewLead", p.joint_screw_lead(env, joint))
    });
    lua_fn!(lua, table, plugin, errors, "setJointScrewLead", |l, p, e, (env, joint, lead): (EnvironmentHandle, ObjectHandle, f64)| {
        status(l, &e, "ik.setJointScrewLead", p.set_joint_screw_lead(env, joint, lead))
    });
    lua_fn!(lua, table, plugin, errors, "getJointWeight", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointWeight", p.joint_weight(env, joint))
    });
    lua_fn!(lua, table, plugin, errors, "setJointWeight", |l, p, e, (env, joint, weight): (EnvironmentHandle, ObjectHandle, f64)| {
        status(l, &e, "ik.setJointWeight", p.set_joint_weight(env, joint, weight))
    });
    lua_fn!(lua, table, plugin, errors, "getJointLimitMargin", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointLimitMargin", p.joint_limit_margin(env, joint))
    });
    lua_fn!(lua, table, plugin, errors, "setJointLimitMargin", |l, p, e, (env, joint, margin): (EnvironmentHandle, ObjectHandle, f64)| {
        status(l, &e, "ik.setJointLimitMargin", p.set_joint_limit_margin(env, joint, margin))
    });
    lua_fn!(lua, table, plugin, errors, "getJointMaxStepSize", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointMaxStepSize", p.joint_max_step_size(env, joint))
    });
    lua_fn!(lua, table, plugin, errors, "setJointMaxStepSize", |l, p, e, (env, joint, step): (EnvironmentHandle, ObjectHandle, f64)| {
        status(l, &e, "ik.setJointMaxStepSize", p.set_joint_max_step_size(env, joint, step))
    });
    lua_fn!(lua, table, plugin, errors, "getJointPosition", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        value_or_nil(l, &e, "ik.getJointPosition", p.joint_position(env, joint))
    });
    lua_fn!(lua, table, plugin, errors, "setJointPosition", |l, p, e, (env, joint, position): (EnvironmentHandle, ObjectHandle, f64)| {
        status(l, &e, "ik.setJointPosition", p.set_joint_position(env, joint, position))
    });
    lua_fn!(lua, table, plugin, errors, "getJointMatrix", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        match p.joint_matrix(env, joint) {
            Ok(matrix) => l.create_sequence_from(matrix)?.into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.getJointMatrix", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "getJointTransformation", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        match p.joint_transformation(env, joint) {
            Ok(pose) => pose_to_lua(l, pose),
            Err(error) => {
                set_error(&e, "ik.getJointTransformation", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setSphericalJointMatrix", |l, p, e, (env, joint, matrix): (EnvironmentHandle, ObjectHandle, Vec<f64>)| {
        if matrix.len() != 12 {
            set_error(&e, "ik.setSphericalJointMatrix", "expected 12 matrix values");
            return false.into_lua_multi(l);
        }
        let mut values = [0.0; 12];
        values.copy_from_slice(&matrix);
        status(
            l,
            &e,
            "ik.setSphericalJointMatrix",
            p.set_spherical_joint_matrix(env, joint, values),
        )
    });
    lua_fn!(lua, table, plugin, errors, "setSphericalJointRotation", |l, p, e, (env, joint, rotation): (EnvironmentHandle, ObjectHandle, Vec<f64>)| {
        let orientation = match rotation_from_values(&rotation) {
            Ok(q) => q,
            Err(error) => {
                set_error(&e, "ik.setSphericalJointRotation", error);
                return false.into_lua_multi(l);
            }
        };
        status(
            l,
            &e,
            "ik.setSphericalJointRotation",
            p.set_spherical_joint_rotation(env, joint, orientation),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getJointDependency", |l, p, e, (env, joint): (EnvironmentHandle, ObjectHandle)| {
        match p.joint_dependency(env, joint) {
            Ok(Some((master, offset, mult))) => (master, offset, mult).into_lua_multi(l),
            Ok(None) => (constants::HANDLE_WORLD, 0.0, 1.0).into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.getJointDependency", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    {
        let p = plugin.clone();
        let e = errors.clone();
        table.set(
            "setJointDependency",
            lua.create_function(
                move |l,
                      (env, slave, master, offset, mult, callback, cb_context): (
                    EnvironmentHandle,
                    ObjectHandle,
                    ObjectHandle,
                    Option<f64>,
                    Option<f64>,
                    Option<String>,
                    Option<ContextId>,
                )| {
                    let callback = callback
                        .filter(|name| !name.is_empty())
                        .map(|name| HostFunction::new(cb_context.unwrap_or(context), name));
                    status(
                        l,
                        &e,
                        "ik.setJointDependency",
                        p.set_joint_dependency(
                            env,
                            slave,
                            optional_handle(master),
                            offset.unwrap_or(0.0),
                            mult.unwrap_or(1.0),
                            callback,
                        ),
                    )
                },
            )?,
        )?;
    }
    Ok(())
}

fn register_group_fns<E: SolverEngine + Send + Sync + 'static>(
    lua: &Lua,
    table: &mlua::Table,
    plugin: &KinematicsPlugin<E, LuaHost>,
    errors: &ErrorSlot,
) -> LuaResult<()> {
    lua_fn!(lua, table, plugin, errors, "getGroupHandle", |l, p, e, (env, name): (EnvironmentHandle, String)| {
        value_or_nil(l, &e, "ik.getGroupHandle", p.group_handle(env, &name))
    });
    lua_fn!(lua, table, plugin, errors, "doesGroupExist", |l, p, e, (env, name): (EnvironmentHandle, String)| {
        value_or_nil(l, &e, "ik.doesGroupExist", p.does_group_exist(env, &name))
    });
    lua_fn!(lua, table, plugin, errors, "createGroup", |l, p, e, (env, name): (EnvironmentHandle, Option<String>)| {
        value_or_nil(l, &e, "ik.createGroup", p.create_group(env, name.as_deref()))
    });
    lua_fn!(lua, table, plugin, errors, "getGroupFlags", |l, p, e, (env, group): (EnvironmentHandle, i32)| {
        value_or_nil(l, &e, "ik.getGroupFlags", p.group_flags(env, group))
    });
    lua_fn!(lua, table, plugin, errors, "setGroupFlags", |l, p, e, (env, group, flags): (EnvironmentHandle, i32, u32)| {
        status(l, &e, "ik.setGroupFlags", p.set_group_flags(env, group, flags))
    });
    lua_fn!(lua, table, plugin, errors, "getGroupCalculation", |l, p, e, (env, group): (EnvironmentHandle, i32)| {
        match p.group_calculation(env, group) {
            Ok(calc) => {
                (calc.method.as_raw(), calc.damping, calc.max_iterations).into_lua_multi(l)
            }
            Err(error) => {
                set_error(&e, "ik.getGroupCalculation", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setGroupCalculation", |l, p, e, (env, group, method, damping, max_iterations): (EnvironmentHandle, i32, i32, f64, u32)| {
        let Some(method) = crate::engine::CalcMethod::from_raw(method) else {
            set_error(&e, "ik.setGroupCalculation", "invalid calculation method");
            return false.into_lua_multi(l);
        };
        status(
            l,
            &e,
            "ik.setGroupCalculation",
            p.set_group_calculation(
                env,
                group,
                GroupCalculation {
                    method,
                    damping,
                    max_iterations,
                },
            ),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getGroupJointLimitHits", |l, p, e, (env, group): (EnvironmentHandle, i32)| {
        match p.group_joint_limit_hits(env, group) {
            Ok(hits) => {
                let handles: Vec<i32> = hits.iter().map(|h| h.0).collect();
                let overshoots: Vec<f64> = hits.iter().map(|h| h.1).collect();
                (
                    l.create_sequence_from(handles)?,
                    l.create_sequence_from(overshoots)?,
                )
                    .into_lua_multi(l)
            }
            Err(error) => {
                set_error(&e, "ik.getGroupJointLimitHits", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "addElement", |l, p, e, (env, group, tip): (EnvironmentHandle, i32, ObjectHandle)| {
        value_or_nil(l, &e, "ik.addElement", p.add_element(env, group, tip))
    });
    lua_fn!(lua, table, plugin, errors, "getElementFlags", |l, p, e, (env, group, element): (EnvironmentHandle, i32, i32)| {
        value_or_nil(l, &e, "ik.getElementFlags", p.element_flags(env, group, element))
    });
    lua_fn!(lua, table, plugin, errors, "setElementFlags", |l, p, e, (env, group, element, flags): (EnvironmentHandle, i32, i32, u32)| {
        status(l, &e, "ik.setElementFlags", p.set_element_flags(env, group, element, flags))
    });
    lua_fn!(lua, table, plugin, errors, "getElementBase", |l, p, e, (env, group, element): (EnvironmentHandle, i32, i32)| {
        match p.element_base(env, group, element) {
            Ok((base, constraints_base)) => {
                (handle_or_world(base), handle_or_world(constraints_base)).into_lua_multi(l)
            }
            Err(error) => {
                set_error(&e, "ik.getElementBase", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setElementBase", |l, p, e, (env, group, element, base, constraints_base): (EnvironmentHandle, i32, i32, ObjectHandle, Option<ObjectHandle>)| {
        status(
            l,
            &e,
            "ik.setElementBase",
            p.set_element_base(
                env,
                group,
                element,
                optional_handle(base),
                constraints_base.and_then(optional_handle),
            ),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getElementConstraints", |l, p, e, (env, group, element): (EnvironmentHandle, i32, i32)| {
        value_or_nil(l, &e, "ik.getElementConstraints", p.element_constraints(env, group, element))
    });
    lua_fn!(lua, table, plugin, errors, "setElementConstraints", |l, p, e, (env, group, element, constraints): (EnvironmentHandle, i32, i32, u32)| {
        status(
            l,
            &e,
            "ik.setElementConstraints",
            p.set_element_constraints(env, group, element, constraints),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getElementPrecision", |l, p, e, (env, group, element): (EnvironmentHandle, i32, i32)| {
        match p.element_precision(env, group, element) {
            Ok(precision) => l.create_sequence_from(precision)?.into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.getElementPrecision", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setElementPrecision", |l, p, e, (env, group, element, precision): (EnvironmentHandle, i32, i32, Vec<f64>)| {
        if precision.len() != 2 {
            set_error(&e, "ik.setElementPrecision", "expected 2 precision values");
            return false.into_lua_multi(l);
        }
        status(
            l,
            &e,
            "ik.setElementPrecision",
            p.set_element_precision(env, group, element, [precision[0], precision[1]]),
        )
    });
    lua_fn!(lua, table, plugin, errors, "getElementWeights", |l, p, e, (env, group, element): (EnvironmentHandle, i32, i32)| {
        match p.element_weights(env, group, element) {
            Ok(weights) => l.create_sequence_from(weights)?.into_lua_multi(l),
            Err(error) => {
                set_error(&e, "ik.getElementWeights", error);
                Value::Nil.into_lua_multi(l)
            }
        }
    });
    lua_fn!(lua, table, plugin, errors, "setElementWeights", |l, p, e, (env, group, element, weights): (EnvironmentHandle, i32, i32, Vec<f64>)| {
        if weights.len() != 2 {
            set_error(&e, "ik.setElementWeights", "expected 2 weight values");
            return false.into_lua_multi(l);
        }
        status(
            l,
            &e,
            "ik.setElementWeights",
            p.set_element_weights(env, group, element, [weights[0], weights[1]]),
        )
    });
    Ok(())
}

fn register_solve_fns<E: SolverEngine + Send + Sync + 'static>(
    lua: &Lua,
    table: &mlua::Table,
    plugin: &KinematicsPlugin<E, LuaHost>,
    errors: &ErrorSlot,
    context: ContextId,
) -> LuaResult<()> {
    {
        let p = plugin.clone();
        let e = errors.clone();
        table.set(
            "handleGroups",
            lua.create_function(
                move |l,
                      (env, group, callback, cb_context): (
                    EnvironmentHandle,
                    Option<i32>,
                    Option<String>,
                    Option<ContextId>,
                )| {
                    let refinement = callback
                        .filter(|name| !name.is_empty())
                        .map(|name| HostFunction::new(cb_context.unwrap_or(context), name));
                    match p.handle_groups(env, group.unwrap_or(constants::HANDLE_ALL), refinement)
                    {
                        Ok(result) => {
                            (result.code.as_raw(), result.invalid_callback_data).into_lua_multi(l)
                        }
                        Err(error) => {
                            set_error(&e, "ik.handleGroups", error);
                            Value::Nil.into_lua_multi(l)
                        }
                    }
                },
            )?,
        )?;
    }
    {
        let p = plugin.clone();
        let e = errors.clone();
        table.set(
            "computeJacobian",
            lua.create_function(
                move |l,
                      (env, base, last_joint, constraints, tip, target, alt_base): (
                    EnvironmentHandle,
                    ObjectHandle,
                    ObjectHandle,
                    u32,
                    Vec<f64>,
                    Option<Vec<f64>>,
                    Option<ObjectHandle>,
                )| {
                    let tip = match pose_from_values(&tip) {
                        Ok(pose) => pose,
                        Err(error) => {
                            set_error(&e, "ik.computeJacobian", error);
                            return Value::Nil.into_lua_multi(l);
                        }
                    };
                    let target = match target.as_deref().map(pose_from_values).transpose() {
                        Ok(pose) => pose,
                        Err(error) => {
                            set_error(&e, "ik.computeJacobian", error);
                            return Value::Nil.into_lua_multi(l);
                        }
                    };
                    match p.compute_jacobian(
                        env,
                        base,
                        last_joint,
                        constraints,
                        tip,
                        target,
                        alt_base.and_then(optional_handle),
                    ) {
                        Ok(data) => (
                            l.create_sequence_from(data.jacobian)?,
                            l.create_sequence_from(data.error_vector)?,
                        )
                            .into_lua_multi(l),
                        Err(error) => {
                            set_error(&e, "ik.computeJacobian", error);
                            Value::Nil.into_lua_multi(l)
                        }
                    }
                },
            )?,
        )?;
    }
    {
        let p = plugin.clone();
        let e = errors.clone();
        table.set(
            "getConfigForTipPose",
            lua.create_function(
                move |l, args: Variadic<Value>| {
                    let parsed = ConfigArgs::parse(l, args.as_slice(), context);
                    let args = match parsed {
                        Ok(args) => args,
                        Err(error) => {
                            set_error(&e, "ik.getConfigForTipPose", error);
                            return Value::Nil.into_lua_multi(l);
                        }
                    };
                    let search = ConfigSearch {
                        joints: &args.joints,
                        threshold: args.threshold,
                        metric: args.metric,
                        joint_options: args.joint_options.as_deref(),
                        low_limits: args.low_limits.as_deref(),
                        ranges: args.ranges.as_deref(),
                    };
                    match p.get_config_for_tip_pose(
                        args.environment,
                        args.group,
                        &search,
                        args.budget as u32,
                        args.callback,
                    ) {
                        Ok(Some(config)) => l.create_sequence_from(config)?.into_lua_multi(l),
                        Ok(None) => Value::Nil.into_lua_multi(l),
                        Err(error) => {
                            set_error(&e, "ik.getConfigForTipPose", error);
                            Value::Nil.into_lua_multi(l)
                        }
                    }
                },
            )?,
        )?;
    }
    {
        let p = plugin.clone();
        let e = errors.clone();
        table.set(
            "findConfig",
            lua.create_function(
                move |l, args: Variadic<Value>| {
                    let parsed = ConfigArgs::parse(l, args.as_slice(), context);
                    let args = match parsed {
                        Ok(args) => args,
                        Err(error) => {
                            set_error(&e, "ik.findConfig", error);
                            return Value::Nil.into_lua_multi(l);
                        }
                    };
                    let search = ConfigSearch {
                        joints: &args.joints,
                        threshold: args.threshold,
                        metric: args.metric,
                        joint_options: None,
                        low_limits: None,
                        ranges: None,
                    };
                    match p.find_config(
                        args.environment,
                        args.group,
                        &search,
                        Duration::from_millis(args.budget),
                        args.callback,
                    ) {
                        Ok(Some(config)) => l.create_sequence_from(config)?.into_lua_multi(l),
                        Ok(None) => Value::Nil.into_lua_multi(l),
                        Err(error) => {
                            set_error(&e, "ik.findConfig", error);
                            Value::Nil.into_lua_multi(l)
                        }
                    }
                },
            )?,
        )?;
    }
    Ok(())
}

/// Shared positional arguments of the two config searches:
/// `(env, group, {joints}, threshold?, budget?, {metric}?, callbackName?,
/// callbackContext?, {jointOptions}?, {lowLimits}?, {ranges}?)`.
struct ConfigArgs {
    environment: EnvironmentHandle,
    group: i32,
    joints: Vec<ObjectHandle>,
    threshold: f64,
    budget: u64,
    metric: Option<[f64; 4]>,
    callback: Option<HostFunction>,
    joint_options: Option<Vec<i32>>,
    low_limits: Option<Vec<f64>>,
    ranges: Option<Vec<f64>>,
}

impl ConfigArgs {
    fn parse(lua: &Lua, args: &[Value], context: ContextId) -> Result<Self, String> {
        fn get<T: FromLua>(lua: &Lua, args: &[Value], index: usize) -> Result<Option<T>, String> {
            match args.get(index) {
                None | Some(Value::Nil) => Ok(None),
                Some(value) => T::from_lua(value.clone(), lua)
                    .map(Some)
                    .map_err(|e| format!("argument {}: {e}", index + 1)),
            }
        }
        let environment: EnvironmentHandle =
            get(lua, args, 0)?.ok_or("missing environment handle")?;
        let group: i32 = get(lua, args, 1)?.ok_or("missing group handle")?;
        let joints: Vec<ObjectHandle> = get(lua, args, 2)?.ok_or("missing joint handles")?;
        let threshold: f64 = get(lua, args, 3)?.unwrap_or(0.1);
        let budget: u64 = get(lua, args, 4)?.unwrap_or(100);
        let metric: Option<Vec<f64>> = get(lua, args, 5)?;
        let metric = match metric {
            Some(values) if values.len() == 4 => {
                Some([values[0], values[1], values[2], values[3]])
            }
            Some(_) => return Err("metric must have 4 values".into()),
            None => None,
        };
        let callback: Option<String> = get(lua, args, 6)?;
        let cb_context: Option<ContextId> = get(lua, args, 7)?;
        let callback = callback
            .filter(|name| !name.is_empty())
            .map(|name| HostFunction::new(cb_context.unwrap_or(context), name));
        Ok(Self {
            environment,
            group,
            joints,
            threshold,
            budget,
            metric,
            callback,
            joint_options: get(lua, args, 8)?,
            low_limits: get(lua, args, 9)?,
            ranges: get(lua, args, 10)?,
        })
    }
}

fn register_constants(table: &mlua::Table) -> LuaResult<()> {
    table.set("handle_all", constants::HANDLE_ALL)?;
    table.set("handle_parent", constants::HANDLE_PARENT)?;
    table.set("handle_world", constants::HANDLE_WORLD)?;
    table.set("handleflag_tipdummy", constants::HANDLEFLAG_TIP_DUMMY)?;
    table.set("objecttype_joint", constants::OBJECT_TYPE_JOINT)?;
    table.set("objecttype_dummy", constants::OBJECT_TYPE_DUMMY)?;
    table.set("jointmode_passive", constants::JOINT_MODE_PASSIVE)?;
    table.set("jointmode_ik", constants::JOINT_MODE_IK)?;
    table.set("jointtype_revolute", constants::JOINT_TYPE_REVOLUTE)?;
    table.set("jointtype_prismatic", constants::JOINT_TYPE_PRISMATIC)?;
    table.set("jointtype_spherical", constants::JOINT_TYPE_SPHERICAL)?;
    table.set("constraint_x", constants::CONSTRAINT_X)?;
    table.set("constraint_y", constants::CONSTRAINT_Y)?;
    table.set("constraint_z", constants::CONSTRAINT_Z)?;
    table.set("constraint_alpha_beta", constants::CONSTRAINT_ALPHA_BETA)?;
    table.set("constraint_gamma", constants::CONSTRAINT_GAMMA)?;
    table.set("constraint_position", constants::CONSTRAINT_POSITION)?;
    table.set("constraint_orientation", constants::CONSTRAINT_ORIENTATION)?;
    table.set("constraint_pose", constants::CONSTRAINT_POSE)?;
    table.set("method_pseudo_inverse", constants::METHOD_PSEUDO_INVERSE)?;
    table.set(
        "method_damped_least_squares",
        constants::METHOD_DAMPED_LEAST_SQUARES,
    )?;
    table.set(
        "method_jacobian_transpose",
        constants::METHOD_JACOBIAN_TRANSPOSE,
    )?;
    table.set(
        "method_undamped_pseudo_inverse",
        constants::METHOD_UNDAMPED_PSEUDO_INVERSE,
    )?;
    table.set("result_not_performed", constants::RESULT_NOT_PERFORMED)?;
    table.set("result_success", constants::RESULT_SUCCESS)?;
    table.set("result_fail", constants::RESULT_FAIL)?;
    table.set("group_enabled", constants::GROUP_ENABLED)?;
    table.set("group_ignoremaxsteps", constants::GROUP_IGNORE_MAX_STEPS)?;
    table.set("group_restoreonfail", constants::GROUP_RESTORE_ON_FAIL)?;
    table.set("group_stoponlimithit", constants::GROUP_STOP_ON_LIMIT_HIT)?;
    table.set("element_enabled", constants::ELEMENT_ENABLED)?;
    table.set("config_joint_fixed", constants::CONFIG_JOINT_FIXED)?;
    Ok(())
}
