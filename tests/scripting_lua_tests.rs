#![cfg(feature = "scripting-lua")]

//! Lua surface tests: the whole protocol driven from script code, callbacks
//! included.

use armature::scripting::install;
use armature::MemoryEngine;
use mlua::Lua;

const ARM_SETUP: &str = r#"
    env = ik.createEnvironment()
    joint = ik.createJoint(env, ik.jointtype_revolute, "j1")
    tip = ik.createDummy(env, "tip")
    target = ik.createDummy(env, "target")
    ik.setObjectParent(env, tip, joint, false)
    ik.setObjectTransformation(env, tip, ik.handle_parent, {1, 0, 0}, {0, 0, 0})
    ik.setObjectTransformation(env, target, ik.handle_world, {0, 1, 0}, {0, 0, 0})
    ik.setLinkedDummy(env, tip, target)
    group = ik.createGroup(env, "arm")
    ik.addElement(env, group, tip)
    ik.setGroupCalculation(env, group, ik.method_pseudo_inverse, 0.1, 100)
"#;

fn lua_with_plugin() -> (
    Lua,
    armature::KinematicsPlugin<MemoryEngine, armature::scripting::LuaHost>,
) {
    let lua = Lua::new();
    let plugin = install(&lua, MemoryEngine::new(), 7).expect("install bindings");
    (lua, plugin)
}

#[test]
fn lua_builds_and_solves_a_chain() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().expect("setup should not error");
    lua.load(
        r#"
        result = ik.handleGroups(env, group)
        q = ik.getJointPosition(env, joint)
    "#,
    )
    .exec()
    .expect("solve should not error");

    let result: i32 = lua.globals().get("result").unwrap();
    assert_eq!(result, 1); // ik.result_success
    let q: f64 = lua.globals().get("q").unwrap();
    assert!((q - std::f64::consts::FRAC_PI_2).abs() < 0.01, "q = {q}");
}

#[test]
fn lua_refinement_callback_is_invoked() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().unwrap();
    lua.load(
        r#"
        refineCalls = 0
        function refineHook(rowConstraints, rowElements, colHandles, colStages, jacobian, errors)
            refineCalls = refineCalls + 1
            assert(#colHandles == 1, "expected one column")
            assert(#errors * #colHandles == #jacobian, "jacobian shape mismatch")
            -- nested reentry while the callback runs
            nestedPosition = ik.getJointPosition(env, joint)
            return
        end
        result = ik.handleGroups(env, group, "refineHook")
    "#,
    )
    .exec()
    .expect("solve with callback should not error");

    let result: i32 = lua.globals().get("result").unwrap();
    assert_eq!(result, 1);
    let calls: i64 = lua.globals().get("refineCalls").unwrap();
    assert!(calls > 0);
    let nested: f64 = lua.globals().get("nestedPosition").unwrap();
    assert!(nested.is_finite());
}

#[test]
fn lua_solution_callback_short_circuits() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().unwrap();
    lua.load(
        r#"
        function solveHook(rowConstraints, rowElements, colHandles, colStages, jacobian, errors)
            return {math.pi / 2}
        end
        result = ik.handleGroups(env, group, "solveHook")
        q = ik.getJointPosition(env, joint)
    "#,
    )
    .exec()
    .unwrap();

    let result: i32 = lua.globals().get("result").unwrap();
    assert_eq!(result, 1);
    let q: f64 = lua.globals().get("q").unwrap();
    assert!((q - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
}

#[test]
fn lua_non_finite_callback_data_is_flagged() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().unwrap();
    lua.load(
        r#"
        function badHook(rowConstraints, rowElements, colHandles, colStages, jacobian, errors)
            return {0/0}
        end
        result, invalidData = ik.handleGroups(env, group, "badHook")
        q = ik.getJointPosition(env, joint)
    "#,
    )
    .exec()
    .unwrap();

    let result: i32 = lua.globals().get("result").unwrap();
    assert_eq!(result, 2); // ik.result_fail
    let invalid: bool = lua.globals().get("invalidData").unwrap();
    assert!(invalid);
    let q: f64 = lua.globals().get("q").unwrap();
    assert!(q.is_finite());
}

#[test]
fn lua_validation_callback_vets_candidates() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().unwrap();
    lua.load(
        r#"
        -- Move the target back onto the tip so the current config is valid.
        ik.setObjectTransformation(env, target, ik.handle_world, {1, 0, 0}, {0, 0, 0})
        vetoed = 0
        function rejectAll(config)
            vetoed = vetoed + 1
            return false
        end
        function acceptAll(config)
            return true
        end
        rejected = ik.getConfigForTipPose(env, group, {joint}, 0.05, 5, nil, "rejectAll")
        accepted = ik.getConfigForTipPose(env, group, {joint}, 0.05, 5, nil, "acceptAll")
    "#,
    )
    .exec()
    .unwrap();

    let rejected: mlua::Value = lua.globals().get("rejected").unwrap();
    assert!(rejected.is_nil());
    let vetoed: i64 = lua.globals().get("vetoed").unwrap();
    assert!(vetoed > 0);
    let accepted: Vec<f64> = lua.globals().get("accepted").unwrap();
    assert_eq!(accepted.len(), 1);
}

#[test]
fn lua_dependency_callback_couples_joints() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(
        r#"
        env = ik.createEnvironment()
        master = ik.createJoint(env, ik.jointtype_revolute, "m")
        slave = ik.createJoint(env, ik.jointtype_revolute, "s")
        function couple(envId, slaveJoint, masterPosition)
            return masterPosition * 2
        end
        ik.setJointDependency(env, slave, master, 0, 1, "couple")
        ik.setJointPosition(env, master, 0.3)
        slavePosition = ik.getJointPosition(env, slave)
    "#,
    )
    .exec()
    .unwrap();

    let slave_position: f64 = lua.globals().get("slavePosition").unwrap();
    assert!((slave_position - 0.6).abs() < 1e-9);
}

#[test]
fn lua_errors_surface_through_get_last_error() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(
        r#"
        ok = ik.eraseEnvironment(12345)
        message = ik.getLastError()
        cleared = ik.getLastError()
    "#,
    )
    .exec()
    .unwrap();

    let ok: bool = lua.globals().get("ok").unwrap();
    assert!(!ok);
    let message: String = lua.globals().get("message").unwrap();
    assert!(message.contains("invalid environment"), "{message}");
    let cleared: mlua::Value = lua.globals().get("cleared").unwrap();
    assert!(cleared.is_nil());
}

#[test]
fn lua_save_load_round_trip() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().unwrap();
    lua.load(
        r#"
        ik.setJointPosition(env, joint, 0.25)
        blob = ik.save(env)
        ik.setJointPosition(env, joint, 0.9)
        ik.load(env, blob)
        q = ik.getJointPosition(env, joint)
    "#,
    )
    .exec()
    .unwrap();

    let q: f64 = lua.globals().get("q").unwrap();
    assert!((q - 0.25).abs() < 1e-12);
}

#[test]
fn lua_constants_are_registered() {
    let (lua, _plugin) = lua_with_plugin();
    lua.load(
        r#"
        assert(ik.handle_all == -2)
        assert(ik.handle_world == -1)
        assert(ik.jointtype_revolute == 10)
        assert(ik.constraint_pose == 31)
        assert(ik.result_success == 1)
    "#,
    )
    .exec()
    .expect("constants should be present");
}

#[test]
fn context_teardown_invalidates_lua_owned_environments() {
    let (lua, plugin) = lua_with_plugin();
    lua.load(ARM_SETUP).exec().unwrap();

    // The embedder signals that script context 7 is gone.
    plugin.on_context_destroyed(7);

    lua.load(
        r#"
        blob = ik.save(env)
        message = ik.getLastError()
    "#,
    )
    .exec()
    .unwrap();
    let blob: mlua::Value = lua.globals().get("blob").unwrap();
    assert!(blob.is_nil());
    let message: String = lua.globals().get("message").unwrap();
    assert!(message.contains("invalid environment"), "{message}");
}
