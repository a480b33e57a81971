//! Persistent joint-dependency callbacks: scripted coupling, linear
//! fallback, and binding lifecycle.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use armature::{HostFunction, JointType, ScriptValue};
use common::plugin;

fn two_joints(
    plugin: &common::TestPlugin,
    owner: i32,
) -> (i32, i32, i32) {
    let env = plugin.create_environment(owner).unwrap();
    let master = plugin
        .create_joint(env, JointType::Revolute, Some("master"))
        .unwrap();
    let slave = plugin
        .create_joint(env, JointType::Revolute, Some("slave"))
        .unwrap();
    (env, master, slave)
}

#[test]
fn scripted_dependency_routes_through_the_host() {
    let (plugin, host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);

    let guard_seen_held = Arc::new(AtomicBool::new(false));
    {
        let plugin = plugin.clone();
        let guard_seen_held = guard_seen_held.clone();
        host.define("couple", move |args| {
            if plugin.guard().is_held() {
                guard_seen_held.store(true, Ordering::SeqCst);
            }
            let master_position = args[2].as_number().unwrap();
            Ok(vec![ScriptValue::Number(master_position * 2.0)])
        });
    }

    plugin
        .set_joint_dependency(env, slave, Some(master), 0.0, 1.0, Some(HostFunction::new(1, "couple")))
        .unwrap();
    assert_eq!(plugin.dependency_binding_count(), 1);

    plugin.set_joint_position(env, master, 0.3).unwrap();

    assert_eq!(host.call_count("couple"), 1);
    assert!(!guard_seen_held.load(Ordering::SeqCst));
    let slave_position = plugin.joint_position(env, slave).unwrap();
    assert!((slave_position - 0.6).abs() < 1e-12);
    // The callback receives (environment, slave, masterPosition).
    let _ = env;
}

#[test]
fn linear_rule_applies_without_a_callback() {
    let (plugin, _host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);

    plugin
        .set_joint_dependency(env, slave, Some(master), 0.1, -2.0, None)
        .unwrap();
    assert_eq!(plugin.dependency_binding_count(), 0);

    plugin.set_joint_position(env, master, 0.25).unwrap();
    let slave_position = plugin.joint_position(env, slave).unwrap();
    assert!((slave_position - (0.1 - 2.0 * 0.25)).abs() < 1e-12);
}

#[test]
fn non_finite_callback_answer_falls_back_to_the_linear_rule() {
    let (plugin, host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);

    host.define("broken", |_args| Ok(vec![ScriptValue::Number(f64::NAN)]));
    plugin
        .set_joint_dependency(env, slave, Some(master), 0.5, 3.0, Some(HostFunction::new(1, "broken")))
        .unwrap();

    plugin.set_joint_position(env, master, 0.2).unwrap();
    let slave_position = plugin.joint_position(env, slave).unwrap();
    assert!((slave_position - (0.5 + 3.0 * 0.2)).abs() < 1e-12);
    assert!(slave_position.is_finite());
}

#[test]
fn clearing_the_dependency_removes_the_binding() {
    let (plugin, host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);

    host.define("couple", |args| Ok(vec![args[2].clone()]));
    plugin
        .set_joint_dependency(env, slave, Some(master), 0.0, 1.0, Some(HostFunction::new(1, "couple")))
        .unwrap();
    assert_eq!(plugin.dependency_binding_count(), 1);

    plugin
        .set_joint_dependency(env, slave, None, 0.0, 1.0, None)
        .unwrap();
    assert_eq!(plugin.dependency_binding_count(), 0);

    plugin.set_joint_position(env, master, 1.0).unwrap();
    assert_eq!(host.call_count("couple"), 0);
    let slave_position = plugin.joint_position(env, slave).unwrap();
    assert_eq!(slave_position, 0.0);
}

#[test]
fn erasing_the_slave_joint_drops_its_binding() {
    let (plugin, host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);

    host.define("couple", |args| Ok(vec![args[2].clone()]));
    plugin
        .set_joint_dependency(env, slave, Some(master), 0.0, 1.0, Some(HostFunction::new(1, "couple")))
        .unwrap();
    plugin.erase_object(env, slave).unwrap();
    assert_eq!(plugin.dependency_binding_count(), 0);

    plugin.set_joint_position(env, master, 1.0).unwrap();
    assert_eq!(host.call_count("couple"), 0);
}

#[test]
fn erasing_the_environment_drops_its_bindings() {
    let (plugin, host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);
    host.define("couple", |args| Ok(vec![args[2].clone()]));
    plugin
        .set_joint_dependency(env, slave, Some(master), 0.0, 1.0, Some(HostFunction::new(1, "couple")))
        .unwrap();
    assert_eq!(plugin.dependency_binding_count(), 1);

    plugin.erase_environment(env).unwrap();
    assert_eq!(plugin.dependency_binding_count(), 0);
}

#[test]
fn owner_teardown_drops_only_that_owners_bindings() {
    let (plugin, host) = plugin();
    host.define("couple", |args| Ok(vec![args[2].clone()]));

    let (env_a, master_a, slave_a) = two_joints(&plugin, 100);
    let (env_b, master_b, slave_b) = two_joints(&plugin, 200);
    plugin
        .set_joint_dependency(env_a, slave_a, Some(master_a), 0.0, 1.0, Some(HostFunction::new(100, "couple")))
        .unwrap();
    plugin
        .set_joint_dependency(env_b, slave_b, Some(master_b), 0.0, 1.0, Some(HostFunction::new(200, "couple")))
        .unwrap();
    assert_eq!(plugin.dependency_binding_count(), 2);

    plugin.on_context_destroyed(100);
    assert_eq!(plugin.dependency_binding_count(), 1);

    // B's coupling still works.
    plugin.set_joint_position(env_b, master_b, 0.4).unwrap();
    assert_eq!(host.call_count("couple"), 1);
    let slave_position = plugin.joint_position(env_b, slave_b).unwrap();
    assert!((slave_position - 0.4).abs() < 1e-12);
}

#[test]
fn dependency_callback_may_reenter_the_plugin() {
    let (plugin, host) = plugin();
    let (env, master, slave) = two_joints(&plugin, 1);

    {
        let plugin = plugin.clone();
        host.define("couple", move |args| {
            // Reenter with a query against the same environment.
            let env = args[0].as_number().unwrap() as i32;
            let master = plugin.object_handle(env, "master").unwrap();
            let master_position = plugin.joint_position(env, master).unwrap();
            Ok(vec![ScriptValue::Number(-master_position)])
        });
    }
    plugin
        .set_joint_dependency(env, slave, Some(master), 0.0, 1.0, Some(HostFunction::new(1, "couple")))
        .unwrap();

    plugin.set_joint_position(env, master, 0.7).unwrap();
    let slave_position = plugin.joint_position(env, slave).unwrap();
    assert!((slave_position + 0.7).abs() < 1e-12);
}
