//! Registry/engine agreement and owner-context lifecycle.

mod common;

use armature::{PluginError, SolverEngine};
use common::{build_arm, plugin};

fn registered_handles(plugin: &common::TestPlugin) -> Vec<i32> {
    let mut handles: Vec<i32> = plugin
        .registered_environments()
        .iter()
        .map(|e| e.environment)
        .collect();
    handles.sort_unstable();
    handles
}

#[test]
fn registry_tracks_exactly_the_engine_state() {
    let (plugin, _host) = plugin();
    let e1 = plugin.create_environment(100).unwrap();
    let e2 = plugin.create_environment(100).unwrap();
    let e3 = plugin.create_environment(200).unwrap();

    assert_eq!(registered_handles(&plugin), vec![e1, e2, e3]);
    assert_eq!(plugin.engine().alive_environments(), vec![e1, e2, e3]);

    plugin.erase_environment(e2).unwrap();
    assert_eq!(registered_handles(&plugin), vec![e1, e3]);
    assert_eq!(plugin.engine().alive_environments(), vec![e1, e3]);
}

#[test]
fn owner_teardown_sweeps_only_that_owner() {
    let (plugin, _host) = plugin();
    let e1 = plugin.create_environment(100).unwrap();
    let e2 = plugin.create_environment(100).unwrap();
    let e3 = plugin.create_environment(200).unwrap();

    plugin.on_context_destroyed(100);

    assert_eq!(registered_handles(&plugin), vec![e3]);
    assert_eq!(plugin.engine().alive_environments(), vec![e3]);
    for gone in [e1, e2] {
        assert!(matches!(
            plugin.save(gone),
            Err(PluginError::InvalidEnvironment(_))
        ));
    }
}

#[test]
fn sweeping_an_empty_owner_is_a_noop() {
    let (plugin, _host) = plugin();
    let e1 = plugin.create_environment(100).unwrap();

    plugin.on_context_destroyed(999);
    plugin.on_context_destroyed(100);
    plugin.on_context_destroyed(100);

    assert!(registered_handles(&plugin).is_empty());
    assert!(plugin.engine().alive_environments().is_empty());
    let _ = e1;
}

#[test]
fn erasing_a_stale_handle_reports_invalid_and_changes_nothing() {
    let (plugin, _host) = plugin();
    let e1 = plugin.create_environment(100).unwrap();
    let e2 = plugin.create_environment(100).unwrap();

    plugin.erase_environment(e1).unwrap();
    let again = plugin.erase_environment(e1);
    assert!(matches!(again, Err(PluginError::InvalidEnvironment(h)) if h == e1));
    assert_eq!(registered_handles(&plugin), vec![e2]);
    assert_eq!(plugin.engine().alive_environments(), vec![e2]);
    assert!(!plugin.guard().is_held());
}

#[test]
fn duplicate_registers_the_copy_under_the_given_owner() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 100, [1.0, 0.0, 0.0]);
    let copy = plugin.duplicate_environment(arm.environment, 200).unwrap();

    assert_ne!(copy, arm.environment);
    let owners: Vec<(i32, i32)> = plugin
        .registered_environments()
        .iter()
        .map(|e| (e.environment, e.owner))
        .collect();
    assert!(owners.contains(&(arm.environment, 100)));
    assert!(owners.contains(&(copy, 200)));

    // The duplicate carries the scene; the joint resolves by name.
    let joint = plugin.object_handle(copy, "base_joint").unwrap();
    assert_eq!(joint, arm.joint);

    plugin.on_context_destroyed(200);
    assert_eq!(registered_handles(&plugin), vec![arm.environment]);
}

#[test]
fn save_load_round_trips_through_an_opaque_blob() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [1.0, 0.0, 0.0]);
    plugin
        .set_joint_position(arm.environment, arm.joint, 0.25)
        .unwrap();
    let blob = plugin.save(arm.environment).unwrap();
    assert!(!blob.is_empty());

    plugin
        .set_joint_position(arm.environment, arm.joint, 0.9)
        .unwrap();
    plugin.load(arm.environment, &blob).unwrap();
    let restored = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!((restored - 0.25).abs() < 1e-12);
}

#[test]
fn guard_serializes_concurrent_lifecycle_traffic() {
    let (plugin, _host) = plugin();
    let mut workers = Vec::new();
    for t in 0..4 {
        let plugin = plugin.clone();
        workers.push(std::thread::spawn(move || {
            let owner = 100 + t;
            for _ in 0..25 {
                let env = plugin.create_environment(owner).unwrap();
                plugin.erase_environment(env).unwrap();
            }
            let kept = plugin.create_environment(owner).unwrap();
            kept
        }));
    }
    let kept: Vec<i32> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let mut expected = kept.clone();
    expected.sort_unstable();
    assert_eq!(registered_handles(&plugin), expected);
    assert_eq!(plugin.engine().alive_environments(), expected);
    assert!(!plugin.guard().is_held());
    // 4 workers * (25 create + 25 erase + 1 create), plus the snapshots above.
    assert!(plugin.guard().acquisitions() >= 204);
}
