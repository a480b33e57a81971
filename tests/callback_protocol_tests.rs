//! The reentrant callback protocol: guard release windows, cursor
//! restoration, nested entry points, and non-finite data rejection.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use armature::{HostFunction, ScriptValue, SolveResultCode, SolverEngine};
use common::{build_arm, plugin};

#[test]
fn solve_converges_without_any_callback() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);
    let result = plugin.handle_groups(arm.environment, arm.group, None).unwrap();
    assert_eq!(result.code, SolveResultCode::Success);
    assert!(!result.invalid_callback_data);
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!((q - std::f64::consts::FRAC_PI_2).abs() < 0.01, "q = {q}");
}

#[test]
fn guard_is_released_for_the_whole_callback_window() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    let observed_held = Arc::new(AtomicBool::new(false));
    {
        let plugin = plugin.clone();
        let observed_held = observed_held.clone();
        host.define("refine", move |_args| {
            if plugin.guard().is_held() {
                observed_held.store(true, Ordering::SeqCst);
            }
            Ok(vec![])
        });
    }

    let result = plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    assert_eq!(result.code, SolveResultCode::Success);
    assert!(host.call_count("refine") > 0);
    assert!(
        !observed_held.load(Ordering::SeqCst),
        "guard was held while host code ran"
    );
    assert!(!plugin.guard().is_held());
}

#[test]
fn callback_receives_consistent_iteration_buffers() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    let shapes = Arc::new(Mutex::new(Vec::new()));
    {
        let shapes = shapes.clone();
        host.define("refine", move |args| {
            let rows = match &args[0] {
                ScriptValue::IntArray(v) => v.len(),
                other => panic!("row constraints not an int array: {other:?}"),
            };
            let cols = match &args[2] {
                ScriptValue::IntArray(v) => v.len(),
                other => panic!("column handles not an int array: {other:?}"),
            };
            let jacobian = args[4].as_number_array().expect("jacobian").len();
            let errors = args[5].as_number_array().expect("error vector").len();
            shapes.lock().unwrap().push((rows, cols, jacobian, errors));
            Ok(vec![])
        });
    }

    plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    let shapes = shapes.lock().unwrap();
    assert!(!shapes.is_empty());
    for (rows, cols, jacobian, errors) in shapes.iter() {
        // One position-constrained element on a one-joint chain.
        assert_eq!(*rows, 3);
        assert_eq!(*cols, 1);
        assert_eq!(*jacobian, rows * cols);
        assert_eq!(*errors, *rows);
    }
}

#[test]
fn cursor_is_restored_after_every_callback() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    let cursor_after_nested = Arc::new(Mutex::new(Vec::new()));
    {
        let plugin = plugin.clone();
        let cursor_after_nested = cursor_after_nested.clone();
        host.define("refine", move |_args| {
            // Nested entry points drag the engine cursor elsewhere.
            let scratch = plugin.create_environment(99).unwrap();
            plugin.erase_environment(scratch).unwrap();
            cursor_after_nested
                .lock()
                .unwrap()
                .push(plugin.engine().current_environment());
            Ok(vec![])
        });
    }

    let result = plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    assert_eq!(result.code, SolveResultCode::Success);
    // Inside the callback the cursor is wherever the nested calls left it
    // (erase clears it); the bridge re-selects before the engine resumes, so
    // the solve still converged on the right environment and the cursor ends
    // on the outer environment.
    assert!(host.call_count("refine") > 1);
    assert_eq!(
        plugin.engine().current_environment(),
        Some(arm.environment)
    );
    assert!(cursor_after_nested.lock().unwrap().iter().all(|c| c.is_none()));
}

#[test]
fn nested_queries_on_the_same_environment_do_not_deadlock() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    let seen_positions = Arc::new(Mutex::new(Vec::new()));
    {
        let plugin = plugin.clone();
        let env = arm.environment;
        let joint = arm.joint;
        let seen_positions = seen_positions.clone();
        host.define("refine", move |_args| {
            let q = plugin.joint_position(env, joint).unwrap();
            seen_positions.lock().unwrap().push(q);
            Ok(vec![])
        });
    }

    let result = plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    assert_eq!(result.code, SolveResultCode::Success);
    let seen = seen_positions.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|q| q.is_finite()));
}

#[test]
fn host_supplied_solution_short_circuits_the_solve() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    host.define("refine", move |_args| {
        Ok(vec![ScriptValue::NumberArray(vec![
            std::f64::consts::FRAC_PI_2,
        ])])
    });

    let result = plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    assert_eq!(result.code, SolveResultCode::Success);
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!((q - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
}

#[test]
fn non_finite_callback_data_fails_the_solve_without_poisoning_state() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    host.define("refine", move |_args| {
        Ok(vec![ScriptValue::NumberArray(vec![f64::NAN])])
    });

    let result = plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    assert_eq!(result.code, SolveResultCode::Fail);
    assert!(result.invalid_callback_data);
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!(q.is_finite(), "NaN leaked into the joint state");
    assert!(!plugin.guard().is_held());
}

#[test]
fn adjusted_error_and_jacobian_are_taken_over() {
    let (plugin, host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    host.define("refine", move |args| {
        // Echo the engine's buffers back unchanged: err then jacobian.
        let jacobian = args[4].as_number_array().unwrap().to_vec();
        let errors = args[5].as_number_array().unwrap().to_vec();
        Ok(vec![
            ScriptValue::NumberArray(errors),
            ScriptValue::NumberArray(jacobian),
        ])
    });

    let result = plugin
        .handle_groups(
            arm.environment,
            arm.group,
            Some(HostFunction::new(1, "refine")),
        )
        .unwrap();

    assert_eq!(result.code, SolveResultCode::Success);
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!((q - std::f64::consts::FRAC_PI_2).abs() < 0.01);
}

#[test]
fn validator_vetoes_and_accepts_candidates() {
    let (plugin, host) = plugin();
    // Target reachable at the current configuration: candidate zero works.
    let arm = build_arm(&plugin, 1, [1.0, 0.0, 0.0]);
    let search_joints = [arm.joint];
    let search = armature::ConfigSearch {
        joints: &search_joints,
        threshold: 0.05,
        metric: None,
        joint_options: None,
        low_limits: None,
        ranges: None,
    };

    let guard_seen_held = Arc::new(AtomicBool::new(false));
    {
        let plugin = plugin.clone();
        let guard_seen_held = guard_seen_held.clone();
        host.define("reject", move |_args| {
            if plugin.guard().is_held() {
                guard_seen_held.store(true, Ordering::SeqCst);
            }
            Ok(vec![ScriptValue::Bool(false)])
        });
    }
    host.define("accept", |args| {
        assert!(args[0].as_number_array().is_some());
        Ok(vec![ScriptValue::Bool(true)])
    });

    let rejected = plugin
        .get_config_for_tip_pose(
            arm.environment,
            arm.group,
            &search,
            5,
            Some(HostFunction::new(1, "reject")),
        )
        .unwrap();
    assert!(rejected.is_none());
    assert!(host.call_count("reject") > 0);
    assert!(!guard_seen_held.load(Ordering::SeqCst));

    let accepted = plugin
        .get_config_for_tip_pose(
            arm.environment,
            arm.group,
            &search,
            5,
            Some(HostFunction::new(1, "accept")),
        )
        .unwrap();
    let config = accepted.expect("config accepted");
    assert_eq!(config.len(), 1);
    assert!(config[0].is_finite());
}

#[test]
fn find_config_respects_its_time_budget() {
    let (plugin, _host) = plugin();
    // Target far out of reach: the search must give up on its own.
    let arm = build_arm(&plugin, 1, [10.0, 0.0, 0.0]);
    let search_joints = [arm.joint];
    let search = armature::ConfigSearch {
        joints: &search_joints,
        threshold: 0.01,
        metric: None,
        joint_options: None,
        low_limits: None,
        ranges: None,
    };

    let started = std::time::Instant::now();
    let found = plugin
        .find_config(
            arm.environment,
            arm.group,
            &search,
            std::time::Duration::from_millis(50),
            None,
        )
        .unwrap();
    assert!(found.is_none());
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(!plugin.guard().is_held());
}

#[test]
fn shape_errors_are_rejected_before_the_guard_is_taken() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [1.0, 0.0, 0.0]);
    let taken_before = plugin.guard().acquisitions();

    let empty: [i32; 0] = [];
    let search = armature::ConfigSearch {
        joints: &empty,
        threshold: 0.1,
        metric: None,
        joint_options: None,
        low_limits: None,
        ranges: None,
    };
    let result = plugin.get_config_for_tip_pose(arm.environment, arm.group, &search, 5, None);
    assert!(matches!(result, Err(armature::PluginError::BadArgument(_))));
    assert_eq!(plugin.guard().acquisitions(), taken_before);
}
