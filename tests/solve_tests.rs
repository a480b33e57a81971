//! Engine-facing behavior through the façade: Jacobian computation, group
//! flags, joint limits, and scene queries.

mod common;

use armature::engine::constants;
use armature::{
    JointType, Pose, PluginError, Quaternion, SolveResultCode,
};
use common::{build_arm, plugin};

#[test]
fn compute_jacobian_matches_the_analytic_column() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    let data = plugin
        .compute_jacobian(
            arm.environment,
            constants::HANDLE_WORLD,
            arm.joint,
            constants::CONSTRAINT_POSITION,
            Pose::new([1.0, 0.0, 0.0], Quaternion::IDENTITY),
            None,
            None,
        )
        .unwrap();

    assert_eq!(data.rows, 3);
    assert_eq!(data.cols, 1);
    // At q = 0 the tip sits at [1, 0, 0]; its velocity is [0, 1, 0].
    assert!(data.jacobian[0].abs() < 1e-5);
    assert!((data.jacobian[1] - 1.0).abs() < 1e-5);
    assert!(data.jacobian[2].abs() < 1e-5);
    // Target defaulted to the tip pose: zero error.
    assert!(data.error_vector.iter().all(|e| e.abs() < 1e-12));
}

#[test]
fn handle_all_solves_every_enabled_group() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);

    // A second, disabled group on the same scene must not be touched.
    let parked = plugin.create_group(arm.environment, Some("parked")).unwrap();
    plugin
        .add_element(arm.environment, parked, arm.tip)
        .unwrap();
    plugin.set_group_flags(arm.environment, parked, 0).unwrap();

    let result = plugin
        .handle_groups(arm.environment, constants::HANDLE_ALL, None)
        .unwrap();
    assert_eq!(result.code, SolveResultCode::Success);
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!((q - std::f64::consts::FRAC_PI_2).abs() < 0.01);
}

#[test]
fn limited_joint_records_limit_hits_and_fails() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);
    // The quarter turn is out of reach: q may only travel to 0.5 rad.
    plugin
        .set_joint_interval(arm.environment, arm.joint, false, Some([-0.5, 1.0]))
        .unwrap();

    let result = plugin.handle_groups(arm.environment, arm.group, None).unwrap();
    assert_eq!(result.code, SolveResultCode::Fail);

    let hits = plugin
        .group_joint_limit_hits(arm.environment, arm.group)
        .unwrap();
    assert!(hits.iter().any(|(joint, overshoot)| {
        *joint == arm.joint && *overshoot > 0.0
    }));
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!(q <= 0.5 + 1e-9);
}

#[test]
fn restore_on_fail_rolls_joint_values_back() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [0.0, 1.0, 0.0]);
    plugin
        .set_joint_interval(arm.environment, arm.joint, false, Some([-0.5, 1.0]))
        .unwrap();
    let flags = plugin.group_flags(arm.environment, arm.group).unwrap();
    plugin
        .set_group_flags(
            arm.environment,
            arm.group,
            flags | constants::GROUP_RESTORE_ON_FAIL,
        )
        .unwrap();

    let result = plugin.handle_groups(arm.environment, arm.group, None).unwrap();
    assert_eq!(result.code, SolveResultCode::Fail);
    let q = plugin.joint_position(arm.environment, arm.joint).unwrap();
    assert!(q.abs() < 1e-9, "joint value not restored: {q}");
}

#[test]
fn object_iteration_walks_the_scene_in_handle_order() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [1.0, 0.0, 0.0]);

    let mut names = Vec::new();
    let mut index = 0;
    while let Some(summary) = plugin.object_at_index(arm.environment, index).unwrap() {
        names.push((summary.handle, summary.name, summary.joint_type));
        index += 1;
    }
    assert_eq!(names.len(), 3);
    assert!(names.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(names[0].1, "base_joint");
    assert_eq!(names[0].2, Some(JointType::Revolute));
    assert_eq!(names[1].2, None);
}

#[test]
fn spherical_joints_reject_scalar_positions() {
    let (plugin, _host) = plugin();
    let env = plugin.create_environment(1).unwrap();
    let ball = plugin
        .create_joint(env, JointType::Spherical, Some("ball"))
        .unwrap();

    assert!(matches!(
        plugin.joint_position(env, ball),
        Err(PluginError::Engine(_))
    ));
    let rotation = Quaternion::from_euler([0.2, 0.0, 0.4]);
    plugin
        .set_spherical_joint_rotation(env, ball, rotation)
        .unwrap();
    let pose = plugin.joint_transformation(env, ball).unwrap();
    assert!((pose.orientation.w - rotation.w).abs() < 1e-12);

    // And the rotation setter rejects non-spherical joints.
    let hinge = plugin
        .create_joint(env, JointType::Revolute, Some("hinge"))
        .unwrap();
    assert!(matches!(
        plugin.set_spherical_joint_rotation(env, hinge, rotation),
        Err(PluginError::Engine(_))
    ));
}

#[test]
fn element_addressing_accepts_the_tip_dummy_flag() {
    let (plugin, _host) = plugin();
    let arm = build_arm(&plugin, 1, [1.0, 0.0, 0.0]);

    let by_flag = arm.tip | constants::HANDLEFLAG_TIP_DUMMY;
    let constraints = plugin
        .element_constraints(arm.environment, arm.group, by_flag)
        .unwrap();
    assert_eq!(constraints, constants::CONSTRAINT_POSITION);

    plugin
        .set_element_constraints(arm.environment, arm.group, by_flag, constants::CONSTRAINT_POSE)
        .unwrap();
    let updated = plugin
        .element_constraints(arm.environment, arm.group, 0)
        .unwrap();
    assert_eq!(updated, constants::CONSTRAINT_POSE);
}

#[test]
fn keep_in_place_reparenting_preserves_the_world_pose() {
    let (plugin, _host) = plugin();
    let env = plugin.create_environment(1).unwrap();
    let joint = plugin
        .create_joint(env, JointType::Revolute, None)
        .unwrap();
    let marker = plugin.create_dummy(env, None).unwrap();
    plugin
        .set_object_transformation(
            env,
            marker,
            constants::HANDLE_WORLD,
            &Pose::new([0.3, -0.2, 0.7], Quaternion::from_euler([0.1, 0.0, 0.2])),
        )
        .unwrap();
    plugin.set_joint_position(env, joint, 0.8).unwrap();

    let before = plugin
        .object_transformation(env, marker, constants::HANDLE_WORLD)
        .unwrap();
    plugin
        .set_object_parent(env, marker, Some(joint), true)
        .unwrap();
    let after = plugin
        .object_transformation(env, marker, constants::HANDLE_WORLD)
        .unwrap();

    for i in 0..3 {
        assert!((before.position[i] - after.position[i]).abs() < 1e-9);
    }
    assert!((before.orientation.w.abs() - after.orientation.w.abs()).abs() < 1e-9);
}
