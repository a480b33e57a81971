//! Integer constants exposed to the host scripting environment.

/// Pseudo-handle addressing every enabled solver group.
pub const HANDLE_ALL: i32 = -2;
/// Pseudo-handle meaning "relative to the object's parent".
pub const HANDLE_PARENT: i32 = -11;
/// Pseudo-handle for the world frame / no parent.
pub const HANDLE_WORLD: i32 = -1;
/// Flag ORed onto a tip handle to address its linked target dummy instead.
pub const HANDLEFLAG_TIP_DUMMY: i32 = 0x0040_0000;

pub const OBJECT_TYPE_JOINT: i32 = 1;
pub const OBJECT_TYPE_DUMMY: i32 = 2;

pub const JOINT_MODE_PASSIVE: i32 = 0;
pub const JOINT_MODE_IK: i32 = 1;

pub const JOINT_TYPE_REVOLUTE: i32 = 10;
pub const JOINT_TYPE_PRISMATIC: i32 = 11;
pub const JOINT_TYPE_SPHERICAL: i32 = 12;

pub const CONSTRAINT_X: u32 = 1;
pub const CONSTRAINT_Y: u32 = 2;
pub const CONSTRAINT_Z: u32 = 4;
pub const CONSTRAINT_ALPHA_BETA: u32 = 8;
pub const CONSTRAINT_GAMMA: u32 = 16;
pub const CONSTRAINT_POSITION: u32 = CONSTRAINT_X | CONSTRAINT_Y | CONSTRAINT_Z;
pub const CONSTRAINT_ORIENTATION: u32 = CONSTRAINT_ALPHA_BETA | CONSTRAINT_GAMMA;
pub const CONSTRAINT_POSE: u32 = CONSTRAINT_POSITION | CONSTRAINT_ORIENTATION;

pub const METHOD_PSEUDO_INVERSE: i32 = 0;
pub const METHOD_DAMPED_LEAST_SQUARES: i32 = 1;
pub const METHOD_JACOBIAN_TRANSPOSE: i32 = 2;
pub const METHOD_UNDAMPED_PSEUDO_INVERSE: i32 = 3;

pub const RESULT_NOT_PERFORMED: i32 = 0;
pub const RESULT_SUCCESS: i32 = 1;
pub const RESULT_FAIL: i32 = 2;

/// Group flag: the group participates in `HANDLE_ALL` solves.
pub const GROUP_ENABLED: u32 = 1;
/// Group flag: joints may exceed their max step size in one iteration.
pub const GROUP_IGNORE_MAX_STEPS: u32 = 2;
/// Group flag: restore joint values when the solve fails.
pub const GROUP_RESTORE_ON_FAIL: u32 = 4;
/// Group flag: abort the solve when a joint hits a limit.
pub const GROUP_STOP_ON_LIMIT_HIT: u32 = 8;

/// Element flag: the element participates in its group's solve.
pub const ELEMENT_ENABLED: u32 = 1;

/// Config-search joint option: keep the joint at its current position
/// instead of sampling it.
pub const CONFIG_JOINT_FIXED: i32 = 1;
