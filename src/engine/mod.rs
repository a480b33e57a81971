//! Solver-engine boundary.
//!
//! The plugin layer drives an external kinematics engine through this trait
//! and never looks inside it. The engine owns all per-environment numerical
//! state, addressed through a single *current environment* cursor: callers
//! switch first, then operate. Handles are opaque non-negative integers the
//! engine allocates; the plugin only records them.
//!
//! Everything here is invoked under the interface guard. The one place the
//! engine hands control back out — the callback parameters of the solve and
//! config-search operations — runs with the guard *released* by the callback
//! bridge, so an engine implementation must not hold internal locks across a
//! callback invocation.

use std::sync::Weak;
use std::time::Duration;

use crate::error::EngineResult;
use crate::transform::{Pose, Quaternion};

pub mod constants;
pub mod memory;

/// Opaque handle of one engine-internal environment.
pub type EnvironmentHandle = i32;
/// Opaque handle of a scene object (joint or dummy) inside an environment.
pub type ObjectHandle = i32;
/// Opaque handle of a solver group inside an environment.
pub type GroupHandle = i32;
/// Opaque handle of one element inside a solver group.
pub type ElementHandle = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ObjectType {
    Joint,
    Dummy,
}

impl ObjectType {
    pub fn as_raw(self) -> i32 {
        match self {
            ObjectType::Joint => constants::OBJECT_TYPE_JOINT,
            ObjectType::Dummy => constants::OBJECT_TYPE_DUMMY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JointType {
    Revolute,
    Prismatic,
    Spherical,
}

impl JointType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            constants::JOINT_TYPE_REVOLUTE => Some(JointType::Revolute),
            constants::JOINT_TYPE_PRISMATIC => Some(JointType::Prismatic),
            constants::JOINT_TYPE_SPHERICAL => Some(JointType::Spherical),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            JointType::Revolute => constants::JOINT_TYPE_REVOLUTE,
            JointType::Prismatic => constants::JOINT_TYPE_PRISMATIC,
            JointType::Spherical => constants::JOINT_TYPE_SPHERICAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JointMode {
    Passive,
    Ik,
}

impl JointMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            constants::JOINT_MODE_PASSIVE => Some(JointMode::Passive),
            constants::JOINT_MODE_IK => Some(JointMode::Ik),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            JointMode::Passive => constants::JOINT_MODE_PASSIVE,
            JointMode::Ik => constants::JOINT_MODE_IK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CalcMethod {
    PseudoInverse,
    DampedLeastSquares,
    JacobianTranspose,
    UndampedPseudoInverse,
}

impl CalcMethod {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            constants::METHOD_PSEUDO_INVERSE => Some(CalcMethod::PseudoInverse),
            constants::METHOD_DAMPED_LEAST_SQUARES => Some(CalcMethod::DampedLeastSquares),
            constants::METHOD_JACOBIAN_TRANSPOSE => Some(CalcMethod::JacobianTranspose),
            constants::METHOD_UNDAMPED_PSEUDO_INVERSE => Some(CalcMethod::UndampedPseudoInverse),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            CalcMethod::PseudoInverse => constants::METHOD_PSEUDO_INVERSE,
            CalcMethod::DampedLeastSquares => constants::METHOD_DAMPED_LEAST_SQUARES,
            CalcMethod::JacobianTranspose => constants::METHOD_JACOBIAN_TRANSPOSE,
            CalcMethod::UndampedPseudoInverse => constants::METHOD_UNDAMPED_PSEUDO_INVERSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveResultCode {
    NotPerformed,
    Success,
    Fail,
}

impl SolveResultCode {
    pub fn as_raw(self) -> i32 {
        match self {
            SolveResultCode::NotPerformed => constants::RESULT_NOT_PERFORMED,
            SolveResultCode::Success => constants::RESULT_SUCCESS,
            SolveResultCode::Fail => constants::RESULT_FAIL,
        }
    }
}

/// Outcome of a `handle_groups` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveResult {
    pub code: SolveResultCode,
    /// Set when a refinement callback fed non-finite data back to the solver
    /// and the affected iteration was aborted.
    pub invalid_callback_data: bool,
}

impl SolveResult {
    pub fn is_success(&self) -> bool {
        self.code == SolveResultCode::Success
    }
}

/// Group calculation parameters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupCalculation {
    pub method: CalcMethod,
    pub damping: f64,
    pub max_iterations: u32,
}

impl Default for GroupCalculation {
    fn default() -> Self {
        Self {
            method: CalcMethod::PseudoInverse,
            damping: 0.1,
            max_iterations: 3,
        }
    }
}

/// One row of the `object_at_index` iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub handle: ObjectHandle,
    pub name: String,
    pub object_type: ObjectType,
    pub joint_type: Option<JointType>,
}

/// Scratch state of one solver iteration, handed to the refinement callback.
///
/// `jacobian` is row-major `rows * cols`; `error_vector` has one entry per
/// row; `solution` has one entry per column and is only read back when the
/// refiner answers [`RefineOutcome::Solved`].
pub struct JacobianProblem<'a> {
    pub rows: usize,
    pub cols: usize,
    pub row_constraints: &'a [i32],
    pub row_elements: &'a [ElementHandle],
    pub col_handles: &'a [ObjectHandle],
    pub col_stages: &'a [i32],
    pub jacobian: &'a mut Vec<f64>,
    pub error_vector: &'a mut Vec<f64>,
    pub solution: &'a mut [f64],
}

/// What a refinement callback did with the iteration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineOutcome {
    /// Nothing supplied; the engine continues with its own buffers.
    Untouched,
    /// Jacobian and/or error vector were updated in place.
    Adjusted,
    /// A full joint-value solution was written to `solution`; the engine
    /// applies it and skips its own update step.
    Solved,
    /// The callback supplied non-finite data; the engine must treat the
    /// iteration as failed rather than propagate it.
    InvalidData,
}

/// Per-iteration refinement hook for `handle_groups`.
pub trait JacobianRefiner {
    fn refine(&mut self, problem: &mut JacobianProblem<'_>) -> RefineOutcome;
}

/// Candidate-configuration hook for the config searches.
pub trait ConfigValidator {
    fn validate(&mut self, config: &[f64]) -> bool;
}

/// Routes evaluation of script-flagged joint dependencies back to the plugin
/// layer. Installed once; the engine calls it with the owning environment,
/// the dependent (slave) joint and the master's current position whenever a
/// flagged dependency must be resolved. `None` means "no scripted answer" and
/// falls back to the joint's linear `offset + mult * master` rule.
pub trait DependencyHandler: Send + Sync {
    fn evaluate(
        &self,
        environment: EnvironmentHandle,
        slave: ObjectHandle,
        master_position: f64,
    ) -> Option<f64>;
}

/// Parameters shared by the two config searches.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSearch<'a> {
    pub joints: &'a [ObjectHandle],
    /// Pose-distance threshold under which a candidate counts as a solution.
    pub threshold: f64,
    /// Weights for the pose metric: x, y, z, angular.
    pub metric: Option<[f64; 4]>,
    /// Per-joint option bits ([`constants::CONFIG_JOINT_FIXED`]).
    pub joint_options: Option<&'a [i32]>,
    /// Per-joint sampling range override: lower bounds.
    pub low_limits: Option<&'a [f64]>,
    /// Per-joint sampling range override: extents.
    pub ranges: Option<&'a [f64]>,
}

/// Jacobian snapshot returned by `compute_jacobian`.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianData {
    pub rows: usize,
    pub cols: usize,
    pub jacobian: Vec<f64>,
    pub error_vector: Vec<f64>,
}

/// The engine boundary. All operations except the environment-lifecycle ones
/// act on the current environment selected with [`switch_environment`].
///
/// [`switch_environment`]: SolverEngine::switch_environment
pub trait SolverEngine {
    // -- Environment lifecycle --

    fn create_environment(&self) -> EngineResult<EnvironmentHandle>;
    /// Erases the current environment. The cursor is unset afterwards.
    fn erase_environment(&self) -> EngineResult<()>;
    fn duplicate_environment(&self) -> EngineResult<EnvironmentHandle>;
    /// Repoints the current-environment cursor. Returns false for handles the
    /// engine does not recognize; the cursor is left unchanged in that case.
    fn switch_environment(&self, environment: EnvironmentHandle) -> bool;
    fn current_environment(&self) -> Option<EnvironmentHandle>;
    fn alive_environments(&self) -> Vec<EnvironmentHandle>;
    /// Serializes the current environment to an opaque blob.
    fn save(&self) -> EngineResult<Vec<u8>>;
    /// Replaces the current environment's content from a `save` blob.
    fn load(&self, data: &[u8]) -> EngineResult<()>;

    // -- Objects --

    fn object_at_index(&self, index: usize) -> Option<ObjectSummary>;
    fn object_handle(&self, name: &str) -> EngineResult<ObjectHandle>;
    fn object_exists(&self, name: &str) -> bool;
    fn erase_object(&self, object: ObjectHandle) -> EngineResult<()>;
    fn object_parent(&self, object: ObjectHandle) -> EngineResult<Option<ObjectHandle>>;
    fn set_object_parent(
        &self,
        object: ObjectHandle,
        parent: Option<ObjectHandle>,
        keep_in_place: bool,
    ) -> EngineResult<()>;
    /// Pose of `object` relative to `relative_to` ([`constants::HANDLE_WORLD`]
    /// or [`constants::HANDLE_PARENT`] pseudo-handles allowed).
    fn object_transformation(
        &self,
        object: ObjectHandle,
        relative_to: ObjectHandle,
    ) -> EngineResult<Pose>;
    fn set_object_transformation(
        &self,
        object: ObjectHandle,
        relative_to: ObjectHandle,
        pose: &Pose,
    ) -> EngineResult<()>;

    // -- Dummies --

    fn create_dummy(&self, name: Option<&str>) -> EngineResult<ObjectHandle>;
    fn linked_dummy(&self, dummy: ObjectHandle) -> EngineResult<Option<ObjectHandle>>;
    fn set_linked_dummy(
        &self,
        dummy: ObjectHandle,
        linked: Option<ObjectHandle>,
    ) -> EngineResult<()>;

    // -- Joints --

    fn create_joint(&self, joint_type: JointType, name: Option<&str>) -> EngineResult<ObjectHandle>;
    fn joint_type(&self, joint: ObjectHandle) -> EngineResult<JointType>;
    fn joint_mode(&self, joint: ObjectHandle) -> EngineResult<JointMode>;
    fn set_joint_mode(&self, joint: ObjectHandle, mode: JointMode) -> EngineResult<()>;
    fn joint_interval(&self, joint: ObjectHandle) -> EngineResult<(bool, [f64; 2])>;
    /// `interval` is `[minimum, range]`; `None` keeps the stored interval and
    /// only toggles the cyclic flag.
    fn set_joint_interval(
        &self,
        joint: ObjectHandle,
        cyclic: bool,
        interval: Option<[f64; 2]>,
    ) -> EngineResult<()>;
    fn joint_screw_lead(&self, joint: ObjectHandle) -> EngineResult<f64>;
    fn set_joint_screw_lead(&self, joint: ObjectHandle, lead: f64) -> EngineResult<()>;
    fn joint_weight(&self, joint: ObjectHandle) -> EngineResult<f64>;
    fn set_joint_weight(&self, joint: ObjectHandle, weight: f64) -> EngineResult<()>;
    fn joint_limit_margin(&self, joint: ObjectHandle) -> EngineResult<f64>;
    fn set_joint_limit_margin(&self, joint: ObjectHandle, margin: f64) -> EngineResult<()>;
    fn joint_max_step_size(&self, joint: ObjectHandle) -> EngineResult<f64>;
    fn set_joint_max_step_size(&self, joint: ObjectHandle, step: f64) -> EngineResult<()>;
    fn joint_position(&self, joint: ObjectHandle) -> EngineResult<f64>;
    fn set_joint_position(&self, joint: ObjectHandle, position: f64) -> EngineResult<()>;
    /// Motion transform of the joint: rotation about Z for revolute joints,
    /// translation along Z for prismatic, free rotation for spherical.
    fn joint_transformation(&self, joint: ObjectHandle) -> EngineResult<Pose>;
    fn set_spherical_joint_rotation(
        &self,
        joint: ObjectHandle,
        orientation: Quaternion,
    ) -> EngineResult<()>;
    fn joint_dependency(
        &self,
        joint: ObjectHandle,
    ) -> EngineResult<Option<(ObjectHandle, f64, f64)>>;
    /// `master = None` clears the dependency. `scripted` flags the dependency
    /// for routing through the installed [`DependencyHandler`].
    fn set_joint_dependency(
        &self,
        slave: ObjectHandle,
        master: Option<ObjectHandle>,
        offset: f64,
        mult: f64,
        scripted: bool,
    ) -> EngineResult<()>;

    // -- Groups and elements --

    fn group_handle(&self, name: &str) -> EngineResult<GroupHandle>;
    fn group_exists(&self, name: &str) -> bool;
    fn create_group(&self, name: Option<&str>) -> EngineResult<GroupHandle>;
    fn group_flags(&self, group: GroupHandle) -> EngineResult<u32>;
    fn set_group_flags(&self, group: GroupHandle, flags: u32) -> EngineResult<()>;
    fn group_calculation(&self, group: GroupHandle) -> EngineResult<GroupCalculation>;
    fn set_group_calculation(&self, group: GroupHandle, calc: GroupCalculation)
        -> EngineResult<()>;
    /// Joints that hit a limit during the last solve of this group, with the
    /// amount they over- or undershot.
    fn group_joint_limit_hits(&self, group: GroupHandle) -> EngineResult<Vec<(ObjectHandle, f64)>>;
    fn add_element(&self, group: GroupHandle, tip: ObjectHandle) -> EngineResult<ElementHandle>;
    fn element_flags(&self, group: GroupHandle, element: ElementHandle) -> EngineResult<u32>;
    fn set_element_flags(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        flags: u32,
    ) -> EngineResult<()>;
    /// Returns `(base, constraints_base)`.
    fn element_base(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<(Option<ObjectHandle>, Option<ObjectHandle>)>;
    fn set_element_base(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        base: Option<ObjectHandle>,
        constraints_base: Option<ObjectHandle>,
    ) -> EngineResult<()>;
    fn element_constraints(&self, group: GroupHandle, element: ElementHandle)
        -> EngineResult<u32>;
    fn set_element_constraints(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        constraints: u32,
    ) -> EngineResult<()>;
    /// Returns `[linear, angular]` precision.
    fn element_precision(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<[f64; 2]>;
    fn set_element_precision(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        precision: [f64; 2],
    ) -> EngineResult<()>;
    /// Returns `[linear, angular]` weights.
    fn element_weights(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<[f64; 2]>;
    fn set_element_weights(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        weights: [f64; 2],
    ) -> EngineResult<()>;

    // -- Solving --

    /// Resolves `group` ([`constants::HANDLE_ALL`] for every enabled group)
    /// and runs the iterative solve, consulting `refiner` once per iteration
    /// when present.
    fn handle_groups(
        &self,
        group: GroupHandle,
        refiner: Option<&mut dyn JacobianRefiner>,
    ) -> EngineResult<SolveResult>;
    fn compute_jacobian(
        &self,
        base: ObjectHandle,
        alt_base: Option<ObjectHandle>,
        last_joint: ObjectHandle,
        constraints: u32,
        tip: &Pose,
        target: &Pose,
    ) -> EngineResult<JacobianData>;
    /// Iterative search for a configuration placing the group's tips on their
    /// targets, bounded by attempt count.
    fn get_config_for_tip_pose(
        &self,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        max_attempts: u32,
        validator: Option<&mut dyn ConfigValidator>,
    ) -> EngineResult<Option<Vec<f64>>>;
    /// Randomized best-effort search bounded by wall-clock budget.
    fn find_config(
        &self,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        time_budget: Duration,
        validator: Option<&mut dyn ConfigValidator>,
    ) -> EngineResult<Option<Vec<f64>>>;

    // -- Dependency routing --

    fn install_dependency_handler(&self, handler: Weak<dyn DependencyHandler>);
}
