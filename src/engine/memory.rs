//! In-memory reference engine.
//!
//! Implements the [`SolverEngine`] boundary without linking a real
//! kinematics library: environments are plain object trees, forward
//! kinematics is computed by composing poses down the parent chain, and the
//! Jacobian is obtained by finite differences. The solve loop runs a
//! Jacobian-transpose update for every calculation method — good enough to
//! drive the callback protocol and the tests, not a production solver.
//!
//! Real deployments implement [`SolverEngine`] over their solver of choice;
//! this engine exists so the protocol layer has something real to push
//! against.

use std::sync::{Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::engine::{
    constants, ConfigSearch, ConfigValidator, DependencyHandler, ElementHandle,
    EnvironmentHandle, GroupCalculation, GroupHandle, JacobianData, JacobianProblem,
    JacobianRefiner, JointMode, JointType, ObjectHandle, ObjectSummary, ObjectType,
    RefineOutcome, SolveResult, SolveResultCode, SolverEngine,
};
use crate::error::{EngineError, EngineResult};
use crate::transform::{Pose, Quaternion};

const DEFAULT_METRIC: [f64; 4] = [1.0, 1.0, 1.0, 0.1];
const FD_EPSILON: f64 = 1e-6;
const STEP_GAIN: f64 = 0.5;

fn fail(message: impl Into<String>) -> EngineError {
    EngineError::new(message)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DependencySpec {
    master: ObjectHandle,
    offset: f64,
    mult: f64,
    scripted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JointModel {
    joint_type: JointType,
    mode: JointMode,
    cyclic: bool,
    /// `[minimum, range]`, meaningful when not cyclic.
    interval: [f64; 2],
    screw_lead: f64,
    weight: f64,
    limit_margin: f64,
    max_step_size: f64,
    position: f64,
    orientation: Quaternion,
    dependency: Option<DependencySpec>,
}

impl JointModel {
    fn new(joint_type: JointType) -> Self {
        Self {
            joint_type,
            mode: JointMode::Ik,
            cyclic: true,
            interval: [-std::f64::consts::PI, 2.0 * std::f64::consts::PI],
            screw_lead: 0.0,
            weight: 1.0,
            limit_margin: 0.0,
            max_step_size: 0.1,
            position: 0.0,
            orientation: Quaternion::IDENTITY,
            dependency: None,
        }
    }

    /// Clamps a candidate position to the joint's admissible range and
    /// reports the overshoot when a limit was hit.
    fn clamp(&self, position: f64) -> (f64, Option<f64>) {
        if self.cyclic {
            return (position, None);
        }
        let low = self.interval[0] + self.limit_margin;
        let high = self.interval[0] + self.interval[1] - self.limit_margin;
        if position < low {
            (low, Some(position - low))
        } else if position > high {
            (high, Some(position - high))
        } else {
            (position, None)
        }
    }

    /// The joint's motion transform for its current state.
    fn motion(&self) -> Pose {
        match self.joint_type {
            JointType::Revolute => {
                let screw = self.position / (2.0 * std::f64::consts::PI) * self.screw_lead;
                Pose::new(
                    [0.0, 0.0, screw],
                    Quaternion::from_axis_angle([0.0, 0.0, 1.0], self.position),
                )
            }
            JointType::Prismatic => Pose::new([0.0, 0.0, self.position], Quaternion::IDENTITY),
            JointType::Spherical => Pose::new([0.0; 3], self.orientation),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ObjectKind {
    Dummy { linked: Option<ObjectHandle> },
    Joint(JointModel),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SceneObject {
    handle: ObjectHandle,
    name: String,
    parent: Option<ObjectHandle>,
    /// Frame of the object relative to its parent, before joint motion.
    local_pose: Pose,
    kind: ObjectKind,
}

impl SceneObject {
    fn joint(&self) -> Option<&JointModel> {
        match &self.kind {
            ObjectKind::Joint(j) => Some(j),
            _ => None,
        }
    }

    fn joint_mut(&mut self) -> Option<&mut JointModel> {
        match &mut self.kind {
            ObjectKind::Joint(j) => Some(j),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ElementModel {
    handle: ElementHandle,
    tip: ObjectHandle,
    base: Option<ObjectHandle>,
    constraints_base: Option<ObjectHandle>,
    constraints: u32,
    flags: u32,
    precision: [f64; 2],
    weights: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupModel {
    handle: GroupHandle,
    name: String,
    flags: u32,
    calculation: GroupCalculation,
    next_element: ElementHandle,
    elements: Vec<ElementModel>,
    #[serde(default)]
    last_limit_hits: Vec<(ObjectHandle, f64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EnvironmentModel {
    next_handle: i32,
    objects: FxHashMap<ObjectHandle, SceneObject>,
    groups: FxHashMap<GroupHandle, GroupModel>,
}

impl EnvironmentModel {
    fn allocate(&mut self) -> i32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn object(&self, handle: ObjectHandle) -> EngineResult<&SceneObject> {
        self.objects
            .get(&handle)
            .ok_or_else(|| fail(format!("invalid object handle {handle}")))
    }

    fn object_mut(&mut self, handle: ObjectHandle) -> EngineResult<&mut SceneObject> {
        self.objects
            .get_mut(&handle)
            .ok_or_else(|| fail(format!("invalid object handle {handle}")))
    }

    fn joint(&self, handle: ObjectHandle) -> EngineResult<&JointModel> {
        self.object(handle)?
            .joint()
            .ok_or_else(|| fail(format!("object {handle} is not a joint")))
    }

    fn joint_mut(&mut self, handle: ObjectHandle) -> EngineResult<&mut JointModel> {
        self.object_mut(handle)?
            .joint_mut()
            .ok_or_else(|| fail(format!("object {handle} is not a joint")))
    }

    fn group(&self, handle: GroupHandle) -> EngineResult<&GroupModel> {
        self.groups
            .get(&handle)
            .ok_or_else(|| fail(format!("invalid group handle {handle}")))
    }

    fn group_mut(&mut self, handle: GroupHandle) -> EngineResult<&mut GroupModel> {
        self.groups
            .get_mut(&handle)
            .ok_or_else(|| fail(format!("invalid group handle {handle}")))
    }

    fn name_in_use(&self, name: &str) -> bool {
        self.objects.values().any(|o| o.name == name)
            || self.groups.values().any(|g| g.name == name)
    }

    /// Elements are addressed by their own handle or by their tip dummy with
    /// the tip-dummy flag ORed in.
    fn element_index(&self, group: GroupHandle, element: ElementHandle) -> EngineResult<usize> {
        let group = self.group(group)?;
        let found = if element & constants::HANDLEFLAG_TIP_DUMMY != 0 {
            let tip = element & !constants::HANDLEFLAG_TIP_DUMMY;
            group.elements.iter().position(|e| e.tip == tip)
        } else {
            group.elements.iter().position(|e| e.handle == element)
        };
        found.ok_or_else(|| fail(format!("invalid element handle {element}")))
    }

    /// World pose of an object, joint motion included.
    fn world_pose(&self, handle: ObjectHandle) -> EngineResult<Pose> {
        let mut chain = Vec::new();
        let mut cursor = Some(handle);
        while let Some(h) = cursor {
            let object = self.object(h)?;
            chain.push(h);
            cursor = object.parent;
            if chain.len() > self.objects.len() {
                return Err(fail("object parent chain contains a cycle"));
            }
        }
        let mut pose = Pose::IDENTITY;
        for h in chain.into_iter().rev() {
            let object = &self.objects[&h];
            pose = pose.compose(object.local_pose);
            if let ObjectKind::Joint(j) = &object.kind {
                pose = pose.compose(j.motion());
            }
        }
        Ok(pose)
    }

    fn relative_pose(&self, object: ObjectHandle, relative_to: ObjectHandle) -> EngineResult<Pose> {
        let world = self.world_pose(object)?;
        match relative_to {
            constants::HANDLE_WORLD => Ok(world),
            constants::HANDLE_PARENT => match self.object(object)?.parent {
                Some(parent) => Ok(self.world_pose(parent)?.inverse().compose(world)),
                None => Ok(world),
            },
            reference => Ok(self.world_pose(reference)?.inverse().compose(world)),
        }
    }

    /// IK-mode revolute/prismatic joints on the path from `tip` up to (and
    /// excluding) `base`, ordered base-to-tip.
    fn chain_joints(
        &self,
        tip: ObjectHandle,
        base: Option<ObjectHandle>,
    ) -> EngineResult<Vec<ObjectHandle>> {
        let mut joints = Vec::new();
        let mut cursor = self.object(tip)?.parent;
        while let Some(h) = cursor {
            if Some(h) == base {
                break;
            }
            let object = self.object(h)?;
            if let ObjectKind::Joint(j) = &object.kind {
                if j.mode == JointMode::Ik && j.joint_type != JointType::Spherical {
                    joints.push(h);
                }
            }
            cursor = object.parent;
        }
        joints.reverse();
        Ok(joints)
    }

    /// Error rows for one element: the world-frame correction moving the tip
    /// onto its target, selected by the element's constraint bits.
    fn element_error(&self, element: &ElementModel) -> EngineResult<Vec<(u32, f64)>> {
        let tip = self.world_pose(element.tip)?;
        let target = match self.object(element.tip)?.kind {
            ObjectKind::Dummy {
                linked: Some(linked),
            } => self.world_pose(linked)?,
            _ => return Err(fail(format!("tip dummy {} has no target", element.tip))),
        };
        let dp = [
            target.position[0] - tip.position[0],
            target.position[1] - tip.position[1],
            target.position[2] - tip.position[2],
        ];
        let dq = tip.orientation.conjugate().mul(target.orientation);
        let angular = dq.to_euler();
        let mut rows = Vec::new();
        let c = element.constraints;
        if c & constants::CONSTRAINT_X != 0 {
            rows.push((constants::CONSTRAINT_X, dp[0] * element.weights[0]));
        }
        if c & constants::CONSTRAINT_Y != 0 {
            rows.push((constants::CONSTRAINT_Y, dp[1] * element.weights[0]));
        }
        if c & constants::CONSTRAINT_Z != 0 {
            rows.push((constants::CONSTRAINT_Z, dp[2] * element.weights[0]));
        }
        if c & constants::CONSTRAINT_ALPHA_BETA != 0 {
            rows.push((constants::CONSTRAINT_ALPHA_BETA, angular[0] * element.weights[1]));
            rows.push((constants::CONSTRAINT_ALPHA_BETA, angular[1] * element.weights[1]));
        }
        if c & constants::CONSTRAINT_GAMMA != 0 {
            rows.push((constants::CONSTRAINT_GAMMA, angular[2] * element.weights[1]));
        }
        Ok(rows)
    }
}

#[derive(Debug, Default)]
struct EngineState {
    next_environment: EnvironmentHandle,
    current: Option<EnvironmentHandle>,
    environments: FxHashMap<EnvironmentHandle, EnvironmentModel>,
}

impl EngineState {
    fn current_env(&self) -> EngineResult<(EnvironmentHandle, &EnvironmentModel)> {
        let handle = self
            .current
            .ok_or_else(|| fail("no environment selected"))?;
        let model = self
            .environments
            .get(&handle)
            .ok_or_else(|| fail("no environment selected"))?;
        Ok((handle, model))
    }

    fn current_env_mut(&mut self) -> EngineResult<(EnvironmentHandle, &mut EnvironmentModel)> {
        let handle = self
            .current
            .ok_or_else(|| fail("no environment selected"))?;
        let model = self
            .environments
            .get_mut(&handle)
            .ok_or_else(|| fail("no environment selected"))?;
        Ok((handle, model))
    }
}

/// Iteration buffers assembled under the state lock and handed to the
/// refinement callback with the lock dropped.
struct IterationBuffers {
    row_constraints: Vec<i32>,
    row_elements: Vec<ElementHandle>,
    col_handles: Vec<ObjectHandle>,
    col_stages: Vec<i32>,
    jacobian: Vec<f64>,
    error_vector: Vec<f64>,
    linear_tolerance: f64,
    angular_tolerance: f64,
}

/// The in-memory engine. Interior state sits behind a mutex that is never
/// held across a callback invocation, per the boundary contract.
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    dependency_handler: Mutex<Option<Weak<dyn DependencyHandler>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            dependency_handler: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Weak<dyn DependencyHandler>> {
        self.dependency_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies joint positions with clamping, linear dependency propagation
    /// and scripted-dependency routing. The state lock is dropped around
    /// every handler call. Limit hits are appended to `limit_hits`.
    fn commit_positions(
        &self,
        environment: EnvironmentHandle,
        updates: Vec<(ObjectHandle, f64)>,
        limit_hits: &mut Vec<(ObjectHandle, f64)>,
    ) -> EngineResult<()> {
        let mut pending = updates;
        let mut visited: Vec<ObjectHandle> = Vec::new();
        while !pending.is_empty() {
            let mut scripted: Vec<(ObjectHandle, f64)> = Vec::new();
            {
                let mut state = self.lock();
                let model = state
                    .environments
                    .get_mut(&environment)
                    .ok_or_else(|| fail("environment destroyed during operation"))?;
                let mut queue = std::mem::take(&mut pending);
                while let Some((handle, position)) = queue.pop() {
                    if visited.contains(&handle) {
                        continue;
                    }
                    visited.push(handle);
                    let joint = model.joint_mut(handle)?;
                    let (clamped, overshoot) = joint.clamp(position);
                    joint.position = clamped;
                    if let Some(amount) = overshoot {
                        limit_hits.push((handle, amount));
                    }
                    // Fan out to dependent joints.
                    let dependents: Vec<(ObjectHandle, DependencySpec)> = model
                        .objects
                        .values()
                        .filter_map(|o| {
                            let j = o.joint()?;
                            let dep = j.dependency?;
                            (dep.master == handle).then_some((o.handle, dep))
                        })
                        .collect();
                    for (slave, dep) in dependents {
                        if dep.scripted {
                            scripted.push((slave, clamped));
                        } else {
                            queue.push((slave, dep.offset + dep.mult * clamped));
                        }
                    }
                }
            }
            for (slave, master_position) in scripted {
                if visited.contains(&slave) {
                    continue;
                }
                let answer = self
                    .handler()
                    .and_then(|weak| weak.upgrade())
                    .and_then(|handler| handler.evaluate(environment, slave, master_position));
                let position = match answer {
                    Some(value) => value,
                    None => {
                        let state = self.lock();
                        let model = state
                            .environments
                            .get(&environment)
                            .ok_or_else(|| fail("environment destroyed during operation"))?;
                        let dep = model
                            .joint(slave)?
                            .dependency
                            .ok_or_else(|| fail("dependency removed during evaluation"))?;
                        dep.offset + dep.mult * master_position
                    }
                };
                pending.push((slave, position));
            }
        }
        Ok(())
    }

    /// Builds the iteration buffers for one group under the state lock.
    fn build_iteration(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
    ) -> EngineResult<Option<IterationBuffers>> {
        let state = self.lock();
        let model = state
            .environments
            .get(&environment)
            .ok_or_else(|| fail("environment destroyed during operation"))?;
        let group = model.group(group)?;

        let mut columns: Vec<ObjectHandle> = Vec::new();
        let mut rows: Vec<(u32, ElementHandle, f64)> = Vec::new();
        let mut linear_tolerance = f64::INFINITY;
        let mut angular_tolerance = f64::INFINITY;
        for element in &group.elements {
            if element.flags & constants::ELEMENT_ENABLED == 0 {
                continue;
            }
            for joint in model.chain_joints(element.tip, element.base)? {
                if !columns.contains(&joint) {
                    columns.push(joint);
                }
            }
            for (constraint, value) in model.element_error(element)? {
                rows.push((constraint, element.handle, value));
            }
            linear_tolerance = linear_tolerance.min(element.precision[0]);
            angular_tolerance = angular_tolerance.min(element.precision[1]);
        }
        if rows.is_empty() || columns.is_empty() {
            return Ok(None);
        }
        columns.sort_unstable();

        // Finite-difference Jacobian: perturb each column joint and observe
        // how every error row moves.
        let mut jacobian = vec![0.0; rows.len() * columns.len()];
        let mut probe = model.clone();
        for (c, &joint) in columns.iter().enumerate() {
            let original = probe.joint(joint)?.position;
            probe.joint_mut(joint)?.position = original + FD_EPSILON;
            let mut r = 0;
            for element in &group.elements {
                if element.flags & constants::ELEMENT_ENABLED == 0 {
                    continue;
                }
                for (_, perturbed) in probe.element_error(element)? {
                    // error shrinks as the tip moves toward the target, so the
                    // tip-motion derivative is the negated error derivative
                    jacobian[r * columns.len() + c] =
                        -(perturbed - rows[r].2) / FD_EPSILON;
                    r += 1;
                }
            }
            probe.joint_mut(joint)?.position = original;
        }

        Ok(Some(IterationBuffers {
            row_constraints: rows.iter().map(|r| r.0 as i32).collect(),
            row_elements: rows.iter().map(|r| r.1).collect(),
            col_stages: vec![0; columns.len()],
            col_handles: columns,
            error_vector: rows.iter().map(|r| r.2).collect(),
            jacobian,
            linear_tolerance,
            angular_tolerance,
        }))
    }

    fn converged(&self, buffers: &IterationBuffers) -> bool {
        buffers
            .error_vector
            .iter()
            .zip(&buffers.row_constraints)
            .all(|(value, constraint)| {
                let tolerance = if (*constraint as u32) & constants::CONSTRAINT_POSITION != 0 {
                    buffers.linear_tolerance
                } else {
                    buffers.angular_tolerance
                };
                value.abs() <= tolerance
            })
    }

    /// One Jacobian-transpose step from the (possibly host-adjusted) buffers.
    fn transpose_step(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        buffers: &IterationBuffers,
    ) -> EngineResult<()> {
        let (updates, mut hits, stop_on_limit) = {
            let state = self.lock();
            let model = state
                .environments
                .get(&environment)
                .ok_or_else(|| fail("environment destroyed during operation"))?;
            let group_model = model.group(group)?;
            let ignore_max_steps = group_model.flags & constants::GROUP_IGNORE_MAX_STEPS != 0;
            let stop_on_limit = group_model.flags & constants::GROUP_STOP_ON_LIMIT_HIT != 0;
            let cols = buffers.col_handles.len();
            let mut updates = Vec::with_capacity(cols);
            for (c, &handle) in buffers.col_handles.iter().enumerate() {
                let joint = model.joint(handle)?;
                let mut delta = 0.0;
                for (r, error) in buffers.error_vector.iter().enumerate() {
                    delta += buffers.jacobian[r * cols + c] * error;
                }
                delta *= STEP_GAIN * joint.weight;
                if !ignore_max_steps {
                    delta = delta.clamp(-joint.max_step_size, joint.max_step_size);
                }
                updates.push((handle, joint.position + delta));
            }
            (updates, Vec::new(), stop_on_limit)
        };
        self.commit_positions(environment, updates, &mut hits)?;
        if !hits.is_empty() {
            let mut state = self.lock();
            let model = state
                .environments
                .get_mut(&environment)
                .ok_or_else(|| fail("environment destroyed during operation"))?;
            let group_model = model.group_mut(group)?;
            group_model.last_limit_hits.extend_from_slice(&hits);
            if stop_on_limit {
                return Err(fail("joint limit hit during solve"));
            }
        }
        Ok(())
    }

    /// The iterative solve for one group.
    fn solve_group(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        refiner: &mut Option<&mut dyn JacobianRefiner>,
    ) -> EngineResult<SolveResult> {
        let (max_iterations, snapshot, restore_on_fail) = {
            let mut state = self.lock();
            let model = state
                .environments
                .get_mut(&environment)
                .ok_or_else(|| fail("environment destroyed during operation"))?;
            let group_model = model.group_mut(group)?;
            group_model.last_limit_hits.clear();
            let calc = group_model.calculation;
            let restore = group_model.flags & constants::GROUP_RESTORE_ON_FAIL != 0;
            let snapshot: Vec<(ObjectHandle, f64)> = model
                .objects
                .values()
                .filter_map(|o| o.joint().map(|j| (o.handle, j.position)))
                .collect();
            (calc.max_iterations.max(1), snapshot, restore)
        };

        let mut invalid_data = false;
        let mut solved = false;
        for iteration in 0..max_iterations {
            let Some(mut buffers) = self.build_iteration(environment, group)? else {
                return Ok(SolveResult {
                    code: SolveResultCode::NotPerformed,
                    invalid_callback_data: false,
                });
            };
            if self.converged(&buffers) {
                solved = true;
                break;
            }
            let outcome = match refiner.as_deref_mut() {
                Some(refiner) => {
                    let cols = buffers.col_handles.len();
                    let mut solution = vec![0.0; cols];
                    let mut problem = JacobianProblem {
                        rows: buffers.error_vector.len(),
                        cols,
                        row_constraints: &buffers.row_constraints,
                        row_elements: &buffers.row_elements,
                        col_handles: &buffers.col_handles,
                        col_stages: &buffers.col_stages,
                        jacobian: &mut buffers.jacobian,
                        error_vector: &mut buffers.error_vector,
                        solution: &mut solution,
                    };
                    // The refiner releases the interface guard and calls into
                    // host code; our own state lock is not held here.
                    let outcome = refiner.refine(&mut problem);
                    if outcome == RefineOutcome::Solved {
                        let updates: Vec<(ObjectHandle, f64)> = buffers
                            .col_handles
                            .iter()
                            .copied()
                            .zip(solution.iter().copied())
                            .collect();
                        let mut hits = Vec::new();
                        self.commit_positions(environment, updates, &mut hits)?;
                    }
                    outcome
                }
                None => RefineOutcome::Untouched,
            };
            match outcome {
                RefineOutcome::InvalidData => {
                    warn!(group, iteration, "refinement callback supplied non-finite data");
                    invalid_data = true;
                    break;
                }
                RefineOutcome::Solved => continue,
                RefineOutcome::Adjusted | RefineOutcome::Untouched => {
                    self.transpose_step(environment, group, &buffers)?;
                }
            }
        }

        if !solved && !invalid_data {
            // Accept the final state when it converged on the last step.
            if let Some(buffers) = self.build_iteration(environment, group)? {
                solved = self.converged(&buffers);
            } else {
                return Ok(SolveResult {
                    code: SolveResultCode::NotPerformed,
                    invalid_callback_data: false,
                });
            }
        }

        if !solved && restore_on_fail {
            let mut state = self.lock();
            if let Some(model) = state.environments.get_mut(&environment) {
                for (handle, position) in &snapshot {
                    if let Ok(joint) = model.joint_mut(*handle) {
                        joint.position = *position;
                    }
                }
            }
        }

        Ok(SolveResult {
            code: if solved {
                SolveResultCode::Success
            } else {
                SolveResultCode::Fail
            },
            invalid_callback_data: invalid_data,
        })
    }

    /// Distance of every enabled element of `group` from its target, against
    /// the worst (largest) element distance.
    fn group_distance(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        metric: [f64; 4],
    ) -> EngineResult<f64> {
        let state = self.lock();
        let model = state
            .environments
            .get(&environment)
            .ok_or_else(|| fail("environment destroyed during operation"))?;
        let group = model.group(group)?;
        let mut worst: f64 = 0.0;
        let mut measured = false;
        for element in &group.elements {
            if element.flags & constants::ELEMENT_ENABLED == 0 {
                continue;
            }
            let tip = model.world_pose(element.tip)?;
            let target = match model.object(element.tip)?.kind {
                ObjectKind::Dummy {
                    linked: Some(linked),
                } => model.world_pose(linked)?,
                _ => return Err(fail(format!("tip dummy {} has no target", element.tip))),
            };
            worst = worst.max(tip.distance_to(target, metric));
            measured = true;
        }
        if !measured {
            return Err(fail("group has no enabled elements"));
        }
        Ok(worst)
    }

    /// Shared candidate loop of the two config searches. `sample` yields the
    /// next candidate configuration, `None` ends the search.
    fn search_config(
        &self,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        validator: &mut Option<&mut dyn ConfigValidator>,
        mut sample: impl FnMut(&[(f64, f64)], &[f64]) -> Option<Vec<f64>>,
    ) -> EngineResult<Option<Vec<f64>>> {
        if search.joints.is_empty() {
            return Err(fail("invalid joint handles"));
        }
        let metric = search.metric.unwrap_or(DEFAULT_METRIC);
        let (environment, snapshot, spans, start) = {
            let state = self.lock();
            let (environment, model) = state.current_env()?;
            model.group(group)?;
            let mut snapshot = Vec::with_capacity(search.joints.len());
            let mut spans = Vec::with_capacity(search.joints.len());
            for (i, &handle) in search.joints.iter().enumerate() {
                let joint = model.joint(handle)?;
                snapshot.push(joint.position);
                let low = search
                    .low_limits
                    .and_then(|l| l.get(i).copied())
                    .unwrap_or(joint.interval[0]);
                let range = search
                    .ranges
                    .and_then(|r| r.get(i).copied())
                    .unwrap_or(joint.interval[1]);
                let fixed = search
                    .joint_options
                    .and_then(|o| o.get(i).copied())
                    .map(|o| o & constants::CONFIG_JOINT_FIXED != 0)
                    .unwrap_or(false);
                if fixed {
                    spans.push((joint.position, 0.0));
                } else {
                    spans.push((low, range));
                }
            }
            (environment, snapshot.clone(), spans, snapshot)
        };

        let restore = |positions: &[f64]| {
            let mut state = self.lock();
            if let Some(model) = state.environments.get_mut(&environment) {
                for (&handle, &position) in search.joints.iter().zip(positions) {
                    if let Ok(joint) = model.joint_mut(handle) {
                        joint.position = position;
                    }
                }
            }
        };

        let mut found = None;
        while let Some(candidate) = sample(&spans, &start) {
            {
                let mut state = self.lock();
                let model = state
                    .environments
                    .get_mut(&environment)
                    .ok_or_else(|| fail("environment destroyed during operation"))?;
                for (&handle, &position) in search.joints.iter().zip(&candidate) {
                    let joint = model.joint_mut(handle)?;
                    joint.position = joint.clamp(position).0;
                }
            }
            if self.group_distance(environment, group, metric)? > search.threshold {
                continue;
            }
            // Candidate reaches the target; let the host veto it. The state
            // lock is dropped, the bridge releases the interface guard.
            let accepted = match validator.as_deref_mut() {
                Some(validator) => validator.validate(&candidate),
                None => true,
            };
            if accepted {
                found = Some(candidate);
                break;
            }
        }
        restore(&snapshot);
        Ok(found)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SolverEngine for MemoryEngine {
    fn create_environment(&self) -> EngineResult<EnvironmentHandle> {
        let mut state = self.lock();
        let handle = state.next_environment;
        state.next_environment += 1;
        state
            .environments
            .insert(handle, EnvironmentModel::default());
        state.current = Some(handle);
        debug!(environment = handle, "environment created");
        Ok(handle)
    }

    fn erase_environment(&self) -> EngineResult<()> {
        let mut state = self.lock();
        let handle = state
            .current
            .ok_or_else(|| fail("no environment selected"))?;
        state
            .environments
            .remove(&handle)
            .ok_or_else(|| fail("no environment selected"))?;
        state.current = None;
        debug!(environment = handle, "environment erased");
        Ok(())
    }

    fn duplicate_environment(&self) -> EngineResult<EnvironmentHandle> {
        let mut state = self.lock();
        let (_, model) = state.current_env()?;
        let copy = model.clone();
        let handle = state.next_environment;
        state.next_environment += 1;
        state.environments.insert(handle, copy);
        Ok(handle)
    }

    fn switch_environment(&self, environment: EnvironmentHandle) -> bool {
        let mut state = self.lock();
        if state.environments.contains_key(&environment) {
            trace!(environment, "environment selected");
            state.current = Some(environment);
            true
        } else {
            false
        }
    }

    fn current_environment(&self) -> Option<EnvironmentHandle> {
        self.lock().current
    }

    fn alive_environments(&self) -> Vec<EnvironmentHandle> {
        let mut handles: Vec<_> = self.lock().environments.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    fn save(&self) -> EngineResult<Vec<u8>> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        bincode::serialize(model).map_err(|e| fail(format!("serialization failed: {e}")))
    }

    fn load(&self, data: &[u8]) -> EngineResult<()> {
        let model: EnvironmentModel =
            bincode::deserialize(data).map_err(|e| fail(format!("invalid environment data: {e}")))?;
        let mut state = self.lock();
        let (_, current) = state.current_env_mut()?;
        *current = model;
        Ok(())
    }

    fn object_at_index(&self, index: usize) -> Option<ObjectSummary> {
        let state = self.lock();
        let (_, model) = state.current_env().ok()?;
        let mut handles: Vec<_> = model.objects.keys().copied().collect();
        handles.sort_unstable();
        let handle = handles.get(index)?;
        let object = &model.objects[handle];
        Some(ObjectSummary {
            handle: object.handle,
            name: object.name.clone(),
            object_type: match object.kind {
                ObjectKind::Joint(_) => ObjectType::Joint,
                ObjectKind::Dummy { .. } => ObjectType::Dummy,
            },
            joint_type: object.joint().map(|j| j.joint_type),
        })
    }

    fn object_handle(&self, name: &str) -> EngineResult<ObjectHandle> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        model
            .objects
            .values()
            .find(|o| o.name == name)
            .map(|o| o.handle)
            .ok_or_else(|| fail(format!("object does not exist: {name}")))
    }

    fn object_exists(&self, name: &str) -> bool {
        let state = self.lock();
        state
            .current_env()
            .map(|(_, model)| model.objects.values().any(|o| o.name == name))
            .unwrap_or(false)
    }

    fn erase_object(&self, object: ObjectHandle) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let removed = model
            .objects
            .remove(&object)
            .ok_or_else(|| fail(format!("invalid object handle {object}")))?;
        for other in model.objects.values_mut() {
            if other.parent == Some(object) {
                other.parent = removed.parent;
            }
            match &mut other.kind {
                ObjectKind::Dummy { linked } if *linked == Some(object) => *linked = None,
                ObjectKind::Joint(j) => {
                    if j.dependency.map(|d| d.master) == Some(object) {
                        j.dependency = None;
                    }
                }
                _ => {}
            }
        }
        for group in model.groups.values_mut() {
            group.elements.retain(|e| e.tip != object);
            for element in &mut group.elements {
                if element.base == Some(object) {
                    element.base = None;
                }
                if element.constraints_base == Some(object) {
                    element.constraints_base = None;
                }
            }
        }
        Ok(())
    }

    fn object_parent(&self, object: ObjectHandle) -> EngineResult<Option<ObjectHandle>> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.object(object)?.parent)
    }

    fn set_object_parent(
        &self,
        object: ObjectHandle,
        parent: Option<ObjectHandle>,
        keep_in_place: bool,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        if let Some(parent) = parent {
            model.object(parent)?;
            let mut cursor = Some(parent);
            while let Some(h) = cursor {
                if h == object {
                    return Err(fail("cannot parent an object to its own descendant"));
                }
                cursor = model.object(h)?.parent;
            }
        }
        let world = model.world_pose(object)?;
        let motion = match &model.object(object)?.kind {
            ObjectKind::Joint(j) => j.motion(),
            _ => Pose::IDENTITY,
        };
        let target = model.object_mut(object)?;
        target.parent = parent;
        if keep_in_place {
            let parent_frame = match parent {
                Some(p) => model.world_pose(p)?,
                None => Pose::IDENTITY,
            };
            let local = parent_frame.inverse().compose(world).compose(motion.inverse());
            model.object_mut(object)?.local_pose = local;
        }
        Ok(())
    }

    fn object_transformation(
        &self,
        object: ObjectHandle,
        relative_to: ObjectHandle,
    ) -> EngineResult<Pose> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        model.relative_pose(object, relative_to)
    }

    fn set_object_transformation(
        &self,
        object: ObjectHandle,
        relative_to: ObjectHandle,
        pose: &Pose,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let reference = match relative_to {
            constants::HANDLE_WORLD => Pose::IDENTITY,
            constants::HANDLE_PARENT => match model.object(object)?.parent {
                Some(parent) => model.world_pose(parent)?,
                None => Pose::IDENTITY,
            },
            other => model.world_pose(other)?,
        };
        let desired = reference.compose(*pose);
        let parent_frame = match model.object(object)?.parent {
            Some(parent) => model.world_pose(parent)?,
            None => Pose::IDENTITY,
        };
        let motion = match &model.object(object)?.kind {
            ObjectKind::Joint(j) => j.motion(),
            _ => Pose::IDENTITY,
        };
        model.object_mut(object)?.local_pose = parent_frame
            .inverse()
            .compose(desired)
            .compose(motion.inverse());
        Ok(())
    }

    fn create_dummy(&self, name: Option<&str>) -> EngineResult<ObjectHandle> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let handle = model.allocate();
        let name = match name {
            Some(name) if !name.is_empty() => {
                if model.name_in_use(name) {
                    return Err(fail(format!("name already in use: {name}")));
                }
                name.to_string()
            }
            _ => format!("dummy{handle}"),
        };
        model.objects.insert(
            handle,
            SceneObject {
                handle,
                name,
                parent: None,
                local_pose: Pose::IDENTITY,
                kind: ObjectKind::Dummy { linked: None },
            },
        );
        Ok(handle)
    }

    fn linked_dummy(&self, dummy: ObjectHandle) -> EngineResult<Option<ObjectHandle>> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        match model.object(dummy)?.kind {
            ObjectKind::Dummy { linked } => Ok(linked),
            _ => Err(fail(format!("object {dummy} is not a dummy"))),
        }
    }

    fn set_linked_dummy(
        &self,
        dummy: ObjectHandle,
        linked: Option<ObjectHandle>,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        // validate both ends first
        match model.object(dummy)?.kind {
            ObjectKind::Dummy { .. } => {}
            _ => return Err(fail(format!("object {dummy} is not a dummy"))),
        }
        if let Some(peer) = linked {
            match model.object(peer)?.kind {
                ObjectKind::Dummy { .. } => {}
                _ => return Err(fail(format!("object {peer} is not a dummy"))),
            }
        }
        // unlink the previous peers of both ends, then link symmetrically
        let old_peer = match model.object(dummy)?.kind {
            ObjectKind::Dummy { linked } => linked,
            _ => None,
        };
        if let Some(old) = old_peer {
            if let ObjectKind::Dummy { linked } = &mut model.object_mut(old)?.kind {
                *linked = None;
            }
        }
        if let Some(peer) = linked {
            let peer_old = match model.object(peer)?.kind {
                ObjectKind::Dummy { linked } => linked,
                _ => None,
            };
            if let Some(old) = peer_old {
                if let ObjectKind::Dummy { linked } = &mut model.object_mut(old)?.kind {
                    *linked = None;
                }
            }
            if let ObjectKind::Dummy { linked } = &mut model.object_mut(peer)?.kind {
                *linked = Some(dummy);
            }
        }
        if let ObjectKind::Dummy { linked: slot } = &mut model.object_mut(dummy)?.kind {
            *slot = linked;
        }
        Ok(())
    }

    fn create_joint(
        &self,
        joint_type: JointType,
        name: Option<&str>,
    ) -> EngineResult<ObjectHandle> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let handle = model.allocate();
        let name = match name {
            Some(name) if !name.is_empty() => {
                if model.name_in_use(name) {
                    return Err(fail(format!("name already in use: {name}")));
                }
                name.to_string()
            }
            _ => format!("joint{handle}"),
        };
        model.objects.insert(
            handle,
            SceneObject {
                handle,
                name,
                parent: None,
                local_pose: Pose::IDENTITY,
                kind: ObjectKind::Joint(JointModel::new(joint_type)),
            },
        );
        Ok(handle)
    }

    fn joint_type(&self, joint: ObjectHandle) -> EngineResult<JointType> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.joint_type)
    }

    fn joint_mode(&self, joint: ObjectHandle) -> EngineResult<JointMode> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.mode)
    }

    fn set_joint_mode(&self, joint: ObjectHandle, mode: JointMode) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        model.joint_mut(joint)?.mode = mode;
        Ok(())
    }

    fn joint_interval(&self, joint: ObjectHandle) -> EngineResult<(bool, [f64; 2])> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let j = model.joint(joint)?;
        Ok((j.cyclic, j.interval))
    }

    fn set_joint_interval(
        &self,
        joint: ObjectHandle,
        cyclic: bool,
        interval: Option<[f64; 2]>,
    ) -> EngineResult<()> {
        if let Some(interval) = interval {
            if interval[1] < 0.0 {
                return Err(fail("interval range must be non-negative"));
            }
        }
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let j = model.joint_mut(joint)?;
        j.cyclic = cyclic;
        if let Some(interval) = interval {
            j.interval = interval;
        }
        if !j.cyclic {
            j.position = j.clamp(j.position).0;
        }
        Ok(())
    }

    fn joint_screw_lead(&self, joint: ObjectHandle) -> EngineResult<f64> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.screw_lead)
    }

    fn set_joint_screw_lead(&self, joint: ObjectHandle, lead: f64) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let j = model.joint_mut(joint)?;
        if j.joint_type != JointType::Revolute {
            return Err(fail("screw lead applies to revolute joints only"));
        }
        j.screw_lead = lead;
        Ok(())
    }

    fn joint_weight(&self, joint: ObjectHandle) -> EngineResult<f64> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.weight)
    }

    fn set_joint_weight(&self, joint: ObjectHandle, weight: f64) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        model.joint_mut(joint)?.weight = weight;
        Ok(())
    }

    fn joint_limit_margin(&self, joint: ObjectHandle) -> EngineResult<f64> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.limit_margin)
    }

    fn set_joint_limit_margin(&self, joint: ObjectHandle, margin: f64) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        model.joint_mut(joint)?.limit_margin = margin;
        Ok(())
    }

    fn joint_max_step_size(&self, joint: ObjectHandle) -> EngineResult<f64> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.max_step_size)
    }

    fn set_joint_max_step_size(&self, joint: ObjectHandle, step: f64) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        model.joint_mut(joint)?.max_step_size = step;
        Ok(())
    }

    fn joint_position(&self, joint: ObjectHandle) -> EngineResult<f64> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let j = model.joint(joint)?;
        if j.joint_type == JointType::Spherical {
            return Err(fail("spherical joints have no scalar position"));
        }
        Ok(j.position)
    }

    fn set_joint_position(&self, joint: ObjectHandle, position: f64) -> EngineResult<()> {
        let environment = {
            let state = self.lock();
            let (environment, model) = state.current_env()?;
            let j = model.joint(joint)?;
            if j.joint_type == JointType::Spherical {
                return Err(fail("spherical joints have no scalar position"));
            }
            environment
        };
        let mut hits = Vec::new();
        self.commit_positions(environment, vec![(joint, position)], &mut hits)
    }

    fn joint_transformation(&self, joint: ObjectHandle) -> EngineResult<Pose> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.joint(joint)?.motion())
    }

    fn set_spherical_joint_rotation(
        &self,
        joint: ObjectHandle,
        orientation: Quaternion,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let j = model.joint_mut(joint)?;
        if j.joint_type != JointType::Spherical {
            return Err(fail("joint is not spherical"));
        }
        j.orientation = orientation.normalized();
        Ok(())
    }

    fn joint_dependency(
        &self,
        joint: ObjectHandle,
    ) -> EngineResult<Option<(ObjectHandle, f64, f64)>> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model
            .joint(joint)?
            .dependency
            .map(|d| (d.master, d.offset, d.mult)))
    }

    fn set_joint_dependency(
        &self,
        slave: ObjectHandle,
        master: Option<ObjectHandle>,
        offset: f64,
        mult: f64,
        scripted: bool,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        if let Some(master) = master {
            model.joint(master)?;
            if master == slave {
                return Err(fail("a joint cannot depend on itself"));
            }
        }
        let j = model.joint_mut(slave)?;
        j.dependency = master.map(|master| DependencySpec {
            master,
            offset,
            mult,
            scripted,
        });
        Ok(())
    }

    fn group_handle(&self, name: &str) -> EngineResult<GroupHandle> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        model
            .groups
            .values()
            .find(|g| g.name == name)
            .map(|g| g.handle)
            .ok_or_else(|| fail(format!("group does not exist: {name}")))
    }

    fn group_exists(&self, name: &str) -> bool {
        let state = self.lock();
        state
            .current_env()
            .map(|(_, model)| model.groups.values().any(|g| g.name == name))
            .unwrap_or(false)
    }

    fn create_group(&self, name: Option<&str>) -> EngineResult<GroupHandle> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let handle = model.allocate();
        let name = match name {
            Some(name) if !name.is_empty() => {
                if model.name_in_use(name) {
                    return Err(fail(format!("name already in use: {name}")));
                }
                name.to_string()
            }
            _ => format!("group{handle}"),
        };
        model.groups.insert(
            handle,
            GroupModel {
                handle,
                name,
                flags: constants::GROUP_ENABLED,
                calculation: GroupCalculation::default(),
                next_element: 0,
                elements: Vec::new(),
                last_limit_hits: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn group_flags(&self, group: GroupHandle) -> EngineResult<u32> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.group(group)?.flags)
    }

    fn set_group_flags(&self, group: GroupHandle, flags: u32) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        model.group_mut(group)?.flags = flags;
        Ok(())
    }

    fn group_calculation(&self, group: GroupHandle) -> EngineResult<GroupCalculation> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.group(group)?.calculation)
    }

    fn set_group_calculation(
        &self,
        group: GroupHandle,
        calc: GroupCalculation,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        model.group_mut(group)?.calculation = calc;
        Ok(())
    }

    fn group_joint_limit_hits(&self, group: GroupHandle) -> EngineResult<Vec<(ObjectHandle, f64)>> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        Ok(model.group(group)?.last_limit_hits.clone())
    }

    fn add_element(&self, group: GroupHandle, tip: ObjectHandle) -> EngineResult<ElementHandle> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        match model.object(tip)?.kind {
            ObjectKind::Dummy { .. } => {}
            _ => return Err(fail(format!("tip {tip} is not a dummy"))),
        }
        let group = model.group_mut(group)?;
        let handle = group.next_element;
        group.next_element += 1;
        group.elements.push(ElementModel {
            handle,
            tip,
            base: None,
            constraints_base: None,
            constraints: constants::CONSTRAINT_POSITION,
            flags: constants::ELEMENT_ENABLED,
            precision: [5e-4, 1e-3],
            weights: [1.0, 1.0],
        });
        Ok(handle)
    }

    fn element_flags(&self, group: GroupHandle, element: ElementHandle) -> EngineResult<u32> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let index = model.element_index(group, element)?;
        Ok(model.group(group)?.elements[index].flags)
    }

    fn set_element_flags(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        flags: u32,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let index = model.element_index(group, element)?;
        model.group_mut(group)?.elements[index].flags = flags;
        Ok(())
    }

    fn element_base(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<(Option<ObjectHandle>, Option<ObjectHandle>)> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let index = model.element_index(group, element)?;
        let e = &model.group(group)?.elements[index];
        Ok((e.base, e.constraints_base))
    }

    fn set_element_base(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        base: Option<ObjectHandle>,
        constraints_base: Option<ObjectHandle>,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        if let Some(base) = base {
            model.object(base)?;
        }
        if let Some(reference) = constraints_base {
            model.object(reference)?;
        }
        let index = model.element_index(group, element)?;
        let e = &mut model.group_mut(group)?.elements[index];
        e.base = base;
        e.constraints_base = constraints_base;
        Ok(())
    }

    fn element_constraints(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<u32> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let index = model.element_index(group, element)?;
        Ok(model.group(group)?.elements[index].constraints)
    }

    fn set_element_constraints(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        constraints: u32,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let index = model.element_index(group, element)?;
        model.group_mut(group)?.elements[index].constraints = constraints;
        Ok(())
    }

    fn element_precision(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<[f64; 2]> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let index = model.element_index(group, element)?;
        Ok(model.group(group)?.elements[index].precision)
    }

    fn set_element_precision(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        precision: [f64; 2],
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let index = model.element_index(group, element)?;
        model.group_mut(group)?.elements[index].precision = precision;
        Ok(())
    }

    fn element_weights(
        &self,
        group: GroupHandle,
        element: ElementHandle,
    ) -> EngineResult<[f64; 2]> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        let index = model.element_index(group, element)?;
        Ok(model.group(group)?.elements[index].weights)
    }

    fn set_element_weights(
        &self,
        group: GroupHandle,
        element: ElementHandle,
        weights: [f64; 2],
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let (_, model) = state.current_env_mut()?;
        let index = model.element_index(group, element)?;
        model.group_mut(group)?.elements[index].weights = weights;
        Ok(())
    }

    fn handle_groups(
        &self,
        group: GroupHandle,
        mut refiner: Option<&mut dyn JacobianRefiner>,
    ) -> EngineResult<SolveResult> {
        let (environment, targets) = {
            let state = self.lock();
            let (environment, model) = state.current_env()?;
            let targets: Vec<GroupHandle> = if group == constants::HANDLE_ALL {
                let mut enabled: Vec<_> = model
                    .groups
                    .values()
                    .filter(|g| g.flags & constants::GROUP_ENABLED != 0)
                    .map(|g| g.handle)
                    .collect();
                enabled.sort_unstable();
                enabled
            } else {
                vec![model.group(group)?.handle]
            };
            (environment, targets)
        };
        if targets.is_empty() {
            return Ok(SolveResult {
                code: SolveResultCode::NotPerformed,
                invalid_callback_data: false,
            });
        }

        let mut performed = false;
        let mut all_ok = true;
        let mut invalid = false;
        for target in targets {
            let result = self.solve_group(environment, target, &mut refiner)?;
            invalid |= result.invalid_callback_data;
            match result.code {
                SolveResultCode::NotPerformed => {}
                SolveResultCode::Success => performed = true,
                SolveResultCode::Fail => {
                    performed = true;
                    all_ok = false;
                }
            }
        }
        Ok(SolveResult {
            code: if !performed {
                SolveResultCode::NotPerformed
            } else if all_ok {
                SolveResultCode::Success
            } else {
                SolveResultCode::Fail
            },
            invalid_callback_data: invalid,
        })
    }

    fn compute_jacobian(
        &self,
        base: ObjectHandle,
        alt_base: Option<ObjectHandle>,
        last_joint: ObjectHandle,
        constraints: u32,
        tip: &Pose,
        target: &Pose,
    ) -> EngineResult<JacobianData> {
        let state = self.lock();
        let (_, model) = state.current_env()?;
        model.joint(last_joint)?;
        let base = if base == constants::HANDLE_WORLD {
            None
        } else {
            Some(model.object(base)?.handle)
        };
        let reference = match alt_base {
            Some(alt) => Some(model.object(alt)?.handle),
            None => base,
        };

        // The chain runs base → last_joint; the virtual tip rides on the last
        // joint's frame, the target is expressed in the reference frame.
        let mut joints = model.chain_joints(last_joint, base)?;
        if let ObjectKind::Joint(j) = &model.object(last_joint)?.kind {
            if j.mode == JointMode::Ik && j.joint_type != JointType::Spherical {
                joints.push(last_joint);
            }
        }
        if joints.is_empty() {
            return Err(fail("no ik-mode joints between base and last joint"));
        }

        let target_world = match reference {
            Some(reference) => model.world_pose(reference)?.compose(*target),
            None => *target,
        };

        let error_of = |probe: &EnvironmentModel| -> EngineResult<Vec<f64>> {
            let tip_world = probe.world_pose(last_joint)?.compose(*tip);
            let dp = [
                target_world.position[0] - tip_world.position[0],
                target_world.position[1] - tip_world.position[1],
                target_world.position[2] - tip_world.position[2],
            ];
            let dq = tip_world.orientation.conjugate().mul(target_world.orientation);
            let angular = dq.to_euler();
            let mut rows = Vec::new();
            if constraints & constants::CONSTRAINT_X != 0 {
                rows.push(dp[0]);
            }
            if constraints & constants::CONSTRAINT_Y != 0 {
                rows.push(dp[1]);
            }
            if constraints & constants::CONSTRAINT_Z != 0 {
                rows.push(dp[2]);
            }
            if constraints & constants::CONSTRAINT_ALPHA_BETA != 0 {
                rows.push(angular[0]);
                rows.push(angular[1]);
            }
            if constraints & constants::CONSTRAINT_GAMMA != 0 {
                rows.push(angular[2]);
            }
            Ok(rows)
        };

        let error_vector = error_of(model)?;
        if error_vector.is_empty() {
            return Err(fail("no constraints selected"));
        }
        let mut probe = model.clone();
        let mut jacobian = vec![0.0; error_vector.len() * joints.len()];
        for (c, &joint) in joints.iter().enumerate() {
            let original = probe.joint(joint)?.position;
            probe.joint_mut(joint)?.position = original + FD_EPSILON;
            for (r, perturbed) in error_of(&probe)?.into_iter().enumerate() {
                jacobian[r * joints.len() + c] = -(perturbed - error_vector[r]) / FD_EPSILON;
            }
            probe.joint_mut(joint)?.position = original;
        }
        Ok(JacobianData {
            rows: error_vector.len(),
            cols: joints.len(),
            jacobian,
            error_vector,
        })
    }

    fn get_config_for_tip_pose(
        &self,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        max_attempts: u32,
        mut validator: Option<&mut dyn ConfigValidator>,
    ) -> EngineResult<Option<Vec<f64>>> {
        let mut attempt = 0u32;
        self.search_config(group, search, &mut validator, |spans, start| {
            if attempt >= max_attempts.max(1) {
                return None;
            }
            let candidate = if attempt == 0 {
                start.to_vec()
            } else {
                let mut rng = SmallRng::seed_from_u64(attempt as u64);
                spans
                    .iter()
                    .map(|&(low, range)| {
                        if range <= 0.0 {
                            low
                        } else {
                            low + rng.gen::<f64>() * range
                        }
                    })
                    .collect()
            };
            attempt += 1;
            Some(candidate)
        })
    }

    fn find_config(
        &self,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        time_budget: Duration,
        mut validator: Option<&mut dyn ConfigValidator>,
    ) -> EngineResult<Option<Vec<f64>>> {
        let deadline = Instant::now() + time_budget;
        let mut attempt = 0u64;
        self.search_config(group, search, &mut validator, |spans, start| {
            if attempt > 0 && Instant::now() >= deadline {
                return None;
            }
            let candidate = if attempt == 0 {
                start.to_vec()
            } else {
                let mut rng = SmallRng::seed_from_u64(attempt);
                spans
                    .iter()
                    .map(|&(low, range)| {
                        if range <= 0.0 {
                            low
                        } else {
                            low + rng.gen::<f64>() * range
                        }
                    })
                    .collect()
            };
            attempt += 1;
            Some(candidate)
        })
    }

    fn install_dependency_handler(&self, handler: Weak<dyn DependencyHandler>) {
        *self
            .dependency_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}
