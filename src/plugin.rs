//! Entry-point façade.
//!
//! Every externally reachable operation follows the same template: acquire
//! the interface guard (scoped), select the target environment by handle,
//! invoke the engine, apply registry or binding side effects for the
//! lifecycle operations, and let the guard drop on scope exit — including on
//! every error branch. Argument-shape problems are rejected before the guard
//! is taken and cause no side effects at all.
//!
//! Selection is re-established on every call on purpose: the cursor may have
//! been left pointing elsewhere by a reentrant call that ran while the guard
//! was released during a callback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bridge::{
    DependencyBinding, DependencyTable, RefineBridge, ValidationBridge, dispatch_dependency,
};
use crate::engine::{
    ConfigSearch, DependencyHandler, ElementHandle, EnvironmentHandle, GroupCalculation,
    GroupHandle, JacobianData, JointMode, JointType, ObjectHandle, ObjectSummary, SolveResult,
    SolverEngine,
};
use crate::error::{PluginError, PluginResult};
use crate::guard::InterfaceGuard;
use crate::host::{ContextId, HostFunction, ScriptHost};
use crate::registry::{EnvironmentRegistry, RegistryEntry};
use crate::transform::{Pose, Quaternion};

struct Shared<E, H> {
    guard: InterfaceGuard,
    engine: E,
    host: H,
    registry: Mutex<EnvironmentRegistry>,
    dependencies: Mutex<DependencyTable>,
}

impl<E: SolverEngine, H: ScriptHost> Shared<E, H> {
    fn registry(&self) -> MutexGuard<'_, EnvironmentRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dependencies(&self) -> MutexGuard<'_, DependencyTable> {
        self.dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, environment: EnvironmentHandle) -> PluginResult<()> {
        if self.engine.switch_environment(environment) {
            Ok(())
        } else {
            Err(PluginError::InvalidEnvironment(environment))
        }
    }
}

impl<E, H> DependencyHandler for Shared<E, H>
where
    E: SolverEngine + Send + Sync,
    H: ScriptHost + Send + Sync,
{
    fn evaluate(
        &self,
        environment: EnvironmentHandle,
        slave: ObjectHandle,
        master_position: f64,
    ) -> Option<f64> {
        let binding = self.dependencies().lookup(environment, slave).cloned()?;
        dispatch_dependency(&self.guard, &self.engine, &self.host, &binding, master_position)
    }
}

/// The plugin: one engine, one host, one guard, and the durable state owned
/// by the plugin layer itself (the environment registry and the dependency
/// bindings). Cheap to clone; clones share everything.
pub struct KinematicsPlugin<E, H> {
    shared: Arc<Shared<E, H>>,
}

impl<E, H> Clone for KinematicsPlugin<E, H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E, H> KinematicsPlugin<E, H>
where
    E: SolverEngine + Send + Sync + 'static,
    H: ScriptHost + Send + Sync + 'static,
{
    pub fn new(engine: E, host: H) -> Self {
        let shared = Arc::new(Shared {
            guard: InterfaceGuard::new(),
            engine,
            host,
            registry: Mutex::new(EnvironmentRegistry::new()),
            dependencies: Mutex::new(DependencyTable::new()),
        });
        let handler: Weak<Shared<E, H>> = Arc::downgrade(&shared);
        shared.engine.install_dependency_handler(handler);
        Self { shared }
    }

    /// The interface guard, exposed for embedders that need to observe
    /// hold/release transitions.
    pub fn guard(&self) -> &InterfaceGuard {
        &self.shared.guard
    }

    /// Direct engine access, for embedders and tests. Engine calls made this
    /// way bypass the guard; use with care.
    pub fn engine(&self) -> &E {
        &self.shared.engine
    }

    // -- Environment lifecycle --

    pub fn create_environment(&self, owner: ContextId) -> PluginResult<EnvironmentHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        let environment = s.engine.create_environment()?;
        s.registry().add(environment, owner);
        debug!(environment, owner, "environment registered");
        Ok(environment)
    }

    pub fn erase_environment(&self, environment: EnvironmentHandle) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        s.engine.erase_environment()?;
        s.registry().remove_by_handle(environment);
        s.dependencies().remove_environment(environment);
        debug!(environment, "environment erased");
        Ok(())
    }

    pub fn duplicate_environment(
        &self,
        environment: EnvironmentHandle,
        owner: ContextId,
    ) -> PluginResult<EnvironmentHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        let duplicate = s.engine.duplicate_environment()?;
        s.registry().add(duplicate, owner);
        Ok(duplicate)
    }

    pub fn load(&self, environment: EnvironmentHandle, data: &[u8]) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.load(data)?)
    }

    pub fn save(&self, environment: EnvironmentHandle) -> PluginResult<Vec<u8>> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.save()?)
    }

    /// Teardown sweep: erases every environment and every dependency binding
    /// owned by `context`. Sweeping a context that owns nothing is a no-op.
    pub fn on_context_destroyed(&self, context: ContextId) {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        debug!(context, "context destroyed, sweeping owned environments");
        // The registry never touches engine state itself: each handle it
        // hands back is erased from the engine here, one at a time, inside
        // the same critical section.
        while let Some(environment) = s.registry().remove_one_by_owner(context) {
            if s.engine.switch_environment(environment) {
                if let Err(error) = s.engine.erase_environment() {
                    warn!(environment, %error, "engine refused to erase environment");
                }
            }
            s.dependencies().remove_environment(environment);
        }
        s.dependencies().remove_context(context);
    }

    /// Registry snapshot: every environment created through this plugin and
    /// its owning context.
    pub fn registered_environments(&self) -> Vec<RegistryEntry> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.registry().entries().to_vec()
    }

    /// Number of installed dependency-callback bindings.
    pub fn dependency_binding_count(&self) -> usize {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.dependencies().len()
    }

    // -- Objects --

    pub fn object_at_index(
        &self,
        environment: EnvironmentHandle,
        index: usize,
    ) -> PluginResult<Option<ObjectSummary>> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.object_at_index(index))
    }

    pub fn object_handle(
        &self,
        environment: EnvironmentHandle,
        name: &str,
    ) -> PluginResult<ObjectHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.object_handle(name)?)
    }

    pub fn does_object_exist(
        &self,
        environment: EnvironmentHandle,
        name: &str,
    ) -> PluginResult<bool> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.object_exists(name))
    }

    pub fn erase_object(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        s.engine.erase_object(object)?;
        // A destroyed slave joint takes its callback binding with it.
        s.dependencies().remove(environment, object);
        Ok(())
    }

    pub fn object_parent(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
    ) -> PluginResult<Option<ObjectHandle>> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.object_parent(object)?)
    }

    pub fn set_object_parent(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
        parent: Option<ObjectHandle>,
        keep_in_place: bool,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_object_parent(object, parent, keep_in_place)?)
    }

    pub fn object_transformation(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
        relative_to: ObjectHandle,
    ) -> PluginResult<Pose> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.object_transformation(object, relative_to)?)
    }

    pub fn set_object_transformation(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
        relative_to: ObjectHandle,
        pose: &Pose,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_object_transformation(object, relative_to, pose)?)
    }

    pub fn object_matrix(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
        relative_to: ObjectHandle,
    ) -> PluginResult<[f64; 12]> {
        Ok(self
            .object_transformation(environment, object, relative_to)?
            .to_matrix12())
    }

    pub fn set_object_matrix(
        &self,
        environment: EnvironmentHandle,
        object: ObjectHandle,
        relative_to: ObjectHandle,
        matrix: [f64; 12],
    ) -> PluginResult<()> {
        self.set_object_transformation(
            environment,
            object,
            relative_to,
            &Pose::from_matrix12(matrix),
        )
    }

    // -- Dummies --

    pub fn create_dummy(
        &self,
        environment: EnvironmentHandle,
        name: Option<&str>,
    ) -> PluginResult<ObjectHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.create_dummy(name)?)
    }

    pub fn linked_dummy(
        &self,
        environment: EnvironmentHandle,
        dummy: ObjectHandle,
    ) -> PluginResult<Option<ObjectHandle>> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.linked_dummy(dummy)?)
    }

    pub fn set_linked_dummy(
        &self,
        environment: EnvironmentHandle,
        dummy: ObjectHandle,
        linked: Option<ObjectHandle>,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_linked_dummy(dummy, linked)?)
    }

    // -- Joints --

    pub fn create_joint(
        &self,
        environment: EnvironmentHandle,
        joint_type: JointType,
        name: Option<&str>,
    ) -> PluginResult<ObjectHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.create_joint(joint_type, name)?)
    }

    pub fn joint_type(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<JointType> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_type(joint)?)
    }

    pub fn joint_mode(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<JointMode> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_mode(joint)?)
    }

    pub fn set_joint_mode(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        mode: JointMode,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_mode(joint, mode)?)
    }

    pub fn joint_interval(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<(bool, [f64; 2])> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_interval(joint)?)
    }

    pub fn set_joint_interval(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        cyclic: bool,
        interval: Option<[f64; 2]>,
    ) -> PluginResult<()> {
        if let Some(interval) = interval {
            if !interval.iter().all(|v| v.is_finite()) || interval[1] < 0.0 {
                return Err(PluginError::BadArgument(
                    "interval must be finite with a non-negative range".into(),
                ));
            }
        }
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_interval(joint, cyclic, interval)?)
    }

    pub fn joint_screw_lead(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<f64> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_screw_lead(joint)?)
    }

    pub fn set_joint_screw_lead(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        lead: f64,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_screw_lead(joint, lead)?)
    }

    pub fn joint_weight(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<f64> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_weight(joint)?)
    }

    pub fn set_joint_weight(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        weight: f64,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_weight(joint, weight)?)
    }

    pub fn joint_limit_margin(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<f64> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_limit_margin(joint)?)
    }

    pub fn set_joint_limit_margin(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        margin: f64,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_limit_margin(joint, margin)?)
    }

    pub fn joint_max_step_size(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<f64> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_max_step_size(joint)?)
    }

    pub fn set_joint_max_step_size(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        step: f64,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_max_step_size(joint, step)?)
    }

    pub fn joint_position(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<f64> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_position(joint)?)
    }

    pub fn set_joint_position(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        position: f64,
    ) -> PluginResult<()> {
        if !position.is_finite() {
            return Err(PluginError::BadArgument(
                "joint position must be finite".into(),
            ));
        }
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_joint_position(joint, position)?)
    }

    pub fn joint_transformation(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<Pose> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_transformation(joint)?)
    }

    pub fn joint_matrix(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<[f64; 12]> {
        Ok(self.joint_transformation(environment, joint)?.to_matrix12())
    }

    pub fn set_spherical_joint_rotation(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        orientation: Quaternion,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_spherical_joint_rotation(joint, orientation)?)
    }

    pub fn set_spherical_joint_matrix(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
        matrix: [f64; 12],
    ) -> PluginResult<()> {
        self.set_spherical_joint_rotation(
            environment,
            joint,
            Pose::from_matrix12(matrix).orientation,
        )
    }

    pub fn joint_dependency(
        &self,
        environment: EnvironmentHandle,
        joint: ObjectHandle,
    ) -> PluginResult<Option<(ObjectHandle, f64, f64)>> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.joint_dependency(joint)?)
    }

    /// Couples `slave` to `master`. With a callback the dependency is routed
    /// through host script code; the binding persists until the slave joint,
    /// the environment or the owning context goes away. `master = None`
    /// clears the coupling and the binding both.
    pub fn set_joint_dependency(
        &self,
        environment: EnvironmentHandle,
        slave: ObjectHandle,
        master: Option<ObjectHandle>,
        offset: f64,
        mult: f64,
        callback: Option<HostFunction>,
    ) -> PluginResult<()> {
        if !offset.is_finite() || !mult.is_finite() {
            return Err(PluginError::BadArgument(
                "dependency offset and multiplier must be finite".into(),
            ));
        }
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        let scripted = master.is_some() && callback.is_some();
        s.engine
            .set_joint_dependency(slave, master, offset, mult, scripted)?;
        let mut table = s.dependencies();
        match callback {
            Some(function) if scripted => table.set(DependencyBinding {
                environment,
                slave,
                function,
            }),
            _ => table.remove(environment, slave),
        }
        Ok(())
    }

    // -- Groups and elements --

    pub fn group_handle(
        &self,
        environment: EnvironmentHandle,
        name: &str,
    ) -> PluginResult<GroupHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.group_handle(name)?)
    }

    pub fn does_group_exist(
        &self,
        environment: EnvironmentHandle,
        name: &str,
    ) -> PluginResult<bool> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.group_exists(name))
    }

    pub fn create_group(
        &self,
        environment: EnvironmentHandle,
        name: Option<&str>,
    ) -> PluginResult<GroupHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.create_group(name)?)
    }

    pub fn group_flags(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
    ) -> PluginResult<u32> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.group_flags(group)?)
    }

    pub fn set_group_flags(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        flags: u32,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_group_flags(group, flags)?)
    }

    pub fn group_calculation(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
    ) -> PluginResult<GroupCalculation> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.group_calculation(group)?)
    }

    pub fn set_group_calculation(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        calculation: GroupCalculation,
    ) -> PluginResult<()> {
        if !calculation.damping.is_finite() || calculation.damping < 0.0 {
            return Err(PluginError::BadArgument(
                "damping must be finite and non-negative".into(),
            ));
        }
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_group_calculation(group, calculation)?)
    }

    pub fn group_joint_limit_hits(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
    ) -> PluginResult<Vec<(ObjectHandle, f64)>> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.group_joint_limit_hits(group)?)
    }

    pub fn add_element(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        tip: ObjectHandle,
    ) -> PluginResult<ElementHandle> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.add_element(group, tip)?)
    }

    pub fn element_flags(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
    ) -> PluginResult<u32> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.element_flags(group, element)?)
    }

    pub fn set_element_flags(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
        flags: u32,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_element_flags(group, element, flags)?)
    }

    pub fn element_base(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
    ) -> PluginResult<(Option<ObjectHandle>, Option<ObjectHandle>)> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.element_base(group, element)?)
    }

    pub fn set_element_base(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
        base: Option<ObjectHandle>,
        constraints_base: Option<ObjectHandle>,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_element_base(group, element, base, constraints_base)?)
    }

    pub fn element_constraints(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
    ) -> PluginResult<u32> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.element_constraints(group, element)?)
    }

    pub fn set_element_constraints(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
        constraints: u32,
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_element_constraints(group, element, constraints)?)
    }

    pub fn element_precision(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
    ) -> PluginResult<[f64; 2]> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.element_precision(group, element)?)
    }

    pub fn set_element_precision(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
        precision: [f64; 2],
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_element_precision(group, element, precision)?)
    }

    pub fn element_weights(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
    ) -> PluginResult<[f64; 2]> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.element_weights(group, element)?)
    }

    pub fn set_element_weights(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        element: ElementHandle,
        weights: [f64; 2],
    ) -> PluginResult<()> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        Ok(s.engine.set_element_weights(group, element, weights)?)
    }

    // -- Solving --

    /// Runs the iterative solve. With `refinement` set, the engine consults
    /// the named host function once per iteration through the callback
    /// bridge.
    pub fn handle_groups(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        refinement: Option<HostFunction>,
    ) -> PluginResult<SolveResult> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        let result = match refinement {
            Some(function) => {
                let mut bridge =
                    RefineBridge::new(&s.guard, &s.engine, &s.host, environment, function);
                s.engine.handle_groups(group, Some(&mut bridge))?
            }
            None => s.engine.handle_groups(group, None)?,
        };
        Ok(result)
    }

    pub fn compute_jacobian(
        &self,
        environment: EnvironmentHandle,
        base: ObjectHandle,
        last_joint: ObjectHandle,
        constraints: u32,
        tip: Pose,
        target: Option<Pose>,
        alt_base: Option<ObjectHandle>,
    ) -> PluginResult<JacobianData> {
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        let target = target.unwrap_or(tip);
        Ok(s.engine
            .compute_jacobian(base, alt_base, last_joint, constraints, &tip, &target)?)
    }

    fn check_search(search: &ConfigSearch<'_>) -> PluginResult<()> {
        if search.joints.is_empty() {
            return Err(PluginError::BadArgument("invalid joint handles".into()));
        }
        for (name, len) in [
            ("jointOptions", search.joint_options.map(<[i32]>::len)),
            ("lowLimits", search.low_limits.map(<[f64]>::len)),
            ("ranges", search.ranges.map(<[f64]>::len)),
        ] {
            if let Some(len) = len {
                if len != search.joints.len() {
                    return Err(PluginError::BadArgument(format!(
                        "{name} must have one entry per joint"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Attempt-bounded configuration search; the named host function vets
    /// each candidate that reaches the target.
    pub fn get_config_for_tip_pose(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        max_attempts: u32,
        validation: Option<HostFunction>,
    ) -> PluginResult<Option<Vec<f64>>> {
        Self::check_search(search)?;
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        let found = match validation {
            Some(function) => {
                let mut bridge =
                    ValidationBridge::new(&s.guard, &s.engine, &s.host, environment, function);
                s.engine
                    .get_config_for_tip_pose(group, search, max_attempts, Some(&mut bridge))?
            }
            None => s
                .engine
                .get_config_for_tip_pose(group, search, max_attempts, None)?,
        };
        Ok(found)
    }

    /// Time-bounded best-effort configuration search.
    pub fn find_config(
        &self,
        environment: EnvironmentHandle,
        group: GroupHandle,
        search: &ConfigSearch<'_>,
        time_budget: Duration,
        validation: Option<HostFunction>,
    ) -> PluginResult<Option<Vec<f64>>> {
        Self::check_search(search)?;
        let s = &*self.shared;
        let _lock = s.guard.scoped();
        s.select(environment)?;
        let found = match validation {
            Some(function) => {
                let mut bridge =
                    ValidationBridge::new(&s.guard, &s.engine, &s.host, environment, function);
                s.engine
                    .find_config(group, search, time_budget, Some(&mut bridge))?
            }
            None => s.engine.find_config(group, search, time_budget, None)?,
        };
        Ok(found)
    }
}
