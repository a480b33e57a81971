//! Callback bridges: the unlock/relock/restore-context protocol.
//!
//! Whenever the engine needs host script code mid-operation, control passes
//! through one of the bridges here. Every bridge follows the same skeleton:
//! release the interface guard, marshal engine buffers into the host calling
//! convention, invoke the host function recorded in the binding, interpret
//! the returned value shape, verify finiteness of anything flowing back into
//! the solver, copy accepted outputs into the engine buffers, reacquire the
//! guard, and re-select the owning environment — the host call may have
//! reentered the plugin and moved the engine's cursor elsewhere.
//!
//! The release/reacquire pair below is the one deliberate exception to the
//! scoped-guard discipline used everywhere else.

use tracing::{debug, warn};

use crate::engine::{
    ConfigValidator, EnvironmentHandle, JacobianProblem, JacobianRefiner, ObjectHandle,
    RefineOutcome, SolverEngine,
};
use crate::guard::InterfaceGuard;
use crate::host::{ContextId, HostFunction, ScriptHost, ScriptValue};

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Reacquire-side tail shared by all bridges: take the guard back and point
/// the engine at the environment the outer call owns.
fn relock_and_restore<E: SolverEngine>(
    guard: &InterfaceGuard,
    engine: &E,
    environment: EnvironmentHandle,
) {
    guard.acquire();
    if !engine.switch_environment(environment) {
        // The callback erased the environment out from under the operation;
        // the engine call will surface the failure on its next access.
        warn!(environment, "environment vanished during a host callback");
    }
}

/// Jacobian-refinement flavor of the callback bridge, one per solve call.
///
/// The host function receives the row/column metadata, the Jacobian and the
/// error vector, and may answer with nothing (keep the engine's buffers), an
/// updated error vector plus Jacobian, or a full solution vector.
pub struct RefineBridge<'a, E, H> {
    guard: &'a InterfaceGuard,
    engine: &'a E,
    host: &'a H,
    environment: EnvironmentHandle,
    function: HostFunction,
}

impl<'a, E: SolverEngine, H: ScriptHost> RefineBridge<'a, E, H> {
    pub fn new(
        guard: &'a InterfaceGuard,
        engine: &'a E,
        host: &'a H,
        environment: EnvironmentHandle,
        function: HostFunction,
    ) -> Self {
        Self {
            guard,
            engine,
            host,
            environment,
            function,
        }
    }

    fn interpret(
        &self,
        returned: Result<Vec<ScriptValue>, String>,
        problem: &mut JacobianProblem<'_>,
    ) -> RefineOutcome {
        let returned = match returned {
            Ok(values) => values,
            Err(message) => {
                warn!(
                    function = %self.function.name,
                    error = %message,
                    "refinement callback failed"
                );
                return RefineOutcome::Untouched;
            }
        };
        match returned.as_slice() {
            [solution] => {
                let Some(values) = solution.as_number_array() else {
                    return RefineOutcome::Untouched;
                };
                if values.len() != problem.cols {
                    return RefineOutcome::Untouched;
                }
                if !all_finite(values) {
                    return RefineOutcome::InvalidData;
                }
                problem.solution.copy_from_slice(values);
                RefineOutcome::Solved
            }
            [error_vector, jacobian] => {
                let (Some(errors), Some(matrix)) =
                    (error_vector.as_number_array(), jacobian.as_number_array())
                else {
                    return RefineOutcome::Untouched;
                };
                if errors.len() != problem.rows || matrix.len() != problem.rows * problem.cols {
                    return RefineOutcome::Untouched;
                }
                if !all_finite(errors) || !all_finite(matrix) {
                    return RefineOutcome::InvalidData;
                }
                problem.error_vector.clear();
                problem.error_vector.extend_from_slice(errors);
                problem.jacobian.clear();
                problem.jacobian.extend_from_slice(matrix);
                RefineOutcome::Adjusted
            }
            _ => RefineOutcome::Untouched,
        }
    }
}

impl<E: SolverEngine, H: ScriptHost> JacobianRefiner for RefineBridge<'_, E, H> {
    fn refine(&mut self, problem: &mut JacobianProblem<'_>) -> RefineOutcome {
        debug!(
            function = %self.function.name,
            environment = self.environment,
            rows = problem.rows,
            cols = problem.cols,
            "bridging refinement callback"
        );
        let args = vec![
            ScriptValue::IntArray(problem.row_constraints.to_vec()),
            ScriptValue::IntArray(problem.row_elements.to_vec()),
            ScriptValue::IntArray(problem.col_handles.to_vec()),
            ScriptValue::IntArray(problem.col_stages.to_vec()),
            ScriptValue::NumberArray(problem.jacobian.clone()),
            ScriptValue::NumberArray(problem.error_vector.clone()),
        ];
        self.guard.release();
        let returned = self
            .host
            .call_function(self.function.context, &self.function.name, args);
        let outcome = self.interpret(returned, problem);
        relock_and_restore(self.guard, self.engine, self.environment);
        outcome
    }
}

/// Configuration-validation flavor of the callback bridge.
///
/// The host function receives a candidate joint configuration and answers
/// with a boolean verdict; anything else counts as acceptance, matching the
/// permissive default of the original interface.
pub struct ValidationBridge<'a, E, H> {
    guard: &'a InterfaceGuard,
    engine: &'a E,
    host: &'a H,
    environment: EnvironmentHandle,
    function: HostFunction,
}

impl<'a, E: SolverEngine, H: ScriptHost> ValidationBridge<'a, E, H> {
    pub fn new(
        guard: &'a InterfaceGuard,
        engine: &'a E,
        host: &'a H,
        environment: EnvironmentHandle,
        function: HostFunction,
    ) -> Self {
        Self {
            guard,
            engine,
            host,
            environment,
            function,
        }
    }
}

impl<E: SolverEngine, H: ScriptHost> ConfigValidator for ValidationBridge<'_, E, H> {
    fn validate(&mut self, config: &[f64]) -> bool {
        debug!(
            function = %self.function.name,
            environment = self.environment,
            joints = config.len(),
            "bridging validation callback"
        );
        self.guard.release();
        let returned = self.host.call_function(
            self.function.context,
            &self.function.name,
            vec![ScriptValue::NumberArray(config.to_vec())],
        );
        let verdict = match returned {
            Ok(values) => values
                .first()
                .and_then(ScriptValue::as_bool)
                .unwrap_or(true),
            Err(message) => {
                warn!(
                    function = %self.function.name,
                    error = %message,
                    "validation callback failed"
                );
                true
            }
        };
        relock_and_restore(self.guard, self.engine, self.environment);
        verdict
    }
}

/// Persistent binding of one joint-dependency callback.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyBinding {
    pub environment: EnvironmentHandle,
    pub slave: ObjectHandle,
    pub function: HostFunction,
}

/// The dependency bindings live in a list keyed by `(environment, slave)`;
/// they are installed on many joints at once and consulted from deep inside
/// unrelated operations, unlike the per-call solve bindings.
#[derive(Debug, Default)]
pub struct DependencyTable {
    bindings: Vec<DependencyBinding>,
}

impl DependencyTable {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Installs or replaces the binding for `(environment, slave)`.
    pub fn set(&mut self, binding: DependencyBinding) {
        self.remove(binding.environment, binding.slave);
        self.bindings.push(binding);
    }

    pub fn remove(&mut self, environment: EnvironmentHandle, slave: ObjectHandle) {
        self.bindings
            .retain(|b| !(b.environment == environment && b.slave == slave));
    }

    pub fn remove_environment(&mut self, environment: EnvironmentHandle) {
        self.bindings.retain(|b| b.environment != environment);
    }

    pub fn remove_context(&mut self, context: ContextId) {
        self.bindings.retain(|b| b.function.context != context);
    }

    pub fn lookup(
        &self,
        environment: EnvironmentHandle,
        slave: ObjectHandle,
    ) -> Option<&DependencyBinding> {
        self.bindings
            .iter()
            .find(|b| b.environment == environment && b.slave == slave)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Dependency flavor of the bridge body. Returns the host-computed slave
/// position, or `None` when the host had no (finite) answer — the engine then
/// falls back to the joint's linear dependency rule.
pub(crate) fn dispatch_dependency<E: SolverEngine, H: ScriptHost>(
    guard: &InterfaceGuard,
    engine: &E,
    host: &H,
    binding: &DependencyBinding,
    master_position: f64,
) -> Option<f64> {
    debug!(
        function = %binding.function.name,
        environment = binding.environment,
        slave = binding.slave,
        "bridging dependency callback"
    );
    guard.release();
    let returned = host.call_function(
        binding.function.context,
        &binding.function.name,
        vec![
            ScriptValue::Int(binding.environment as i64),
            ScriptValue::Int(binding.slave as i64),
            ScriptValue::Number(master_position),
        ],
    );
    let answer = match returned {
        Ok(values) => values.first().and_then(ScriptValue::as_number),
        Err(message) => {
            warn!(
                function = %binding.function.name,
                error = %message,
                "dependency callback failed"
            );
            None
        }
    };
    relock_and_restore(guard, engine, binding.environment);
    match answer {
        Some(value) if value.is_finite() => Some(value),
        Some(_) => {
            warn!(
                function = %binding.function.name,
                "dependency callback returned non-finite data"
            );
            None
        }
        None => None,
    }
}
