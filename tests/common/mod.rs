//! Shared scaffolding for the integration tests: a programmable script host
//! and a canonical one-joint arm scenario.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use armature::engine::constants;
use armature::{
    ContextId, EnvironmentHandle, GroupCalculation, GroupHandle, JointType, KinematicsPlugin,
    MemoryEngine, ObjectHandle, Pose, Quaternion, ScriptHost, ScriptValue,
};

type HostFn = Arc<dyn Fn(Vec<ScriptValue>) -> Result<Vec<ScriptValue>, String> + Send + Sync>;

#[derive(Default)]
struct StubHostInner {
    functions: Mutex<HashMap<String, HostFn>>,
    calls: Mutex<Vec<String>>,
}

/// Script host test double: named functions are closures registered from the
/// test body. Lookup clones the closure out before invoking it, so a
/// callback may freely reenter the plugin (and thereby this host).
#[derive(Clone, Default)]
pub struct StubHost {
    inner: Arc<StubHostInner>,
}

impl StubHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define<F>(&self, name: &str, function: F)
    where
        F: Fn(Vec<ScriptValue>) -> Result<Vec<ScriptValue>, String> + Send + Sync + 'static,
    {
        self.inner
            .functions
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(function));
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == name)
            .count()
    }
}

impl ScriptHost for StubHost {
    fn call_function(
        &self,
        _context: ContextId,
        function: &str,
        args: Vec<ScriptValue>,
    ) -> Result<Vec<ScriptValue>, String> {
        self.inner.calls.lock().unwrap().push(function.to_string());
        let callee = self.inner.functions.lock().unwrap().get(function).cloned();
        match callee {
            Some(callee) => callee(args),
            None => Err(format!("unknown function {function}")),
        }
    }
}

pub type TestPlugin = KinematicsPlugin<MemoryEngine, StubHost>;

pub fn plugin() -> (TestPlugin, StubHost) {
    let host = StubHost::new();
    let plugin = KinematicsPlugin::new(MemoryEngine::new(), host.clone());
    (plugin, host)
}

/// A planar one-joint arm: revolute joint at the origin, tip dummy one unit
/// down the arm, target dummy placed at `target`. With the target at
/// `[1, 0, 0]` the chain starts solved; `[0, 1, 0]` needs a quarter turn.
pub struct ArmScenario {
    pub environment: EnvironmentHandle,
    pub joint: ObjectHandle,
    pub tip: ObjectHandle,
    pub target: ObjectHandle,
    pub group: GroupHandle,
}

pub fn build_arm(plugin: &TestPlugin, owner: ContextId, target: [f64; 3]) -> ArmScenario {
    let environment = plugin.create_environment(owner).expect("create environment");
    let joint = plugin
        .create_joint(environment, JointType::Revolute, Some("base_joint"))
        .expect("create joint");
    let tip = plugin
        .create_dummy(environment, Some("tip"))
        .expect("create tip");
    let target_dummy = plugin
        .create_dummy(environment, Some("target"))
        .expect("create target");
    plugin
        .set_object_parent(environment, tip, Some(joint), false)
        .expect("parent tip");
    plugin
        .set_object_transformation(
            environment,
            tip,
            constants::HANDLE_PARENT,
            &Pose::new([1.0, 0.0, 0.0], Quaternion::IDENTITY),
        )
        .expect("place tip");
    plugin
        .set_object_transformation(
            environment,
            target_dummy,
            constants::HANDLE_WORLD,
            &Pose::new(target, Quaternion::IDENTITY),
        )
        .expect("place target");
    plugin
        .set_linked_dummy(environment, tip, Some(target_dummy))
        .expect("link tip to target");
    let group = plugin
        .create_group(environment, Some("arm"))
        .expect("create group");
    plugin
        .add_element(environment, group, tip)
        .expect("add element");
    plugin
        .set_group_calculation(
            environment,
            group,
            GroupCalculation {
                method: armature::engine::CalcMethod::PseudoInverse,
                damping: 0.1,
                max_iterations: 100,
            },
        )
        .expect("configure group");
    ArmScenario {
        environment,
        joint,
        tip,
        target: target_dummy,
        group,
    }
}
