//! Ready-made `VirtoolApp` manifests with sensible defaults, used by tests
//! and tooling. Options run in order after the defaults are filled in.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::virtool_app::{
    ComponentSpec, GlobalConfig, JobSpec, UpdateStrategy, VirtoolApp, VirtoolAppSpec,
    VirtoolAppStatus,
};

pub const DEFAULT_COMPONENT: &str = "default";
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_IMAGE: &str = "default-image:latest";
pub const DEFAULT_REPLICAS: i32 = 1;
pub const DEFAULT_CPU_LIMIT: &str = "100m";
pub const DEFAULT_MEMORY_LIMIT: &str = "128Mi";
pub const DEFAULT_CPU_REQUEST: &str = "50m";
pub const DEFAULT_MEMORY_REQUEST: &str = "64Mi";
pub const DEFAULT_UPDATE_TYPE: &str = "RollingUpdate";
pub const DEFAULT_MAX_UNAVAILABLE: &str = "25%";
pub const DEFAULT_MAX_SURGE: &str = "25%";
pub const DEFAULT_REGISTRY: &str = "default-registry.example.com";
pub const DEFAULT_IMAGE_PULL_SECRET: &str = "default-pull-secret";

pub type AppOption = Box<dyn FnOnce(&mut VirtoolApp) + Send>;

pub fn default_resources() -> ResourceRequirements {
    let pair = |cpu: &str, mem: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(mem.to_string())),
        ])
    };
    ResourceRequirements {
        limits: Some(pair(DEFAULT_CPU_LIMIT, DEFAULT_MEMORY_LIMIT)),
        requests: Some(pair(DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_REQUEST)),
        ..Default::default()
    }
}

pub fn default_component() -> ComponentSpec {
    ComponentSpec {
        version: DEFAULT_VERSION.into(),
        image: DEFAULT_IMAGE.into(),
        replicas: Some(DEFAULT_REPLICAS),
        resources: Some(default_resources()),
        update_order: 0,
        pre_update_job: None,
        post_update_job: None,
    }
}

pub fn new_virtool_app(
    name: &str,
    namespace: &str,
    opts: impl IntoIterator<Item = AppOption>,
) -> VirtoolApp {
    let spec = VirtoolAppSpec {
        components: BTreeMap::from([(DEFAULT_COMPONENT.to_string(), default_component())]),
        update_strategy: UpdateStrategy {
            type_: Some(DEFAULT_UPDATE_TYPE.into()),
            max_unavailable: Some(IntOrString::String(DEFAULT_MAX_UNAVAILABLE.into())),
            max_surge: Some(IntOrString::String(DEFAULT_MAX_SURGE.into())),
        },
        global_config: GlobalConfig {
            registry: Some(DEFAULT_REGISTRY.into()),
            image_pull_secret: Some(DEFAULT_IMAGE_PULL_SECRET.into()),
            ..Default::default()
        },
    };
    let mut app = VirtoolApp::new(name, spec);
    app.metadata.namespace = Some(namespace.to_string());
    app.status = Some(VirtoolAppStatus::default());
    for opt in opts {
        opt(&mut app);
    }
    app
}

/// Replace the whole component set.
pub fn with_components(components: BTreeMap<String, ComponentSpec>) -> AppOption {
    Box::new(move |app| app.spec.components = components)
}

/// Add or replace one component, starting from the defaults.
pub fn with_component(
    name: &str,
    edit: impl FnOnce(&mut ComponentSpec) + Send + 'static,
) -> AppOption {
    let name = name.to_string();
    Box::new(move |app| {
        let mut c = default_component();
        edit(&mut c);
        app.spec.components.insert(name, c);
    })
}

pub fn without_component(name: &str) -> AppOption {
    let name = name.to_string();
    Box::new(move |app| {
        app.spec.components.remove(&name);
    })
}

pub fn with_strategy(
    type_: &str,
    max_unavailable: Option<IntOrString>,
    max_surge: Option<IntOrString>,
) -> AppOption {
    let strategy = UpdateStrategy {
        type_: Some(type_.to_string()),
        max_unavailable,
        max_surge,
    };
    Box::new(move |app| app.spec.update_strategy = strategy)
}

pub fn with_global_config(global: GlobalConfig) -> AppOption {
    Box::new(move |app| app.spec.global_config = global)
}

pub fn with_generation(generation: i64) -> AppOption {
    Box::new(move |app| app.metadata.generation = Some(generation))
}

pub fn job(image: &str, command: &[&str]) -> JobSpec {
    JobSpec {
        image: image.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        args: Vec::new(),
    }
}
