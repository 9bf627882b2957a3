use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::error::SpecError;
use crate::crd::virtool_app::{GlobalConfig, JobSpec, UpdateStrategy, VirtoolApp};

pub const DEFAULT_REPLICAS: i32 = 1;
pub const DEFAULT_MAX_UNAVAILABLE: IntOrPercent = IntOrPercent::Percent(25);
pub const DEFAULT_MAX_SURGE: IntOrPercent = IntOrPercent::Percent(25);

/// Namespaced identity of an application.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId {
    pub namespace: String,
    pub name: String,
}

impl AppId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(app: &VirtoolApp) -> Self {
        Self::new(
            app.namespace().unwrap_or_else(|| "default".to_string()),
            app.name_any(),
        )
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single component of one application.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub app: AppId,
    pub component: String,
}

impl ComponentKey {
    pub fn new(app: &AppId, component: &str) -> Self {
        Self {
            app: app.clone(),
            component: component.to_string(),
        }
    }

    /// Name of the workload object backing this component. Distinct
    /// components always get distinct names.
    pub fn workload_name(&self) -> String {
        unique_dns_label(&format!("{}-{}", self.app.name, self.component))
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.app, self.component)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntOrPercent {
    Int(i32),
    Percent(u32),
}

impl IntOrPercent {
    pub fn parse(field: &'static str, value: &IntOrString) -> Result<Self, SpecError> {
        let malformed = || SpecError::MalformedIntOrPercent {
            field,
            value: match value {
                IntOrString::Int(i) => i.to_string(),
                IntOrString::String(s) => s.clone(),
            },
        };
        match value {
            IntOrString::Int(i) if *i >= 0 => Ok(IntOrPercent::Int(*i)),
            IntOrString::Int(_) => Err(malformed()),
            IntOrString::String(s) => {
                let pct = s.trim().strip_suffix('%').ok_or_else(malformed)?;
                let pct: u32 = pct.trim().parse().map_err(|_| malformed())?;
                if pct > 100 {
                    return Err(malformed());
                }
                Ok(IntOrPercent::Percent(pct))
            }
        }
    }

    /// Absolute count against `total`; percentages round up or down.
    pub fn resolve(self, total: i32, round_up: bool) -> i32 {
        match self {
            IntOrPercent::Int(i) => i,
            IntOrPercent::Percent(p) => {
                let scaled = i64::from(total.max(0)) * i64::from(p);
                let v = if round_up {
                    (scaled + 99) / 100
                } else {
                    scaled / 100
                };
                v as i32
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    RollingUpdate {
        max_unavailable: IntOrPercent,
        max_surge: IntOrPercent,
    },
    Recreate,
}

impl Strategy {
    pub fn from_spec(spec: &UpdateStrategy) -> Result<Self, SpecError> {
        match spec.type_.as_deref().map(str::trim) {
            None | Some("") | Some("RollingUpdate") => {
                let max_unavailable = spec
                    .max_unavailable
                    .as_ref()
                    .map(|v| IntOrPercent::parse("maxUnavailable", v))
                    .transpose()?
                    .unwrap_or(DEFAULT_MAX_UNAVAILABLE);
                let max_surge = spec
                    .max_surge
                    .as_ref()
                    .map(|v| IntOrPercent::parse("maxSurge", v))
                    .transpose()?
                    .unwrap_or(DEFAULT_MAX_SURGE);
                Ok(Strategy::RollingUpdate {
                    max_unavailable,
                    max_surge,
                })
            }
            Some("Recreate") => Ok(Strategy::Recreate),
            Some(other) => Err(SpecError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Pod placement shared by every workload and job of an application.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Placement {
    pub image_pull_secret: Option<String>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
}

impl From<&GlobalConfig> for Placement {
    fn from(g: &GlobalConfig) -> Self {
        Self {
            image_pull_secret: g.image_pull_secret.clone().filter(|s| !s.is_empty()),
            tolerations: g.tolerations.clone(),
            node_selector: g.node_selector.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Pre,
    Post,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pre => "pre",
            JobPhase::Post => "post",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentDesired {
    pub name: String,
    pub version: String,
    /// Image with the global registry applied
    pub image: String,
    pub replicas: i32,
    pub resources: Option<ResourceRequirements>,
    pub update_order: i32,
    pub pre_job: Option<JobSpec>,
    pub post_job: Option<JobSpec>,
}

impl ComponentDesired {
    pub fn job(&self, phase: JobPhase) -> Option<&JobSpec> {
        match phase {
            JobPhase::Pre => self.pre_job.as_ref(),
            JobPhase::Post => self.post_job.as_ref(),
        }
    }
}

/// Validated view of a `VirtoolApp` the engine plans against.
#[derive(Clone, Debug, PartialEq)]
pub struct Application {
    pub id: AppId,
    pub uid: Option<String>,
    pub generation: Option<i64>,
    /// Sorted by update order, then name
    pub components: Vec<ComponentDesired>,
    pub strategy: Strategy,
    pub placement: Placement,
}

impl Application {
    pub fn from_resource(app: &VirtoolApp) -> Result<Self, SpecError> {
        let spec = &app.spec;
        let strategy = Strategy::from_spec(&spec.update_strategy)?;
        let registry = spec.global_config.registry.as_deref();
        let mut components = Vec::with_capacity(spec.components.len());
        for (name, c) in &spec.components {
            if !is_dns_label(name) {
                return Err(SpecError::InvalidComponentName(name.clone()));
            }
            if c.version.trim().is_empty() {
                return Err(SpecError::EmptyField {
                    component: name.clone(),
                    field: "version",
                });
            }
            if c.image.trim().is_empty() {
                return Err(SpecError::EmptyField {
                    component: name.clone(),
                    field: "image",
                });
            }
            let replicas = c.replicas.unwrap_or(DEFAULT_REPLICAS);
            if replicas < 0 {
                return Err(SpecError::NegativeReplicas {
                    component: name.clone(),
                    replicas,
                });
            }
            let with_registry = |job: &JobSpec| -> Result<JobSpec, SpecError> {
                if job.image.trim().is_empty() {
                    return Err(SpecError::EmptyField {
                        component: name.clone(),
                        field: "job image",
                    });
                }
                Ok(JobSpec {
                    image: resolve_image(registry, &job.image),
                    ..job.clone()
                })
            };
            components.push(ComponentDesired {
                name: name.clone(),
                version: c.version.clone(),
                image: resolve_image(registry, &c.image),
                replicas,
                resources: c.resources.clone(),
                update_order: c.update_order,
                pre_job: c.pre_update_job.as_ref().map(&with_registry).transpose()?,
                post_job: c.post_update_job.as_ref().map(&with_registry).transpose()?,
            });
        }
        components.sort_by(|a, b| {
            a.update_order
                .cmp(&b.update_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(Self {
            id: AppId::of(app),
            uid: app.metadata.uid.clone(),
            generation: app.metadata.generation,
            components,
            strategy,
            placement: Placement::from(&spec.global_config),
        })
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDesired> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Best-effort snapshot of a component's workload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentObserved {
    pub exists: bool,
    /// Version the workload template runs
    pub current_version: Option<String>,
    pub image: Option<String>,
    /// Replica count the workload was told to run
    pub spec_replicas: i32,
    /// All instances, old and new
    pub replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
}

impl ComponentObserved {
    pub fn absent() -> Self {
        Self::default()
    }

    /// Workload template carries the desired version, image and scale.
    pub fn runs(&self, desired: &ComponentDesired) -> bool {
        self.exists
            && self.current_version.as_deref() == Some(desired.version.as_str())
            && self.image.as_deref() == Some(desired.image.as_str())
            && self.spec_replicas == desired.replicas
    }

    /// Observed version matches and every desired replica is ready.
    pub fn is_converged(&self, desired: &ComponentDesired) -> bool {
        self.exists
            && self.current_version.as_deref() == Some(desired.version.as_str())
            && self.ready_replicas == desired.replicas
    }

    /// Rollout finished: only updated instances remain and all are ready.
    pub fn is_rolled_out(&self, desired: &ComponentDesired) -> bool {
        self.runs(desired)
            && self.updated_replicas == desired.replicas
            && self.ready_replicas == desired.replicas
            && self.replicas == desired.replicas
    }
}

/// Prefix `registry` unless the image already names a registry host.
pub fn resolve_image(registry: Option<&str>, image: &str) -> String {
    let registry = match registry.map(|r| r.trim().trim_end_matches('/')) {
        Some(r) if !r.is_empty() => r,
        _ => return image.to_string(),
    };
    let names_host = image
        .split_once('/')
        .map(|(first, _)| first.contains('.') || first.contains(':') || first == "localhost")
        .unwrap_or(false);
    if names_host {
        image.to_string()
    } else {
        format!("{}/{}", registry, image)
    }
}

pub const MAX_LABEL: usize = 63;

pub fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_LABEL
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Lowercase, replace anything outside `[a-z0-9-]`, cap at 63 characters.
pub fn dns_label(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('-');
    let capped: String = trimmed.chars().take(MAX_LABEL).collect();
    capped.trim_end_matches('-').to_string()
}

/// Like [`dns_label`], but when sanitizing or capping changed the input a
/// hash of the original is appended, so two inputs never share a label.
pub fn unique_dns_label(s: &str) -> String {
    let label = dns_label(s);
    if label == s {
        return label;
    }
    let hash = format!("{:08x}", fnv1a(s.as_bytes()) as u32);
    let head: String = label.chars().take(MAX_LABEL - hash.len() - 1).collect();
    match head.trim_end_matches('-') {
        "" => hash,
        head => format!("{}-{}", head, hash),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}
