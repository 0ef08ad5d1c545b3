//! Stage, report and context types for the provisioning pipeline.

use crate::firewall::FirewallPolicy;
use crate::images::{BaseImage, InstanceDisk};
use crate::pipeline::PipelineMetrics;
use crate::runtime::{InstanceLayout, ProvisionOptions, SharedEnvironment};
use crate::seed::{ConfigBundle, InstanceId, SeedArtifact};
use crate::service::ServiceUnit;
use crate::vmm::VmInstance;
use scratchvm_shared::errors::ScratchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Provisioning state machine.
///
/// ```text
/// Init → ImageReady → DiskReady → BundleReady → Launched → Running
///   └──────────┴───────────┴───────────┴────────────┴──→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisionStage {
    Init,
    ImageReady,
    DiskReady,
    BundleReady,
    Launched,
    Running,
    Failed,
}

impl ProvisionStage {
    /// Stage a pipeline task works towards. Validation counts towards
    /// `BundleReady` since it builds the first-boot bundle.
    pub(crate) fn for_task(task: &str) -> Self {
        match task {
            super::tasks::BUNDLE_BUILD
            | super::tasks::FIREWALL_BUILD
            | super::tasks::UNIT_BUILD
            | super::tasks::BUNDLE_ASSEMBLE
            | super::tasks::SEED_WRITE => ProvisionStage::BundleReady,
            super::tasks::IMAGE_ACQUIRE => ProvisionStage::ImageReady,
            super::tasks::DISK_DERIVE => ProvisionStage::DiskReady,
            super::tasks::VM_LAUNCH => ProvisionStage::Launched,
            super::tasks::LIVENESS_CHECK => ProvisionStage::Running,
            _ => ProvisionStage::Init,
        }
    }
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionStage::Init => "Init",
            ProvisionStage::ImageReady => "ImageReady",
            ProvisionStage::DiskReady => "DiskReady",
            ProvisionStage::BundleReady => "BundleReady",
            ProvisionStage::Launched => "Launched",
            ProvisionStage::Running => "Running",
            ProvisionStage::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// A provision that ended in `Failed`. `stage` is the stage that could not
/// be reached.
#[derive(Debug, thiserror::Error)]
#[error("failed at stage {stage}: {source}")]
pub struct ProvisionError {
    pub stage: ProvisionStage,
    #[source]
    pub source: ScratchError,
}

impl ProvisionError {
    pub fn new(stage: ProvisionStage, source: ScratchError) -> Self {
        Self { stage, source }
    }
}

/// Outcome of a provision that reached `Running`.
#[derive(Debug)]
pub struct ProvisionReport {
    pub name: String,
    pub instance: VmInstance,
    pub base_image: PathBuf,
    pub disk: PathBuf,
    pub seed: PathBuf,
    /// An existing overlay was kept rather than created.
    pub disk_reused: bool,
    /// The seed volume on disk changed.
    pub seed_written: bool,
    pub metrics: PipelineMetrics,
}

impl ProvisionReport {
    pub fn forwarded_ports(&self) -> BTreeMap<u16, String> {
        self.instance.forwarded_ports()
    }

    pub fn display_endpoint(&self) -> Option<String> {
        self.instance.display_endpoint()
    }
}

/// Shared state of one provisioning run.
pub(crate) struct ProvisionContext {
    pub env: SharedEnvironment,
    pub options: ProvisionOptions,
    pub layout: InstanceLayout,
    pub instance_id: InstanceId,

    pub bundle: Option<ConfigBundle>,
    pub policy: Option<FirewallPolicy>,
    pub unit: Option<ServiceUnit>,
    pub seed: Option<SeedArtifact>,

    pub base: Option<Arc<BaseImage>>,
    pub disk: Option<InstanceDisk>,
    pub seed_written: bool,
    pub instance: Option<VmInstance>,
}

impl ProvisionContext {
    pub fn new(env: SharedEnvironment, options: ProvisionOptions) -> Self {
        let layout = env.layout().instance(&options.name);
        let instance_id = InstanceId::for_instance(&options.name);
        Self {
            env,
            options,
            layout,
            instance_id,
            bundle: None,
            policy: None,
            unit: None,
            seed: None,
            base: None,
            disk: None,
            seed_written: false,
            instance: None,
        }
    }
}
