//! ContainerStorageModule Reconciler
//!
//! One pass over a resource:
//! - fetch, then branch on the deletion timestamp
//! - prechecks; a spec problem parks the resource in `InvalidConfig`
//! - finalizer and version annotations
//! - differential cleanup against the last applied snapshot
//! - compose (driver bundle, overrides, driver profile, modules) and sync
//! - snapshot, status refresh and content watch
//!
//! The deletion branch removes what the resource asks to force-remove and
//! only then releases the finalizer.

use super::cleanup::DifferentialCleanup;
use super::context::{backoff_key, Context};
use super::drivers::DriverFactory;
use super::precheck::Prechecks;
use super::snapshot::AppliedSnapshot;
use super::sync::{ExtensionFailures, Synchronizer};
use super::watch::projection::{project_state, read_workloads, same_status};
use crate::crd::{
    ContainerStorageModule, ContainerStorageModuleStatus, StatusState,
    ANNOTATION_CONFIG_VERSION, ANNOTATION_OPERATOR_VERSION, ANNOTATION_PREVIOUS_CONFIG,
    CSM_FINALIZER,
};
use crate::domain::objects::ManagedObject;
use crate::domain::ports::{EventReason, ResourceEvent};
use crate::error::{Error, Result};
use crate::manifest::bundle::{Bundle, InstanceRef};
use crate::manifest::template::{RenderContext, DEFAULT_KUBELET_DIR};
use crate::modules::{transform, ModulePipeline};
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Kind label used in metrics and logs
pub const KIND: &str = "ContainerStorageModule";

/// Driver env that relocates the kubelet root
pub const KUBELET_DIR_ENV: &str = "KUBELET_CONFIG_DIR";

/// Controller entry point
pub async fn reconcile(csm: Arc<ContainerStorageModule>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let namespace = csm.namespace().unwrap_or_default();
    let name = csm.name_any();

    let result = StorageModuleReconciler::new(ctx.clone())
        .reconcile(&namespace, &name)
        .await;

    ctx.metrics
        .reconciled(KIND, started.elapsed(), result.as_ref().err());
    if result.is_ok() {
        ctx.reset_backoff(&backoff_key(csm.as_ref()));
    }
    result
}

pub struct StorageModuleReconciler {
    ctx: Arc<Context>,
}

impl StorageModuleReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let csm = match self.ctx.modules.get(namespace, name).await {
            Ok(Some(csm)) => csm,
            Ok(None) => {
                debug!("Resource is gone");
                return Ok(Action::await_change());
            }
            Err(e) => {
                // The next watch event brings us back
                warn!(error = %e, "Failed to fetch resource");
                return Ok(Action::await_change());
            }
        };

        if csm.meta().deletion_timestamp.is_some() {
            return self.remove(&csm).await;
        }

        let prechecks = Prechecks::new(&self.ctx.resolver, self.ctx.cluster.as_ref());
        match prechecks.run(&csm).await {
            Ok(()) => {}
            Err(e) if e.is_validation() => return Ok(self.reject(&csm, &e).await),
            Err(e) => return Err(e),
        }

        match self.install(&csm).await {
            Ok(action) => Ok(action),
            Err(e) if e.is_validation() => Ok(self.reject(&csm, &e).await),
            Err(e) => {
                warn!(error = %e, "Sync failed");
                let message = e.to_string();
                self.update_status(&csm, |status| status.message = Some(message.clone()))
                    .await;
                self.publish(&csm, ResourceEvent::warning(EventReason::Updated, message))
                    .await;
                Err(e)
            }
        }
    }

    /// Normal branch, after prechecks passed
    async fn install(&self, csm: &ContainerStorageModule) -> Result<Action> {
        let instance = InstanceRef::from_resource(csm);
        let previous = AppliedSnapshot::from_resource(csm);
        let installing = !csm.has_finalizer();

        if installing {
            let mut finalizers = csm.finalizers().to_vec();
            finalizers.push(CSM_FINALIZER.to_string());
            self.ctx
                .modules
                .set_finalizers(&instance.namespace, &instance.name, finalizers)
                .await?;
            info!(instance = %instance.key(), "Added finalizer");
        }

        self.annotate_versions(csm).await?;

        let progress = progress_state(csm.state(), installing, previous.as_ref(), csm);
        self.update_status(csm, |status| {
            status.state = progress;
            status.message = None;
        })
        .await;

        let render = self.render_context(csm).await?;

        if let Some(previous) = &previous {
            let cleanup = DifferentialCleanup::new(&self.ctx.resolver, self.ctx.cluster.as_ref(), &instance);
            let removed = cleanup.run(previous, &csm.spec, &render).await?;
            if removed > 0 {
                info!(removed, "Cleaned up disabled modules");
            }
        }

        let bundle = self.compose(csm, &render)?;
        let report = Synchronizer::new(self.ctx.cluster.as_ref(), &instance)
            .apply_all(bundle.ordered())
            .await?;
        info!(
            instance = %instance.key(),
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            "Synced bundle"
        );

        let snapshot = AppliedSnapshot::capture(&csm.spec);
        if previous.as_ref() != Some(&snapshot) {
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_PREVIOUS_CONFIG.to_string(), snapshot.to_annotation()?);
            self.ctx
                .modules
                .merge_annotations(&instance.namespace, &instance.name, annotations)
                .await?;
        }

        if csm.driver_type().is_none() {
            self.update_status(csm, |status| {
                status.state = status.state.advance(StatusState::Succeeded);
                status.message = None;
            })
            .await;
        } else {
            match read_workloads(self.ctx.cluster.as_ref(), &instance).await {
                Ok((controller, node)) => {
                    let healthy = controller.is_healthy() && node.is_healthy();
                    self.update_status(csm, |status| {
                        status.controller_status = controller;
                        status.node_status = node;
                        status.state = project_state(status.state, healthy);
                        status.message = None;
                    })
                    .await;
                }
                Err(e) => warn!(error = %e, "Failed to read workloads after sync"),
            }
            self.ctx.watches.arm(&instance, self.ctx.launcher.as_ref());
        }

        self.publish(
            csm,
            ResourceEvent::normal(
                EventReason::Completed,
                format!("Synced {} objects", report.created + report.updated + report.unchanged),
            ),
        )
        .await;
        Ok(Action::await_change())
    }

    /// Park a resource whose spec needs an edit
    async fn reject(&self, csm: &ContainerStorageModule, error: &Error) -> Action {
        warn!(name = %csm.name_any(), error = %error, "Invalid configuration");
        let message = error.to_string();
        self.update_status(csm, |status| {
            status.state = StatusState::InvalidConfig;
            status.message = Some(message.clone());
        })
        .await;
        self.publish(csm, ResourceEvent::warning(EventReason::Updated, message))
            .await;
        Action::await_change()
    }

    /// Deletion branch
    #[instrument(skip_all, fields(name = %csm.name_any()))]
    async fn remove(&self, csm: &ContainerStorageModule) -> Result<Action> {
        let instance = InstanceRef::from_resource(csm);
        if !csm.has_finalizer() {
            self.ctx.watches.disarm(&instance.key());
            return Ok(Action::await_change());
        }

        let objects = self.removal_set(csm).await?;
        if !objects.is_empty() {
            let removed = Synchronizer::new(self.ctx.cluster.as_ref(), &instance)
                .remove_all(objects, ExtensionFailures::Fail)
                .await?;
            info!(removed, "Removed managed objects");
        }

        self.ctx.watches.disarm(&instance.key());
        self.publish(
            csm,
            ResourceEvent::normal(EventReason::Deleted, "Released managed objects"),
        )
        .await;

        let finalizers = csm
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CSM_FINALIZER)
            .cloned()
            .collect();
        self.ctx
            .modules
            .set_finalizers(&instance.namespace, &instance.name, finalizers)
            .await?;
        info!(instance = %instance.key(), "Removed finalizer");
        Ok(Action::await_change())
    }

    /// Objects to delete for a resource being removed.
    ///
    /// Rendering uses the last applied spec, which is what the cluster holds;
    /// the force flags come from the current spec.
    async fn removal_set(&self, csm: &ContainerStorageModule) -> Result<Vec<ManagedObject>> {
        let force_driver = csm.spec.driver.force_removal;
        let forced_modules: Vec<_> = csm
            .spec
            .modules
            .iter()
            .filter(|m| m.force_remove_module)
            .map(|m| m.name)
            .collect();
        if !force_driver && forced_modules.is_empty() {
            return Ok(Vec::new());
        }

        let mut applied = csm.clone();
        if let Some(snapshot) = AppliedSnapshot::from_resource(csm) {
            applied.spec = snapshot.spec;
        }
        let render = self.render_context(&applied).await?;

        if force_driver {
            return Ok(self.compose(&applied, &render)?.ordered());
        }

        let driver = &applied.spec.driver;
        let pipeline = ModulePipeline::new(
            &self.ctx.resolver,
            &render,
            driver.csi_driver_type.map(|d| (d, driver.config_version.as_str())),
        );
        let mut objects = Vec::new();
        for module in applied.enabled_modules().filter(|m| forced_modules.contains(&m.name)) {
            let components = transform(module.name).components(module);
            objects.extend(pipeline.standalone(module, &components)?);
        }
        Ok(objects)
    }

    /// Driver bundle with overrides and profile edits, then every module
    fn compose(&self, csm: &ContainerStorageModule, render: &RenderContext) -> Result<Bundle> {
        let spec = &csm.spec.driver;
        let driver = match spec.csi_driver_type {
            Some(driver_type) => {
                let mut bundle = self.ctx.resolver.resolve_driver(driver_type, render)?;
                bundle.apply_overrides(spec);
                DriverFactory::profile(driver_type).preprocess(
                    &mut bundle,
                    csm,
                    self.ctx.config.platform,
                )?;
                Some(bundle)
            }
            None => None,
        };

        let pipeline = ModulePipeline::new(
            &self.ctx.resolver,
            render,
            spec.csi_driver_type.map(|d| (d, spec.config_version.as_str())),
        );
        pipeline.apply(Bundle::new(driver), &csm.spec.modules)
    }

    async fn render_context(&self, csm: &ContainerStorageModule) -> Result<RenderContext> {
        let kube = self.ctx.kube_version().await?;
        let driver = &csm.spec.driver;

        let mut render = RenderContext::new(csm.name_any(), csm.namespace().unwrap_or_default())
            .with_config_version(driver.config_version.clone());
        render.driver = driver
            .csi_driver_type
            .map(|d| d.as_str().to_string())
            .unwrap_or_default();
        render.kubelet_dir = csm
            .driver_env(KUBELET_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .unwrap_or(DEFAULT_KUBELET_DIR)
            .to_string();
        render.images = self.ctx.resolver.images(kube)?;
        Ok(render)
    }

    async fn annotate_versions(&self, csm: &ContainerStorageModule) -> Result<()> {
        let mut annotations = BTreeMap::new();
        let version = &csm.spec.driver.config_version;
        if !version.is_empty() && csm.applied_config_version() != Some(version.as_str()) {
            annotations.insert(ANNOTATION_CONFIG_VERSION.to_string(), version.clone());
        }
        let operator = &self.ctx.config.operator_version;
        if csm.annotations().get(ANNOTATION_OPERATOR_VERSION) != Some(operator) {
            annotations.insert(ANNOTATION_OPERATOR_VERSION.to_string(), operator.clone());
        }
        if annotations.is_empty() {
            return Ok(());
        }
        self.ctx
            .modules
            .merge_annotations(
                &csm.namespace().unwrap_or_default(),
                &csm.name_any(),
                annotations,
            )
            .await
    }

    /// Read-modify-write of the status under the shared status lock.
    ///
    /// Failures are logged; the next pass or watch event writes again.
    async fn update_status(
        &self,
        csm: &ContainerStorageModule,
        update: impl FnOnce(&mut ContainerStorageModuleStatus) + Send,
    ) {
        let namespace = csm.namespace().unwrap_or_default();
        let name = csm.name_any();

        let _guard = self.ctx.status_lock.lock().await;
        let current = match self.ctx.modules.get(&namespace, &name).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to refetch resource for status");
                return;
            }
        };

        let previous = current.status.unwrap_or_default();
        let mut status = previous.clone();
        update(&mut status);
        if same_status(&previous, &status) {
            return;
        }
        status.last_updated = Some(Utc::now());

        match self.ctx.modules.set_status(&namespace, &name, &status).await {
            Ok(()) => debug!(state = %status.state, "Status updated"),
            Err(e) => warn!(error = %e, "Failed to update status"),
        }
    }

    async fn publish(&self, csm: &ContainerStorageModule, event: ResourceEvent) {
        self.ctx.events.publish(&csm.object_ref(&()), event).await;
    }
}

/// State shown while a pass is in flight
fn progress_state(
    current: StatusState,
    installing: bool,
    previous: Option<&AppliedSnapshot>,
    csm: &ContainerStorageModule,
) -> StatusState {
    let target = match (current, previous) {
        (StatusState::NoState, _) | (_, None) => StatusState::Creating,
        _ if installing => StatusState::Creating,
        (StatusState::Failed | StatusState::InvalidConfig, Some(_)) => StatusState::Updating,
        (_, Some(previous)) if previous.spec != csm.spec => StatusState::Updating,
        (current, Some(_)) => current,
    };
    current.advance(target)
}
