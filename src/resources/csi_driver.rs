//! CSIDriver registration
//!
//! Only reconciled when the cluster serves `storage.k8s.io/v1` CSIDrivers.

use super::{apply_with, object_meta, remove, ResourceContext, DRIVER_NAME};
use crate::error::Result;
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use tracing::debug;

/// Register the driver, or remove the registration when CSI is disabled
pub async fn reconcile(ctx: &ResourceContext) -> Result<()> {
    if !ctx.store.is_served::<CSIDriver>().await? {
        debug!("CSIDriver not served, skipping");
        return Ok(());
    }
    if ctx.cr.spec.disable_csi {
        remove::<CSIDriver>(ctx, DRIVER_NAME).await?;
        return Ok(());
    }
    apply_with(ctx, csi_driver(ctx), preserve_immutable).await?;
    Ok(())
}

pub async fn remove_driver(ctx: &ResourceContext) -> Result<()> {
    if !ctx.store.is_served::<CSIDriver>().await? {
        return Ok(());
    }
    remove::<CSIDriver>(ctx, DRIVER_NAME).await?;
    Ok(())
}

fn csi_driver(ctx: &ResourceContext) -> CSIDriver {
    CSIDriver {
        metadata: object_meta(DRIVER_NAME, None, ctx.config.recommended_labels()),
        spec: CSIDriverSpec {
            attach_required: Some(false),
            pod_info_on_mount: Some(true),
            requires_republish: Some(false),
            storage_capacity: Some(false),
            volume_lifecycle_modes: Some(vec!["Persistent".to_string(), "Ephemeral".to_string()]),
            ..Default::default()
        },
    }
}

/// Most of a CSIDriver spec cannot change after creation, keep the live values
fn preserve_immutable(desired: &mut CSIDriver, current: &CSIDriver) {
    desired.spec.attach_required = current.spec.attach_required;
    desired.spec.pod_info_on_mount = current.spec.pod_info_on_mount;
    desired.spec.volume_lifecycle_modes = current.spec.volume_lifecycle_modes.clone();
    desired.spec.storage_capacity = current.spec.storage_capacity;
    desired.spec.fs_group_policy = current.spec.fs_group_policy.clone();
}
