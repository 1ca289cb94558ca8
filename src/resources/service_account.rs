//! Service accounts of the provisioner pods

use super::{
    apply, is_owned_by, object_meta, remove, ResourceContext, ADMIN_CSI_SERVICE_ACCOUNT,
    ADMIN_SERVICE_ACCOUNT, HEALTH_CHECK_NAME,
};
use crate::config::{K8S_APP_LABEL, K8S_APP_VALUE};
use crate::domain::ListSelector;
use crate::error::Result;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;
use tracing::info;

const KEEP: [&str; 3] = [ADMIN_SERVICE_ACCOUNT, ADMIN_CSI_SERVICE_ACCOUNT, HEALTH_CHECK_NAME];

pub async fn reconcile(ctx: &ResourceContext) -> Result<()> {
    let cr_name = ctx.cr.name_any();
    for app in [K8S_APP_VALUE, cr_name.as_str()] {
        let selector = ListSelector::in_namespace(&ctx.namespace).with_label(K8S_APP_LABEL, app);
        for sa in ctx.store.list::<ServiceAccount>(&selector).await? {
            let name = sa.name_any();
            if !KEEP.contains(&name.as_str()) && is_owned_by(&sa.metadata, &cr_name) {
                info!(%name, "Deleting extra service account");
                remove::<ServiceAccount>(ctx, &name).await?;
            }
        }
    }

    for name in [ADMIN_SERVICE_ACCOUNT, ADMIN_CSI_SERVICE_ACCOUNT] {
        apply(ctx, service_account(ctx, name)).await?;
    }
    Ok(())
}

fn service_account(ctx: &ResourceContext, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(name, Some(&ctx.namespace), ctx.config.recommended_labels()),
        ..Default::default()
    }
}
