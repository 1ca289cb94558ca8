//! OpenShift security context constraints
//!
//! Only reconciled when the cluster serves `security.openshift.io`.

use super::{
    apply, object_meta, remove, ResourceContext, ADMIN_CSI_SERVICE_ACCOUNT, ADMIN_SERVICE_ACCOUNT,
    CSI_PROVISIONER_NAME, PROVISIONER_NAME,
};
use crate::crd::{SecurityContextConstraints, StrategyOptions};
use crate::error::Result;
use tracing::debug;

pub async fn reconcile(ctx: &ResourceContext) -> Result<()> {
    if !ctx.store.is_served::<SecurityContextConstraints>().await? {
        debug!("SecurityContextConstraints not served, skipping");
        return Ok(());
    }
    if ctx.cr.is_legacy() {
        apply(ctx, legacy_scc(ctx)).await?;
    } else {
        remove::<SecurityContextConstraints>(ctx, PROVISIONER_NAME).await?;
    }
    apply(ctx, csi_scc(ctx)).await?;
    Ok(())
}

/// Delete both constraints while the CR is deleted
pub async fn remove_all(ctx: &ResourceContext) -> Result<()> {
    if !ctx.store.is_served::<SecurityContextConstraints>().await? {
        return Ok(());
    }
    for name in [PROVISIONER_NAME, CSI_PROVISIONER_NAME] {
        remove::<SecurityContextConstraints>(ctx, name).await?;
    }
    Ok(())
}

fn base_scc(ctx: &ResourceContext, name: &str, sa: &str) -> SecurityContextConstraints {
    SecurityContextConstraints {
        metadata: object_meta(name, None, ctx.config.recommended_labels()),
        allow_host_dir_volume_plugin: true,
        required_drop_capabilities: ["KILL", "MKNOD", "SETUID", "SETGID"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        run_as_user: StrategyOptions::run_as_any(),
        se_linux_context: StrategyOptions::run_as_any(),
        fs_group: StrategyOptions::run_as_any(),
        supplemental_groups: StrategyOptions::run_as_any(),
        users: vec![format!("system:serviceaccount:{}:{}", ctx.namespace, sa)],
        groups: Vec::new(),
        ..Default::default()
    }
}

fn legacy_scc(ctx: &ResourceContext) -> SecurityContextConstraints {
    SecurityContextConstraints {
        allow_privileged_container: false,
        volumes: vec!["hostPath".into(), "secret".into(), "projected".into()],
        ..base_scc(ctx, PROVISIONER_NAME, ADMIN_SERVICE_ACCOUNT)
    }
}

fn csi_scc(ctx: &ResourceContext) -> SecurityContextConstraints {
    SecurityContextConstraints {
        allow_privileged_container: true,
        volumes: vec!["*".into()],
        ..base_scc(ctx, CSI_PROVISIONER_NAME, ADMIN_CSI_SERVICE_ACCOUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ObjectKey, ResourceKind};
    use crate::resources::testing::*;

    async fn scc(ctx: &ResourceContext, name: &str) -> Option<SecurityContextConstraints> {
        ctx.store.get(&ObjectKey::cluster(name)).await.unwrap()
    }

    #[tokio::test]
    async fn test_constraints_follow_mode() {
        let fx = fixture(legacy_spec()).await;
        reconcile(&fx.ctx).await.unwrap();

        let legacy = scc(&fx.ctx, PROVISIONER_NAME).await.unwrap();
        assert!(!legacy.allow_privileged_container);
        assert_eq!(
            legacy.users,
            vec![format!("system:serviceaccount:{}:{}", NAMESPACE, ADMIN_SERVICE_ACCOUNT)]
        );
        let csi = scc(&fx.ctx, CSI_PROVISIONER_NAME).await.unwrap();
        assert!(csi.allow_privileged_container);
        assert_eq!(csi.volumes, vec!["*"]);

        let mut ctx = fx.ctx.clone();
        ctx.cr.spec = pool_spec();
        reconcile(&ctx).await.unwrap();
        assert!(scc(&ctx, PROVISIONER_NAME).await.is_none());
        assert!(scc(&ctx, CSI_PROVISIONER_NAME).await.is_some());
    }

    #[tokio::test]
    async fn test_skipped_without_openshift() {
        let fx = fixture(legacy_spec()).await;
        fx.memory.remove_api(ResourceKind::SecurityContextConstraints);
        reconcile(&fx.ctx).await.unwrap();
        remove_all(&fx.ctx).await.unwrap();
        assert_eq!(fx.memory.writes(), 1);
    }
}
