//! Cluster roles, roles and their bindings

use super::{
    apply, object_meta, remove, ResourceContext, ADMIN_CSI_SERVICE_ACCOUNT, ADMIN_SERVICE_ACCOUNT,
    PROVISIONER_NAME,
};
use crate::crd::SNAPSHOTTING_FEATURE_GATE;
use crate::error::Result;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub async fn reconcile_cluster_roles(ctx: &ResourceContext) -> Result<()> {
    if ctx.cr.is_legacy() {
        apply(ctx, legacy_cluster_role(ctx)).await?;
    } else {
        remove::<ClusterRole>(ctx, PROVISIONER_NAME).await?;
    }
    apply(ctx, csi_cluster_role(ctx)).await?;
    Ok(())
}

pub async fn reconcile_cluster_role_bindings(ctx: &ResourceContext) -> Result<()> {
    if ctx.cr.is_legacy() {
        apply(
            ctx,
            cluster_role_binding(ctx, PROVISIONER_NAME, ADMIN_SERVICE_ACCOUNT),
        )
        .await?;
    } else {
        remove::<ClusterRoleBinding>(ctx, PROVISIONER_NAME).await?;
    }
    apply(
        ctx,
        cluster_role_binding(ctx, ADMIN_CSI_SERVICE_ACCOUNT, ADMIN_CSI_SERVICE_ACCOUNT),
    )
    .await?;
    Ok(())
}

pub async fn reconcile_roles(ctx: &ResourceContext) -> Result<()> {
    apply(ctx, csi_role(ctx)).await?;
    Ok(())
}

pub async fn reconcile_role_bindings(ctx: &ResourceContext) -> Result<()> {
    apply(
        ctx,
        role_binding(
            ctx,
            ADMIN_CSI_SERVICE_ACCOUNT,
            ADMIN_CSI_SERVICE_ACCOUNT,
            &ctx.namespace,
        ),
    )
    .await?;
    Ok(())
}

/// Delete every cluster-scoped RBAC object, used while the CR is deleted
pub async fn remove_cluster_scoped(ctx: &ResourceContext) -> Result<()> {
    for name in [PROVISIONER_NAME, ADMIN_CSI_SERVICE_ACCOUNT] {
        remove::<ClusterRoleBinding>(ctx, name).await?;
        remove::<ClusterRole>(ctx, name).await?;
    }
    Ok(())
}

// =============================================================================
// Rules
// =============================================================================

pub(crate) fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// Rules shared by both provisioners
fn volume_rules() -> Vec<PolicyRule> {
    vec![
        rule(&[""], &["persistentvolumes"], &["get", "list", "watch", "create", "delete"]),
        rule(&[""], &["persistentvolumeclaims"], &["get", "list", "watch", "update"]),
        rule(&["storage.k8s.io"], &["storageclasses"], &["get", "list", "watch"]),
        rule(&[""], &["events"], &["list", "watch", "create", "patch", "update"]),
    ]
}

fn legacy_cluster_role(ctx: &ResourceContext) -> ClusterRole {
    let mut rules = volume_rules();
    rules.push(rule(&[""], &["nodes"], &["get"]));
    ClusterRole {
        metadata: object_meta(PROVISIONER_NAME, None, ctx.config.recommended_labels()),
        rules: Some(rules),
        ..Default::default()
    }
}

fn csi_cluster_role(ctx: &ResourceContext) -> ClusterRole {
    let mut rules = volume_rules();
    rules.extend([
        rule(&["storage.k8s.io"], &["csinodes"], &["get", "list", "watch"]),
        rule(&[""], &["nodes"], &["get", "list", "watch"]),
        rule(&["storage.k8s.io"], &["volumeattachments"], &["get", "list", "watch", "patch"]),
        rule(&["storage.k8s.io"], &["volumeattachments/status"], &["patch"]),
    ]);
    if ctx.cr.is_feature_gate_enabled(SNAPSHOTTING_FEATURE_GATE) {
        let group = "snapshot.storage.k8s.io";
        rules.extend([
            rule(&[group], &["volumesnapshotclasses"], &["get", "list", "watch"]),
            rule(&[group], &["volumesnapshots"], &["get"]),
            rule(
                &[group],
                &["volumesnapshotcontents"],
                &["create", "get", "list", "watch", "update", "delete", "patch"],
            ),
            rule(&[group], &["volumesnapshotcontents/status"], &["update", "patch"]),
        ]);
    }
    ClusterRole {
        metadata: object_meta(ADMIN_CSI_SERVICE_ACCOUNT, None, ctx.config.recommended_labels()),
        rules: Some(rules),
        ..Default::default()
    }
}

fn csi_role(ctx: &ResourceContext) -> Role {
    let verbs = ["get", "list", "watch", "delete", "update", "create"];
    Role {
        metadata: object_meta(
            ADMIN_CSI_SERVICE_ACCOUNT,
            Some(&ctx.namespace),
            ctx.config.recommended_labels(),
        ),
        rules: Some(vec![
            rule(&["coordination.k8s.io"], &["leases"], &verbs),
            rule(&["storage.k8s.io"], &["csistoragecapacities"], &verbs),
            rule(&[""], &["pods"], &["get"]),
        ]),
    }
}

// =============================================================================
// Bindings
// =============================================================================

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn cluster_role_binding(ctx: &ResourceContext, name: &str, sa: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: object_meta(name, None, ctx.config.recommended_labels()),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![service_account_subject(sa, &ctx.namespace)]),
    }
}

/// Binding of the Role `name` to service account `sa` of `sa_namespace`
pub(crate) fn role_binding(
    ctx: &ResourceContext,
    name: &str,
    sa: &str,
    sa_namespace: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: object_meta(name, Some(&ctx.namespace), ctx.config.recommended_labels()),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![service_account_subject(sa, sa_namespace)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ObjectKey;
    use crate::resources::testing::*;

    async fn cluster_role(ctx: &ResourceContext, name: &str) -> Option<ClusterRole> {
        ctx.store.get(&ObjectKey::cluster(name)).await.unwrap()
    }

    #[tokio::test]
    async fn test_legacy_roles_follow_mode() {
        let fx = fixture(legacy_spec()).await;
        reconcile_cluster_roles(&fx.ctx).await.unwrap();
        reconcile_cluster_role_bindings(&fx.ctx).await.unwrap();

        let legacy = cluster_role(&fx.ctx, PROVISIONER_NAME).await.unwrap();
        let last = legacy.rules.unwrap().pop().unwrap();
        assert_eq!(last.resources.unwrap(), vec!["nodes"]);
        assert_eq!(last.verbs, vec!["get"]);

        let binding: ClusterRoleBinding = fx
            .ctx
            .store
            .get(&ObjectKey::cluster(PROVISIONER_NAME))
            .await
            .unwrap()
            .unwrap();
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, ADMIN_SERVICE_ACCOUNT);
        assert_eq!(subject.namespace.as_deref(), Some(NAMESPACE));

        let mut ctx = fx.ctx.clone();
        ctx.cr.spec = pool_spec();
        reconcile_cluster_roles(&ctx).await.unwrap();
        reconcile_cluster_role_bindings(&ctx).await.unwrap();
        assert!(cluster_role(&ctx, PROVISIONER_NAME).await.is_none());
        assert!(ctx
            .store
            .get::<ClusterRoleBinding>(&ObjectKey::cluster(PROVISIONER_NAME))
            .await
            .unwrap()
            .is_none());
        assert!(cluster_role(&ctx, ADMIN_CSI_SERVICE_ACCOUNT).await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_rules_behind_gate() {
        let fx = fixture(pool_spec()).await;
        assert_eq!(csi_cluster_role(&fx.ctx).rules.unwrap().len(), 8);

        let mut ctx = fx.ctx.clone();
        ctx.cr.spec.feature_gates = vec![SNAPSHOTTING_FEATURE_GATE.into()];
        let rules = csi_cluster_role(&ctx).rules.unwrap();
        assert_eq!(rules.len(), 12);
        assert!(rules
            .iter()
            .any(|r| r.api_groups.as_deref() == Some(&["snapshot.storage.k8s.io".to_string()][..])));
    }

    #[tokio::test]
    async fn test_namespaced_role_and_binding() {
        let fx = fixture(pool_spec()).await;
        reconcile_roles(&fx.ctx).await.unwrap();
        reconcile_role_bindings(&fx.ctx).await.unwrap();

        let key = fx.ctx.namespaced_key(ADMIN_CSI_SERVICE_ACCOUNT);
        let role: Role = fx.ctx.store.get(&key).await.unwrap().unwrap();
        assert_eq!(role.rules.unwrap().len(), 3);
        let binding: RoleBinding = fx.ctx.store.get(&key).await.unwrap().unwrap();
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, ADMIN_CSI_SERVICE_ACCOUNT);
    }

    #[tokio::test]
    async fn test_remove_cluster_scoped() {
        let fx = fixture(legacy_spec()).await;
        reconcile_cluster_roles(&fx.ctx).await.unwrap();
        reconcile_cluster_role_bindings(&fx.ctx).await.unwrap();
        remove_cluster_scoped(&fx.ctx).await.unwrap();
        assert!(cluster_role(&fx.ctx, PROVISIONER_NAME).await.is_none());
        assert!(cluster_role(&fx.ctx, ADMIN_CSI_SERVICE_ACCOUNT).await.is_none());
    }
}
