//! Create-or-merge protocol shared by every managed kind
//!
//! 1. Stamp the last-applied annotation on the desired object.
//! 2. Point namespaced objects at the custom resource as their controller.
//! 3. Create the object when it is missing.
//! 4. Otherwise three-way merge it onto the live object and update only when
//!    the merge changed something.
//!
//! Create and update outcomes are reported as events on the custom resource.

use super::{
    ResourceContext, CREATE_RESOURCE_FAILED, CREATE_RESOURCE_SUCCESS, UPDATE_RESOURCE_FAILED,
    UPDATE_RESOURCE_SUCCESS,
};
use crate::domain::OperatorEvent;
use crate::error::Result;
use crate::merge::{merge_object, set_last_applied, to_document};
use crate::store::{key_of, Managed};
use tracing::{debug, info, warn};

/// What [`apply`] did to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Converge one object onto `desired`
pub async fn apply<K: Managed>(ctx: &ResourceContext, desired: K) -> Result<ApplyOutcome> {
    apply_with(ctx, desired, |_, _| {}).await
}

/// Like [`apply`], with `preserve` copying fields from the live object onto
/// the desired one before merging.
pub async fn apply_with<K, F>(ctx: &ResourceContext, mut desired: K, preserve: F) -> Result<ApplyOutcome>
where
    K: Managed,
    F: FnOnce(&mut K, &K),
{
    set_last_applied(&mut desired)?;
    if K::KIND.namespaced() {
        desired.meta_mut().owner_references = Some(vec![ctx.owner_reference()?]);
    }

    let key = key_of(&desired);
    let kind = K::KIND;

    let Some(current) = ctx.store.get::<K>(&key).await? else {
        info!(%kind, %key, "Creating resource");
        return match ctx.store.create(&desired).await {
            Ok(_) => {
                ctx.publish(OperatorEvent::normal(
                    CREATE_RESOURCE_SUCCESS,
                    format!("Successfully created resource {} {}", kind, key.name),
                ))
                .await;
                Ok(ApplyOutcome::Created)
            }
            Err(e) => {
                warn!(%kind, %key, error = %e, "Failed to create resource");
                ctx.publish(OperatorEvent::warning(
                    CREATE_RESOURCE_FAILED,
                    format!("Failed to create resource {}, {}", key.name, e),
                ))
                .await;
                Err(e)
            }
        };
    };

    preserve(&mut desired, &current);
    let merged = merge_object(&desired, &current)?;

    if to_document(&merged)? == to_document(&current)? {
        debug!(%kind, %key, "Skip reconcile: resource already up to date");
        return Ok(ApplyOutcome::Unchanged);
    }

    info!(%kind, %key, "Updating resource");
    match ctx.store.update(&merged).await {
        Ok(_) => {
            ctx.publish(OperatorEvent::normal(
                UPDATE_RESOURCE_SUCCESS,
                format!("Successfully updated resource {} {}", kind, key.name),
            ))
            .await;
            Ok(ApplyOutcome::Updated)
        }
        Err(e) => {
            warn!(%kind, %key, error = %e, "Failed to update resource");
            ctx.publish(OperatorEvent::warning(
                UPDATE_RESOURCE_FAILED,
                format!("Failed to update resource {}, {}", key.name, e),
            ))
            .await;
            Err(e)
        }
    }
}

/// Delete `name` if it exists. Returns whether anything was deleted.
pub async fn remove<K: Managed>(ctx: &ResourceContext, name: &str) -> Result<bool> {
    let key = ctx.key_for(K::KIND, name);
    let deleted = ctx.store.delete::<K>(&key).await?;
    if deleted {
        info!(kind = %K::KIND, %key, "Deleted resource");
    }
    Ok(deleted)
}
