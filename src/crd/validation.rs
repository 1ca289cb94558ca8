//! Admission validation of HostPathProvisioner specs

use super::hostpath_provisioner::{HostPathProvisionerSpec, StoragePool};
use crate::error::{Error, Result};
use std::collections::HashMap;

const MAX_STORAGE_POOL_NAME_LENGTH: usize = 50;
const MAX_PATH_LENGTH: usize = 255;
const MAX_STORAGE_POOLS: usize = 1;

/// Validate a spec, returning the first violated rule
pub fn validate(spec: &HostPathProvisionerSpec) -> Result<()> {
    match (&spec.path_config, spec.storage_pools.is_empty()) {
        (Some(_), false) => return Err(invalid("pathConfig and storage pools cannot be both set")),
        (None, true) => return Err(invalid("either pathConfig or storage pools must be set")),
        _ => {}
    }
    if let Some(path_config) = &spec.path_config {
        if path_config.path.is_empty() {
            return Err(invalid("pathconfig path must be set"));
        }
    }
    let mut used_paths: HashMap<&str, usize> = HashMap::new();
    let mut used_names: HashMap<&str, usize> = HashMap::new();
    for (i, pool) in spec.storage_pools.iter().enumerate() {
        validate_storage_pool(pool)?;
        if let Some(index) = used_paths.insert(&pool.path, i) {
            return Err(invalid(&format!(
                "spec.storagePools[{}].path is the same as spec.storagePools[{}].path, cannot have duplicate paths",
                i, index
            )));
        }
        if let Some(index) = used_names.insert(&pool.name, i) {
            return Err(invalid(&format!(
                "spec.storagePools[{}].name is the same as spec.storagePools[{}].name, cannot have duplicate names",
                i, index
            )));
        }
    }
    if spec.storage_pools.len() > MAX_STORAGE_POOLS {
        return Err(invalid(&format!(
            "at most {} storage pool is supported, {} found",
            MAX_STORAGE_POOLS,
            spec.storage_pools.len()
        )));
    }
    Ok(())
}

fn validate_storage_pool(pool: &StoragePool) -> Result<()> {
    if pool.name.trim().is_empty() {
        return Err(invalid("storagePool.name cannot be blank"));
    }
    if pool.name.len() > MAX_STORAGE_POOL_NAME_LENGTH {
        return Err(invalid("storagePool.name cannot have a length greater than 50"));
    }
    if pool.path.trim().is_empty() {
        return Err(invalid("storagePool.path cannot be blank"));
    }
    if pool.path.len() > MAX_PATH_LENGTH {
        return Err(invalid("storagePool.path cannot have a length greater than 255"));
    }
    if pool.pvc_template.is_some() && pool.storage_class.is_some() {
        return Err(invalid(
            "storagePool cannot set both pvcTemplate and storageClass",
        ));
    }
    Ok(())
}

fn invalid(message: &str) -> Error {
    Error::Validation(message.to_string())
}
