//! Deterministic object naming
//!
//! Pool, node and job names are combined into Kubernetes object names that must
//! stay within the 63 character label/DNS limit. Long names are shortened with
//! an FNV-1a hash so the same inputs always produce the same name.

/// Maximum length of a Kubernetes object name used as a label value
pub const MAX_NAME_LENGTH: usize = 63;

/// Prefix of per-node storage pool Deployments and claims
pub const POOL_PREFIX: &str = "hpp-pool";

/// Prefix of per-node cleanup jobs
pub const CLEANUP_PREFIX: &str = "cleanup-pool";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a 32 bit hash rendered as 8 lowercase hex characters
pub fn short_hash(s: &str) -> String {
    let hash = s.bytes().fold(FNV_OFFSET_BASIS, |acc, b| {
        (acc ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    });
    format!("{:08x}", hash)
}

/// Build `base-suffix`, shortening `base` with a hash when the result would
/// exceed `max_length`.
pub fn resource_name_with_max_length(base: &str, suffix: &str, max_length: usize) -> String {
    if max_length == 0 {
        return String::new();
    }
    let name = format!("{}-{}", base, suffix);
    if name.len() <= max_length {
        return name;
    }

    // 10 = two dashes plus the 8 character hash
    match max_length.checked_sub(10 + suffix.len()) {
        Some(base_length) => {
            format!("{}-{}-{}", truncate(base, base_length), short_hash(base), suffix)
        }
        None => {
            // Suffix alone does not fit, hash the whole name instead
            let prefix = truncate(base, max_length.saturating_sub(9));
            let short = format!("{}-{}", prefix, short_hash(&name));
            truncate(&short, max_length).to_string()
        }
    }
}

/// Name of the claim and Deployment backing `pool` on `node`
pub fn pool_resource_name(pool: &str, node: &str) -> String {
    resource_name_with_max_length(POOL_PREFIX, &format!("{}-{}", pool, node), MAX_NAME_LENGTH)
}

/// Name of the cleanup job that unmounts `pool` on `node`
pub fn cleanup_job_name(pool: &str, node: &str) -> String {
    resource_name_with_max_length(CLEANUP_PREFIX, &format!("{}-{}", pool, node), MAX_NAME_LENGTH)
}

/// Value of the storage pool label identifying every object of `pool`
pub fn pool_label_value(pool: &str) -> String {
    resource_name_with_max_length(pool, "hpp", MAX_NAME_LENGTH)
}

/// Name of the host path volume mounted into the CSI daemon for `pool`
pub fn pool_mount_name(pool: Option<&str>) -> String {
    resource_name_with_max_length(pool.unwrap_or("csi"), "data-dir", MAX_NAME_LENGTH)
}

fn truncate(s: &str, len: usize) -> &str {
    if s.len() <= len {
        return s;
    }
    // Object names are ASCII, but never split a code point
    let mut end = len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
