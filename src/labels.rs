// Copyright 2025. The DC2 Project
// SPDX-License-Identifier: BSD-3-Clause

//! The canonical set of labels stamped onto engine objects.
//!
//! Every container, volume and network this crate creates is tagged with a
//! subset of these labels, and every lifecycle decision (instance lookup,
//! proxy reference counting, owned-network teardown) is driven by label
//! queries against the live engine rather than an in-process registry. The
//! IMDS proxy's request routing reads the same labels, so the strings are a
//! wire contract and must not change.

use std::collections::HashMap;

/// Marks a container as a pseudo-instance.
pub const ENABLED: &str = "dc2:enabled";
/// The generated 17-hex instance ID.
pub const INSTANCE_ID: &str = "dc2:instance-id";
/// The EC2 instance type requested at creation.
pub const INSTANCE_TYPE: &str = "dc2:instance-type";
/// The image the instance was created from.
pub const IMAGE_ID: &str = "dc2:image-id";
/// The main-container ID of the executor that owns the instance.
pub const IMDS_OWNER: &str = "dc2:imds-owner";
/// Host the IMDS backend listens on, stamped on the main container.
pub const IMDS_BACKEND_HOST: &str = "dc2:imds-backend-host";
/// Port the IMDS backend listens on, stamped on the main container.
pub const IMDS_BACKEND_PORT: &str = "dc2:imds-backend-port";
/// The explicit instance network configured for an executor.
pub const INSTANCE_NETWORK: &str = "dc2:instance-network";
/// Marks a network as created (and owned) by an executor.
pub const OWNED_NETWORK: &str = "dc2:owned-network";
/// Opaque user data supplied at instance creation.
pub const USER_DATA: &str = "dc2:user-data";
/// Marks the per-executor main substrate container.
pub const MAIN: &str = "dc2:main";
/// Version stamp on the shared IMDS proxy container.
pub const IMDS_PROXY_VERSION: &str = "dc2:imds-proxy-version";

/// Formats a `key=value` pair the way the engine's label filters expect it.
pub fn kv(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

/// Builds a `label` filter map matching a single key/value pair.
pub fn filter(key: &str, value: &str) -> HashMap<String, Vec<String>> {
    filter_many(&[(key, value)])
}

/// Builds a `label` filter map matching every given key/value pair at once.
pub fn filter_many(pairs: &[(&str, &str)]) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        pairs.iter().map(|(k, v)| kv(k, v)).collect(),
    );
    filters
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_are_namespaced_and_distinct() {
        let all = [
            ENABLED,
            INSTANCE_ID,
            INSTANCE_TYPE,
            IMAGE_ID,
            IMDS_OWNER,
            IMDS_BACKEND_HOST,
            IMDS_BACKEND_PORT,
            INSTANCE_NETWORK,
            OWNED_NETWORK,
            USER_DATA,
            MAIN,
            IMDS_PROXY_VERSION,
        ];
        for label in all {
            assert!(label.starts_with("dc2:"), "{} is not namespaced", label);
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn filter_many_collects_all_pairs() {
        let filters = filter_many(&[(ENABLED, "true"), (INSTANCE_ID, "abc")]);
        let labels = filters.get("label").unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels.contains(&"dc2:enabled=true".to_string()));
        assert!(labels.contains(&"dc2:instance-id=abc".to_string()));
    }
}
