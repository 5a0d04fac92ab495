/// Resource naming and the cloud label schema
use std::collections::HashMap;

pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_TEST_ID: &str = "test-id";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_POOL: &str = "pool";
pub const LABEL_ORDINAL: &str = "ordinal";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_SHARED: &str = "shared";

pub const MANAGER: &str = "patina";

/// Role values used on cloud objects.
pub const ROLE_CONTROL_PLANE: &str = "control-plane";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_LOAD_BALANCER: &str = "load-balancer";
pub const ROLE_NETWORK: &str = "network";
pub const ROLE_FIREWALL: &str = "firewall";

/// Base labels carried by every object the reconciler creates.
pub fn base_labels(cluster: &str, test_id: &str) -> HashMap<String, String> {
    [
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_TEST_ID.to_string(), test_id.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
    ]
    .into_iter()
    .collect()
}

/// Base labels plus a role marker.
pub fn role_labels(cluster: &str, test_id: &str, role: &str) -> HashMap<String, String> {
    let mut labels = base_labels(cluster, test_id);
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels
}

/// Labels for one server in a pool.
pub fn server_labels(
    cluster: &str,
    test_id: &str,
    role: &str,
    pool: &str,
    ordinal: u32,
) -> HashMap<String, String> {
    let mut labels = role_labels(cluster, test_id, role);
    labels.insert(LABEL_POOL.to_string(), pool.to_string());
    labels.insert(LABEL_ORDINAL.to_string(), ordinal.to_string());
    labels
}

/// Render labels as a Hetzner Cloud `label_selector` expression.
///
/// Keys are sorted so the same label set always renders the same selector.
pub fn selector(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort_by_key(|(k, _)| k.as_str());
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}=={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector matching every object belonging to a cluster.
pub fn cluster_selector(cluster: &str, test_id: &str) -> String {
    format!(
        "{}=={},{}=={}",
        LABEL_CLUSTER, cluster, LABEL_TEST_ID, test_id
    )
}

// Deterministic names. Servers: {cluster}-{pool}-{ordinal}; singletons get a
// fixed suffix per kind.

pub fn server_name(cluster: &str, pool: &str, ordinal: u32) -> String {
    format!("{}-{}-{}", cluster, pool, ordinal)
}

pub fn network_name(cluster: &str) -> String {
    format!("{}-network", cluster)
}

pub fn firewall_name(cluster: &str) -> String {
    format!("{}-firewall", cluster)
}

pub fn load_balancer_name(cluster: &str) -> String {
    format!("{}-kube-api", cluster)
}

pub fn cp_placement_group_name(cluster: &str) -> String {
    format!("{}-cp-pg", cluster)
}

pub fn pool_placement_group_name(cluster: &str, pool: &str) -> String {
    format!("{}-{}-pg", cluster, pool)
}

pub fn ssh_key_name(cluster: &str) -> String {
    format!("{}-ssh", cluster)
}

pub fn state_certificate_name(cluster: &str) -> String {
    format!("{}-state", cluster)
}

pub fn backup_bucket_name(cluster: &str) -> String {
    format!("{}-etcd-backups", cluster)
}

/// Extract the ordinal from a server name of the form {cluster}-{pool}-{n}.
pub fn parse_ordinal(name: &str, cluster: &str, pool: &str) -> Option<u32> {
    let prefix = format!("{}-{}-", cluster, pool);
    name.strip_prefix(&prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_names() {
        assert_eq!(server_name("c1", "w", 2), "c1-w-2");
        assert_eq!(parse_ordinal("c1-w-2", "c1", "w"), Some(2));
        assert_eq!(parse_ordinal("c1-other-2", "c1", "w"), None);
        assert_eq!(parse_ordinal("c1-w-x", "c1", "w"), None);
    }

    #[test]
    fn test_singleton_names() {
        assert_eq!(network_name("c1"), "c1-network");
        assert_eq!(load_balancer_name("c1"), "c1-kube-api");
        assert_eq!(cp_placement_group_name("c1"), "c1-cp-pg");
        assert_eq!(pool_placement_group_name("c1", "w"), "c1-w-pg");
        assert_eq!(state_certificate_name("c1"), "c1-state");
    }

    #[test]
    fn test_selector_is_stable() {
        let labels = server_labels("c1", "t1", ROLE_WORKER, "w", 1);
        let a = selector(&labels);
        let b = selector(&labels);
        assert_eq!(a, b);
        assert!(a.contains("cluster==c1"));
        assert!(a.contains("ordinal==1"));
    }

    #[test]
    fn test_cluster_selector() {
        assert_eq!(cluster_selector("c1", "t1"), "cluster==c1,test-id==t1");
    }
}
