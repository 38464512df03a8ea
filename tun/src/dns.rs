//! Platform-neutral pieces of DNS configuration.

/// How DNS settings are applied on Windows.
///
/// Neither mechanism is universally reliable: group policies can shadow the
/// registry keys, and PowerShell may be restricted by execution policy.
/// `Auto` tries the registry first and falls back to PowerShell.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DnsStrategy {
    #[default]
    Auto,
    Registry,
    Powershell,
}

/// Merges the caller's search list with the existing global one.
///
/// The caller's entries come first, in order, followed by every existing entry
/// that does not belong to the cluster domain. Duplicates are dropped.
pub fn merge_search_list(
    callers: &[String],
    existing: &[String],
    cluster_domain: &str,
) -> Vec<String> {
    let cluster_suffix = cluster_domain.trim_end_matches('.');

    let mut merged = Vec::with_capacity(callers.len() + existing.len());

    for entry in callers {
        if !merged.contains(entry) {
            merged.push(entry.clone());
        }
    }

    for entry in existing {
        let belongs_to_cluster = entry
            .trim_end_matches('.')
            .ends_with(cluster_suffix);

        if !belongs_to_cluster && !merged.contains(entry) {
            merged.push(entry.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn callers_entries_come_first_in_order() {
        let merged = merge_search_list(
            &strings(&["default.svc.cluster.local", "svc.cluster.local"]),
            &strings(&["corp.example.com"]),
            "cluster.local",
        );

        assert_eq!(
            merged,
            strings(&[
                "default.svc.cluster.local",
                "svc.cluster.local",
                "corp.example.com"
            ])
        );
    }

    #[test]
    fn drops_stale_cluster_entries_from_existing_list() {
        let merged = merge_search_list(
            &strings(&["default.svc.cluster.local"]),
            &strings(&["other.svc.cluster.local", "corp.example.com"]),
            "cluster.local",
        );

        assert_eq!(
            merged,
            strings(&["default.svc.cluster.local", "corp.example.com"])
        );
    }

    #[test]
    fn deduplicates() {
        let merged = merge_search_list(
            &strings(&["corp.example.com"]),
            &strings(&["corp.example.com"]),
            "cluster.local",
        );

        assert_eq!(merged, strings(&["corp.example.com"]));
    }
}
