//! Builtin hardware table.
//!
//! The reference implementation ships a few hundred vendor-specific
//! entries compiled into the binary. We carry a small representative
//! sample plus the always-present `overrides` pseudo-entry; a real
//! deployment loads the rest from the main config file and overlay
//! directory exactly the same way.

use crate::config::entry::{DeviceTriple, HardwareEntry, OverridableProps};
use crate::multipath::{NoPathRetry, PgPolicy};

/// The compiled-in hardware entries, most-generic first (matching the
/// iteration order of the reference table; `find_hwe` walks it backwards).
pub fn builtin_entries() -> Vec<HardwareEntry> {
    vec![
        HardwareEntry {
            triple: DeviceTriple::compile(Some("^DEFAULT$"), None, None).unwrap(),
            product_blacklist: None,
            props: OverridableProps {
                policy: Some(PgPolicy::Failover),
                selector: Some("service-time 0".into()),
                no_path_retry: Some(NoPathRetry::Fail),
                minio: Some(1000),
                ..Default::default()
            },
        },
        HardwareEntry {
            triple: DeviceTriple::compile(Some("^(COMPAQ|HP)$"), Some("^HSV1[01]0"), None)
                .unwrap(),
            product_blacklist: None,
            props: OverridableProps {
                policy: Some(PgPolicy::GroupByPrio),
                selector: Some("round-robin 0".into()),
                hwhandler: Some("1 hp_sw".into()),
                no_path_retry: Some(NoPathRetry::Queue),
                ..Default::default()
            },
        },
        HardwareEntry {
            triple: DeviceTriple::compile(Some("^DGC$"), Some("^RAID"), None).unwrap(),
            product_blacklist: None,
            props: OverridableProps {
                policy: Some(PgPolicy::GroupByPrio),
                selector: Some("service-time 0".into()),
                hwhandler: Some("1 emc".into()),
                no_path_retry: Some(NoPathRetry::Retries(30)),
                ..Default::default()
            },
        },
        HardwareEntry {
            triple: DeviceTriple::compile(Some("^NVME$"), None, None).unwrap(),
            product_blacklist: None,
            props: OverridableProps {
                policy: Some(PgPolicy::GroupByTpg),
                selector: Some("queue-length 0".into()),
                hwhandler: Some("0".into()),
                no_path_retry: Some(NoPathRetry::Retries(15)),
                ..Default::default()
            },
        },
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin_entries_nonempty_and_compile() {
        let entries = builtin_entries();
        assert!(!entries.is_empty());
        assert!(entries
            .iter()
            .any(|e| e.triple.matches("DGC", "RAID5", "0330")));
    }
}
