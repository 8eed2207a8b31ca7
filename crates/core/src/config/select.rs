//! Per-property selection chain.
//!
//! For every overridable property the resolver walks, in order: the
//! multipath-level entry for this wwid, the `overrides` pseudo-entry, each
//! matched hardware entry (most-specific first), then the global default.
//! The level a value was read from is logged as an observable contract.

use std::sync::Arc;

use crate::config::entry::{HardwareEntry, OverridableProps, PgFailback};
use crate::multipath::{NoPathRetry, PgPolicy};

/// Where a resolved property value came from, for the origin-logging
/// contract tests assert against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Set on the multipath-level entry for this wwid.
    Multipath,
    /// Set on the `overrides` pseudo-entry.
    Overrides,
    /// Set on a matched hardware entry, keyed by its vendor/product source.
    HwTable(String),
    /// Fell through to the global default.
    Default,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Multipath => write!(f, "multipath"),
            Origin::Overrides => write!(f, "overrides"),
            Origin::HwTable(key) => write!(f, "hwtable:{key}"),
            Origin::Default => write!(f, "default"),
        }
    }
}

/// Walk the four selection levels for one property, returning the
/// resolved value and the level it was found at.
///
/// `get` extracts the candidate field from an [`OverridableProps`]; it
/// returns `None` when that level doesn't set the property.
pub fn select<T: Clone>(
    property: &str,
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: &T,
    get: impl Fn(&OverridableProps) -> Option<T>,
) -> T {
    if let Some(v) = mpe.and_then(&get) {
        log_origin(property, &Origin::Multipath);
        return v;
    }
    if let Some(v) = overrides.and_then(&get) {
        log_origin(property, &Origin::Overrides);
        return v;
    }
    for entry in hwe {
        if let Some(v) = get(&entry.props) {
            let key = format!(
                "{}/{}",
                entry.triple.vendor_src, entry.triple.product_src
            );
            log_origin(property, &Origin::HwTable(key));
            return v;
        }
    }
    log_origin(property, &Origin::Default);
    default.clone()
}

fn log_origin(property: &str, origin: &Origin) {
    tracing::debug!(property, origin = %origin, "resolved property");
}

/// Resolve `path_grouping_policy` across the four selection levels.
pub fn select_policy(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: PgPolicy,
) -> PgPolicy {
    select("path_grouping_policy", mpe, overrides, hwe, &default, |p| p.policy)
}

/// Resolve `path_selector` across the four selection levels.
pub fn select_selector(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: &str,
) -> String {
    select(
        "path_selector",
        mpe,
        overrides,
        hwe,
        &default.to_string(),
        |p| p.selector.clone(),
    )
}

/// Resolve `features` across the four selection levels.
pub fn select_features(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: &str,
) -> String {
    select("features", mpe, overrides, hwe, &default.to_string(), |p| {
        p.features.clone()
    })
}

/// Resolve `hardware_handler` across the four selection levels.
pub fn select_hwhandler(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: &str,
) -> String {
    select("hardware_handler", mpe, overrides, hwe, &default.to_string(), |p| {
        p.hwhandler.clone()
    })
}

pub fn select_checker(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: &str,
) -> String {
    select("path_checker", mpe, overrides, hwe, &default.to_string(), |p| {
        p.checker.clone()
    })
}

pub fn select_prio(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: &str,
) -> String {
    select("prio", mpe, overrides, hwe, &default.to_string(), |p| {
        p.prio.clone()
    })
}

pub fn select_no_path_retry(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: NoPathRetry,
) -> NoPathRetry {
    select("no_path_retry", mpe, overrides, hwe, &default, |p| {
        p.no_path_retry
    })
}

pub fn select_minio(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: u32,
) -> u32 {
    select("rr_min_io", mpe, overrides, hwe, &default, |p| p.minio)
}

pub fn select_rr_weight(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: bool,
) -> bool {
    select("rr_weight", mpe, overrides, hwe, &default, |p| {
        p.rr_weight_is_prio
    })
}

pub fn select_pgfailback(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
    hwe: &[Arc<HardwareEntry>],
    default: PgFailback,
) -> PgFailback {
    select("failback", mpe, overrides, hwe, &default, |p| p.pgfailback)
}

pub fn select_alias(
    mpe: Option<&OverridableProps>,
    overrides: Option<&OverridableProps>,
) -> Option<String> {
    mpe.and_then(|p| p.alias.clone())
        .or_else(|| overrides.and_then(|p| p.alias.clone()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::entry::DeviceTriple;

    fn hwe(selector: &str) -> Arc<HardwareEntry> {
        Arc::new(HardwareEntry {
            triple: DeviceTriple::compile(Some("^V$"), Some("^P$"), None).unwrap(),
            product_blacklist: None,
            props: OverridableProps {
                selector: Some(selector.into()),
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_selection_order_multipath_wins() {
        let mpe = OverridableProps {
            selector: Some("mpe-selector".into()),
            ..Default::default()
        };
        let hwe_vec = vec![hwe("hwe-selector")];
        let v = select_selector(Some(&mpe), None, &hwe_vec, "default-selector");
        assert_eq!(v, "mpe-selector");
    }

    #[test]
    fn test_selection_order_overrides_before_hwtable() {
        let overrides = OverridableProps {
            selector: Some("override-selector".into()),
            ..Default::default()
        };
        let hwe_vec = vec![hwe("hwe-selector")];
        let v = select_selector(None, Some(&overrides), &hwe_vec, "default-selector");
        assert_eq!(v, "override-selector");
    }

    #[test]
    fn test_selection_order_hwtable_before_default() {
        let hwe_vec = vec![hwe("hwe-selector")];
        let v = select_selector(None, None, &hwe_vec, "default-selector");
        assert_eq!(v, "hwe-selector");
    }

    #[test]
    fn test_selection_falls_through_to_default() {
        let v = select_selector(None, None, &[], "default-selector");
        assert_eq!(v, "default-selector");
    }

    #[test]
    fn test_hwtable_most_specific_first() {
        let generic = hwe("generic-selector");
        let specific = hwe("specific-selector");
        // most-specific first, per find_hwe's backwards-iteration ordering.
        let hwe_vec = vec![specific, generic];
        let v = select_selector(None, None, &hwe_vec, "default");
        assert_eq!(v, "specific-selector");
    }
}
