//! Hardware-entry and multipath-entry data model.

use regex::Regex;

use crate::multipath::{NoPathRetry, PgPolicy};

/// Path-group failback policy, selected the same way as every other
/// overridable property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PgFailback {
    /// Never automatically fail back; an operator must switch groups.
    Manual,
    /// Fail back as soon as a higher-priority group becomes usable.
    Immediate,
    /// Fail back only while the preferred group stays continuously usable.
    FollowOver,
    /// Fail back after the group has been usable for this many seconds.
    Deferred(u32),
}

/// The subset of per-map / per-path attributes that can be set at any of
/// the four selection levels: multipath entry, `overrides`,
/// hardware entry, global default.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OverridableProps {
    /// Path-group policy.
    pub policy: Option<PgPolicy>,
    /// Kernel path-selector string.
    pub selector: Option<String>,
    /// Kernel feature-string.
    pub features: Option<String>,
    /// Kernel hardware-handler string.
    pub hwhandler: Option<String>,
    /// Path checker name.
    pub checker: Option<String>,
    /// Prioritizer name.
    pub prio: Option<String>,
    /// `no_path_retry` behavior.
    pub no_path_retry: Option<NoPathRetry>,
    /// `minio` selector argument.
    pub minio: Option<u32>,
    /// Whether `rr_weight` is interpreted as a priority multiplier.
    pub rr_weight_is_prio: Option<bool>,
    /// Path-group failback policy.
    pub pgfailback: Option<PgFailback>,
    /// Device-mapper map alias.
    pub alias: Option<String>,
    /// Persistent reservation registration key.
    pub reservation_key: Option<u64>,
}

impl OverridableProps {
    /// Overlay `other`'s set fields on top of `self`, with `other` winning
    /// (used by the factorization merge: "the later entry's attributes
    /// overwrite the earlier one's where set").
    pub fn merge_from(&mut self, other: &OverridableProps) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(policy);
        take!(selector);
        take!(features);
        take!(hwhandler);
        take!(checker);
        take!(prio);
        take!(no_path_retry);
        take!(minio);
        take!(rr_weight_is_prio);
        take!(pgfailback);
        take!(alias);
        take!(reservation_key);
    }
}

/// One compiled (vendor, product, revision) regex triple. A missing regex
/// matches anything.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceTriple {
    #[serde(skip)]
    pub vendor: Option<Regex>,
    #[serde(skip)]
    pub product: Option<Regex>,
    #[serde(skip)]
    pub revision: Option<Regex>,
    /// The raw source strings, used for the factorization/dedup key
    /// ("textually identical" comparison, not automaton comparison).
    pub vendor_src: String,
    /// Raw source string for `product`.
    pub product_src: String,
    /// Raw source string for `revision`.
    pub revision_src: String,
}

impl DeviceTriple {
    /// Compile a (vendor, product, revision) triple; `None` matches anything.
    pub fn compile(
        vendor: Option<&str>,
        product: Option<&str>,
        revision: Option<&str>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            vendor: vendor.map(Regex::new).transpose()?,
            product: product.map(Regex::new).transpose()?,
            revision: revision.map(Regex::new).transpose()?,
            vendor_src: vendor.unwrap_or_default().to_string(),
            product_src: product.unwrap_or_default().to_string(),
            revision_src: revision.unwrap_or_default().to_string(),
        })
    }

    /// True if `vendor`/`product`/`revision` satisfy every set regex.
    pub fn matches(&self, vendor: &str, product: &str, revision: &str) -> bool {
        self.vendor.as_ref().map_or(true, |r| r.is_match(vendor))
            && self.product.as_ref().map_or(true, |r| r.is_match(product))
            && self
                .revision
                .as_ref()
                .map_or(true, |r| r.is_match(revision))
    }

    /// The factorization key: textual identity of the three regex sources.
    pub fn factorization_key(&self) -> (String, String, String) {
        (
            self.vendor_src.clone(),
            self.product_src.clone(),
            self.revision_src.clone(),
        )
    }
}

/// A hardware entry from the builtin table, the main config file, or an
/// overlay snippet. The `overrides` pseudo-entry is represented as a
/// `HardwareEntry` whose [`DeviceTriple`] has every regex unset (matches
/// everything) and is kept out of the regular hardware table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HardwareEntry {
    /// (vendor, product, revision) match criteria.
    pub triple: DeviceTriple,
    /// Devices matching `triple` but also this regex are blacklisted
    /// (product-blacklist regex, ).
    #[serde(skip)]
    pub product_blacklist: Option<Regex>,
    /// Properties this entry sets.
    pub props: OverridableProps,
}

/// A multipath entry: an exact wwid match plus an optional alias override
///.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MultipathEntry {
    /// World-wide identifier this entry applies to.
    pub wwid: String,
    /// Properties this entry sets.
    pub props: OverridableProps,
}
