//! Layered configuration resolver.

pub mod entry;
pub mod format;
pub mod hwtable;
pub mod select;

use std::sync::Arc;

use crate::blacklist::{Blacklist, BlacklistEntry, BlacklistOrigin};
use crate::error::ConfigWarning;
use crate::multipath::{NoPathRetry, PgPolicy};
use entry::{DeviceTriple, MultipathEntry, OverridableProps, PgFailback};

/// Properties with no configured override anywhere.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GlobalDefaults {
    /// Path-group policy.
    pub policy: PgPolicy,
    /// Kernel path-selector string.
    pub selector: String,
    /// Kernel feature-string.
    pub features: String,
    /// Kernel hardware-handler string.
    pub hwhandler: String,
    /// Path checker name.
    pub checker: String,
    /// Prioritizer name.
    pub prio: String,
    /// `no_path_retry` behavior.
    pub no_path_retry: NoPathRetry,
    /// `minio` selector argument.
    pub minio: u32,
    /// Whether `rr_weight` is interpreted as a priority multiplier.
    pub rr_weight_is_prio: bool,
    /// Path-group failback policy.
    pub pgfailback: PgFailback,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            policy: PgPolicy::Failover,
            selector: "service-time 0".into(),
            features: "0".into(),
            hwhandler: "0".into(),
            checker: "always_up".into(),
            prio: "const".into(),
            no_path_retry: NoPathRetry::Fail,
            minio: 1000,
            rr_weight_is_prio: false,
            pgfailback: PgFailback::Manual,
        }
    }
}

/// The fully resolved, immutable configuration snapshot. Reference-counted;
/// reloads publish a new `Arc` rather than mutate the old one.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    /// Most-generic first, matching the source iteration order; `match_hwe`
    /// walks it backwards.
    pub hwe_table: Vec<Arc<HardwareEntry>>,
    /// Exact-wwid multipath entries.
    pub mpe_table: Vec<MultipathEntry>,
    /// The `overrides` pseudo-entry, if any.
    pub overrides: Option<OverridableProps>,
    /// Compiled blacklist/whitelist filter.
    pub blacklist: Blacklist,
    /// Level-4 fallback defaults.
    pub defaults: GlobalDefaults,
}

impl Config {
    /// A config holding only the builtin hardware table, an empty
    /// blacklist, and stock defaults; the starting point before loading any
    /// file.
    pub fn builtin_defaults() -> Self {
        Self {
            hwe_table: hwtable::builtin_entries().into_iter().map(Arc::new).collect(),
            mpe_table: Vec::new(),
            overrides: None,
            blacklist: Blacklist::with_defaults(),
            defaults: GlobalDefaults::default(),
        }
    }

    fn mpe_for(&self, wwid: &str) -> Option<&OverridableProps> {
        self.mpe_table
            .iter()
            .find(|e| e.wwid == wwid)
            .map(|e| &e.props)
    }

    /// Match (vendor, product, revision) against the hardware table,
    /// walking it backwards and returning every match most-specific first.
    pub fn match_hwe(&self, vendor: &str, product: &str, revision: &str) -> Vec<Arc<HardwareEntry>> {
        self.hwe_table
            .iter()
            .rev()
            .filter(|e| e.triple.matches(vendor, product, revision))
            .cloned()
            .collect()
    }

    /// Resolve the path-group policy for `wwid` across all selection levels.
    pub fn select_policy(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> PgPolicy {
        select::select_policy(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            self.defaults.policy,
        )
    }

    /// Resolve the kernel path-selector string for `wwid`.
    pub fn select_selector(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> String {
        select::select_selector(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            &self.defaults.selector,
        )
    }

    /// Resolve the kernel feature-string for `wwid`.
    pub fn select_features(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> String {
        select::select_features(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            &self.defaults.features,
        )
    }

    /// Resolve the kernel hardware-handler string for `wwid`.
    pub fn select_hwhandler(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> String {
        select::select_hwhandler(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            &self.defaults.hwhandler,
        )
    }

    /// Resolve the path checker name for `wwid`.
    pub fn select_checker(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> String {
        select::select_checker(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            &self.defaults.checker,
        )
    }

    /// Resolve the prioritizer name for `wwid`.
    pub fn select_prio(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> String {
        select::select_prio(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            &self.defaults.prio,
        )
    }

    /// Resolve `no_path_retry` behavior for `wwid`.
    pub fn select_no_path_retry(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> NoPathRetry {
        select::select_no_path_retry(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            self.defaults.no_path_retry,
        )
    }

    /// Resolve the `minio` selector argument for `wwid`.
    pub fn select_minio(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> u32 {
        select::select_minio(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            self.defaults.minio,
        )
    }

    /// Resolve whether `rr_weight` is a priority multiplier for `wwid`.
    pub fn select_rr_weight_is_prio(&self, wwid: &str, hwe: &[Arc<HardwareEntry>]) -> bool {
        select::select_rr_weight(
            self.mpe_for(wwid),
            self.overrides.as_ref(),
            hwe,
            self.defaults.rr_weight_is_prio,
        )
    }

    /// Resolve the map alias for `wwid`, if any level sets one.
    pub fn select_alias(&self, wwid: &str) -> Option<String> {
        select::select_alias(self.mpe_for(wwid), self.overrides.as_ref())
    }

    /// Load the main config file, then every `*.conf` file of `dir` in
    /// lexicographic order, merging into `self` per the module's
    /// factorization rules. Returns accumulated non-fatal warnings.
    pub fn load(
        &mut self,
        main_file: &str,
        overlay_files: &[(&str, &str)],
    ) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        self.load_source(main_file, "multipath.conf", &mut warnings);
        // Factorization crosses the main-file/directory-file boundary but
        // not the builtin/file boundary: builtin entries were already
        // final by the time we get here, so we only ever factorize the
        // entries loaded from files against each other.
        let mut sorted = overlay_files.to_vec();
        sorted.sort_by_key(|(name, _)| name.to_string());
        for (name, contents) in sorted {
            self.load_source(contents, name, &mut warnings);
        }
        self.factorize_file_entries();
        self.merge_mpe_table();
        self.blacklist.dedup();
        warnings
    }

    fn load_source(&mut self, source: &str, origin: &str, warnings: &mut Vec<ConfigWarning>) {
        let (block, mut parse_warnings) = format::parse(source, origin);
        warnings.append(&mut parse_warnings);

        if let Some(defaults) = block.blocks("defaults").next() {
            self.apply_defaults_block(defaults);
        }

        if let Some(devices) = block.blocks("devices").next() {
            for device in devices.blocks("device") {
                match self.parse_hwe(device) {
                    Ok(hwe) => self.hwe_table.push(Arc::new(hwe)),
                    Err(e) => warnings.push(ConfigWarning {
                        source: origin.to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }

        if let Some(mpaths) = block.blocks("multipaths").next() {
            for mp in mpaths.blocks("multipath") {
                match self.parse_mpe(mp) {
                    Ok(mpe) => self.mpe_table.push(mpe),
                    Err(e) => warnings.push(ConfigWarning {
                        source: origin.to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }

        if let Some(bl) = block.blocks("blacklist").next() {
            self.parse_blacklist_block(bl, BlacklistOrigin::Config);
        }

        if let Some(overrides) = block.blocks("overrides").next() {
            let props = Self::parse_props(overrides);
            match &mut self.overrides {
                Some(existing) => existing.merge_from(&props),
                None => self.overrides = Some(props),
            }
        }
    }

    fn apply_defaults_block(&mut self, defaults: &format::Block) {
        if let Some(v) = defaults.value("path_grouping_policy") {
            if let Some(p) = parse_policy(v) {
                self.defaults.policy = p;
            }
        }
        if let Some(v) = defaults.value("path_selector") {
            self.defaults.selector = v.to_string();
        }
        if let Some(v) = defaults.value("path_checker") {
            self.defaults.checker = v.to_string();
        }
        if let Some(v) = defaults.value("prio") {
            self.defaults.prio = v.to_string();
        }
        if let Some(v) = defaults.value("rr_min_io") {
            if let Ok(n) = v.parse() {
                self.defaults.minio = n;
            }
        }
        if let Some(v) = defaults.value("no_path_retry") {
            self.defaults.no_path_retry = parse_no_path_retry(v);
        }
    }

    fn parse_props(block: &format::Block) -> OverridableProps {
        OverridableProps {
            policy: block.value("path_grouping_policy").and_then(parse_policy),
            selector: block.value("path_selector").map(str::to_string),
            features: block.value("features").map(str::to_string),
            hwhandler: block.value("hardware_handler").map(str::to_string),
            checker: block.value("path_checker").map(str::to_string),
            prio: block.value("prio").map(str::to_string),
            no_path_retry: block.value("no_path_retry").map(parse_no_path_retry),
            minio: block.value("rr_min_io").and_then(|v| v.parse().ok()),
            rr_weight_is_prio: block
                .value("rr_weight")
                .map(|v| v == "priorities"),
            pgfailback: block.value("failback").map(parse_pgfailback),
            alias: block.value("alias").map(str::to_string),
            reservation_key: block.value("reservation_key").and_then(|v| v.parse().ok()),
        }
    }

    fn parse_hwe(&self, block: &format::Block) -> anyhow::Result<HardwareEntry> {
        let triple = DeviceTriple::compile(
            block.value("vendor"),
            block.value("product"),
            block.value("revision"),
        )?;
        let product_blacklist = block
            .value("product_blacklist")
            .map(regex::Regex::new)
            .transpose()?;
        Ok(HardwareEntry {
            triple,
            product_blacklist,
            props: Self::parse_props(block),
        })
    }

    fn parse_mpe(&self, block: &format::Block) -> anyhow::Result<MultipathEntry> {
        let wwid = block
            .value("wwid")
            .ok_or_else(|| anyhow::anyhow!("multipath entry missing wwid"))?
            .to_string();
        Ok(MultipathEntry {
            wwid,
            props: Self::parse_props(block),
        })
    }

    fn parse_blacklist_block(&mut self, block: &format::Block, origin: BlacklistOrigin) {
        for wwid in block.values("wwid") {
            self.blacklist
                .push(BlacklistEntry::wwid(wwid, false, origin));
        }
        for devnode in block.values("devnode") {
            self.blacklist
                .push(BlacklistEntry::devnode(devnode, false, origin));
        }
        for protocol in block.values("protocol") {
            self.blacklist
                .push(BlacklistEntry::protocol(protocol, false, origin));
        }
        for device in block.blocks("device") {
            if let (Some(v), Some(p)) = (device.value("vendor"), device.value("product")) {
                self.blacklist
                    .push(BlacklistEntry::device(v, p, false, origin));
            }
        }
        if let Some(exceptions) = block.blocks("blacklist_exceptions").next() {
            for wwid in exceptions.values("wwid") {
                self.blacklist
                    .push(BlacklistEntry::wwid(wwid, true, origin));
            }
        }
    }

    /// Merge entries whose (vendor, product, revision) regex triples are
    /// textually identical, later entry winning, not crossing the
    /// builtin/file boundary.
    fn factorize_file_entries(&mut self) {
        // The builtin table is always `hwe_table`'s prefix at construction
        // time (see `builtin_defaults`); record that boundary so
        // factorization only considers entries loaded from files.
        let builtin_count = hwtable::builtin_entries().len().min(self.hwe_table.len());
        let (builtin, file_entries) = self.hwe_table.split_at(builtin_count);
        let mut merged: Vec<Arc<HardwareEntry>> = Vec::new();
        for entry in file_entries {
            let key = entry.triple.factorization_key();
            if let Some(existing) = merged
                .iter_mut()
                .find(|e: &&mut Arc<HardwareEntry>| e.triple.factorization_key() == key)
            {
                let mut merged_props = existing.props.clone();
                merged_props.merge_from(&entry.props);
                *existing = Arc::new(HardwareEntry {
                    triple: existing.triple.clone(),
                    product_blacklist: entry
                        .product_blacklist
                        .clone()
                        .or_else(|| existing.product_blacklist.clone()),
                    props: merged_props,
                });
            } else {
                merged.push(entry.clone());
            }
        }
        self.hwe_table = builtin.to_vec();
        self.hwe_table.extend(merged);
    }

    /// Sort multipath entries by wwid and merge identical-wwid duplicates,
    /// later entry winning.
    fn merge_mpe_table(&mut self) {
        self.mpe_table.sort_by(|a, b| a.wwid.cmp(&b.wwid));
        let mut merged: Vec<MultipathEntry> = Vec::new();
        for entry in self.mpe_table.drain(..) {
            if let Some(existing) = merged.iter_mut().find(|e| e.wwid == entry.wwid) {
                existing.props.merge_from(&entry.props);
            } else {
                merged.push(entry);
            }
        }
        self.mpe_table = merged;
    }
}

fn parse_policy(s: &str) -> Option<PgPolicy> {
    match s {
        "failover" => Some(PgPolicy::Failover),
        "multibus" => Some(PgPolicy::Multibus),
        "group_by_serial" => Some(PgPolicy::GroupBySerial),
        "group_by_prio" => Some(PgPolicy::GroupByPrio),
        "group_by_node_name" => Some(PgPolicy::GroupByNodeName),
        "group_by_tpg" => Some(PgPolicy::GroupByTpg),
        _ => None,
    }
}

fn parse_pgfailback(s: &str) -> PgFailback {
    match s {
        "manual" => PgFailback::Manual,
        "immediate" => PgFailback::Immediate,
        "followover" => PgFailback::FollowOver,
        n => n.parse().map(PgFailback::Deferred).unwrap_or(PgFailback::Manual),
    }
}

fn parse_no_path_retry(s: &str) -> NoPathRetry {
    match s {
        "queue" => NoPathRetry::Queue,
        "fail" => NoPathRetry::Fail,
        n => n.parse().map(NoPathRetry::Retries).unwrap_or(NoPathRetry::Fail),
    }
}

pub use entry::HardwareEntry;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_main_file_sets_defaults() {
        let mut config = Config::builtin_defaults();
        let main = indoc::indoc! {r#"
            defaults {
                path_grouping_policy multibus
                path_selector "round-robin 0"
                rr_min_io 50
            }
        "#};
        let warnings = config.load(main, &[]);
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(config.defaults.policy, PgPolicy::Multibus);
        assert_eq!(config.defaults.selector, "round-robin 0");
        assert_eq!(config.defaults.minio, 50);
    }

    #[test]
    fn test_overlay_merges_after_main_lexicographically() {
        let mut config = Config::builtin_defaults();
        let main = "devices { device { vendor \"^V$\" product \"^P$\" path_selector \"round-robin 0\" } }";
        let overlay_a = "devices { device { vendor \"^V$\" product \"^P$\" rr_min_io 20 } }";
        let warnings = config.load(main, &[("10-a.conf", overlay_a)]);
        assert!(warnings.is_empty(), "{warnings:?}");
        let hwe = config.match_hwe("V", "P", "rev");
        assert_eq!(hwe.len(), 1);
        // The overlay's rr_min_io and the main file's selector both survive
        // the factorization merge (same vendor/product/revision triple).
        assert_eq!(hwe[0].props.selector.as_deref(), Some("round-robin 0"));
        assert_eq!(hwe[0].props.minio, Some(20));
    }

    #[test]
    fn test_multipath_entry_loaded_and_selected() {
        let mut config = Config::builtin_defaults();
        let main = indoc::indoc! {r#"
            multipaths {
                multipath {
                    wwid 3600a098000aaaaaa
                    alias data0
                }
            }
        "#};
        config.load(main, &[]);
        assert_eq!(
            config.select_alias("3600a098000aaaaaa").as_deref(),
            Some("data0")
        );
    }

    #[test]
    fn test_blacklist_loaded_from_config() {
        let mut config = Config::builtin_defaults();
        let main = "blacklist { wwid \"^1ZZZ\" }";
        config.load(main, &[]);
        assert!(config
            .blacklist
            .check_wwid("1ZZZ000000000000")
            .is_blacklisted());
    }
}
