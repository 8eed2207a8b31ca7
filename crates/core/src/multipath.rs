//! Multipath descriptor and path-group tree.

use crate::arena::{Arena, Handle};
use crate::path::Path;

/// `no_path_retry` configuration value: either a reserved sentinel or a
/// positive retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum NoPathRetry {
    /// Not yet resolved from configuration.
    Undef,
    /// Queue I/O indefinitely while no path is available.
    Queue,
    /// Fail I/O immediately when no path is available.
    Fail,
    /// Queue for this many polling intervals before failing.
    Retries(u32),
}

impl NoPathRetry {
    /// Whether `queue_if_no_path` should be asserted in the feature string
    /// ("augmented by queue_if_no_path when no-path-retry != fail").
    pub fn queues(&self) -> bool {
        !matches!(self, NoPathRetry::Fail)
    }
}

/// Source of a map's persistent reservation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservationKeySource {
    /// No reservation key configured.
    #[default]
    None,
    /// Taken from the resolved configuration.
    FromConfig,
    /// Taken from a persisted key file.
    FromFile,
}

/// Per-map statistics counters, incremented by `domap` as each
/// action is successfully applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Number of times this map was created from scratch.
    pub creates: u32,
    /// Number of table reloads applied.
    pub reloads: u32,
    /// Number of size-only resizes applied.
    pub resizes: u32,
    /// Number of path-group switches applied.
    pub switch_groups: u32,
    /// Number of alias renames applied.
    pub renames: u32,
    /// Number of failed action applications.
    pub failures: u32,
}

/// Device-mapper-reported pathgroup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PgState {
    /// Not yet reported by device-mapper.
    #[default]
    Undef,
    /// Group is enabled but not the active group.
    Enabled,
    /// Group is disabled.
    Disabled,
    /// Group is the currently active group.
    Active,
}

/// Path-group policy identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PgPolicy {
    /// One path active at a time, one path per group.
    Failover,
    /// All paths in a single group, fanned out round-robin.
    Multibus,
    /// Paths grouped by the serial number reported by the target.
    GroupBySerial,
    /// Paths grouped by priority tier.
    GroupByPrio,
    /// Paths grouped by target node name.
    GroupByNodeName,
    /// Paths grouped by ALUA target port group.
    GroupByTpg,
}

/// Action selector outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The map already matches the desired state.
    Nothing,
    /// No map exists yet for this wwid; create one from scratch.
    Create,
    /// Reload the map's target table.
    Reload,
    /// Resize the map in place.
    Resize,
    /// Switch the active path group without a full reload.
    SwitchGroup,
    /// Rename the map's alias.
    Rename,
    /// Reject with the conflicting alias; caller is expected to flush it and
    /// retry as `Create`.
    Reject,
}

/// An ordered subset of a map's paths considered equivalent by the
/// selected policy.
#[derive(Debug, Clone, Default)]
pub struct Pathgroup {
    /// Member paths, in the order they appear in the kernel table.
    pub paths: Vec<Handle<Path>>,
    /// Aggregate priority of the group.
    pub priority: i32,
    /// Number of member paths currently enabled.
    pub enabled_paths: usize,
    /// True if this group was split off by marginal-path grouping.
    pub marginal: bool,
    /// Device-mapper-reported state of this group.
    pub dm_state: PgState,
    /// The kernel path-selector string for this group, e.g. `"service-time 0"`.
    /// Usually identical across every group in a map, but the disassembler
    /// reads it per-group since the kernel table format carries it
    /// that way.
    pub selector: String,
}

impl Pathgroup {
    /// Stable identity used to detect a topology change across reloads:
    /// XOR of member path handle indices (; arena-handle analogue of the
    /// reference implementation's XOR-of-pointers).
    pub fn identity(&self) -> usize {
        self.paths.iter().fold(0usize, |acc, h| acc ^ h.index())
    }
}

/// The aggregated logical block device and its in-memory descriptor.
#[derive(Debug, Clone)]
pub struct Multipath {
    /// World-wide identifier, immutable once assigned.
    pub wwid: String,
    /// Device-mapper map name.
    pub alias: String,
    /// Alias this map had before the most recent rename, if any.
    pub previous_alias: Option<String>,
    /// Size in 512-byte sectors.
    pub size: u64,
    /// Path groups, in kernel table order.
    pub pg: Vec<Pathgroup>,
    /// 1-based index into `pg`, as reported by the kernel ("nextpg").
    pub nextpg: Option<usize>,
    /// 1-based index into `pg`, as desired by the engine ("bestpg").
    pub bestpg: Option<usize>,
    /// Path-group policy in effect.
    pub policy: PgPolicy,
    /// Kernel path-selector string, e.g. `"service-time 0"`.
    pub selector: String,
    /// Kernel feature-string, e.g. `"1 queue_if_no_path"`.
    pub features: String,
    /// Kernel hardware-handler string, e.g. `"0"`.
    pub hwhandler: String,
    /// Resolved `no_path_retry` behavior.
    pub no_path_retry: NoPathRetry,
    /// Whether the currently attached hardware handler should be preserved
    /// across a reload instead of reattached, asserted in the assembled
    /// features string as `retain_attached_hw_handler`.
    pub retain_hwhandler: bool,
    /// Persistent reservation registration key, if any.
    pub reservation_key: Option<u64>,
    /// Where `reservation_key` was resolved from.
    pub reservation_key_source: ReservationKeySource,
    /// Action selected for this map on the current reconciliation pass.
    pub action: Action,
    /// Whether `rr_weight` should be interpreted as a priority multiplier.
    pub rr_weight_is_prio: bool,
    /// `minio` selector argument.
    pub minio: u32,
    /// True once a persistent reservation key has been observed to hold on
    /// the kernel map (set by `update_map_pr`).
    pub prflag: bool,
    pub stats: MapStats,
    /// Set by the engine when a create/reload fails and the map must be
    /// re-attempted; the daemon's next coalesce pass consults it instead of
    /// leaving a half-applied map behind.
    pub needs_retry: bool,
}

impl Multipath {
    /// A brand new map for `wwid`, with no paths or pathgroups yet.
    pub fn new(wwid: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            wwid: wwid.into(),
            alias: alias.into(),
            previous_alias: None,
            size: 0,
            pg: Vec::new(),
            nextpg: None,
            bestpg: None,
            policy: PgPolicy::Failover,
            selector: "service-time 0".into(),
            features: "0".into(),
            hwhandler: "0".into(),
            no_path_retry: NoPathRetry::Undef,
            retain_hwhandler: false,
            reservation_key: None,
            reservation_key_source: ReservationKeySource::None,
            action: Action::Nothing,
            rr_weight_is_prio: false,
            minio: 1000,
            prflag: false,
            stats: MapStats::default(),
            needs_retry: false,
        }
    }
}

/// Whether a deallocation should also free the referenced paths, or just
/// drop the map's references to them (`keep_paths` vs `free_paths`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocMode {
    /// Orphan the map's paths instead of removing them.
    KeepPaths,
    /// Remove the map's paths outright.
    FreePaths,
}

/// The two top-level collections the reconciliation pass operates on: the
/// path vector and the map vector, protected together by one coarse lock in
/// the daemon; here, a plain struct the caller holds the mutex around.
#[derive(Debug, Default)]
pub struct Vectors {
    /// All known paths.
    pub paths: Arena<Path>,
    /// All known maps.
    pub maps: Arena<Multipath>,
}

impl Vectors {
    /// An empty set of vectors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new map seeded with one path, as `add_map_with_path` does
    /// when a previously unseen wwid is coalesced.
    pub fn add_map_with_path(&mut self, path_handle: Handle<Path>, alias: impl Into<String>) -> Handle<Multipath> {
        let wwid = self
            .paths
            .get(path_handle)
            .map(|p| p.wwid.clone())
            .unwrap_or_default();
        let map_handle = self.maps.insert(Multipath::new(wwid, alias));
        if let Some(p) = self.paths.get_mut(path_handle) {
            p.mpp = Some(map_handle);
        }
        map_handle
    }

    /// Detach `path_handle` from its map, if any.
    pub fn orphan_path(&mut self, path_handle: Handle<Path>, reason: &str) {
        if let Some(p) = self.paths.get_mut(path_handle) {
            p.orphan(reason);
        }
    }

    /// Remove a map. In `KeepPaths` mode the referenced paths are orphaned
    /// instead of destroyed; in `FreePaths` mode they are removed outright.
    pub fn remove_map(&mut self, map_handle: Handle<Multipath>, mode: DeallocMode) {
        let Some(map) = self.maps.remove(map_handle) else {
            return;
        };
        for pg in &map.pg {
            for &ph in &pg.paths {
                match mode {
                    DeallocMode::KeepPaths => self.orphan_path(ph, "map removed"),
                    DeallocMode::FreePaths => {
                        self.paths.remove(ph);
                    }
                }
            }
        }
    }

    /// Find the map with the given wwid, if any.
    pub fn find_map_by_wwid(&self, wwid: &str) -> Option<Handle<Multipath>> {
        self.maps
            .iter()
            .find(|(_, m)| m.wwid == wwid)
            .map(|(h, _)| h)
    }

    /// Find the map with the given alias, if any.
    pub fn find_map_by_alias(&self, alias: &str) -> Option<Handle<Multipath>> {
        self.maps
            .iter()
            .find(|(_, m)| m.alias == alias)
            .map(|(h, _)| h)
    }

    /// Find the path with the given devnode basename, if any.
    pub fn find_path_by_dev(&self, dev: &str) -> Option<Handle<Path>> {
        self.paths.iter().find(|(_, p)| p.dev == dev).map(|(h, _)| h)
    }

    /// Find the path with the given major:minor device number, if any.
    pub fn find_path_by_dev_t(&self, dev_t: (u32, u32)) -> Option<Handle<Path>> {
        self.paths
            .iter()
            .find(|(_, p)| p.dev_t == dev_t)
            .map(|(h, _)| h)
    }

    /// Remove empty pathgroups from a map ( invariant: "empty pathgroups
    /// are removed during reconciliation").
    pub fn prune_empty_pathgroups(&mut self, map_handle: Handle<Multipath>) {
        if let Some(m) = self.maps.get_mut(map_handle) {
            m.pg.retain(|pg| !pg.paths.is_empty());
        }
    }

    /// Every live path handle whose `wwid` matches, in arena (insertion)
    /// order ( ordering: "paths are visited in insertion order").
    pub fn paths_with_wwid(&self, wwid: &str) -> Vec<Handle<Path>> {
        self.paths
            .iter()
            .filter(|(_, p)| p.wwid == wwid)
            .map(|(h, _)| h)
            .collect()
    }

    /// True if at least one of `map_handle`'s referenced paths still
    /// resolves in the path arena. A map none of whose paths resolve has
    /// disappeared from sysfs entirely and is a coalesce-pass removal
    /// candidate ("any map whose paths are all gone from sysfs is
    /// removed").
    pub fn map_has_live_paths(&self, map_handle: Handle<Multipath>) -> bool {
        match self.maps.get(map_handle) {
            Some(m) => m
                .pg
                .iter()
                .any(|pg| pg.paths.iter().any(|&h| self.paths.get(h).is_some())),
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_map_with_path_sets_backreference() {
        let mut vecs = Vectors::new();
        let mut p = Path::new("sdb", (8, 16));
        p.wwid = "W1".into();
        let ph = vecs.paths.insert(p);
        let mh = vecs.add_map_with_path(ph, "mpatha");
        assert_eq!(vecs.paths.get(ph).unwrap().mpp, Some(mh));
        assert_eq!(vecs.maps.get(mh).unwrap().wwid, "W1");
    }

    #[test]
    fn test_remove_map_keep_paths_orphans() {
        let mut vecs = Vectors::new();
        let mut p = Path::new("sdb", (8, 16));
        p.wwid = "W1".into();
        let ph = vecs.paths.insert(p);
        let mh = vecs.add_map_with_path(ph, "mpatha");
        vecs.maps.get_mut(mh).unwrap().pg.push(Pathgroup {
            paths: vec![ph],
            ..Default::default()
        });
        vecs.remove_map(mh, DeallocMode::KeepPaths);
        assert!(vecs.maps.get(mh).is_none());
        assert!(vecs.paths.get(ph).unwrap().is_orphan());
        // wwid is preserved across orphaning.
        assert_eq!(vecs.paths.get(ph).unwrap().wwid, "W1");
    }

    #[test]
    fn test_remove_map_free_paths_removes() {
        let mut vecs = Vectors::new();
        let p = Path::new("sdb", (8, 16));
        let ph = vecs.paths.insert(p);
        let mh = vecs.add_map_with_path(ph, "mpatha");
        vecs.maps.get_mut(mh).unwrap().pg.push(Pathgroup {
            paths: vec![ph],
            ..Default::default()
        });
        vecs.remove_map(mh, DeallocMode::FreePaths);
        assert!(vecs.paths.get(ph).is_none());
    }

    #[test]
    fn test_pathgroup_identity_order_independent_of_content_change() {
        let mut vecs = Vectors::new();
        let ph1 = vecs.paths.insert(Path::new("sda", (8, 0)));
        let ph2 = vecs.paths.insert(Path::new("sdb", (8, 16)));
        let pg_a = Pathgroup {
            paths: vec![ph1, ph2],
            ..Default::default()
        };
        let pg_b = Pathgroup {
            paths: vec![ph2, ph1],
            ..Default::default()
        };
        assert_eq!(pg_a.identity(), pg_b.identity());
    }

    #[test]
    fn test_no_path_retry_queues() {
        assert!(NoPathRetry::Queue.queues());
        assert!(NoPathRetry::Retries(12).queues());
        assert!(!NoPathRetry::Fail.queues());
    }
}
