//! Action selector and coalescing pass.
//!
//! [`select_action`] implements the action decision table: given the engine's
//! desired state for a map (`M`) and the last-known kernel state (`C`), it
//! picks exactly one [`Action`]. [`coalesce_paths`] is the daemon's
//! reconciliation pass: group discovered paths by wwid, run the configured
//! path-group policy, diff against the previous pass, and apply.

use std::collections::{HashMap, HashSet};

use crate::arena::{Arena, Handle};
use crate::config::Config;
use crate::dm::{self, DmClient, ResumeFlags};
use crate::dmparser::assemble_map;
use crate::multipath::{Action, Multipath, Vectors};
use crate::path::{Path, PathState, ScsiAddress};
use crate::pgpolicies;
use crate::store::FileKvStore;

/// Whether any path belonging to `map` answers I/O ("no path of M is
/// up").
fn any_path_up(map: &Multipath, paths: &Arena<Path>) -> bool {
    map.pg
        .iter()
        .flat_map(|pg| &pg.paths)
        .any(|&h| paths.get(h).map(|p| p.state == PathState::Up).unwrap_or(false))
}

fn pg_identities_differ(current: &Multipath, desired: &Multipath) -> bool {
    if current.pg.len() != desired.pg.len() {
        return true;
    }
    current
        .pg
        .iter()
        .zip(desired.pg.iter())
        .any(|(c, d)| c.identity() != d.identity())
}

/// A feature-string difference only forces a reload when `no_path_retry`
/// disables queueing; a queue_if_no_path token that simply tracks a config
/// change the kernel already honors implicitly does not.
fn features_trigger_reload(current: &Multipath, desired: &Multipath) -> bool {
    current.features != desired.features && !desired.no_path_retry.queues()
}

/// Pick the action to apply for `desired` against `current` (`None` when no
/// map for this wwid is known to exist yet). `alias_owner_wwid` is the wwid
/// of whatever other map, if any, already owns `desired.alias`.
///
/// The table is evaluated top-down; the first matching row wins. One row is
/// not spelled out as a distinct table entry elsewhere but is required for
/// a rename to happen at all: when `C` is present, its alias differs from
/// the desired one, and no other wwid owns the desired alias, the action
/// is `Rename`.
pub fn select_action(
    desired: &Multipath,
    paths: &Arena<Path>,
    current: Option<&Multipath>,
    alias_owner_wwid: Option<&str>,
    force_reload: bool,
    retain_hwhandler: bool,
) -> Action {
    let alias_conflict = alias_owner_wwid.is_some_and(|w| w != desired.wwid);

    let Some(current) = current else {
        return if alias_conflict {
            Action::Reject
        } else {
            Action::Create
        };
    };

    if alias_conflict {
        tracing::info!(
            alias = %desired.alias,
            wwid = %desired.wwid,
            "alias already bound to a different wwid, leaving kernel map unchanged"
        );
        return Action::Nothing;
    }

    if desired.alias != current.alias {
        return Action::Rename;
    }

    if !any_path_up(desired, paths) {
        return Action::Nothing;
    }

    if force_reload {
        return Action::Reload;
    }

    if current.size != desired.size {
        return Action::Resize;
    }

    if features_trigger_reload(current, desired) {
        return Action::Reload;
    }

    if current.hwhandler != desired.hwhandler && !retain_hwhandler {
        return Action::Reload;
    }

    if current.selector != desired.selector || current.minio != desired.minio {
        return Action::Reload;
    }

    if pg_identities_differ(current, desired) {
        return Action::Reload;
    }

    if current.nextpg != desired.bestpg {
        return Action::SwitchGroup;
    }

    Action::Nothing
}

/// Reorder `paths` so members sharing a SCSI host adapter are adjacent,
/// then interleave the per-adapter runs round-robin, before the configured
/// path-group policy groups them ( adapter-affinity reordering).
pub fn reorder_by_adapter_affinity(paths: &[Handle<Path>], arena: &Arena<Path>) -> Vec<Handle<Path>> {
    rr_optimize_path_order(&group_by_host_adapter(paths, arena))
}

fn group_by_host_adapter(paths: &[Handle<Path>], arena: &Arena<Path>) -> Vec<Vec<Handle<Path>>> {
    let mut order: Vec<i32> = Vec::new();
    let mut buckets: HashMap<i32, Vec<Handle<Path>>> = HashMap::new();
    for &h in paths {
        let host = arena.get(h).map(|p| p.sg_id.host).unwrap_or(ScsiAddress::NO_HOST);
        buckets.entry(host).or_insert_with(|| {
            order.push(host);
            Vec::new()
        });
        buckets.get_mut(&host).unwrap().push(h);
    }
    order.into_iter().map(|host| buckets.remove(&host).unwrap_or_default()).collect()
}

fn rr_optimize_path_order(adapters: &[Vec<Handle<Path>>]) -> Vec<Handle<Path>> {
    if adapters.len() <= 1 {
        return adapters.iter().flatten().copied().collect();
    }
    let max_len = adapters.iter().map(|a| a.len()).max().unwrap_or(0);
    let mut out = Vec::with_capacity(adapters.iter().map(|a| a.len()).sum());
    for i in 0..max_len {
        for adapter in adapters {
            if let Some(&h) = adapter.get(i) {
                out.push(h);
            }
        }
    }
    out
}

/// A stable, previously unused `mpathN` alias ( scenario 1: "alias
/// derived from bindings or `mpath0`"), used when neither the config nor
/// the bindings store supplies one.
fn generate_alias(vectors: &Vectors) -> String {
    let mut n = 0usize;
    loop {
        let candidate = format!("mpath{n}");
        if vectors.find_map_by_alias(&candidate).is_none() {
            return candidate;
        }
        n += 1;
    }
}

/// Outcome of applying one map's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomapResult {
    Applied,
    Retry,
    DryRun,
}

/// Apply `map_handle`'s currently selected action via `dm`, updating its
/// statistics and retry flag. `wwids` is consulted so a
/// successfully applied map's wwid is remembered.
pub fn domap(
    vectors: &mut Vectors,
    map_handle: Handle<Multipath>,
    dm_client: &dyn DmClient,
    wwids: &FileKvStore,
    dry_run: bool,
) -> DomapResult {
    let Some(map) = vectors.maps.get(map_handle) else {
        return DomapResult::Retry;
    };
    let action = map.action;

    if dry_run {
        tracing::info!(alias = %map.alias, ?action, "dry-run: would apply action");
        return DomapResult::DryRun;
    }

    let alias = map.alias.clone();
    let wwid = map.wwid.clone();
    let uuid = dm::map_uuid(&wwid);
    let table = assemble_map(map, &vectors.paths);

    let result: Result<(), crate::dm::DmError> = match action {
        Action::Nothing | Action::Reject => Ok(()),
        Action::Create => dm_client.create(&alias, &uuid, &table).inspect_err(|e| {
            tracing::error!(alias = %alias, error = %e, "create failed, flushing partial map");
            let _ = dm_client.remove(&alias);
        }),
        Action::Reload => match dm_client.reload(&alias, &table) {
            Ok(()) => dm_client.resume(&alias, ResumeFlags::default()),
            Err(_) => {
                // A reload whose table failed to load is followed by an
                // explicit resume with the reload flag set, so the kernel
                // picks the just-loaded inactive table back up.
                dm_client.resume(&alias, ResumeFlags { reload: true })
            }
        },
        Action::Resize => dm_client
            .reload(&alias, &table)
            .and_then(|()| dm_client.resume(&alias, ResumeFlags::default())),
        Action::SwitchGroup => {
            let n = map.bestpg.unwrap_or(1);
            dm_client.message(&alias, &dm::msg_switch_group(n))
        }
        Action::Rename => {
            let old = map.previous_alias.clone().unwrap_or_else(|| alias.clone());
            dm_client.rename(&old, &alias)
        }
    };

    match result {
        Ok(()) => {
            if let Some(m) = vectors.maps.get_mut(map_handle) {
                match action {
                    Action::Create => m.stats.creates += 1,
                    Action::Reload => m.stats.reloads += 1,
                    Action::Resize => m.stats.resizes += 1,
                    Action::SwitchGroup => m.stats.switch_groups += 1,
                    Action::Rename => m.stats.renames += 1,
                    Action::Nothing | Action::Reject => {}
                }
                m.needs_retry = false;
            }
            if !matches!(action, Action::Nothing | Action::Reject) {
                if let Err(e) = wwids.insert(&wwid, "") {
                    tracing::warn!(%wwid, error = %e, "failed to remember wwid");
                }
            }
            DomapResult::Applied
        }
        Err(e) => {
            tracing::error!(alias = %alias, ?action, error = %e, "failed to apply action");
            if let Some(m) = vectors.maps.get_mut(map_handle) {
                m.stats.failures += 1;
                m.needs_retry = true;
            }
            DomapResult::Retry
        }
    }
}

/// One map's outcome from a [`coalesce_paths`] pass.
#[derive(Debug, Clone, Copy)]
pub struct CoalesceOutcome {
    pub map: Handle<Multipath>,
    pub action: Action,
    pub result: DomapResult,
}

/// Group discovered paths by wwid, run the path-group policy, diff against
/// the previous pass's state, and apply the result via `dm`. Maps
/// whose member paths have all disappeared are removed at the end of the
/// pass.
#[allow(clippy::too_many_arguments)]
pub fn coalesce_paths(
    vectors: &mut Vectors,
    config: &Config,
    dm_client: &dyn DmClient,
    wwids: &FileKvStore,
    bindings: &FileKvStore,
    force_reload: bool,
    retain_hwhandler: bool,
    dry_run: bool,
) -> Vec<CoalesceOutcome> {
    let mut outcomes = Vec::new();
    let mut coalesced: HashSet<Handle<Path>> = HashSet::new();

    let candidate_paths: Vec<Handle<Path>> = vectors.paths.iter().map(|(h, _)| h).collect();

    for ph in candidate_paths {
        if coalesced.contains(&ph) {
            continue;
        }
        let Some(path) = vectors.paths.get(ph) else {
            continue;
        };
        if path.wwid.is_empty() || config.blacklist.check_wwid(&path.wwid).is_blacklisted() {
            continue;
        }
        let wwid = path.wwid.clone();

        let existed_before = vectors.find_map_by_wwid(&wwid).is_some();

        let alias = config
            .select_alias(&wwid)
            .or_else(|| bindings.find_key_for_value(&wwid).ok().flatten())
            .unwrap_or_else(|| generate_alias(vectors));

        let alias_owner_wwid: Option<String> = vectors
            .find_map_by_alias(&alias)
            .and_then(|h| vectors.maps.get(h))
            .filter(|m| m.wwid != wwid)
            .map(|m| m.wwid.clone());

        let map_handle = match vectors.find_map_by_wwid(&wwid) {
            Some(h) => h,
            None => vectors.add_map_with_path(ph, alias.clone()),
        };

        let current_snapshot = if existed_before {
            vectors.maps.get(map_handle).cloned()
        } else {
            None
        };

        let member_paths = vectors.paths_with_wwid(&wwid);
        let mut size = 0u64;
        let mut consistent_size = true;
        for (i, &mph) in member_paths.iter().enumerate() {
            if let Some(p) = vectors.paths.get_mut(mph) {
                p.mpp = Some(map_handle);
                if i == 0 {
                    size = p.size;
                } else if p.size != 0 && size != 0 && p.size != size {
                    consistent_size = false;
                }
            }
            coalesced.insert(mph);
        }
        if !consistent_size {
            tracing::warn!(%wwid, "member paths disagree on size, skipping this pass");
            continue;
        }

        let reordered = reorder_by_adapter_affinity(&member_paths, &vectors.paths);
        let hwe = vectors.paths.get(ph).map(|p| p.hwe.clone()).unwrap_or_default();
        let policy = config.select_policy(&wwid, &hwe);
        let selector = config.select_selector(&wwid, &hwe);
        let mut pg = pgpolicies::group_paths(&reordered, &vectors.paths, policy, true);
        for g in &mut pg {
            g.selector = selector.clone();
        }

        if alias_owner_wwid.is_none() {
            if let Some(m) = vectors.maps.get_mut(map_handle) {
                m.alias = alias.clone();
            }
        }
        {
            let Some(m) = vectors.maps.get_mut(map_handle) else {
                continue;
            };
            m.size = size;
            m.policy = policy;
            m.selector = selector;
            m.features = config.select_features(&wwid, &hwe);
            m.hwhandler = config.select_hwhandler(&wwid, &hwe);
            m.no_path_retry = config.select_no_path_retry(&wwid, &hwe);
            m.retain_hwhandler = retain_hwhandler;
            m.minio = config.select_minio(&wwid, &hwe);
            m.rr_weight_is_prio = config.select_rr_weight_is_prio(&wwid, &hwe);
            m.pg = pg;
            m.bestpg = Some(1);
        }

        let desired_snapshot = vectors.maps.get(map_handle).cloned().unwrap();
        let mut action = select_action(
            &desired_snapshot,
            &vectors.paths,
            current_snapshot.as_ref(),
            alias_owner_wwid.as_deref(),
            force_reload,
            retain_hwhandler,
        );

        if action == Action::Nothing && alias_owner_wwid.is_some() {
            if let (Some(c), Some(m)) = (&current_snapshot, vectors.maps.get_mut(map_handle)) {
                m.alias = c.alias.clone();
            }
        }

        if action == Action::Reject {
            tracing::warn!(%alias, %wwid, "alias conflict on create, flushing and retrying");
            let _ = dm_client.remove(&alias);
            action = Action::Create;
        }

        if action == Action::Rename {
            if let Some(m) = vectors.maps.get_mut(map_handle) {
                m.previous_alias = current_snapshot.as_ref().map(|c| c.alias.clone());
            }
        }

        if let Some(m) = vectors.maps.get_mut(map_handle) {
            m.action = action;
        }

        let result = domap(vectors, map_handle, dm_client, wwids, dry_run);
        outcomes.push(CoalesceOutcome {
            map: map_handle,
            action,
            result,
        });
    }

    let stale: Vec<Handle<Multipath>> = vectors
        .maps
        .iter()
        .filter(|(h, _)| !vectors.map_has_live_paths(*h))
        .map(|(h, _)| h)
        .collect();
    for h in stale {
        vectors.remove_map(h, crate::multipath::DeallocMode::FreePaths);
    }

    outcomes
}
