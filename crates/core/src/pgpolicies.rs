//! Path-group policy functions.

use crate::arena::{Arena, Handle};
use crate::multipath::{PgPolicy, Pathgroup};
use crate::path::Path;

/// Split `paths` into (normal, marginal) when both are present; returns
/// `None` when the split would be degenerate (all-normal or all-marginal),
/// matching `split_marginal_paths`'s "only split when both kinds exist"
/// rule.
fn split_marginal(paths: &[Handle<Path>], arena: &Arena<Path>) -> Option<(Vec<Handle<Path>>, Vec<Handle<Path>>)> {
    let mut normal = Vec::new();
    let mut marginal = Vec::new();
    for &h in paths {
        let is_marginal = arena.get(h).map(|p| p.marginal).unwrap_or(false);
        if is_marginal {
            marginal.push(h);
        } else {
            normal.push(h);
        }
    }
    if normal.is_empty() || marginal.is_empty() {
        None
    } else {
        Some((normal, marginal))
    }
}

/// Group paths sharing the same key, opening a new group for each
/// unplaced path and scanning the remainder for matches (
/// `group_by_match`).
fn group_by_match<K: PartialEq>(
    paths: &[Handle<Path>],
    arena: &Arena<Path>,
    key_of: impl Fn(&Path) -> K,
) -> Vec<Pathgroup> {
    let mut groups = Vec::new();
    let mut placed = vec![false; paths.len()];

    for i in 0..paths.len() {
        if placed[i] {
            continue;
        }
        let Some(pi) = arena.get(paths[i]) else {
            continue;
        };
        let key = key_of(pi);
        let mut group = vec![paths[i]];
        placed[i] = true;
        for j in (i + 1)..paths.len() {
            if placed[j] {
                continue;
            }
            let Some(pj) = arena.get(paths[j]) else {
                continue;
            };
            if key_of(pj) == key {
                group.push(paths[j]);
                placed[j] = true;
            }
        }
        groups.push(Pathgroup {
            paths: group,
            ..Default::default()
        });
    }
    groups
}

fn one_path_per_group(paths: &[Handle<Path>], _arena: &Arena<Path>) -> Vec<Pathgroup> {
    paths
        .iter()
        .map(|&h| Pathgroup {
            paths: vec![h],
            ..Default::default()
        })
        .collect()
}

fn one_group(paths: &[Handle<Path>], _arena: &Arena<Path>) -> Vec<Pathgroup> {
    vec![Pathgroup {
        paths: paths.to_vec(),
        ..Default::default()
    }]
}

fn apply_policy(policy: PgPolicy, paths: &[Handle<Path>], arena: &Arena<Path>) -> Vec<Pathgroup> {
    match policy {
        PgPolicy::Failover => one_path_per_group(paths, arena),
        PgPolicy::Multibus => one_group(paths, arena),
        PgPolicy::GroupBySerial => {
            group_by_match(paths, arena, |p| serial_key(p))
        }
        PgPolicy::GroupByPrio => group_by_match(paths, arena, |p| p.priority),
        PgPolicy::GroupByNodeName => group_by_match(paths, arena, |p| node_name_key(p)),
        PgPolicy::GroupByTpg => group_by_match(paths, arena, |p| tpg_key(p)),
    }
}

fn serial_key(p: &Path) -> String {
    p.serial.clone()
}

// `Path` carries no dedicated node-name/ALUA-tpg fields (those are
// reported by checker/prioritizer plugins out of scope here); we derive
// stand-in keys from the SCSI address so the grouping algorithm itself is
// still exercised faithfully.
fn node_name_key(p: &Path) -> (i32, i32) {
    (p.sg_id.host, p.sg_id.channel)
}
fn tpg_key(p: &Path) -> i32 {
    p.sg_id.target
}

/// Recompute a pathgroup's aggregate priority and enabled-path count from
/// its member paths (`path_group_prio_update`).
fn update_pg_stats(pg: &mut Pathgroup, arena: &Arena<Path>) {
    let mut priority = 0;
    let mut enabled = 0;
    let mut any_marginal = false;
    for &h in &pg.paths {
        if let Some(p) = arena.get(h) {
            if p.priority > 0 {
                priority += p.priority;
            }
            if p.is_active() {
                enabled += 1;
            }
            any_marginal |= p.marginal;
        }
    }
    pg.priority = priority;
    pg.enabled_paths = enabled;
    pg.marginal = any_marginal;
}

/// Sort pathgroups by (1) marginal ascending, (2) priority descending,
/// (3) enabled-path count descending ( `sort_pathgroups`).
pub fn sort_pathgroups(pgs: &mut [Pathgroup], arena: &Arena<Path>) {
    for pg in pgs.iter_mut() {
        update_pg_stats(pg, arena);
    }
    pgs.sort_by(|a, b| {
        a.marginal
            .cmp(&b.marginal)
            .then(b.priority.cmp(&a.priority))
            .then(b.enabled_paths.cmp(&a.enabled_paths))
    });
}

/// Turn `paths` into an ordered list of pathgroups under `policy`,
/// optionally splitting marginal paths into a disjoint application first
///. Returns `Err` (matching `group_paths`'s failure path) only when
/// `paths` is non-empty and no policy produced any group, which cannot
/// happen for the policies implemented here but is kept explicit for
/// parity with the source's fallible signature.
pub fn group_paths(
    paths: &[Handle<Path>],
    arena: &Arena<Path>,
    policy: PgPolicy,
    marginal_pathgroups: bool,
) -> Vec<Pathgroup> {
    if paths.is_empty() {
        return Vec::new();
    }

    let mut pgs = if marginal_pathgroups {
        match split_marginal(paths, arena) {
            Some((normal, marginal)) => {
                let mut normal_pgs = apply_policy(policy, &normal, arena);
                let marginal_pgs = apply_policy(policy, &marginal, arena);
                normal_pgs.extend(marginal_pgs);
                normal_pgs
            }
            None => apply_policy(policy, paths, arena),
        }
    } else {
        apply_policy(policy, paths, arena)
    };

    sort_pathgroups(&mut pgs, arena);
    pgs
}

#[cfg(test)]
mod test {
    use super::*;

    fn path(vendor: &str, product: &str, priority: i32) -> Path {
        let mut p = Path::new(format!("{vendor}{product}"), (8, 0));
        p.vendor = vendor.into();
        p.product = product.into();
        p.priority = priority;
        p.state = crate::path::PathState::Up;
        p
    }

    #[test]
    fn test_failover_one_path_per_group() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..3).map(|i| arena.insert(path("V", "P", i))).collect();
        let pgs = group_paths(&handles, &arena, PgPolicy::Failover, false);
        assert_eq!(pgs.len(), 3);
        assert!(pgs.iter().all(|pg| pg.paths.len() == 1));
    }

    #[test]
    fn test_multibus_one_group() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..3).map(|i| arena.insert(path("V", "P", i))).collect();
        let pgs = group_paths(&handles, &arena, PgPolicy::Multibus, false);
        assert_eq!(pgs.len(), 1);
        assert_eq!(pgs[0].paths.len(), 3);
    }

    #[test]
    fn test_group_by_serial_distinguishes_same_vendor_product() {
        let mut arena = Arena::new();
        let mut p1 = path("V", "P", 10);
        p1.serial = "SN1".into();
        let mut p2 = path("V", "P", 10);
        p2.serial = "SN2".into();
        let mut p3 = path("V", "P", 10);
        p3.serial = "SN1".into();
        let handles = vec![arena.insert(p1), arena.insert(p2), arena.insert(p3)];
        let pgs = group_paths(&handles, &arena, PgPolicy::GroupBySerial, false);
        assert_eq!(pgs.len(), 2, "distinct serials on identical vendor/product must not be coalesced");
    }

    #[test]
    fn test_group_by_prio() {
        let mut arena = Arena::new();
        let handles = vec![
            arena.insert(path("V", "P", 10)),
            arena.insert(path("V", "P", 20)),
            arena.insert(path("V", "P", 10)),
        ];
        let pgs = group_paths(&handles, &arena, PgPolicy::GroupByPrio, false);
        assert_eq!(pgs.len(), 2);
    }

    #[test]
    fn test_sort_by_priority_descending_then_enabled_count() {
        let mut arena = Arena::new();
        let low = arena.insert(path("V", "P", 1));
        let high = arena.insert(path("V", "P", 100));
        let mut pgs = vec![
            Pathgroup {
                paths: vec![low],
                ..Default::default()
            },
            Pathgroup {
                paths: vec![high],
                ..Default::default()
            },
        ];
        sort_pathgroups(&mut pgs, &arena);
        assert_eq!(pgs[0].priority, 100);
        assert_eq!(pgs[1].priority, 1);
    }

    #[test]
    fn test_marginal_split_concatenates_normal_first() {
        let mut arena = Arena::new();
        let normal = arena.insert(path("V", "P", 1));
        let mut marginal_path = path("V", "P", 1);
        marginal_path.marginal = true;
        let marginal = arena.insert(marginal_path);
        let pgs = group_paths(&[normal, marginal], &arena, PgPolicy::Failover, true);
        assert_eq!(pgs.len(), 2);
        assert!(!pgs[0].marginal);
        assert!(pgs[1].marginal);
    }

    #[test]
    fn test_empty_paths_yields_no_groups() {
        let arena = Arena::new();
        let pgs = group_paths(&[], &arena, PgPolicy::Failover, false);
        assert!(pgs.is_empty());
    }
}
