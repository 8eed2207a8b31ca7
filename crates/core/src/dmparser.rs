//! Target-table assembler / disassembler.
//!
//! The device-mapper target-table for a multipath target is a single
//! whitespace-separated string. This module turns a [`Multipath`] + its
//! paths into that string (`assemble_map`) and turns a string read back
//! from the kernel into an intermediate tree (`disassemble_table`) that the
//! caller reconciles against its path inventory (the disassembler may
//! see `major:minor` pairs with no corresponding path record yet).

use crate::arena::{Arena, Handle};
use crate::error::CoreError;
use crate::multipath::{Multipath, NoPathRetry, Pathgroup};
use crate::path::{InitState, Path};

/// A count-prefixed token list: `features` and `hwhandler` strings both use
/// this format. The features string always begins with a decimal count of
/// the remaining space-separated tokens; that prefix is fragile, so parsing
/// it is defensive rather than strict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    tokens: Vec<String>,
}

impl FeatureSet {
    /// Parse a count-prefixed token list. A missing, non-numeric, or
    /// overlong count is treated defensively: the whole string becomes an
    /// opaque token list rather than aborting.
    pub fn parse(s: &str) -> Self {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.is_empty() {
            return Self::default();
        }
        match parts[0].parse::<usize>() {
            Ok(n) if n <= parts.len() - 1 => Self {
                tokens: parts[1..1 + n].iter().map(|s| s.to_string()).collect(),
            },
            _ => {
                tracing::warn!(raw = %s, "malformed token-count prefix, treating string as opaque");
                Self {
                    tokens: parts.iter().map(|s| s.to_string()).collect(),
                }
            }
        }
    }

    /// Render back to the count-prefixed wire form. An empty set renders as
    /// the literal `"0"`, never dropped.
    pub fn render(&self) -> String {
        if self.tokens.is_empty() {
            "0".to_string()
        } else {
            format!("{} {}", self.tokens.len(), self.tokens.join(" "))
        }
    }

    /// True if `name` is present in the token list.
    pub fn contains(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t == name)
    }

    /// Add `name` if absent. Rejects a feature token containing whitespace:
    /// per , that would corrupt the space-separated wire format and is
    /// treated as an internal bug, not a recoverable input error.
    pub fn add_feature(&mut self, name: &str) -> Result<(), CoreError> {
        if name.split_whitespace().count() > 1 {
            return Err(CoreError::Fatal(anyhow::anyhow!(
                "feature token '{name}' contains whitespace"
            )));
        }
        if !self.contains(name) {
            self.tokens.push(name.to_string());
        }
        Ok(())
    }

    /// Remove `name` if present. Idempotent when absent ( round-trip
    /// property: `add_feature โˆ˜ remove_feature == identity` when absent).
    pub fn remove_feature(&mut self, name: &str) {
        self.tokens.retain(|t| t != name);
    }
}

/// One pathgroup as read back from a kernel table: the selector string
/// verbatim, and the raw `(dev_t, minio)` pairs in table order.
#[derive(Debug, Clone)]
pub struct DisassembledPathgroup {
    /// The selector token string, verbatim from the table.
    pub selector: String,
    /// `(major:minor, minio)` pairs, in table order.
    pub entries: Vec<((u32, u32), u32)>,
}

/// The whole table, disassembled but not yet reconciled against a path
/// inventory.
#[derive(Debug, Clone)]
pub struct DisassembledTable {
    /// Count-prefixed feature token string, verbatim from the table.
    pub features: String,
    /// Count-prefixed hardware-handler token string, verbatim from the table.
    pub hwhandler: String,
    /// 1-based index of the currently selected pathgroup ("nextpg").
    pub nextpg: usize,
    /// Path groups, in table order.
    pub pg: Vec<DisassembledPathgroup>,
}

struct TokenCursor<'a> {
    tokens: std::iter::Peekable<std::str::SplitWhitespace<'a>>,
}

impl<'a> TokenCursor<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            tokens: s.split_whitespace().peekable(),
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.tokens.next()
    }

    /// Consume a count-prefixed sub-list and return it rendered back to its
    /// wire form (used for `features`/`hwhandler`, which are carried on
    /// [`Multipath`] as opaque strings rather than parsed [`FeatureSet`]s).
    fn take_prefixed(&mut self) -> Result<String, CoreError> {
        let count_tok = self
            .next()
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated table: missing token count")))?;
        let n: usize = count_tok
            .parse()
            .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed token count '{count_tok}'")))?;
        let mut toks = Vec::with_capacity(n);
        for _ in 0..n {
            let t = self
                .next()
                .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated token list")))?;
            toks.push(t.to_string());
        }
        Ok(if toks.is_empty() {
            "0".to_string()
        } else {
            format!("{} {}", toks.len(), toks.join(" "))
        })
    }

    fn take_usize(&mut self) -> Result<usize, CoreError> {
        self.next()
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated table: expected integer")))?
            .parse()
            .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed integer in table")))
    }
}

fn parse_dev_t(s: &str) -> Result<(u32, u32), CoreError> {
    let (maj, min) = s
        .split_once(':')
        .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("malformed major:minor '{s}'")))?;
    Ok((
        maj.parse()
            .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed major in '{s}'")))?,
        min.parse()
            .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed minor in '{s}'")))?,
    ))
}

/// `map.features` plus whatever `queue_if_no_path`/`retain_attached_hw_handler`
/// tokens the map's resolved state requires (`Undef` is treated like `fail`:
/// no-path-retry has not yet been resolved, so nothing is asserted).
fn assembled_features(map: &Multipath) -> String {
    let mut fs = FeatureSet::parse(&map.features);
    if map.no_path_retry.queues() && !matches!(map.no_path_retry, NoPathRetry::Undef) {
        let _ = fs.add_feature("queue_if_no_path");
    }
    if map.retain_hwhandler {
        let _ = fs.add_feature("retain_attached_hw_handler");
    }
    fs.render()
}

/// Serialize `map`'s topology to the kernel target-table string.
///
/// The features string is augmented beyond `map.features` as assembled: a
/// resolved `no_path_retry` other than `fail` asserts `queue_if_no_path`,
/// and `map.retain_hwhandler` asserts `retain_attached_hw_handler` (both
/// added only if not already present).
///
/// Per-path `minio` is `map.minio` unless `map.rr_weight_is_prio`, in which
/// case it is multiplied by the path's priority (clamped to at least 1, so
/// a path whose priority has not been determined doesn't starve).
pub fn assemble_map(map: &Multipath, paths: &Arena<Path>) -> String {
    let mut out = Vec::new();
    out.push(assembled_features(map));
    out.push(map.hwhandler.clone());
    out.push(map.pg.len().to_string());
    out.push(map.bestpg.unwrap_or(1).to_string());

    for pg in &map.pg {
        out.push(pg.selector.clone());
        out.push(pg.paths.len().to_string());
        out.push("1".to_string());
        for &ph in &pg.paths {
            let Some(p) = paths.get(ph) else { continue };
            out.push(p.dev_t_string());
            let minio = if map.rr_weight_is_prio {
                map.minio.saturating_mul(p.priority.max(1) as u32)
            } else {
                map.minio
            };
            out.push(minio.to_string());
        }
    }
    out.join(" ")
}

/// Parse a kernel target-table string back into an intermediate tree.
/// Unknown feature/hwhandler tokens round-trip unchanged.
pub fn disassemble_table(table: &str) -> Result<DisassembledTable, CoreError> {
    let mut cur = TokenCursor::new(table);
    let features = cur.take_prefixed()?;
    let hwhandler = cur.take_prefixed()?;
    let nr_pg = cur.take_usize()?;
    let nextpg = cur.take_usize()?;

    let mut pgs = Vec::with_capacity(nr_pg);
    for _ in 0..nr_pg {
        let selector_name = cur
            .next()
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated table: missing selector")))?;
        let selector_args: usize = cur
            .next()
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated table: missing selector arg count")))?
            .parse()
            .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed selector arg count")))?;
        let mut selector_toks = vec![selector_name.to_string(), selector_args.to_string()];
        for _ in 0..selector_args {
            selector_toks.push(
                cur.next()
                    .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated selector args")))?
                    .to_string(),
            );
        }
        let selector = selector_toks.join(" ");

        let path_count = cur.take_usize()?;
        let per_path_args = cur.take_usize()?;
        let mut entries = Vec::with_capacity(path_count);
        for _ in 0..path_count {
            let dev_t = parse_dev_t(
                cur.next()
                    .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated table: missing dev_t")))?,
            )?;
            let mut minio = 0u32;
            for i in 0..per_path_args {
                let v: u32 = cur
                    .next()
                    .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("truncated per-path args")))?
                    .parse()
                    .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed per-path arg")))?;
                if i == 0 {
                    minio = v;
                }
            }
            entries.push((dev_t, minio));
        }
        pgs.push(DisassembledPathgroup { selector, entries });
    }

    Ok(DisassembledTable {
        features,
        hwhandler,
        nextpg,
        pg: pgs,
    })
}

/// Reconcile a [`DisassembledTable`] against the path arena, appending an
/// uninitialized [`Path`] ("appended ... in an uninitialized state")
/// for any `dev_t` not yet known. Returns the rebuilt pathgroup list;
/// callers own deciding whether/how to merge it onto a [`Multipath`].
pub fn reconcile_pathgroups(
    parsed: &DisassembledTable,
    paths: &mut Arena<Path>,
    find_by_dev_t: impl Fn(&Arena<Path>, (u32, u32)) -> Option<Handle<Path>>,
) -> Vec<Pathgroup> {
    let mut out = Vec::with_capacity(parsed.pg.len());
    for pg in &parsed.pg {
        let mut handles = Vec::with_capacity(pg.entries.len());
        for &(dev_t, _minio) in &pg.entries {
            let handle = find_by_dev_t(paths, dev_t).unwrap_or_else(|| {
                let mut p = Path::new(String::new(), dev_t);
                p.init_state = InitState::New;
                paths.insert(p)
            });
            handles.push(handle);
        }
        out.push(Pathgroup {
            paths: handles,
            selector: pg.selector.clone(),
            ..Default::default()
        });
    }
    out
}

/// Simplified internal status-string format: not a byte-exact rendering of
/// the kernel's target-status grammar, but a self-consistent wire shape
/// covering every field the status parser is required to set:
/// `"<nextpg> <pg-letter>/<count>,<devt>:<state>:<fails>,... ..."`.
pub fn format_status(map: &Multipath, paths: &Arena<Path>) -> String {
    let mut groups = Vec::with_capacity(map.pg.len());
    for pg in &map.pg {
        let letter = match pg.dm_state {
            crate::multipath::PgState::Active => 'A',
            crate::multipath::PgState::Enabled => 'E',
            crate::multipath::PgState::Disabled => 'D',
            crate::multipath::PgState::Undef => 'U',
        };
        let path_fields: Vec<String> = pg
            .paths
            .iter()
            .filter_map(|&h| paths.get(h))
            .map(|p| {
                let state = match p.dm_state {
                    crate::path::DmPathState::Active => 'A',
                    crate::path::DmPathState::Failed => 'F',
                    crate::path::DmPathState::Undef => 'U',
                };
                format!("{}:{}:{}", p.dev_t_string(), state, p.fail_count)
            })
            .collect();
        groups.push(format!("{letter}/{}", path_fields.join(",")));
    }
    format!("{} {}", map.nextpg.unwrap_or(1), groups.join(" "))
}

/// Parse a status string produced by [`format_status`], setting `map.nextpg`,
/// each pathgroup's `dm_state`, and each path's `dm_state`/`fail_count`.
/// Pathgroups/paths are matched positionally against `map.pg`; a status
/// string with a different topology than `map` is a caller error and only
/// the overlapping prefix is applied.
pub fn parse_status(status: &str, map: &mut Multipath, paths: &mut Arena<Path>) -> Result<(), CoreError> {
    let mut fields = status.split_whitespace();
    let nextpg: usize = fields
        .next()
        .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("empty status string")))?
        .parse()
        .map_err(|_| CoreError::Fatal(anyhow::anyhow!("malformed nextpg in status")))?;
    map.nextpg = Some(nextpg);

    for (pg, field) in map.pg.iter_mut().zip(fields) {
        let (letter, rest) = field
            .split_once('/')
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("malformed pathgroup status field '{field}'")))?;
        pg.dm_state = match letter {
            "A" => crate::multipath::PgState::Active,
            "E" => crate::multipath::PgState::Enabled,
            "D" => crate::multipath::PgState::Disabled,
            _ => crate::multipath::PgState::Undef,
        };
        if rest.is_empty() {
            continue;
        }
        for (handle, path_field) in pg.paths.iter().zip(rest.split(',')) {
            let mut parts = path_field.split(':');
            let _dev_t = parts.next();
            let state = parts.next().unwrap_or("U");
            let fail_count: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            if let Some(p) = paths.get_mut(*handle) {
                p.dm_state = match state {
                    "A" => crate::path::DmPathState::Active,
                    "F" => crate::path::DmPathState::Failed,
                    _ => crate::path::DmPathState::Undef,
                };
                p.fail_count = fail_count;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::multipath::PgPolicy;

    #[test]
    fn test_feature_set_add_remove_idempotent() {
        let mut fs = FeatureSet::parse("0");
        assert_eq!(fs.render(), "0");
        fs.add_feature("queue_if_no_path").unwrap();
        assert_eq!(fs.render(), "1 queue_if_no_path");
        fs.add_feature("queue_if_no_path").unwrap();
        assert_eq!(fs.render(), "1 queue_if_no_path", "adding twice is idempotent");
        fs.remove_feature("queue_if_no_path");
        assert_eq!(fs.render(), "0");
        fs.remove_feature("queue_if_no_path");
        assert_eq!(fs.render(), "0", "removing an absent feature is idempotent");
    }

    #[test]
    fn test_feature_set_rejects_whitespace_token() {
        let mut fs = FeatureSet::default();
        assert!(fs.add_feature("two words").is_err());
    }

    #[test]
    fn test_feature_set_parse_defends_against_overlong_count() {
        let fs = FeatureSet::parse("99 only_one_token");
        // Overlong count: the whole string becomes an opaque token list
        // rather than panicking or truncating silently.
        assert_eq!(fs.tokens, vec!["99", "only_one_token"]);
    }

    #[test]
    fn test_assemble_map_create_from_scratch_scenario() {
        let mut paths = Arena::new();
        let ph = paths.insert(Path::new("sdb", (8, 16)));
        let mut map = Multipath::new("3600a098000aaaaaa", "mpatha");
        map.policy = PgPolicy::Multibus;
        map.selector = "service-time 0".into();
        map.minio = 1000;
        map.bestpg = Some(1);
        map.no_path_retry = NoPathRetry::Fail;
        map.pg.push(Pathgroup {
            paths: vec![ph],
            selector: "service-time 0".into(),
            ..Default::default()
        });
        let table = assemble_map(&map, &paths);
        similar_asserts::assert_eq!(table, "0 0 1 1 service-time 0 1 1 8:16 1000");
    }

    #[test]
    fn test_assemble_map_augments_features_for_queueing_and_retained_hwhandler() {
        let mut paths = Arena::new();
        let ph = paths.insert(Path::new("sdb", (8, 16)));
        let mut map = Multipath::new("3600a098000aaaaaa", "mpatha");
        map.minio = 1000;
        map.bestpg = Some(1);
        map.no_path_retry = NoPathRetry::Queue;
        map.retain_hwhandler = true;
        map.pg.push(Pathgroup {
            paths: vec![ph],
            selector: "service-time 0".into(),
            ..Default::default()
        });
        let table = assemble_map(&map, &paths);
        assert!(table.starts_with("2 queue_if_no_path retain_attached_hw_handler "));
    }

    #[test]
    fn test_assemble_map_does_not_augment_for_unresolved_no_path_retry() {
        let mut paths = Arena::new();
        let ph = paths.insert(Path::new("sdb", (8, 16)));
        let mut map = Multipath::new("3600a098000aaaaaa", "mpatha");
        map.minio = 1000;
        map.bestpg = Some(1);
        map.pg.push(Pathgroup {
            paths: vec![ph],
            selector: "service-time 0".into(),
            ..Default::default()
        });
        let table = assemble_map(&map, &paths);
        assert!(table.starts_with("0 0 "));
    }

    #[test]
    fn test_disassemble_roundtrip_selector_and_topology() {
        let table = "0 0 1 1 service-time 0 1 1 8:16 1000";
        let parsed = disassemble_table(table).unwrap();
        assert_eq!(parsed.features, "0");
        assert_eq!(parsed.hwhandler, "0");
        assert_eq!(parsed.nextpg, 1);
        assert_eq!(parsed.pg.len(), 1);
        assert_eq!(parsed.pg[0].selector, "service-time 0");
        assert_eq!(parsed.pg[0].entries, vec![((8, 16), 1000)]);
    }

    #[test]
    fn test_disassemble_reload_two_paths_same_group() {
        let table = "0 0 1 1 service-time 0 2 1 8:16 1000 8:32 1000";
        let parsed = disassemble_table(table).unwrap();
        assert_eq!(parsed.pg[0].entries.len(), 2);
        assert_eq!(parsed.pg[0].entries[1].0, (8, 32));
    }

    #[test]
    fn test_reconcile_appends_uninitialized_path_for_unknown_dev_t() {
        let table = "0 0 1 1 service-time 0 1 1 8:16 1000";
        let parsed = disassemble_table(table).unwrap();
        let mut paths: Arena<Path> = Arena::new();
        let pgs = reconcile_pathgroups(&parsed, &mut paths, |arena, dev_t| {
            arena.iter().find(|(_, p)| p.dev_t == dev_t).map(|(h, _)| h)
        });
        assert_eq!(pgs[0].paths.len(), 1);
        let p = paths.get(pgs[0].paths[0]).unwrap();
        assert_eq!(p.dev_t, (8, 16));
        assert_eq!(p.init_state, InitState::New);
    }

    #[test]
    fn test_malformed_table_truncated_reports_fatal() {
        assert!(disassemble_table("0").is_err());
    }

    #[test]
    fn test_status_roundtrip_sets_pg_and_path_state() {
        let mut paths = Arena::new();
        let ph = paths.insert(Path::new("sdb", (8, 16)));
        let mut map = Multipath::new("W", "mpatha");
        map.pg.push(Pathgroup {
            paths: vec![ph],
            dm_state: crate::multipath::PgState::Active,
            ..Default::default()
        });
        paths.get_mut(ph).unwrap().dm_state = crate::path::DmPathState::Failed;
        paths.get_mut(ph).unwrap().fail_count = 3;
        map.bestpg = Some(1);
        map.nextpg = Some(1);

        let status = format_status(&map, &paths);
        // Reset state, then reparse to confirm it's recovered.
        map.pg[0].dm_state = crate::multipath::PgState::Undef;
        paths.get_mut(ph).unwrap().dm_state = crate::path::DmPathState::Undef;
        paths.get_mut(ph).unwrap().fail_count = 0;

        parse_status(&status, &mut map, &mut paths).unwrap();
        assert_eq!(map.nextpg, Some(1));
        assert_eq!(map.pg[0].dm_state, crate::multipath::PgState::Active);
        let p = paths.get(ph).unwrap();
        assert_eq!(p.dm_state, crate::path::DmPathState::Failed);
        assert_eq!(p.fail_count, 3);
    }
}
