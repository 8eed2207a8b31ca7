//! Persistent reservation broadcaster.
//!
//! The SCSI PRIN/PROUT protocol this module implements operates against a
//! single shared backend LUN reached through several device nodes (the
//! paths of one multipath map). PRIN calls are read-only and any one
//! reachable path answers authoritatively; PROUT calls that register a key
//! must be issued on every active path in parallel, via `std::thread::scope`
//! ( - no async runtime, the crate's only fan-out concurrency).
//!
//! [`ScsiTransport`] is this module's seam, playing the same role for SCSI
//! passthrough that [`crate::dm::DmClient`] plays for device-mapper: one
//! production implementation issuing real `ioctl`s, one in-memory fake used
//! by this module's own tests and by callers exercising the reconciliation
//! engine end to end.

use std::sync::Mutex;

use thiserror::Error;

use crate::arena::Arena;
use crate::multipath::Multipath;
use crate::path::Path;
use crate::store::FileKvStore;

/// PRIN service actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinAction {
    ReadKeys,
    ReadReservation,
    ReadCapabilities,
    ReadFullStatus,
}

/// PROUT service actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProutAction {
    Register,
    Reserve,
    Release,
    Clear,
    Preempt,
    PreemptAbort,
    RegisterAndIgnore,
    RegisterAndMove,
}

/// One entry of a PRIN READ FULL STATUS response.
#[derive(Debug, Clone, Default)]
pub struct Registrant {
    pub key: u64,
    pub all_tg_pt: bool,
    /// Opaque SCSI transport-id blob, reusable verbatim as the
    /// `TransportID` field of a subsequent `REGISTER` with `SPEC_I_PT` set
    /// during release's reservation-holder reconstruction.
    pub transport_id: Vec<u8>,
}

/// Response payload for a PRIN call.
#[derive(Debug, Clone, Default)]
pub struct PrinData {
    pub generation: u32,
    pub reservation_holder_key: Option<u64>,
    pub reservation_type: Option<u8>,
    pub registrants: Vec<Registrant>,
}

/// Parameter block for a PROUT call.
///
/// `key` is the "reservation key" field (the key the initiator currently
/// holds, presented for authentication); `sa_key` is the "service action
/// reservation key" field (the new key being registered, or zero to
/// unregister). A fresh registration has `key == 0, sa_key == new_key`; an
/// unregister/rollback swaps the two and zeroes the new key.
#[derive(Debug, Clone, Default)]
pub struct ProutParams {
    pub key: u64,
    pub sa_key: u64,
    pub scope: u8,
    pub pr_type: u8,
    pub all_tg_pt: bool,
    pub aptpl: bool,
    /// Specify-initiator-ports: carry an explicit transport-id list. Cleared
    /// by the broadcaster on every task after the first in a multi-path
    /// register fan-out, since only one task need resubmit it.
    pub spec_i_pt: bool,
    pub transport_ids: Vec<Vec<u8>>,
}

/// Sense-key category driving the retry policy (unit attention
/// retries immediately up to 5 times; not-ready-becoming-ready sleeps 1ms
/// between up to 5 retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    UnitAttention,
    NotReady,
}

/// Failure modes a [`ScsiTransport`] call can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrError {
    #[error("reservation conflict")]
    ReservationConflict,
    #[error("illegal request: {0}")]
    IllegalRequest(String),
    #[error("transient: {0:?}")]
    Transient(TransientKind),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Final, merged status of a broadcast operation, ranked for precedence
/// (reservation-conflict outranks every other failure, which in turn
/// outranks success).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrOutcome {
    Success,
    Transient,
    IllegalRequest,
    Fatal(String),
    ReservationConflict,
}

impl PrOutcome {
    fn rank(&self) -> u8 {
        match self {
            PrOutcome::Success => 0,
            PrOutcome::Transient => 1,
            PrOutcome::IllegalRequest => 2,
            PrOutcome::Fatal(_) => 3,
            PrOutcome::ReservationConflict => 4,
        }
    }
}

impl From<Result<(), PrError>> for PrOutcome {
    fn from(r: Result<(), PrError>) -> Self {
        match r {
            Ok(()) => PrOutcome::Success,
            Err(PrError::ReservationConflict) => PrOutcome::ReservationConflict,
            Err(PrError::IllegalRequest(_)) => PrOutcome::IllegalRequest,
            Err(PrError::Transient(_)) => PrOutcome::Transient,
            Err(PrError::Fatal(m)) => PrOutcome::Fatal(m),
        }
    }
}

fn merge_worst(outcomes: impl Iterator<Item = PrOutcome>) -> PrOutcome {
    outcomes.max_by_key(|o| o.rank()).unwrap_or(PrOutcome::Success)
}

/// The seam between the protocol logic in this module and a real or fake
/// SCSI passthrough backend, addressed by device number so the broadcaster
/// never has to open paths itself.
pub trait ScsiTransport: Send + Sync {
    fn prin(&self, dev_t: (u32, u32), action: PrinAction) -> Result<PrinData, PrError>;
    fn prout(&self, dev_t: (u32, u32), action: ProutAction, params: &ProutParams) -> Result<(), PrError>;
}

const MAX_RETRIES: u32 = 5;

fn with_retry<T>(mut f: impl FnMut() -> Result<T, PrError>) -> Result<T, PrError> {
    let mut attempts = 0;
    loop {
        match f() {
            Err(PrError::Transient(kind)) if attempts < MAX_RETRIES => {
                attempts += 1;
                if kind == TransientKind::NotReady {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
            other => return other,
        }
    }
}

/// Paths eligible to carry a PRIN/PROUT call: state up or ghost.
fn eligible_paths<'a>(map: &Multipath, paths: &'a Arena<Path>) -> Vec<&'a Path> {
    map.pg
        .iter()
        .flat_map(|pg| &pg.paths)
        .filter_map(|&h| paths.get(h))
        .filter(|p| p.is_active())
        .collect()
}

/// Eligible paths, optionally deduplicated by SCSI host adapter when
/// `all_tg_pt` is set. Paths with no host number (`NO_HOST`) are never
/// deduplicated, verbatim.
fn active_paths_for_register<'a>(map: &Multipath, paths: &'a Arena<Path>, all_tg_pt: bool) -> Vec<&'a Path> {
    let mut out = Vec::new();
    let mut seen_hosts = std::collections::HashSet::new();
    for p in eligible_paths(map, paths) {
        if all_tg_pt && p.sg_id.has_host() && !seen_hosts.insert(p.sg_id.host) {
            continue;
        }
        out.push(p);
    }
    out
}

/// PRIN fan-out: iterate pathgroups then paths, issue the call on
/// the first eligible path; retry the SCSI-level retry policy per path but
/// move on to the next path on any other error, returning the last
/// non-illegal-request error if every path failed.
pub fn prin_fanout(
    map: &Multipath,
    paths: &Arena<Path>,
    transport: &dyn ScsiTransport,
    action: PrinAction,
) -> Result<PrinData, PrError> {
    let mut last_err: Option<PrError> = None;
    for p in eligible_paths(map, paths) {
        match with_retry(|| transport.prin(p.dev_t, action)) {
            Ok(data) => return Ok(data),
            Err(e @ PrError::IllegalRequest(_)) => return Err(e),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| PrError::Fatal("no eligible paths".into())))
}

struct WorkerResult {
    outcome: Result<(), PrError>,
}

/// Fan out one PROUT call to every path in `targets` concurrently via
/// `std::thread::scope`. Only the first task in iteration order keeps
/// `spec_i_pt` set; later tasks clear it so the transport-id list is not
/// resubmitted on every path.
fn dispatch_fanout(
    targets: &[&Path],
    transport: &dyn ScsiTransport,
    action: ProutAction,
    params: &ProutParams,
) -> Vec<WorkerResult> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut per_task = params.clone();
                if i > 0 {
                    per_task.spec_i_pt = false;
                }
                let dev_t = p.dev_t;
                scope.spawn(move || WorkerResult {
                    outcome: with_retry(|| transport.prout(dev_t, action, &per_task)),
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or(WorkerResult {
                    outcome: Err(PrError::Fatal("worker thread panicked".into())),
                })
            })
            .collect()
    })
}

fn rollback_params(original: &ProutParams) -> ProutParams {
    let mut p = original.clone();
    std::mem::swap(&mut p.key, &mut p.sa_key);
    p.sa_key = 0;
    p
}

/// `register`/`register-and-ignore`: fan out to every active path
/// (deduplicated by host when `all_tg_pt`); if any task reports a
/// reservation conflict and we were registering a new (non-zero) key, roll
/// the whole operation back by re-issuing the unregister parameter block
/// (key and sa_key swapped, new key zeroed) on the slots that had
/// succeeded.
pub fn register(
    map: &Multipath,
    paths: &Arena<Path>,
    transport: &dyn ScsiTransport,
    action: ProutAction,
    params: ProutParams,
) -> PrOutcome {
    let active = active_paths_for_register(map, paths, params.all_tg_pt);
    if active.is_empty() {
        return PrOutcome::Fatal("no active paths for register".into());
    }

    let results = dispatch_fanout(&active, transport, action, &params);
    let any_conflict = results.iter().any(|r| matches!(r.outcome, Err(PrError::ReservationConflict)));

    if any_conflict && params.sa_key != 0 {
        let rollback_targets: Vec<&Path> = active
            .iter()
            .zip(results.iter())
            .filter(|(_, r)| r.outcome.is_ok())
            .map(|(p, _)| *p)
            .collect();
        if !rollback_targets.is_empty() {
            let _ = dispatch_fanout(&rollback_targets, transport, action, &rollback_params(&params));
        }
        return PrOutcome::ReservationConflict;
    }

    merge_worst(results.into_iter().map(|r| PrOutcome::from(r.outcome)))
}

/// `reserve`/`clear`/`preempt`/`preempt-abort`: issued once, on the
/// first eligible path.
pub fn single_path_prout(
    map: &Multipath,
    paths: &Arena<Path>,
    transport: &dyn ScsiTransport,
    action: ProutAction,
    params: &ProutParams,
) -> PrOutcome {
    for p in eligible_paths(map, paths) {
        let outcome = with_retry(|| transport.prout(p.dev_t, action, params));
        return PrOutcome::from(outcome);
    }
    PrOutcome::Fatal("no active path".into())
}

/// `release`: fan out release to every active path as with
/// register, then check whether the reservation is actually gone. If a
/// foreign registrant still holds it, transfer each foreign registration to
/// us (register with its transport-id via `SPEC_I_PT`, then zero its key
/// out) before re-registering our own key on every active path.
///
/// The initial fan-out issues `Release` (not `Clear`): a reservation-holder
/// recovery scenario sometimes describes this step loosely as "clear", but
/// a plain release is sufficient to drop our own reservation before probing
/// for a foreign one.
pub fn release(map: &Multipath, paths: &Arena<Path>, transport: &dyn ScsiTransport, params: &ProutParams) -> PrOutcome {
    let active = active_paths_for_register(map, paths, params.all_tg_pt);
    if active.is_empty() {
        return PrOutcome::Fatal("no active paths for release".into());
    }

    let release_results = dispatch_fanout(&active, transport, ProutAction::Release, params);

    match prin_fanout(map, paths, transport, PrinAction::ReadReservation) {
        Ok(data) if data.reservation_holder_key.is_none() => {
            merge_worst(release_results.into_iter().map(|r| PrOutcome::from(r.outcome)))
        }
        Ok(_) => {
            let status = match prin_fanout(map, paths, transport, PrinAction::ReadFullStatus) {
                Ok(s) => s,
                Err(e) => return PrOutcome::from(Err(e)),
            };
            for reg in status.registrants.iter().filter(|r| r.key != params.key) {
                let mut transfer = params.clone();
                transfer.spec_i_pt = true;
                transfer.sa_key = reg.key;
                transfer.transport_ids = vec![reg.transport_id.clone()];
                let _ = register(map, paths, transport, ProutAction::RegisterAndIgnore, transfer);

                let mut unregister = params.clone();
                unregister.key = reg.key;
                unregister.sa_key = 0;
                let _ = register(map, paths, transport, ProutAction::Register, unregister);
            }

            let mut reregister = params.clone();
            reregister.key = 0;
            reregister.sa_key = params.key;
            register(map, paths, transport, ProutAction::Register, reregister)
        }
        Err(e) => PrOutcome::from(Err(e)),
    }
}

/// Post-action persistence bookkeeping: called by the reconciliation
/// loop after `register` returns success.
pub fn bookkeep_register(map_wwid: &str, prkeys: &FileKvStore, new_key: u64) {
    if new_key == 0 {
        if let Ok(Some(old_key)) = prkeys.find_key_for_value(map_wwid) {
            let _ = prkeys.remove(&old_key);
        }
    } else {
        let _ = prkeys.insert(&format!("{new_key:x}"), map_wwid);
    }
}

/// Clears the persistence record for `map_wwid` after a successful
/// `clear` or `preempt-abort`.
pub fn bookkeep_clear_or_preempt_abort(map_wwid: &str, prkeys: &FileKvStore) {
    if let Ok(Some(old_key)) = prkeys.find_key_for_value(map_wwid) {
        let _ = prkeys.remove(&old_key);
    }
}

/// Cross-check the configured key actually appears in the kernel's
/// read-keys output and set `map.prflag` accordingly ( `update_map_pr`).
pub fn update_map_pr(map: &mut Multipath, paths: &Arena<Path>, transport: &dyn ScsiTransport) {
    let Some(configured_key) = map.reservation_key else {
        map.prflag = false;
        return;
    };
    map.prflag = match prin_fanout(map, paths, transport, PrinAction::ReadKeys) {
        Ok(data) => {
            data.registrants.iter().any(|r| r.key == configured_key)
                || data.reservation_holder_key == Some(configured_key)
        }
        Err(_) => false,
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::multipath::Pathgroup;
    use crate::path::PathState;
    use std::collections::HashMap;

    #[derive(Default)]
    struct LunState {
        registrants: HashMap<u64, Registrant>,
        reservation_holder: Option<u64>,
    }

    /// A fake SCSI transport simulating one shared backend LUN, with
    /// per-path scripted one-shot failures for exercising retry/rollback.
    #[derive(Default)]
    struct FakeScsiTransport {
        lun: Mutex<LunState>,
        scripted: Mutex<HashMap<(u32, u32), PrError>>,
        call_log: Mutex<Vec<(u32, u32, &'static str)>>,
    }

    impl FakeScsiTransport {
        fn script_once(&self, dev_t: (u32, u32), err: PrError) {
            self.scripted.lock().unwrap().insert(dev_t, err);
        }

        fn calls(&self) -> Vec<(u32, u32, &'static str)> {
            self.call_log.lock().unwrap().clone()
        }

        fn take_scripted(&self, dev_t: (u32, u32)) -> Option<PrError> {
            self.scripted.lock().unwrap().remove(&dev_t)
        }
    }

    impl ScsiTransport for FakeScsiTransport {
        fn prin(&self, _dev_t: (u32, u32), action: PrinAction) -> Result<PrinData, PrError> {
            let lun = self.lun.lock().unwrap();
            Ok(match action {
                PrinAction::ReadReservation => PrinData {
                    reservation_holder_key: lun.reservation_holder,
                    ..Default::default()
                },
                PrinAction::ReadFullStatus => PrinData {
                    registrants: lun.registrants.values().cloned().collect(),
                    ..Default::default()
                },
                PrinAction::ReadKeys => PrinData {
                    registrants: lun.registrants.values().cloned().collect(),
                    reservation_holder_key: lun.reservation_holder,
                    ..Default::default()
                },
                PrinAction::ReadCapabilities => PrinData::default(),
            })
        }

        fn prout(&self, dev_t: (u32, u32), action: ProutAction, params: &ProutParams) -> Result<(), PrError> {
            self.call_log.lock().unwrap().push((dev_t.0, dev_t.1, "prout"));
            if let Some(err) = self.take_scripted(dev_t) {
                return Err(err);
            }
            let mut lun = self.lun.lock().unwrap();
            match action {
                ProutAction::Register | ProutAction::RegisterAndIgnore => {
                    if params.sa_key == 0 {
                        lun.registrants.remove(&params.key);
                    } else {
                        lun.registrants.insert(
                            params.sa_key,
                            Registrant {
                                key: params.sa_key,
                                all_tg_pt: params.all_tg_pt,
                                transport_id: Vec::new(),
                            },
                        );
                    }
                    Ok(())
                }
                ProutAction::Reserve => {
                    lun.reservation_holder = Some(params.key);
                    Ok(())
                }
                ProutAction::Release => {
                    if lun.reservation_holder == Some(params.key) {
                        lun.reservation_holder = None;
                    }
                    Ok(())
                }
                ProutAction::Clear => {
                    lun.reservation_holder = None;
                    lun.registrants.clear();
                    Ok(())
                }
                ProutAction::Preempt | ProutAction::PreemptAbort | ProutAction::RegisterAndMove => Ok(()),
            }
        }
    }

    fn active_path(dev: &str, dev_t: (u32, u32)) -> Path {
        let mut p = Path::new(dev, dev_t);
        p.state = PathState::Up;
        p
    }

    fn map_with_paths(paths: &mut Arena<Path>, devs: &[(&str, (u32, u32))]) -> (Multipath, Vec<crate::arena::Handle<Path>>) {
        let mut map = Multipath::new("W1", "mpatha");
        let mut handles = Vec::new();
        for (dev, dev_t) in devs {
            handles.push(paths.insert(active_path(dev, *dev_t)));
        }
        map.pg.push(Pathgroup {
            paths: handles.clone(),
            ..Default::default()
        });
        (map, handles)
    }

    #[test]
    fn test_register_succeeds_on_all_paths() {
        let mut paths = Arena::new();
        let (map, _) = map_with_paths(&mut paths, &[("a", (8, 0)), ("b", (8, 16)), ("c", (8, 32))]);
        let transport = FakeScsiTransport::default();
        let outcome = register(
            &map,
            &paths,
            &transport,
            ProutAction::Register,
            ProutParams {
                sa_key: 0xABC,
                ..Default::default()
            },
        );
        assert_eq!(outcome, PrOutcome::Success);
        assert_eq!(transport.lun.lock().unwrap().registrants.len(), 1);
    }

    #[test]
    fn test_register_rolls_back_on_conflict_scenario_5() {
        let mut paths = Arena::new();
        let (map, handles) = map_with_paths(&mut paths, &[("a", (8, 0)), ("b", (8, 16)), ("c", (8, 32))]);
        let transport = FakeScsiTransport::default();
        let c_dev_t = paths.get(handles[2]).unwrap().dev_t;
        transport.script_once(c_dev_t, PrError::ReservationConflict);

        let outcome = register(
            &map,
            &paths,
            &transport,
            ProutAction::Register,
            ProutParams {
                sa_key: 0xCAB,
                ..Default::default()
            },
        );
        assert_eq!(outcome, PrOutcome::ReservationConflict);
        // A and B succeeded, then were rolled back: no registrant remains.
        assert!(transport.lun.lock().unwrap().registrants.is_empty());
    }

    #[test]
    fn test_single_path_reserve_uses_first_active_path() {
        let mut paths = Arena::new();
        let (map, _) = map_with_paths(&mut paths, &[("a", (8, 0)), ("b", (8, 16))]);
        let transport = FakeScsiTransport::default();
        let outcome = single_path_prout(
            &map,
            &paths,
            &transport,
            ProutAction::Reserve,
            &ProutParams {
                key: 0x1,
                ..Default::default()
            },
        );
        assert_eq!(outcome, PrOutcome::Success);
        assert_eq!(transport.lun.lock().unwrap().reservation_holder, Some(0x1));
    }

    #[test]
    fn test_release_when_reservation_already_gone() {
        let mut paths = Arena::new();
        let (map, _) = map_with_paths(&mut paths, &[("a", (8, 0))]);
        let transport = FakeScsiTransport::default();
        let outcome = release(
            &map,
            &paths,
            &transport,
            &ProutParams {
                key: 0x1,
                ..Default::default()
            },
        );
        assert_eq!(outcome, PrOutcome::Success);
    }

    #[test]
    fn test_release_transfers_foreign_registrant_scenario_6() {
        let mut paths = Arena::new();
        let (map, _) = map_with_paths(&mut paths, &[("b", (8, 16))]);
        let transport = FakeScsiTransport::default();
        {
            let mut lun = transport.lun.lock().unwrap();
            lun.reservation_holder = Some(0xD);
            lun.registrants.insert(
                0xD,
                Registrant {
                    key: 0xD,
                    all_tg_pt: false,
                    transport_id: vec![1, 2, 3],
                },
            );
        }

        let outcome = release(
            &map,
            &paths,
            &transport,
            &ProutParams {
                key: 0xCAB,
                ..Default::default()
            },
        );
        assert_eq!(outcome, PrOutcome::Success);
        let lun = transport.lun.lock().unwrap();
        assert!(!lun.registrants.contains_key(&0xD));
        assert!(lun.registrants.contains_key(&0xCAB));
        assert!(!transport.calls().is_empty());
    }

    #[test]
    fn test_merge_worst_prefers_reservation_conflict() {
        let merged = merge_worst(
            vec![PrOutcome::Success, PrOutcome::ReservationConflict, PrOutcome::Fatal("x".into())].into_iter(),
        );
        assert_eq!(merged, PrOutcome::ReservationConflict);
    }

    #[test]
    fn test_with_retry_gives_up_after_five_attempts() {
        let mut calls = 0;
        let result: Result<(), PrError> = with_retry(|| {
            calls += 1;
            Err(PrError::Transient(TransientKind::UnitAttention))
        });
        assert!(result.is_err());
        assert_eq!(calls, MAX_RETRIES + 1);
    }

    #[test]
    fn test_update_map_pr_sets_prflag_when_key_present() {
        let mut paths = Arena::new();
        let (mut map, _) = map_with_paths(&mut paths, &[("a", (8, 0))]);
        map.reservation_key = Some(0x99);
        let transport = FakeScsiTransport::default();
        transport.lun.lock().unwrap().reservation_holder = Some(0x99);
        update_map_pr(&mut map, &paths, &transport);
        assert!(map.prflag);
    }

    #[test]
    fn test_bookkeep_register_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let prkeys = crate::store::prkeys_store(dir.path().join("prkeys"));
        bookkeep_register("W1", &prkeys, 0x42);
        assert_eq!(prkeys.lookup("42").unwrap().as_deref(), Some("W1"));
        bookkeep_register("W1", &prkeys, 0);
        assert_eq!(prkeys.find_key_for_value("W1").unwrap(), None);
    }
}
