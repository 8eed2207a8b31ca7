//! Path descriptor and sysfs snapshot.

use std::sync::Arc;

use crate::arena::Handle;
use crate::checker::{Checker, Prioritizer, PRIO_UNDEF};
use crate::config::{Config, HardwareEntry};
use crate::multipath::Multipath;

/// Checker-reported path state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathState {
    /// Not yet checked since discovery.
    Wild,
    /// Checker has not run.
    Unchecked,
    /// Path answers I/O.
    Up,
    /// Path does not answer I/O.
    Down,
    /// Path answers intermittently / is flagged marginal.
    Shaky,
    /// Standby/ALUA path that answers but is not the active one.
    Ghost,
    /// A check is in flight.
    Pending,
    /// The last check timed out.
    Timeout,
    /// The underlying device is gone.
    Removed,
    /// The checker asked to defer this path for now.
    Delayed,
}

/// Device-mapper-reported per-path state, distinct from the checker's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DmPathState {
    /// Not yet reported by device-mapper.
    #[default]
    Undef,
    /// Device-mapper has marked this path failed.
    Failed,
    /// Device-mapper considers this path active.
    Active,
}

/// Transport/bus kind a path was discovered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// SCSI transport (FCP, iSCSI, SAS, ...).
    Scsi,
    /// NVMe transport.
    Nvme,
    /// s390 channel command word device.
    Ccw,
    /// HP/Compaq `cciss` RAID controller.
    Cciss,
    /// Transport could not be determined.
    Unknown,
}

/// Lifecycle state of a path's in-memory record, independent of its
/// checker-reported I/O state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    /// Just discovered, `pathinfo` not yet run.
    New,
    /// `pathinfo` failed (e.g. sysfs read error).
    Failed,
    /// Required udev properties were not yet available.
    MissingUdev,
    /// Some fields were populated but not all (bounded I/O mask run).
    Partial,
    /// Fully populated.
    Ok,
    /// Device has disappeared; kept only until no map references it.
    Removed,
}

/// The SCSI address tuple identifying a path's transport location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScsiAddress {
    /// SCSI host number, or [`ScsiAddress::NO_HOST`] for non-SCSI transports.
    pub host: i32,
    /// SCSI channel (bus) number.
    pub channel: i32,
    /// SCSI target id.
    pub target: i32,
    /// SCSI logical unit number.
    pub lun: i64,
}

impl ScsiAddress {
    /// Sentinel meaning "no SCSI host", matching the reference
    /// implementation's `sg_id.host_no == -1` convention ( host-dedup
    /// open question: paths without a host number are never deduplicated).
    pub const NO_HOST: i32 = -1;

    /// False for paths discovered over a transport with no SCSI host number.
    pub fn has_host(&self) -> bool {
        self.host != Self::NO_HOST
    }
}

/// One block device exposing a backend LUN.
#[derive(Debug, Clone)]
pub struct Path {
    /// Devnode basename, e.g. `sdb`.
    pub dev: String,
    /// Major:minor device number.
    pub dev_t: (u32, u32),
    /// SCSI address; `host == NO_HOST` for non-SCSI transports.
    pub sg_id: ScsiAddress,
    /// Transport bus kind.
    pub bus: BusKind,
    /// Protocol id string, e.g. `scsi:fcp`.
    pub protocol: String,
    /// SCSI INQUIRY vendor string.
    pub vendor: String,
    /// SCSI INQUIRY product string.
    pub product: String,
    /// SCSI INQUIRY revision string.
    pub rev: String,
    /// SCSI INQUIRY (VPD page 0x80) serial string; used to key
    /// `group_by_serial`.
    pub serial: String,
    /// World-wide identifier; empty until resolved. Immutable once non-empty.
    pub wwid: String,
    /// Size in 512-byte sectors.
    pub size: u64,
    /// Checker-reported I/O state.
    pub state: PathState,
    /// Device-mapper-reported state, distinct from `state`.
    pub dm_state: DmPathState,
    /// Priority; `PRIO_UNDEF` (-1) until a prioritizer has run.
    pub priority: i32,
    /// Consecutive checker failures.
    pub fail_count: u32,
    /// Index of this path's group within its owning map, if assigned.
    pub pg_index: Option<usize>,
    /// Lifecycle state of this path's in-memory record.
    pub init_state: InitState,
    /// Non-owning back-reference to the map this path belongs to.
    /// `None` means the path is an orphan.
    pub mpp: Option<Handle<Multipath>>,
    /// A path flagged marginal is grouped separately by policies that
    /// support marginal-path splitting.
    pub marginal: bool,
    /// Hardware entries matched against this path's (vendor, product, rev),
    /// most-specific first.
    pub hwe: Vec<Arc<HardwareEntry>>,
    checker: Option<Arc<dyn Checker>>,
    prioritizer: Option<Arc<dyn Prioritizer>>,
}

impl Path {
    /// Construct a freshly discovered path with no resolved identity yet.
    pub fn new(dev: impl Into<String>, dev_t: (u32, u32)) -> Self {
        Self {
            dev: dev.into(),
            dev_t,
            sg_id: ScsiAddress {
                host: ScsiAddress::NO_HOST,
                ..Default::default()
            },
            bus: BusKind::Unknown,
            protocol: String::new(),
            vendor: String::new(),
            product: String::new(),
            rev: String::new(),
            serial: String::new(),
            wwid: String::new(),
            size: 0,
            state: PathState::Unchecked,
            dm_state: DmPathState::Undef,
            priority: PRIO_UNDEF,
            fail_count: 0,
            pg_index: None,
            init_state: InitState::New,
            mpp: None,
            marginal: false,
            hwe: Vec::new(),
            checker: None,
            prioritizer: None,
        }
    }

    /// `major:minor` formatted for the device-mapper target-table.
    pub fn dev_t_string(&self) -> String {
        format!("{}:{}", self.dev_t.0, self.dev_t.1)
    }

    /// Whether this path is eligible for I/O fan-out (PR broadcaster ,
    /// "state up or ghost").
    pub fn is_active(&self) -> bool {
        matches!(self.state, PathState::Up | PathState::Ghost)
    }

    /// A path loses its map back-reference; its checker/prioritizer state is
    /// reset but its wwid is preserved.
    pub fn orphan(&mut self, _reason: &str) {
        self.mpp = None;
        self.pg_index = None;
        self.state = PathState::Unchecked;
        self.priority = PRIO_UNDEF;
        self.checker = None;
        self.prioritizer = None;
    }

    /// True if this path has no owning map.
    pub fn is_orphan(&self) -> bool {
        self.mpp.is_none()
    }
}

/// Tiny helper macro so `PathInfoMask` reads like a real bitflags type
/// without pulling the `bitflags` crate in for five bits.
macro_rules! bitflags_like_mask {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name($repr);

        #[allow(missing_docs)]
        impl $name {
            $(pub const $flag: Self = Self($value);)*

            /// Every flag set.
            pub const ALL: Self = Self($(| $value)*);

            /// True if every bit of `other` is also set in `self`.
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like_mask! {
    /// Bitmask selecting which fields `pathinfo` should (re)populate.
    pub struct PathInfoMask: u32 {
        const SYSFS = 1 << 0;
        const WWID = 1 << 1;
        const FILTER = 1 << 2;
        const CHECKER = 1 << 3;
        const PRIO = 1 << 4;
    }
}

/// Outcome of a `pathinfo` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathInfoOutcome {
    /// All requested fields were populated successfully.
    Ok,
    /// Blacklisted at some axis; the path must not be coalesced.
    Skipped,
    /// A sysfs read failed.
    Failed,
}

/// Minimal sysfs-shaped input to `pathinfo`; in production this is read
/// from `/sys/block/<dev>/device/...`, here it is supplied by the caller
/// (event producers, or tests) since sysfs scanning is explicitly out of
/// scope.
#[derive(Debug, Clone, Default)]
pub struct SysfsSnapshot {
    /// SCSI INQUIRY vendor string.
    pub vendor: String,
    /// SCSI INQUIRY product string.
    pub product: String,
    /// SCSI INQUIRY revision string.
    pub rev: String,
    /// SCSI INQUIRY (VPD page 0x80) serial string.
    pub serial: String,
    /// Resolved world-wide identifier, if any.
    pub wwid: Option<String>,
    /// Size in 512-byte sectors.
    pub size: u64,
    /// Protocol id string, e.g. `scsi:fcp`.
    pub protocol: String,
    /// SCSI address of the underlying device.
    pub sg_id: ScsiAddress,
    /// Transport bus kind, if known.
    pub bus: Option<BusKind>,
    /// udev properties, consulted by the blacklist property axis.
    pub udev_properties: std::collections::HashMap<String, String>,
    /// Wwid derived by a fallback method (e.g. a raw VPD page 0x83 read)
    /// when the primary source (`wwid`, typically a udev property) comes
    /// up empty. Consulted unless `no_fallback` is set.
    pub wwid_fallback: Option<String>,
}

/// Populate `path` from `snapshot` under `mask`, in pipeline order:
/// sysfs -> wwid -> filters -> checker -> prio.
///
/// `no_io` forbids device access: the checker and prioritizer stages are
/// skipped entirely. `no_fallback` is independent of `no_io`: it only
/// suppresses consulting `snapshot.wwid_fallback` when the primary wwid is
/// unresolved, leaving the path's wwid empty instead.
pub fn pathinfo(
    path: &mut Path,
    config: &Config,
    snapshot: &SysfsSnapshot,
    mask: PathInfoMask,
    no_io: bool,
    no_fallback: bool,
) -> PathInfoOutcome {
    if mask.contains(PathInfoMask::SYSFS) {
        path.vendor = snapshot.vendor.clone();
        path.product = snapshot.product.clone();
        path.rev = snapshot.rev.clone();
        path.serial = snapshot.serial.clone();
        path.size = snapshot.size;
        path.protocol = snapshot.protocol.clone();
        path.sg_id = snapshot.sg_id;
        path.bus = snapshot.bus.unwrap_or(BusKind::Unknown);
    }

    if mask.contains(PathInfoMask::WWID) {
        match &snapshot.wwid {
            Some(w) if !w.is_empty() => path.wwid = w.clone(),
            _ => match &snapshot.wwid_fallback {
                Some(w) if !w.is_empty() && !no_fallback => {
                    tracing::debug!(dev = %path.dev, "wwid resolved via fallback");
                    path.wwid = w.clone();
                }
                _ => {
                    tracing::debug!(dev = %path.dev, "no wwid resolved for path");
                }
            },
        }
    }

    if mask.contains(PathInfoMask::FILTER) {
        let verdict = config.blacklist.check_path(path, &snapshot.udev_properties);
        if verdict.is_blacklisted() {
            tracing::debug!(dev = %path.dev, axis = ?verdict, "path blacklisted");
            path.init_state = InitState::Failed;
            return PathInfoOutcome::Skipped;
        }
    }

    path.hwe = config.match_hwe(&path.vendor, &path.product, &path.rev);

    if mask.contains(PathInfoMask::CHECKER) && !no_io {
        let checker_name = config.select_checker(path.wwid.as_str(), &path.hwe);
        let checker = crate::checker::registry().checker(&checker_name);
        if let Some(c) = checker {
            path.state = c.check(-1);
            path.checker = Some(c);
        } else {
            tracing::warn!(checker = %checker_name, "unknown checker, leaving path unchecked");
        }
    }

    if mask.contains(PathInfoMask::PRIO) && !no_io {
        let prio_name = config.select_prio(path.wwid.as_str(), &path.hwe);
        let prioritizer = crate::checker::registry().prioritizer(&prio_name);
        if let Some(p) = prioritizer {
            path.priority = p.get_prio(-1);
            path.prioritizer = Some(p);
        }
    }

    path.init_state = InitState::Ok;
    PathInfoOutcome::Ok
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_new_path_defaults() {
        let p = Path::new("sdb", (8, 16));
        assert_eq!(p.dev_t_string(), "8:16");
        assert_eq!(p.priority, PRIO_UNDEF);
        assert!(p.is_orphan());
        assert!(!p.is_active());
    }

    #[test]
    fn test_orphan_preserves_wwid() {
        let mut p = Path::new("sdb", (8, 16));
        p.wwid = "3600a098000aaaaaa".into();
        p.priority = 10;
        p.orphan("device removed");
        assert_eq!(p.wwid, "3600a098000aaaaaa");
        assert_eq!(p.priority, PRIO_UNDEF);
        assert!(p.is_orphan());
    }

    #[test]
    fn test_pathinfo_populates_and_checks() {
        let config = Config::builtin_defaults();
        let mut path = Path::new("sdb", (8, 16));
        let snapshot = SysfsSnapshot {
            vendor: "ACME".into(),
            product: "STORAGE".into(),
            rev: "1.0".into(),
            wwid: Some("3600a098000aaaaaa".into()),
            size: 2048,
            protocol: "scsi:fcp".into(),
            ..Default::default()
        };
        let outcome = pathinfo(&mut path, &config, &snapshot, PathInfoMask::ALL, false, false);
        assert_eq!(outcome, PathInfoOutcome::Ok);
        assert_eq!(path.wwid, "3600a098000aaaaaa");
        assert_eq!(path.state, PathState::Up);
        assert_eq!(path.priority, 1);
    }

    #[test]
    fn test_pathinfo_uses_wwid_fallback_when_primary_missing() {
        let config = Config::builtin_defaults();
        let mut path = Path::new("sdb", (8, 16));
        let snapshot = SysfsSnapshot {
            wwid_fallback: Some("3600a098000bbbbbb".into()),
            ..Default::default()
        };
        pathinfo(&mut path, &config, &snapshot, PathInfoMask::WWID, true, false);
        assert_eq!(path.wwid, "3600a098000bbbbbb");
    }

    #[test]
    fn test_pathinfo_no_fallback_suppresses_fallback_wwid() {
        let config = Config::builtin_defaults();
        let mut path = Path::new("sdb", (8, 16));
        let snapshot = SysfsSnapshot {
            wwid_fallback: Some("3600a098000bbbbbb".into()),
            ..Default::default()
        };
        pathinfo(&mut path, &config, &snapshot, PathInfoMask::WWID, true, true);
        assert!(path.wwid.is_empty());
    }

    #[test]
    fn test_pathinfo_no_io_skips_checker_and_prio() {
        let config = Config::builtin_defaults();
        let mut path = Path::new("sdb", (8, 16));
        let snapshot = SysfsSnapshot {
            wwid: Some("3600a098000aaaaaa".into()),
            ..Default::default()
        };
        pathinfo(&mut path, &config, &snapshot, PathInfoMask::ALL, true, false);
        assert_eq!(path.state, PathState::Unchecked);
        assert_eq!(path.priority, PRIO_UNDEF);
    }
}
