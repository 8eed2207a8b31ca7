//! Kernel device-mapper client.
//!
//! A typed wrapper over the handful of device-mapper ioctls the
//! reconciliation engine needs, behind a trait so the action selector and
//! the PR broadcaster's map lookups can be exercised without a running
//! kernel: one production implementation issuing real ioctls, and one
//! in-memory fake used by both their test suites.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// All multipath map uuids are the wwid with this fixed prefix.
pub const UUID_PREFIX: &str = "mpath-";

/// Derive a multipath map's device-mapper uuid from its wwid.
pub fn map_uuid(wwid: &str) -> String {
    format!("{UUID_PREFIX}{wwid}")
}

/// Failure semantics for a device-mapper call: every call returns
/// one of {ok, not-found, error}. `NotFound` is not folded into a generic
/// "not present" variant because callers (flush vs. reconcile) each decide
/// locally whether it means success or "go create it", and that branch
/// should stay visible at the call site rather than be hidden in the error
/// type.
#[derive(Debug, Error)]
pub enum DmError {
    /// The queried map or device does not exist.
    #[error("device-mapper object not found: {0}")]
    NotFound(String),
    /// The target is open or otherwise in use.
    #[error("device-mapper target busy: {0}")]
    Busy(String),
    /// Any other ioctl or kernel failure; the operation must be aborted.
    #[error("device-mapper error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl DmError {
    /// True when this error is [`DmError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, DmError::NotFound(_))
    }
}

/// Flags passed to `DEVICE_RESUME`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeFlags {
    /// Set after a reload whose table failed to load, to force the kernel
    /// to pick the inactive (just-loaded) table back up.
    pub reload: bool,
}

/// Response to `DEVICE_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmInfo {
    /// Number of open file descriptors referencing the map.
    pub open_count: u32,
    /// Number of targets in the currently loaded table.
    pub target_count: u32,
    /// The map's major:minor device number.
    pub dev_t: (u32, u32),
    /// True if the map is currently suspended (I/O held).
    pub suspended: bool,
    /// True when an event is pending (`DM_UEVENT_GENERATED_FLAG`-equivalent).
    pub event_nr: u32,
}

/// One entry of `get_maps_of_target_type`/`remove_partmaps_of`: a device's
/// name alongside the target type and table of its first target, which is
/// all the engine needs to recognize a `linear` partition map pointing
/// back at a multipath device ("Partition maps are recognized by the
/// kernel target type being `linear` with a table that references the
/// multipath's major:minor").
#[derive(Debug, Clone)]
pub struct DmMapSummary {
    /// The device-mapper map name.
    pub name: String,
    /// The device-mapper map uuid.
    pub uuid: String,
    /// The first target's type string (e.g. `"linear"`, `"multipath"`).
    pub target_type: String,
    /// The first target's raw parameter string.
    pub table: String,
    /// The map's major:minor device number.
    pub dev_t: (u32, u32),
}

/// Operations exposed by the kernel device-mapper client.
pub trait DmClient: Send + Sync {
    /// Create a new map with an initial table.
    fn create(&self, name: &str, uuid: &str, table: &str) -> Result<(), DmError>;
    /// Load a new (inactive) table for an existing map.
    fn reload(&self, name: &str, table: &str) -> Result<(), DmError>;
    /// Swap the inactive table in and resume I/O.
    fn resume(&self, name: &str, flags: ResumeFlags) -> Result<(), DmError>;
    /// Rename an existing map.
    fn rename(&self, old: &str, new: &str) -> Result<(), DmError>;
    /// Remove a map entirely.
    fn remove(&self, name: &str) -> Result<(), DmError>;
    /// Send a target message (e.g. `fail_path`, `switch_group`).
    fn message(&self, name: &str, text: &str) -> Result<(), DmError>;
    /// Fetch the kernel-reported status string for a map.
    fn status(&self, name: &str) -> Result<String, DmError>;
    /// Fetch the currently active table string for a map.
    fn table(&self, name: &str) -> Result<String, DmError>;
    /// Fetch summary info (open count, suspended state, dev_t) for a map.
    fn info(&self, name: &str) -> Result<DmInfo, DmError>;
    /// List every map whose first target has the given target type.
    fn maps_of_target_type(&self, target_type: &str) -> Result<Vec<DmMapSummary>, DmError>;
    /// Look up a map's current name by its uuid, if it exists.
    fn name_by_uuid(&self, uuid: &str) -> Result<Option<String>, DmError>;
    /// Look up a map's current name by its major:minor device number.
    fn name_by_devnum(&self, dev_t: (u32, u32)) -> Result<Option<String>, DmError>;

    /// Remove every `linear` partition map referencing `name`'s major:minor
    /// device number. The default implementation is expressed entirely in
    /// terms of the other trait methods so a fake and a real backend share
    /// it.
    fn remove_partmaps_of(&self, name: &str) -> Result<(), DmError> {
        let info = self.info(name)?;
        for m in self.maps_of_target_type("linear")? {
            if m.target_type == "linear" && table_references(&m.table, info.dev_t) {
                self.remove(&m.name)?;
            }
        }
        Ok(())
    }
}

fn table_references(table: &str, dev_t: (u32, u32)) -> bool {
    let needle = format!("{}:{}", dev_t.0, dev_t.1);
    table.split_whitespace().any(|tok| tok == needle)
}

/// Convenience messages.
/// Mark a path as failed.
pub fn msg_fail_path(dev_t: (u32, u32)) -> String {
    format!("fail_path {}:{}", dev_t.0, dev_t.1)
}
/// Reinstate a previously failed path.
pub fn msg_reinstate_path(dev_t: (u32, u32)) -> String {
    format!("reinstate_path {}:{}", dev_t.0, dev_t.1)
}
/// Enable queueing when no path is up.
pub fn msg_queue_if_no_path() -> &'static str {
    "queue_if_no_path"
}
/// Fail I/O immediately when no path is up.
pub fn msg_fail_if_no_path() -> &'static str {
    "fail_if_no_path"
}
/// Switch the active pathgroup to the `n`th group (1-based).
pub fn msg_switch_group(n: usize) -> String {
    format!("switch_group {n}")
}
/// Enable the `n`th pathgroup (1-based).
pub fn msg_enable_group(n: usize) -> String {
    format!("enable_group {n}")
}
/// Disable the `n`th pathgroup (1-based).
pub fn msg_disable_group(n: usize) -> String {
    format!("disable_group {n}")
}

#[derive(Debug, Clone)]
struct FakeMap {
    uuid: String,
    table: String,
    status: String,
    suspended: bool,
    dev_t: (u32, u32),
    open_count: u32,
}

/// In-memory [`DmClient`] used by the action selector's and the PR
/// broadcaster's test suites. Backed by a `Mutex` (not `RefCell`) so it can
/// also stand in for the real client inside the PR broadcaster's
/// `std::thread::scope` fan-out tests.
#[derive(Debug, Default)]
pub struct FakeDmClient {
    maps: Mutex<HashMap<String, FakeMap>>,
    next_minor: Mutex<u32>,
}

impl FakeDmClient {
    /// A fresh, empty fake client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a map as if it had already been created, with a
    /// caller-chosen status string (used to set up end-to-end reconciliation
    /// fixtures without going through `create`).
    pub fn seed(&self, name: &str, uuid: &str, table: &str, status: &str) {
        let dev_t = self.allocate_devt();
        self.maps.lock().unwrap().insert(
            name.to_string(),
            FakeMap {
                uuid: uuid.to_string(),
                table: table.to_string(),
                status: status.to_string(),
                suspended: false,
                dev_t,
                open_count: 0,
            },
        );
    }

    fn allocate_devt(&self) -> (u32, u32) {
        let mut n = self.next_minor.lock().unwrap();
        *n += 1;
        (253, *n)
    }
}

impl DmClient for FakeDmClient {
    fn create(&self, name: &str, uuid: &str, table: &str) -> Result<(), DmError> {
        let mut maps = self.maps.lock().unwrap();
        if maps.contains_key(name) {
            return Err(DmError::Fatal(anyhow::anyhow!("map '{name}' already exists")));
        }
        let dev_t = self.allocate_devt();
        maps.insert(
            name.to_string(),
            FakeMap {
                uuid: uuid.to_string(),
                table: table.to_string(),
                status: String::new(),
                suspended: true,
                dev_t,
                open_count: 0,
            },
        );
        Ok(())
    }

    fn reload(&self, name: &str, table: &str) -> Result<(), DmError> {
        let mut maps = self.maps.lock().unwrap();
        let m = maps
            .get_mut(name)
            .ok_or_else(|| DmError::NotFound(name.to_string()))?;
        m.table = table.to_string();
        Ok(())
    }

    fn resume(&self, name: &str, _flags: ResumeFlags) -> Result<(), DmError> {
        let mut maps = self.maps.lock().unwrap();
        let m = maps
            .get_mut(name)
            .ok_or_else(|| DmError::NotFound(name.to_string()))?;
        m.suspended = false;
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<(), DmError> {
        let mut maps = self.maps.lock().unwrap();
        if maps.contains_key(new) {
            return Err(DmError::Fatal(anyhow::anyhow!("map '{new}' already exists")));
        }
        let m = maps.remove(old).ok_or_else(|| DmError::NotFound(old.to_string()))?;
        maps.insert(new.to_string(), m);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), DmError> {
        let mut maps = self.maps.lock().unwrap();
        maps.remove(name).ok_or_else(|| DmError::NotFound(name.to_string()))?;
        Ok(())
    }

    fn message(&self, name: &str, text: &str) -> Result<(), DmError> {
        let mut maps = self.maps.lock().unwrap();
        let m = maps
            .get_mut(name)
            .ok_or_else(|| DmError::NotFound(name.to_string()))?;
        if let Some(n) = text.strip_prefix("switch_group ") {
            let n: usize = n.parse().map_err(|_| DmError::Fatal(anyhow::anyhow!("bad switch_group arg")))?;
            m.status = format!("{n} {}", m.status.split_once(' ').map(|(_, r)| r).unwrap_or(""));
        }
        Ok(())
    }

    fn status(&self, name: &str) -> Result<String, DmError> {
        let maps = self.maps.lock().unwrap();
        let m = maps.get(name).ok_or_else(|| DmError::NotFound(name.to_string()))?;
        Ok(m.status.clone())
    }

    fn table(&self, name: &str) -> Result<String, DmError> {
        let maps = self.maps.lock().unwrap();
        let m = maps.get(name).ok_or_else(|| DmError::NotFound(name.to_string()))?;
        Ok(m.table.clone())
    }

    fn info(&self, name: &str) -> Result<DmInfo, DmError> {
        let maps = self.maps.lock().unwrap();
        let m = maps.get(name).ok_or_else(|| DmError::NotFound(name.to_string()))?;
        Ok(DmInfo {
            open_count: m.open_count,
            target_count: 1,
            dev_t: m.dev_t,
            suspended: m.suspended,
            event_nr: 0,
        })
    }

    fn maps_of_target_type(&self, target_type: &str) -> Result<Vec<DmMapSummary>, DmError> {
        let maps = self.maps.lock().unwrap();
        Ok(maps
            .iter()
            .filter(|(_, m)| {
                m.table
                    .split_whitespace()
                    .nth(if target_type == "linear" { 0 } else { usize::MAX })
                    .is_some()
                    && target_type == "linear"
                    && looks_linear(&m.table)
            })
            .map(|(name, m)| DmMapSummary {
                name: name.clone(),
                uuid: m.uuid.clone(),
                target_type: target_type.to_string(),
                table: m.table.clone(),
                dev_t: m.dev_t,
            })
            .collect())
    }

    fn name_by_uuid(&self, uuid: &str) -> Result<Option<String>, DmError> {
        let maps = self.maps.lock().unwrap();
        Ok(maps.iter().find(|(_, m)| m.uuid == uuid).map(|(n, _)| n.clone()))
    }

    fn name_by_devnum(&self, dev_t: (u32, u32)) -> Result<Option<String>, DmError> {
        let maps = self.maps.lock().unwrap();
        Ok(maps.iter().find(|(_, m)| m.dev_t == dev_t).map(|(n, _)| n.clone()))
    }
}

/// The fake's tables aren't real `linear` targets; tests that exercise
/// `remove_partmaps_of` tag a seeded table with a leading `linear` marker
/// token so `maps_of_target_type("linear")` can find it without the fake
/// needing a full per-target-type table model.
fn looks_linear(table: &str) -> bool {
    table.starts_with("linear ")
}

#[cfg(target_os = "linux")]
pub use real::RealDmClient;

/// Real backend talking to `/dev/mapper/control`.
///
/// The kernel's `dm-ioctl` ABI is a fixed-size header (`struct dm_ioctl`)
/// followed by a variable-length payload, addressed with plain `ioctl(2)`
/// rather than a dedicated syscall; marshalling it requires raw pointer
/// casts that the workspace-wide `unsafe_code = "deny"` lint does not
/// allow by default, so this module carries a file-scoped override, as the
/// crate's other FFI boundaries do.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod real {
    use std::ffi::CString;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    use super::{DmClient, DmError, DmInfo, DmMapSummary, ResumeFlags};

    const DM_DIR: &str = "/dev/mapper/control";
    const DM_NAME_LEN: usize = 128;
    const DM_UUID_LEN: usize = 129;
    const DM_VERSION_MAJOR: u32 = 4;
    const DM_VERSION_MINOR: u32 = 0;
    const DM_VERSION_PATCH: u32 = 0;

    const DM_IOCTL_MAGIC: u8 = 0xfd;
    // Command numbers, matching <linux/dm-ioctl.h>.
    const DM_DEV_CREATE_CMD: u8 = 3;
    const DM_DEV_REMOVE_CMD: u8 = 4;
    const DM_DEV_RENAME_CMD: u8 = 5;
    const DM_DEV_SUSPEND_CMD: u8 = 6; // also used for RESUME via flags
    const DM_DEV_STATUS_CMD: u8 = 7;
    const DM_TABLE_LOAD_CMD: u8 = 9;
    const DM_TABLE_STATUS_CMD: u8 = 12;
    const DM_TARGET_MSG_CMD: u8 = 17;
    const DM_LIST_DEVICES_CMD: u8 = 2;

    const DM_SUSPEND_FLAG: u32 = 1 << 1;
    const DM_STATUS_TABLE_FLAG: u32 = 1 << 4;
    const DM_EXISTS_FLAG: u32 = 1 << 2;

    /// Mirrors `struct dm_ioctl` (header-only portion; the variable-length
    /// payload is appended by the caller into an over-allocated buffer).
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct DmIoctl {
        version: [u32; 3],
        data_size: u32,
        data_start: u32,
        target_count: u32,
        open_count: i32,
        flags: u32,
        event_nr: u32,
        padding: u32,
        dev: u64,
        name: [u8; DM_NAME_LEN],
        uuid: [u8; DM_UUID_LEN],
        padding2: [u8; 7],
    }

    impl DmIoctl {
        fn new(name: &str) -> Self {
            let mut hdr = DmIoctl {
                version: [DM_VERSION_MAJOR, DM_VERSION_MINOR, DM_VERSION_PATCH],
                data_size: mem::size_of::<DmIoctl>() as u32,
                data_start: mem::size_of::<DmIoctl>() as u32,
                target_count: 0,
                open_count: 0,
                flags: 0,
                event_nr: 0,
                padding: 0,
                dev: 0,
                name: [0; DM_NAME_LEN],
                uuid: [0; DM_UUID_LEN],
                padding2: [0; 7],
            };
            let bytes = name.as_bytes();
            let n = bytes.len().min(DM_NAME_LEN - 1);
            hdr.name[..n].copy_from_slice(&bytes[..n]);
            hdr
        }

        fn set_uuid(&mut self, uuid: &str) {
            let bytes = uuid.as_bytes();
            let n = bytes.len().min(DM_UUID_LEN - 1);
            self.uuid[..n].copy_from_slice(&bytes[..n]);
        }
    }

    fn ioc(dir: u32, nr: u8, size: usize) -> u64 {
        // Replicates asm-generic/ioctl.h's _IOC() encoding used by every
        // Linux ioctl, including dm-ioctl's.
        const NRBITS: u32 = 8;
        const TYPEBITS: u32 = 8;
        const SIZEBITS: u32 = 14;
        ((dir as u64) << (NRBITS + TYPEBITS + SIZEBITS))
            | ((DM_IOCTL_MAGIC as u64) << NRBITS)
            | (nr as u64)
            | ((size as u64) << (NRBITS + TYPEBITS))
    }

    const DIR_NONE: u32 = 0;
    const DIR_WRITE: u32 = 1;
    const DIR_READ: u32 = 2;

    fn request(cmd: u8, size: usize) -> u64 {
        ioc(DIR_READ | DIR_WRITE, cmd, size)
    }

    fn control_fd() -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(DM_DIR)
    }

    /// Run one ioctl against `/dev/mapper/control` with a header-sized
    /// buffer (no table/message payload).
    fn simple_ioctl(cmd: u8, name: &str, uuid: Option<&str>, flags: u32) -> Result<DmIoctl, DmError> {
        let f = control_fd().map_err(|e| DmError::Fatal(e.into()))?;
        let mut hdr = DmIoctl::new(name);
        if let Some(u) = uuid {
            hdr.set_uuid(u);
        }
        hdr.flags = flags;
        let req = request(cmd, mem::size_of::<DmIoctl>());
        // SAFETY: `hdr` is a repr(C) struct matching the kernel's
        // `dm_ioctl` header layout for the fixed-size operations issued
        // here (no variable-length payload beyond the header); `req` was
        // built from the same `_IOC` encoding the kernel header uses, and
        // `f` stays open for the call's duration.
        let rc = unsafe { libc::ioctl(f.as_raw_fd(), req as _, &mut hdr as *mut DmIoctl) };
        classify(rc, &hdr, name)?;
        Ok(hdr)
    }

    fn classify(rc: i32, hdr: &DmIoctl, name: &str) -> Result<(), DmError> {
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENXIO) | Some(libc::ENODEV) => Err(DmError::NotFound(name.to_string())),
            Some(libc::EBUSY) => Err(DmError::Busy(name.to_string())),
            _ => {
                let _ = hdr.flags; // flags inspected by callers that need EXISTS/etc.
                Err(DmError::Fatal(anyhow::Error::new(err).context(format!("dm ioctl on '{name}'"))))
            }
        }
    }

    /// Real [`DmClient`], backed by ioctls against `/dev/mapper/control`.
    #[derive(Debug, Default)]
    pub struct RealDmClient;

    impl RealDmClient {
        /// A client bound to `/dev/mapper/control`.
        pub fn new() -> Self {
            Self
        }
    }

    impl DmClient for RealDmClient {
        fn create(&self, name: &str, uuid: &str, table: &str) -> Result<(), DmError> {
            simple_ioctl(DM_DEV_CREATE_CMD, name, Some(uuid), 0)?;
            self.reload(name, table)?;
            self.resume(name, ResumeFlags::default())
        }

        fn reload(&self, name: &str, table: &str) -> Result<(), DmError> {
            load_table(name, table)
        }

        fn resume(&self, name: &str, _flags: ResumeFlags) -> Result<(), DmError> {
            simple_ioctl(DM_DEV_SUSPEND_CMD, name, None, 0).map(|_| ())
        }

        fn rename(&self, old: &str, new: &str) -> Result<(), DmError> {
            let cstr = CString::new(new).map_err(|e| DmError::Fatal(e.into()))?;
            let mut hdr = DmIoctl::new(old);
            let f = control_fd().map_err(|e| DmError::Fatal(e.into()))?;
            // The new name is the ioctl's variable-length payload for
            // DM_DEV_RENAME, appended immediately after the header.
            let payload = cstr.as_bytes_with_nul();
            let total = mem::size_of::<DmIoctl>() + payload.len();
            hdr.data_size = total as u32;
            let req = request(DM_DEV_RENAME_CMD, total);
            let mut buf = vec![0u8; total];
            // SAFETY: `hdr` occupies the buffer's prefix with a layout
            // matching the kernel's expectation for this ioctl.
            unsafe {
                std::ptr::copy_nonoverlapping(&hdr as *const DmIoctl as *const u8, buf.as_mut_ptr(), mem::size_of::<DmIoctl>());
            }
            buf[mem::size_of::<DmIoctl>()..].copy_from_slice(payload);
            let rc = unsafe { libc::ioctl(f.as_raw_fd(), req as _, buf.as_mut_ptr()) };
            classify(rc, &hdr, old)
        }

        fn remove(&self, name: &str) -> Result<(), DmError> {
            simple_ioctl(DM_DEV_REMOVE_CMD, name, None, 0).map(|_| ())
        }

        fn message(&self, name: &str, text: &str) -> Result<(), DmError> {
            send_message(name, text)
        }

        fn status(&self, name: &str) -> Result<String, DmError> {
            query_table(name, DM_STATUS_TABLE_FLAG)
        }

        fn table(&self, name: &str) -> Result<String, DmError> {
            query_table(name, 0)
        }

        fn info(&self, name: &str) -> Result<DmInfo, DmError> {
            let hdr = simple_ioctl(DM_DEV_STATUS_CMD, name, None, 0)?;
            Ok(DmInfo {
                open_count: hdr.open_count.max(0) as u32,
                target_count: hdr.target_count,
                dev_t: ((hdr.dev >> 8) as u32, (hdr.dev & 0xff) as u32),
                suspended: hdr.flags & DM_SUSPEND_FLAG != 0,
                event_nr: hdr.event_nr,
            })
        }

        fn maps_of_target_type(&self, target_type: &str) -> Result<Vec<DmMapSummary>, DmError> {
            // DM_LIST_DEVICES returns every device name; per-device table
            // lookups filter to `target_type`. This keeps the real backend
            // a thin composition of the other primitives rather than a
            // second payload-parsing codepath.
            let names = list_device_names()?;
            let mut out = Vec::new();
            for name in names {
                if let Ok(table) = self.table(&name) {
                    if let Some(tt) = table.split_whitespace().next() {
                        if tt == target_type {
                            if let Ok(info) = self.info(&name) {
                                out.push(DmMapSummary {
                                    uuid: String::new(),
                                    target_type: target_type.to_string(),
                                    table,
                                    dev_t: info.dev_t,
                                    name,
                                });
                            }
                        }
                    }
                }
            }
            Ok(out)
        }

        fn name_by_uuid(&self, uuid: &str) -> Result<Option<String>, DmError> {
            match simple_ioctl(DM_DEV_STATUS_CMD, "", Some(uuid), 0) {
                Ok(hdr) => Ok(Some(
                    std::str::from_utf8(&hdr.name)
                        .unwrap_or_default()
                        .trim_end_matches('\0')
                        .to_string(),
                )),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        }

        fn name_by_devnum(&self, dev_t: (u32, u32)) -> Result<Option<String>, DmError> {
            for name in list_device_names()? {
                if let Ok(info) = self.info(&name) {
                    if info.dev_t == dev_t {
                        return Ok(Some(name));
                    }
                }
            }
            Ok(None)
        }
    }

    fn load_table(name: &str, table: &str) -> Result<(), DmError> {
        // `target_spec` header followed by the nul-terminated params
        // string, matching <linux/dm-ioctl.h>'s `struct dm_target_spec`.
        #[repr(C)]
        struct TargetSpec {
            sector_start: u64,
            length: u64,
            status: i32,
            target_type: [u8; 16],
            next: u32,
        }
        let mut hdr = DmIoctl::new(name);
        hdr.target_count = 1;
        let mut spec = TargetSpec {
            sector_start: 0,
            length: 0, // kernel ignores length for multipath; filled by caller if needed
            status: 0,
            target_type: [0; 16],
            next: 0,
        };
        spec.target_type[..b"multipath".len()].copy_from_slice(b"multipath");
        let params = CString::new(table).map_err(|e| DmError::Fatal(e.into()))?;
        let params_bytes = params.as_bytes_with_nul();
        let spec_size = mem::size_of::<TargetSpec>() + params_bytes.len();
        let total = mem::size_of::<DmIoctl>() + spec_size;
        hdr.data_size = total as u32;
        hdr.data_start = mem::size_of::<DmIoctl>() as u32;

        let mut buf = vec![0u8; total];
        let hdr_size = mem::size_of::<DmIoctl>();
        // SAFETY: `buf` was sized to hold `hdr` followed by `spec` and the
        // nul-terminated params string, matching the kernel's expected
        // `dm_ioctl` + `dm_target_spec` + params layout for table loads.
        unsafe {
            std::ptr::copy_nonoverlapping(&hdr as *const DmIoctl as *const u8, buf.as_mut_ptr(), hdr_size);
            std::ptr::copy_nonoverlapping(
                &spec as *const TargetSpec as *const u8,
                buf.as_mut_ptr().add(hdr_size),
                mem::size_of::<TargetSpec>(),
            );
        }
        buf[hdr_size + mem::size_of::<TargetSpec>()..].copy_from_slice(params_bytes);

        let f = control_fd().map_err(|e| DmError::Fatal(e.into()))?;
        let req = request(DM_TABLE_LOAD_CMD, total);
        let rc = unsafe { libc::ioctl(f.as_raw_fd(), req as _, buf.as_mut_ptr()) };
        classify(rc, &hdr, name)
    }

    fn query_table(name: &str, flags: u32) -> Result<String, DmError> {
        const BUF: usize = 16 * 1024;
        let mut hdr = DmIoctl::new(name);
        hdr.flags = flags;
        hdr.data_size = BUF as u32;
        let mut buf = vec![0u8; BUF];
        let hdr_size = mem::size_of::<DmIoctl>();
        // SAFETY: see `load_table`; `buf` is large enough for the header
        // plus whatever variable-length status/table text the kernel
        // writes back, and the kernel never writes past `data_size`.
        unsafe {
            std::ptr::copy_nonoverlapping(&hdr as *const DmIoctl as *const u8, buf.as_mut_ptr(), hdr_size);
        }
        let f = control_fd().map_err(|e| DmError::Fatal(e.into()))?;
        // Both status and table queries issue DM_TABLE_STATUS; which one the
        // kernel returns is selected by DM_STATUS_TABLE_FLAG in hdr.flags,
        // already set above.
        let req = request(DM_TABLE_STATUS_CMD, BUF);
        let rc = unsafe { libc::ioctl(f.as_raw_fd(), req as _, buf.as_mut_ptr()) };
        classify(rc, &hdr, name)?;
        // The params string starts after the target_spec header the
        // kernel wrote back at `data_start`.
        let start = hdr.data_start as usize;
        let end = buf[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[start..end]).to_string())
    }

    fn send_message(name: &str, text: &str) -> Result<(), DmError> {
        #[repr(C)]
        struct TargetMsg {
            sector: u64,
        }
        let mut hdr = DmIoctl::new(name);
        let msg = CString::new(text).map_err(|e| DmError::Fatal(e.into()))?;
        let msg_bytes = msg.as_bytes_with_nul();
        let hdr_size = mem::size_of::<DmIoctl>();
        let total = hdr_size + mem::size_of::<TargetMsg>() + msg_bytes.len();
        hdr.data_size = total as u32;
        hdr.data_start = hdr_size as u32;
        let mut buf = vec![0u8; total];
        // SAFETY: see `load_table`.
        unsafe {
            std::ptr::copy_nonoverlapping(&hdr as *const DmIoctl as *const u8, buf.as_mut_ptr(), hdr_size);
        }
        buf[hdr_size + mem::size_of::<TargetMsg>()..].copy_from_slice(msg_bytes);
        let f = control_fd().map_err(|e| DmError::Fatal(e.into()))?;
        let req = request(DM_TARGET_MSG_CMD, total);
        let rc = unsafe { libc::ioctl(f.as_raw_fd(), req as _, buf.as_mut_ptr()) };
        classify(rc, &hdr, name)
    }

    fn list_device_names() -> Result<Vec<String>, DmError> {
        const BUF: usize = 64 * 1024;
        let mut hdr = DmIoctl::new("");
        hdr.data_size = BUF as u32;
        let mut buf = vec![0u8; BUF];
        let hdr_size = mem::size_of::<DmIoctl>();
        // SAFETY: see `load_table`.
        unsafe {
            std::ptr::copy_nonoverlapping(&hdr as *const DmIoctl as *const u8, buf.as_mut_ptr(), hdr_size);
        }
        let f = control_fd().map_err(|e| DmError::Fatal(e.into()))?;
        let req = request(DM_LIST_DEVICES_CMD, BUF);
        let rc = unsafe { libc::ioctl(f.as_raw_fd(), req as _, buf.as_mut_ptr()) };
        classify(rc, &hdr, "")?;

        // `struct dm_name_list { u64 dev; u32 next; char name[0]; }`
        // repeated, `next` is the byte offset to the next entry (0 = last).
        let mut names = Vec::new();
        let mut off = hdr.data_start as usize;
        loop {
            if off + 12 > buf.len() {
                break;
            }
            let next = u32::from_ne_bytes(buf[off + 8..off + 12].try_into().unwrap());
            let name_start = off + 12;
            let end = buf[name_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| name_start + p)
                .unwrap_or(name_start);
            if end > name_start {
                names.push(String::from_utf8_lossy(&buf[name_start..end]).to_string());
            }
            if next == 0 {
                break;
            }
            off += next as usize;
        }
        Ok(names)
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn test_ioc_encoding_matches_linux_asm_generic() {
            // DM_VERSION is _IOWR(0xfd, 0, struct dm_ioctl) in the kernel
            // header; cross-check our encoding against the well-known
            // constant for a read/write ioctl of the header size.
            let req = request(0, mem::size_of::<DmIoctl>());
            let expected_dir = (req >> 30) & 0x3;
            assert_eq!(expected_dir, (DIR_READ | DIR_WRITE) as u64);
            let expected_type = (req >> 8) & 0xff;
            assert_eq!(expected_type, DM_IOCTL_MAGIC as u64);
        }

        #[test]
        fn test_dm_ioctl_header_size_matches_kernel_struct() {
            // struct dm_ioctl is documented as 312 bytes on 64-bit kernels;
            // our repr(C) layout (with explicit padding fields) must match.
            assert_eq!(mem::size_of::<DmIoctl>(), 312);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_map_uuid_prefix() {
        assert_eq!(map_uuid("3600a098000aaaaaa"), "mpath-3600a098000aaaaaa");
    }

    #[test]
    fn test_fake_create_reload_resume() {
        let dm = FakeDmClient::new();
        dm.create("mpatha", &map_uuid("W"), "0 0 1 1 service-time 0 1 1 8:16 1000")
            .unwrap();
        assert!(dm.info("mpatha").unwrap().suspended);
        dm.resume("mpatha", ResumeFlags::default()).unwrap();
        assert!(!dm.info("mpatha").unwrap().suspended);
        dm.reload("mpatha", "0 0 1 1 service-time 0 2 1 8:16 1000 8:32 1000")
            .unwrap();
        assert_eq!(
            dm.table("mpatha").unwrap(),
            "0 0 1 1 service-time 0 2 1 8:16 1000 8:32 1000"
        );
    }

    #[test]
    fn test_fake_create_twice_fails() {
        let dm = FakeDmClient::new();
        dm.create("mpatha", "u", "t").unwrap();
        assert!(dm.create("mpatha", "u", "t").is_err());
    }

    #[test]
    fn test_fake_not_found_semantics() {
        let dm = FakeDmClient::new();
        let err = dm.remove("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_fake_rename() {
        let dm = FakeDmClient::new();
        dm.create("old", "u", "t").unwrap();
        dm.rename("old", "new").unwrap();
        assert!(dm.table("old").is_err());
        assert_eq!(dm.table("new").unwrap(), "t");
    }

    #[test]
    fn test_fake_name_by_uuid() {
        let dm = FakeDmClient::new();
        dm.create("mpatha", &map_uuid("W"), "t").unwrap();
        assert_eq!(dm.name_by_uuid(&map_uuid("W")).unwrap().as_deref(), Some("mpatha"));
        assert_eq!(dm.name_by_uuid("mpath-nope").unwrap(), None);
    }

    #[test]
    fn test_remove_partmaps_of_matches_devt() {
        let dm = FakeDmClient::new();
        dm.create("mpatha", &map_uuid("W"), "multipath 0 0 1 1 service-time 0 1 1 8:16 1000")
            .unwrap();
        let dev_t = dm.info("mpatha").unwrap().dev_t;
        dm.seed(
            "mpatha1",
            "",
            &format!("linear {}:{} 0", dev_t.0, dev_t.1),
            "",
        );
        dm.remove_partmaps_of("mpatha").unwrap();
        assert!(dm.table("mpatha1").is_err());
        assert!(dm.table("mpatha").is_ok());
    }
}
