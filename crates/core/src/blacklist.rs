//! Blacklist / whitelist filter.
//!
//! Four symmetric axes (devnode, device, wwid, protocol) plus one
//! asymmetric udev-property axis. Each symmetric axis carries its own
//! builtin-default, config, and exception (`invert`) entries; the overall
//! polarity is "excluded unless a later exception entry of the same axis
//! also matches".

use std::collections::HashMap;

use regex::Regex;

use crate::path::Path;

/// Where a blacklist entry came from, carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BlacklistOrigin {
    /// Compiled into the binary.
    Builtin,
    /// Loaded from the main config file or an overlay snippet.
    Config,
    /// Synthesized default, not traceable to any source file.
    Default,
}

/// Which axis produced a blacklist verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Axis {
    /// The device node name (e.g. `sda`).
    Devnode,
    /// The (vendor, product) pair.
    Device,
    /// The wwid.
    Wwid,
    /// The transport protocol string.
    Protocol,
    /// The asymmetric udev-property axis.
    Property,
}

/// Outcome of filtering one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The path is not blacklisted.
    Allowed,
    /// The path is blacklisted, by the named axis.
    Blacklisted(Axis),
}

impl Verdict {
    /// True if this verdict is [`Verdict::Blacklisted`].
    pub fn is_blacklisted(&self) -> bool {
        matches!(self, Verdict::Blacklisted(_))
    }
}

#[derive(Debug, Clone)]
enum Kind {
    Devnode { regex: Regex, src: String },
    Wwid { regex: Regex, src: String },
    Protocol { regex: Regex, src: String },
    Device {
        vendor: Regex,
        product: Regex,
        vendor_src: String,
        product_src: String,
    },
    /// The property axis: a configured property name that must match
    /// `regex`; a path not carrying the property, or carrying it with a
    /// non-matching value, is blacklisted. This is the inverse of every
    /// other axis' "match to exclude" polarity and is never subject to the
    /// `invert` exception flag.
    Property { name: String, regex: Option<Regex> },
}

/// One blacklist (or, with `invert` set, whitelist-exception) entry.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    kind: Kind,
    invert: bool,
    origin: BlacklistOrigin,
}

impl BlacklistEntry {
    /// A devnode-axis entry.
    pub fn devnode(pattern: &str, invert: bool, origin: BlacklistOrigin) -> Self {
        Self {
            kind: Kind::Devnode {
                regex: Regex::new(pattern).expect("valid devnode regex"),
                src: pattern.to_string(),
            },
            invert,
            origin,
        }
    }

    /// A wwid-axis entry.
    pub fn wwid(pattern: &str, invert: bool, origin: BlacklistOrigin) -> Self {
        Self {
            kind: Kind::Wwid {
                regex: Regex::new(pattern).expect("valid wwid regex"),
                src: pattern.to_string(),
            },
            invert,
            origin,
        }
    }

    /// A protocol-axis entry.
    pub fn protocol(pattern: &str, invert: bool, origin: BlacklistOrigin) -> Self {
        Self {
            kind: Kind::Protocol {
                regex: Regex::new(pattern).expect("valid protocol regex"),
                src: pattern.to_string(),
            },
            invert,
            origin,
        }
    }

    /// A device-axis entry, matching both vendor and product regexes.
    pub fn device(vendor: &str, product: &str, invert: bool, origin: BlacklistOrigin) -> Self {
        Self {
            kind: Kind::Device {
                vendor: Regex::new(vendor).expect("valid vendor regex"),
                product: Regex::new(product).expect("valid product regex"),
                vendor_src: vendor.to_string(),
                product_src: product.to_string(),
            },
            invert,
            origin,
        }
    }

    /// The asymmetric property-axis entry; never subject to `invert`.
    pub fn property(name: &str, pattern: Option<&str>, origin: BlacklistOrigin) -> Self {
        Self {
            kind: Kind::Property {
                name: name.to_string(),
                regex: pattern.map(|p| Regex::new(p).expect("valid property regex")),
            },
            invert: false,
            origin,
        }
    }

    /// Textual pattern(s) this entry matches against, for diagnostic dumps.
    fn pattern_src(&self) -> String {
        match &self.kind {
            Kind::Devnode { src, .. } | Kind::Wwid { src, .. } | Kind::Protocol { src, .. } => src.clone(),
            Kind::Device {
                vendor_src,
                product_src,
                ..
            } => format!("{vendor_src}:{product_src}"),
            Kind::Property { name, regex } => {
                format!("{name}={}", regex.as_ref().map_or("*", Regex::as_str))
            }
        }
    }

    /// Dedup key, compared textually: two entries collapse when their
    /// regex *source strings* match, not when their compiled automata would
    /// behave identically.
    fn dedup_key(&self) -> String {
        match &self.kind {
            Kind::Devnode { src, .. } => format!("devnode:{src}"),
            Kind::Wwid { src, .. } => format!("wwid:{src}"),
            Kind::Protocol { src, .. } => format!("protocol:{src}"),
            Kind::Device {
                vendor_src,
                product_src,
                ..
            } => format!("device:{vendor_src}:{product_src}"),
            Kind::Property { name, regex } => {
                format!("property:{name}:{:?}", regex.as_ref().map(Regex::as_str))
            }
        }
    }
}

/// `BlacklistEntry` holds compiled `Regex`es behind a private `Kind`, which
/// can't derive `Serialize`; dump the diagnostic-relevant fields by hand
/// instead ( diagnostics dump, ).
impl serde::Serialize for BlacklistEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let axis = match &self.kind {
            Kind::Devnode { .. } => "devnode",
            Kind::Wwid { .. } => "wwid",
            Kind::Protocol { .. } => "protocol",
            Kind::Device { .. } => "device",
            Kind::Property { .. } => "property",
        };
        let mut s = serializer.serialize_struct("BlacklistEntry", 4)?;
        s.serialize_field("axis", axis)?;
        s.serialize_field("pattern", &self.pattern_src())?;
        s.serialize_field("invert", &self.invert)?;
        s.serialize_field("origin", &self.origin)?;
        s.end()
    }
}

/// The full set of blacklist/whitelist entries for a configuration
/// snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Blacklist {
    entries: Vec<BlacklistEntry>,
}

impl Blacklist {
    /// An empty blacklist with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference implementation's default devnode blacklist: non-LUN
    /// block devices that should never be considered multipath candidates.
    pub fn with_defaults() -> Self {
        let mut bl = Self::new();
        for pattern in [
            r"^(ram|zram|loop|fd|md|dm-|sr|scd|st|dcssblk)[0-9]",
            r"^(td|hd|vd)[a-z]",
        ] {
            bl.push(BlacklistEntry::devnode(
                pattern,
                false,
                BlacklistOrigin::Default,
            ));
        }
        bl
    }

    /// Append one entry.
    pub fn push(&mut self, entry: BlacklistEntry) {
        self.entries.push(entry);
    }

    /// Merge entries across builtin/config/default vectors, de-duplicating
    /// by textual regex identity ( `merge_blacklist`).
    pub fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.entries.retain(|e| seen.insert(e.dedup_key()));
    }

    fn axis_verdict<'a, M>(&'a self, matches: M) -> bool
    where
        M: Fn(&'a BlacklistEntry) -> bool,
    {
        let mut blacklisted = false;
        let mut whitelisted = false;
        for entry in &self.entries {
            if matches(entry) {
                if entry.invert {
                    whitelisted = true;
                } else {
                    blacklisted = true;
                }
            }
        }
        blacklisted && !whitelisted
    }

    /// Check the devnode axis alone.
    pub fn check_devnode(&self, devnode: &str) -> Verdict {
        let hit = self.axis_verdict(|e| matches!(&e.kind, Kind::Devnode { regex, .. } if regex.is_match(devnode)));
        if hit {
            Verdict::Blacklisted(Axis::Devnode)
        } else {
            Verdict::Allowed
        }
    }

    /// Check the wwid axis alone.
    pub fn check_wwid(&self, wwid: &str) -> Verdict {
        let hit = self.axis_verdict(|e| matches!(&e.kind, Kind::Wwid { regex, .. } if regex.is_match(wwid)));
        if hit {
            Verdict::Blacklisted(Axis::Wwid)
        } else {
            Verdict::Allowed
        }
    }

    /// Check the protocol axis alone.
    pub fn check_protocol(&self, protocol: &str) -> Verdict {
        let hit = self.axis_verdict(|e| matches!(&e.kind, Kind::Protocol { regex, .. } if regex.is_match(protocol)));
        if hit {
            Verdict::Blacklisted(Axis::Protocol)
        } else {
            Verdict::Allowed
        }
    }

    /// Check the device axis alone.
    pub fn check_device(&self, vendor: &str, product: &str) -> Verdict {
        let hit = self.axis_verdict(|e| {
            matches!(&e.kind, Kind::Device { vendor: v, product: p, .. }
                if v.is_match(vendor) && p.is_match(product))
        });
        if hit {
            Verdict::Blacklisted(Axis::Device)
        } else {
            Verdict::Allowed
        }
    }

    /// The property axis: inverted polarity. A path is blacklisted when a
    /// configured property entry names a udev property that either is
    /// absent from `properties` or is present with a non-matching value.
    /// Never subject to `invert` exceptions.
    pub fn check_property(&self, properties: &HashMap<String, String>) -> Verdict {
        for entry in &self.entries {
            if let Kind::Property { name, regex } = &entry.kind {
                match properties.get(name) {
                    None => return Verdict::Blacklisted(Axis::Property),
                    Some(value) => {
                        if let Some(regex) = regex {
                            if !regex.is_match(value) {
                                return Verdict::Blacklisted(Axis::Property);
                            }
                        }
                    }
                }
            }
        }
        Verdict::Allowed
    }

    /// Run every axis against `path`, stopping at the first blacklisting
    /// verdict.
    pub fn check_path(&self, path: &Path, udev_properties: &HashMap<String, String>) -> Verdict {
        let devnode = self.check_devnode(&path.dev);
        if devnode.is_blacklisted() {
            return devnode;
        }
        let device = self.check_device(&path.vendor, &path.product);
        if device.is_blacklisted() {
            return device;
        }
        if !path.protocol.is_empty() {
            let protocol = self.check_protocol(&path.protocol);
            if protocol.is_blacklisted() {
                return protocol;
            }
        }
        if !path.wwid.is_empty() {
            let wwid = self.check_wwid(&path.wwid);
            if wwid.is_blacklisted() {
                return wwid;
            }
        }
        self.check_property(udev_properties)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_devnode_blacklist() {
        let bl = Blacklist::with_defaults();
        assert!(bl.check_devnode("loop0").is_blacklisted());
        assert!(!bl.check_devnode("sdb").is_blacklisted());
    }

    #[test]
    fn test_wwid_exception_overrides_blacklist() {
        let mut bl = Blacklist::new();
        bl.push(BlacklistEntry::wwid("^3", false, BlacklistOrigin::Config));
        bl.push(BlacklistEntry::wwid(
            "^3600a098",
            true,
            BlacklistOrigin::Config,
        ));
        assert!(!bl.check_wwid("3600a098000aaaaaa").is_blacklisted());
        assert!(bl.check_wwid("3700000000000000").is_blacklisted());
    }

    #[test]
    fn test_device_axis_requires_both_regexes() {
        let mut bl = Blacklist::new();
        bl.push(BlacklistEntry::device(
            "^ACME$",
            "^TOASTER$",
            false,
            BlacklistOrigin::Config,
        ));
        assert!(bl.check_device("ACME", "TOASTER").is_blacklisted());
        assert!(!bl.check_device("ACME", "FRIDGE").is_blacklisted());
    }

    #[test]
    fn test_property_axis_inverted_polarity() {
        let mut bl = Blacklist::new();
        bl.push(BlacklistEntry::property(
            "ID_NVME_NSHEAD",
            Some("^1$"),
            BlacklistOrigin::Config,
        ));
        let mut props = HashMap::new();
        // Absent property -> blacklisted (opposite of the other axes).
        assert!(bl.check_property(&props).is_blacklisted());
        props.insert("ID_NVME_NSHEAD".to_string(), "1".to_string());
        assert!(!bl.check_property(&props).is_blacklisted());
        props.insert("ID_NVME_NSHEAD".to_string(), "0".to_string());
        assert!(bl.check_property(&props).is_blacklisted());
    }

    #[test]
    fn test_dedup_by_textual_regex() {
        let mut bl = Blacklist::new();
        bl.push(BlacklistEntry::wwid("^3", false, BlacklistOrigin::Builtin));
        bl.push(BlacklistEntry::wwid("^3", false, BlacklistOrigin::Config));
        bl.dedup();
        assert_eq!(bl.entries.len(), 1);
    }

    #[test]
    fn test_check_path_stops_at_first_axis() {
        let mut bl = Blacklist::with_defaults();
        bl.push(BlacklistEntry::wwid(
            "^SHOULD_NOT_BE_REACHED",
            false,
            BlacklistOrigin::Config,
        ));
        let path = Path::new("loop0", (7, 0));
        let verdict = bl.check_path(&path, &HashMap::new());
        assert_eq!(verdict, Verdict::Blacklisted(Axis::Devnode));
    }
}
