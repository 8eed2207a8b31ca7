//! The multipath assembly and reconciliation core.
//!
//! This crate models the in-memory path/pathgroup/map tree (see [`path`] and
//! [`multipath`]), the layered configuration resolver that assigns
//! properties to a device ([`config`]), the five path-group policies
//! ([`pgpolicies`]), the device-mapper target-table codec ([`dmparser`]),
//! the action selector and coalescing pass ([`configure`]), the kernel
//! device-mapper client ([`dm`]), the persistent-reservation broadcaster
//! ([`pr`]), the wwid/prkey/binding stores ([`store`]), and the
//! blacklist/whitelist filter ([`blacklist`]).

mod arena;
pub use arena::*;
pub mod blacklist;
pub mod checker;
pub mod config;
pub mod configure;
pub mod dm;
pub mod dmparser;
pub mod error;
pub mod multipath;
pub mod path;
pub mod pgpolicies;
pub mod pr;
pub mod store;

pub use error::{ConfigWarning, CoreError};
