//! Small `Result`/`Option` extension traits shared across the workspace.

use anyhow::{Context, Result};

/// Extension trait for turning a missing value into a descriptive error,
/// instead of the generic message `anyhow` produces for `ok_or_else`.
pub trait OptionExt<T> {
    /// Equivalent to `ok_or_else` but takes a plain message, matching the
    /// call sites that just want `.context()`-flavored ergonomics on an `Option`.
    fn ctx(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ctx(self, msg: &str) -> Result<T> {
        self.with_context(|| msg.to_string())
    }
}

/// Extension trait for treating "not found" I/O errors as an `Option`
/// rather than threading `ErrorKind::NotFound` checks through every call site.
pub trait IoResultExt<T> {
    /// Convert `Err(NotFound)` into `Ok(None)`, and any other outcome into `Some`.
    fn ignore_not_found(self) -> std::io::Result<Option<T>>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn ignore_not_found(self) -> std::io::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_option_ext() {
        let v: Option<u32> = None;
        assert!(v.ctx("missing").is_err());
        assert_eq!(Some(42).ctx("missing").unwrap(), 42);
    }

    #[test]
    fn test_ignore_not_found() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Err::<(), _>(e).ignore_not_found().unwrap(), None);
        let e = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(Err::<(), _>(e).ignore_not_found().is_err());
    }
}
