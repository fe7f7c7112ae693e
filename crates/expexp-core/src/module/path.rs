//! Validation of the `path` request parameter.

use thiserror::Error;

use super::FileModule;

/// Why a requested path was refused. The display text is sent to the client
/// as-is, so it names no filesystem details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathRejection {
    #[error("Invalid path argument")]
    InvalidPath,
    #[error("Dot files are not allowed")]
    DotFile,
}

/// Drops leading slashes and collapses every run of slashes into one.
pub fn normalize_slashes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '/' && (out.is_empty() || out.ends_with('/')) {
            continue;
        }
        out.push(c);
    }
    out
}

impl FileModule {
    /// Checks a raw `path` parameter and returns the relative path to append
    /// to the base path: empty, or starting with `/`.
    ///
    /// Without an allow pattern only the empty path is accepted. With one,
    /// a path that MATCHES the pattern is rejected. Any component starting
    /// with `.` is rejected in both cases.
    pub fn validate_path(&self, raw: &str) -> Result<String, PathRejection> {
        let path = normalize_slashes(raw);

        match self.allow_pattern() {
            None if !path.is_empty() => return Err(PathRejection::InvalidPath),
            Some(pattern) if pattern.is_match(&path) => return Err(PathRejection::InvalidPath),
            _ => {}
        }

        if path.is_empty() {
            return Ok(path);
        }
        let path = format!("/{path}");
        if path.contains("/.") {
            return Err(PathRejection::DotFile);
        }
        Ok(path)
    }

    /// Validates `raw` and joins it onto the module's base path.
    pub fn resolve(&self, raw: &str) -> Result<String, PathRejection> {
        let relative = self.validate_path(raw)?;
        Ok(format!("{}{relative}", self.base_path()))
    }
}
