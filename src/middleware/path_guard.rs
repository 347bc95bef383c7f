//! # Request Path Guard
//!
//! Policies and routes are matched against the raw request path, while the
//! upstream URL is built with the `url` crate, which resolves `.` and `..`
//! segments (including their percent-encoded forms). A path is only accepted
//! when both sides read it the same way, so anything the URL parser would
//! rewrite is refused up front:
//!
//! - `.` and `..` segments, literal or percent-encoded
//! - empty segments (`//`), apart from a single trailing slash
//! - encoded separators (`%2F`, `%5C`) and raw backslashes
//! - encoded percent signs (`%25`) and NUL bytes (`%00`)

use thiserror::Error;

/// Why a request path was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathRejection {
    #[error("path must start with '/'")]
    NotAbsolute,
    #[error("path contains a '.' or '..' segment")]
    DotSegment,
    #[error("path contains an empty segment")]
    EmptySegment,
    #[error("path contains an encoded or backslash separator")]
    EncodedSeparator,
    #[error("path contains an encoded percent sign or NUL byte")]
    EncodedControl,
}

/// Accept `path` only if it is already in normal form
pub fn check_path(path: &str) -> Result<(), PathRejection> {
    let rest = path.strip_prefix('/').ok_or(PathRejection::NotAbsolute)?;
    if rest.is_empty() {
        return Ok(());
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.into_iter().enumerate() {
        if segment.is_empty() {
            if index == last {
                continue;
            }
            return Err(PathRejection::EmptySegment);
        }

        let lowered = segment.to_ascii_lowercase();
        if lowered.contains('\\') || lowered.contains("%2f") || lowered.contains("%5c") {
            return Err(PathRejection::EncodedSeparator);
        }
        if lowered.contains("%25") || lowered.contains("%00") {
            return Err(PathRejection::EncodedControl);
        }

        let decoded = lowered.replace("%2e", ".");
        if decoded == "." || decoded == ".." {
            return Err(PathRejection::DotSegment);
        }
    }
    Ok(())
}
