//! Path validation and pattern matching for Apteryx.
//!
//! Paths are `/`-separated strings rooted at `/` (`/a/b/c`). A directory
//! form (`/a/b/`) and a wildcard-suffix form (`/a/b/*`) exist alongside
//! exact paths for search and watcher-pattern purposes; see [`Kind`].

use thiserror::Error;

/// Errors surfaced by path validation. Caller-side only — never reaches
/// the wire (see `InvalidPath` in the error taxonomy).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path must start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("path must not contain empty segments: {0:?}")]
    EmptySegment(String),
    #[error("'*' is only permitted as the final segment: {0:?}")]
    MisplacedWildcard(String),
    #[error("path must be exact (no trailing '/', no '*'): {0:?}")]
    NotExact(String),
    #[error("search path must be root-equivalent or end in '/': {0:?}")]
    NotSearchable(String),
}

/// The shape a path or pattern string was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A plain path with no trailing `/` and no `*`: `/a/b/c`.
    Exact,
    /// A directory-form path: `/a/b/`.
    Directory,
    /// A wildcard-suffix pattern: `/a/b/*`.
    Wildcard,
    /// Any of `""`, `/`, `*`, `/*` — the root directory.
    Root,
    /// Fails validation: missing leading slash, `//`, or a `*` anywhere
    /// other than as the final segment.
    Invalid,
}

const ROOT_FORMS: [&str; 4] = ["", "/", "*", "/*"];

/// Classify a path or watcher-pattern string.
///
/// This never rejects outright — see [`Kind::Invalid`] — so that pattern
/// matching can treat malformed patterns (in particular a `*` that is not
/// the final segment) as "never matches" rather than as a registration
/// error, per the design note on pattern-matching ambiguity.
pub fn validate(path: &str) -> Kind {
    if ROOT_FORMS.contains(&path) {
        return Kind::Root;
    }
    if !path.starts_with('/') {
        return Kind::Invalid;
    }
    if path.contains("//") {
        return Kind::Invalid;
    }
    if let Some(star_pos) = path.find('*') {
        let is_final = star_pos == path.len() - 1;
        let preceded_by_slash = star_pos > 0 && path.as_bytes()[star_pos - 1] == b'/';
        let single_star = path.matches('*').count() == 1;
        if !(is_final && preceded_by_slash && single_star) {
            return Kind::Invalid;
        }
        return Kind::Wildcard;
    }
    if path.ends_with('/') {
        return Kind::Directory;
    }
    Kind::Exact
}

/// Validate a path for use with `set`/`get`/`prune`: must be exact.
pub fn validate_exact(path: &str) -> Result<&str, PathError> {
    match validate(path) {
        Kind::Exact => Ok(path),
        Kind::Root => Err(PathError::NotExact(path.to_string())),
        Kind::Directory | Kind::Wildcard => Err(PathError::NotExact(path.to_string())),
        Kind::Invalid => Err(classify_invalid(path)),
    }
}

/// The resolved target of a `search` request: either the root directory
/// or a concrete directory path (trailing `/` stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTarget<'a> {
    Root,
    Directory(&'a str),
}

/// Validate a path for use with `search`: must be root-equivalent or end
/// in `/`. Preserves the "search validation quirk" — bare non-root paths
/// are rejected even though `get`/`set` would accept them.
pub fn validate_search(path: &str) -> Result<SearchTarget<'_>, PathError> {
    match validate(path) {
        Kind::Root => Ok(SearchTarget::Root),
        Kind::Directory => Ok(SearchTarget::Directory(path.trim_end_matches('/'))),
        Kind::Exact | Kind::Wildcard => Err(PathError::NotSearchable(path.to_string())),
        Kind::Invalid => Err(classify_invalid(path)),
    }
}

fn classify_invalid(path: &str) -> PathError {
    if !path.starts_with('/') {
        return PathError::MissingLeadingSlash(path.to_string());
    }
    if path.contains("//") {
        return PathError::EmptySegment(path.to_string());
    }
    PathError::MisplacedWildcard(path.to_string())
}

/// Does `pattern` (a watcher or provider registration pattern) match
/// `path` (a concrete, already-validated path)?
///
/// Exact patterns match only the identical path. Directory patterns
/// (`P/`) match any direct descendant of `P`. Wildcard-suffix patterns
/// (`P/*`) match `P` itself and any descendant at any depth. Root-form
/// patterns (`""`, `/`, `*`, `/*`) match every path. A pattern with a
/// `*` anywhere but the final segment never matches anything.
pub fn matches(pattern: &str, path: &str) -> bool {
    match validate(pattern) {
        Kind::Root => true,
        Kind::Exact => pattern == path,
        Kind::Directory => {
            let dir = pattern.trim_end_matches('/');
            match path.strip_prefix(dir).and_then(|rest| rest.strip_prefix('/')) {
                Some(rest) => !rest.is_empty() && !rest.contains('/'),
                None => false,
            }
        }
        Kind::Wildcard => {
            let prefix = &pattern[..pattern.len() - 2]; // strip trailing "/*"
            path == prefix || path.starts_with(&format!("{prefix}/"))
        }
        Kind::Invalid => false,
    }
}
