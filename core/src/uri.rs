//! Base-URI-relative resolution for configuration references.
//!
//! Import cycle detection compares *normalized* URIs (scheme preserved,
//! backslashes folded, `.`/`..` segments collapsed) so that trivially
//! distinct spellings of the same resource cannot bypass the check.

/// Normalize a URI for identity comparison.
///
/// Folds backslashes to forward slashes, collapses `.` segments and
/// resolves `..` against preceding segments. A scheme prefix (`file:`,
/// `http://...`) is preserved untouched.
pub fn normalize(uri: &str) -> String {
    let (scheme, path) = split_scheme(uri);
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let mut out = String::from(scheme);
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    out
}

/// Resolve `reference` against `base`.
///
/// An absolute reference (one carrying a scheme, or rooted at `/`) is
/// returned normalized as-is; a relative reference is joined onto `base`,
/// which is treated as a directory URI.
pub fn resolve(base: &str, reference: &str) -> String {
    if is_absolute(reference) {
        return normalize(reference);
    }
    if base.is_empty() {
        return normalize(reference);
    }
    normalize(&format!("{}/{}", base, reference))
}

/// The parent (directory) URI of a resolved resource URI.
///
/// Becomes the new base URI when recursing into an imported file.
pub fn parent(uri: &str) -> String {
    let normalized = normalize(uri);
    let (scheme, path) = split_scheme(&normalized);
    match path.rfind('/') {
        Some(0) => format!("{scheme}/"),
        Some(idx) => format!("{scheme}{}", &path[..idx]),
        None => String::from(scheme),
    }
}

fn is_absolute(uri: &str) -> bool {
    uri.starts_with('/') || split_scheme(uri).0 != ""
}

/// Split a URI into its scheme prefix (including `:` or `://`) and the rest.
///
/// Single-character prefixes are not treated as schemes so Windows drive
/// letters survive normalization.
fn split_scheme(uri: &str) -> (&str, &str) {
    if let Some(idx) = uri.find(':') {
        let candidate = &uri[..idx];
        if candidate.len() > 1 && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
            let rest = &uri[idx + 1..];
            if let Some(stripped) = rest.strip_prefix("//") {
                if let Some(slash) = stripped.find('/') {
                    let split_at = idx + 1 + 2 + slash;
                    return (&uri[..split_at], &uri[split_at..]);
                }
                return (uri, "");
            }
            return (&uri[..idx + 1], rest);
        }
    }
    ("", uri)
}
