//! `Origin` allow-list.

use axum::http::{HeaderValue, Uri};

/// Exact-match allow-list for the `Origin` request header.
///
/// An empty list allows everything. A request without an `Origin` header
/// (non-browser client) is always allowed.
#[derive(Clone, Debug, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Build a policy from configured origins. Blank entries are ignored.
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    /// Whether the policy restricts anything.
    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Check a raw header value.
    pub fn allows(&self, origin: Option<&HeaderValue>) -> bool {
        match origin {
            None => true,
            Some(value) => match value.to_str() {
                Ok(origin) => self.allows_str(origin),
                Err(_) => self.is_open(),
            },
        }
    }

    /// Check an origin string.
    ///
    /// Matches either the literal value or its `scheme://host[:port]` form.
    pub fn allows_str(&self, origin: &str) -> bool {
        if origin.is_empty() || self.is_open() {
            return true;
        }
        if self.allowed.iter().any(|a| a == origin) {
            return true;
        }
        match normalize(origin) {
            Some(normalized) => self.allowed.iter().any(|a| *a == normalized),
            None => false,
        }
    }
}

fn normalize(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    let scheme = uri.scheme_str()?;
    let authority = uri.authority()?;
    Some(format!("{scheme}://{authority}"))
}
