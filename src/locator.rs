//! URL canonicalization and parent references.
//!
//! Every mirrored entity is identified by its canonical URL: the remote URL with
//! trailing slashes removed. An entity is either located directly by URL or derived
//! from its parent's URL, an optional path segment and a local id.

use std::fmt;
use std::sync::{Arc, Weak};

/// Removes trailing `/` characters.
pub fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Joins URL snippets with a single `/`, skipping empty ones.
pub fn join_url(parts: &[&str]) -> String {
    let mut joined = String::new();
    for part in parts {
        let part = if joined.is_empty() {
            part.trim_end_matches('/')
        } else {
            part.trim_matches('/')
        };
        if part.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push('/');
        }
        joined.push_str(part);
    }
    joined
}

/// Splits a canonical child URL into `(parent_url, id)`.
///
/// With `segment = Some("job")`, `http://ci/job/app` yields `("http://ci", "app")`;
/// the URL must end in `<segment>/<id>`. Returns `None` when the shape does not match
/// or when the parent would not be an absolute URL.
pub fn split_child(url: &str, segment: Option<&str>) -> Option<(String, String)> {
    let url = normalize_url(url);
    let (rest, id) = url.rsplit_once('/')?;
    if id.is_empty() {
        return None;
    }
    let parent = match segment {
        Some(expected) => {
            let (parent, found) = rest.rsplit_once('/')?;
            if found != expected {
                return None;
            }
            parent
        }
        None => rest,
    };
    let has_host = parent
        .split_once("://")
        .is_some_and(|(scheme, host)| !scheme.is_empty() && !host.is_empty());
    if !has_host {
        return None;
    }
    Some((parent.to_string(), id.to_string()))
}

/// How an entity is located at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator<'a> {
    /// A full remote URL.
    Url(&'a str),
    /// A parent URL, an optional class-specific segment and a local id.
    Child {
        parent: &'a str,
        segment: Option<&'a str>,
        id: &'a str,
    },
}

impl<'a> Locator<'a> {
    /// Locates a child of `parent`.
    pub fn child(parent: &'a str, segment: Option<&'a str>, id: &'a str) -> Self {
        Locator::Child {
            parent,
            segment,
            id,
        }
    }

    /// Returns the canonical URL. Both variants normalize identically.
    pub fn canonical(&self) -> String {
        match self {
            Locator::Url(url) => normalize_url(url),
            Locator::Child {
                parent,
                segment,
                id,
            } => {
                let mut parts = vec![*parent];
                if let Some(segment) = segment {
                    parts.push(segment);
                }
                parts.push(id);
                normalize_url(&join_url(&parts))
            }
        }
    }
}

/// Stand-in for a parent that is only known by URL and cannot be traversed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueRemote {
    url: String,
}

impl OpaqueRemote {
    /// Creates a stand-in for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_url(&url.into()),
        }
    }

    /// Returns the canonical URL of the stand-in.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Non-owning reference from a child entity to its parent.
pub enum Parent<T> {
    /// A live parent in the object graph.
    Linked(Weak<T>),
    /// A parent known only by URL.
    Opaque(OpaqueRemote),
}

impl<T> Parent<T> {
    /// Returns the parent if it is linked and still alive.
    pub fn upgrade(&self) -> Option<Arc<T>> {
        match self {
            Parent::Linked(parent) => parent.upgrade(),
            Parent::Opaque(_) => None,
        }
    }

    /// Returns true if the parent cannot be traversed.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Parent::Opaque(_))
    }
}

impl<T> Clone for Parent<T> {
    fn clone(&self) -> Self {
        match self {
            Parent::Linked(parent) => Parent::Linked(parent.clone()),
            Parent::Opaque(remote) => Parent::Opaque(remote.clone()),
        }
    }
}

impl<T> fmt::Debug for Parent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Linked(parent) => f
                .debug_tuple("Linked")
                .field(&(parent.strong_count() > 0))
                .finish(),
            Parent::Opaque(remote) => f.debug_tuple("Opaque").field(&remote.url).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_slashes() {
        assert_eq!(normalize_url("http://ci/job/app/"), "http://ci/job/app");
        assert_eq!(normalize_url("http://ci/job/app//"), "http://ci/job/app");
        assert_eq!(normalize_url("http://ci"), "http://ci");
    }

    #[test]
    fn join_skips_empty_parts_and_duplicate_slashes() {
        assert_eq!(join_url(&["http://ci/", "job", "", "/app/"]), "http://ci/job/app");
        assert_eq!(join_url(&["http://ci", "api/json"]), "http://ci/api/json");
    }

    #[test]
    fn child_and_url_locators_agree() {
        let derived = Locator::child("http://ci/", Some("job"), "app").canonical();
        let direct = Locator::Url("http://ci/job/app/").canonical();
        assert_eq!(derived, direct);
        assert_eq!(derived, "http://ci/job/app");
    }

    #[test]
    fn canonical_is_idempotent() {
        let once = Locator::child("http://ci/job/app", None, "42").canonical();
        let twice = Locator::Url(&once).canonical();
        assert_eq!(once, twice);
    }

    #[test]
    fn split_child_with_segment() {
        assert_eq!(
            split_child("http://ci/job/app/", Some("job")),
            Some(("http://ci".to_string(), "app".to_string()))
        );
        assert_eq!(split_child("http://ci/view/app", Some("job")), None);
    }

    #[test]
    fn split_child_without_segment() {
        assert_eq!(
            split_child("http://ci/job/app/42", None),
            Some(("http://ci/job/app".to_string(), "42".to_string()))
        );
        assert_eq!(split_child("http://ci", None), None);
    }

    #[test]
    fn opaque_parent_is_not_traversable() {
        let parent: Parent<String> = Parent::Opaque(OpaqueRemote::new("http://ci/"));
        assert!(parent.is_opaque());
        assert!(parent.upgrade().is_none());
    }

    #[test]
    fn linked_parent_upgrades_while_alive() {
        let owner = Arc::new("server".to_string());
        let parent = Parent::Linked(Arc::downgrade(&owner));
        assert_eq!(parent.upgrade().as_deref().map(String::as_str), Some("server"));
        drop(owner);
        assert!(parent.upgrade().is_none());
    }
}
