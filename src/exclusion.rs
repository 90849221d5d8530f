//! Paths for which request logging is skipped entirely.

use arc_swap::ArcSwap;

/// A registered exclusion.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ExcludedPath {
    /// Path with any trailing `/` removed (root stays `/`)
    path: String,
    /// Registered with a trailing `/`: also covers every path below it
    subtree: bool,
}

impl ExcludedPath {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Some(Self {
                path: "/".to_string(),
                subtree: false,
            });
        }

        Some(Self {
            path: trimmed.to_string(),
            subtree: trimmed.len() != raw.len(),
        })
    }

    fn matches(&self, path: &str) -> bool {
        if self.path == path {
            return true;
        }

        self.subtree
            && path
                .strip_prefix(self.path.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Append-only set of excluded request paths.
///
/// `/` is always excluded. A path registered with a trailing slash (`/internal/`) excludes
/// itself and everything below it (`/internal`, `/internal/stats`); a path registered
/// without one (`/health`) excludes only that exact path, not `/health/live`. Matching is
/// segment-aware, so `/internal/` never excludes `/internals`.
///
/// Registrations publish a new snapshot atomically; concurrent checks see either the list
/// before or after a registration, never a partial one.
///
/// ```rust
/// use periscope::ExclusionPolicy;
///
/// let policy = ExclusionPolicy::new();
/// policy.register("/health");
/// policy.register("/internal/");
///
/// assert!(policy.is_excluded("/"));
/// assert!(policy.is_excluded("/health"));
/// assert!(!policy.is_excluded("/health/live"));
/// assert!(policy.is_excluded("/internal/stats"));
/// assert!(!policy.is_excluded("/api/users"));
/// ```
#[derive(Debug)]
pub struct ExclusionPolicy {
    paths: ArcSwap<Vec<ExcludedPath>>,
}

impl ExclusionPolicy {
    pub fn new() -> Self {
        Self {
            paths: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Build a policy from an initial list of paths.
    pub fn with_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let policy = Self::new();
        for path in paths {
            policy.register(path.as_ref());
        }
        policy
    }

    /// Add a path to the exclusion set. Empty paths are ignored; duplicates are harmless.
    pub fn register(&self, path: &str) {
        let Some(excluded) = ExcludedPath::parse(path) else {
            return;
        };

        tracing::debug!(path = %excluded.path, subtree = excluded.subtree, "Registered excluded path");
        self.paths.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(excluded.clone());
            next
        });
    }

    /// Whether logging should be skipped for `path`.
    pub fn is_excluded(&self, path: &str) -> bool {
        path == "/" || self.paths.load().iter().any(|excluded| excluded.matches(path))
    }

    /// The registered paths, in registration order, as originally written (trailing slash
    /// kept for subtree entries).
    pub fn registered(&self) -> Vec<String> {
        self.paths
            .load()
            .iter()
            .map(|excluded| match (excluded.subtree, excluded.path.as_str()) {
                (true, path) => format!("{path}/"),
                (false, path) => path.to_string(),
            })
            .collect()
    }
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_paths() {
        let policy = ExclusionPolicy::with_paths(["", "/", "/path1", "/path2/"]);

        assert!(policy.is_excluded("/"));
        assert!(policy.is_excluded("/path1"));
        assert!(!policy.is_excluded("/path1/path2"));
        assert!(policy.is_excluded("/path2"));
        assert!(policy.is_excluded("/path2/path1"));
    }

    #[test]
    fn test_root_is_always_excluded() {
        let policy = ExclusionPolicy::new();
        assert!(policy.is_excluded("/"));
        assert!(!policy.is_excluded("/anything"));
    }

    #[test]
    fn test_segment_boundaries() {
        let policy = ExclusionPolicy::with_paths(["/path2/"]);
        assert!(!policy.is_excluded("/path1/path2"));
        assert!(!policy.is_excluded("/path22"));
        assert!(policy.is_excluded("/path2/"));
    }

    #[test]
    fn test_root_registration_does_not_cover_everything() {
        let policy = ExclusionPolicy::with_paths(["/", "//"]);
        assert!(!policy.is_excluded("/api"));
    }

    #[test]
    fn test_registered_listing() {
        let policy = ExclusionPolicy::with_paths(["", "/a", "/b/", "/a"]);
        assert_eq!(policy.registered(), vec!["/a", "/b/", "/a"]);
    }

    #[test]
    fn test_concurrent_register_and_check() {
        let policy = std::sync::Arc::new(ExclusionPolicy::new());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let policy = policy.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        policy.register(&format!("/w{i}/p{j}/"));
                    }
                })
            })
            .collect();

        for _ in 0..1000 {
            assert!(!policy.is_excluded("/api/users"));
        }
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(policy.registered().len(), 400);
        assert!(policy.is_excluded("/w3/p17/child"));
    }
}
