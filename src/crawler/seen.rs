use std::collections::HashSet;
use url::Url;

/// Per-process set of normalised URLs already handed to the fetcher.
/// Not shared across crawler instances (spec §4.2 "Seen-set policy") —
/// cross-crawler duplicates are tolerated as redundant but idempotent work.
#[derive(Default)]
pub struct SeenSet {
    seen: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `url` (already normalised) if absent. Returns `true` if this
    /// is the first time the URL has been seen.
    pub fn insert(&mut self, normalized_url: String) -> bool {
        self.seen.insert(normalized_url)
    }

    pub fn contains(&self, normalized_url: &str) -> bool {
        self.seen.contains(normalized_url)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Normalise a URL per spec §6: lower-case scheme and host, strip the
/// fragment, strip a trailing slash from the path (unless the path is
/// just `/`), preserve the query string.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw).ok()?;
    parsed.set_fragment(None);

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(&path[..path.len() - 1]);
    }

    Some(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_url("HTTPS://Example.test/Path/#frag").unwrap();
        let twice = normalize_url(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_fragment_and_trailing_slash_but_keeps_query() {
        let normalized = normalize_url("https://example.test/path/?q=1#section").unwrap();
        assert_eq!(normalized, "https://example.test/path?q=1");
    }

    #[test]
    fn root_path_trailing_slash_is_preserved() {
        let normalized = normalize_url("https://example.test/").unwrap();
        assert_eq!(normalized, "https://example.test/");
    }

    #[test]
    fn seen_set_rejects_second_insert_of_same_url() {
        let mut seen = SeenSet::new();
        assert!(seen.insert("https://example.test/".to_string()));
        assert!(!seen.insert("https://example.test/".to_string()));
        assert_eq!(seen.len(), 1);
    }
}
