use std::fmt;
use std::sync::Mutex;

use url::Url;

use crate::error::Result;

pub const CHAT_PATH: &str = "/interacciones";
pub const DASHBOARD_PATH: &str = "/dashboard";
pub const EXERCISE_PARAM: &str = "id";
pub const INTERACTION_PARAM: &str = "interactionId";

/// Address of what is currently open: a path plus ordered query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl Location {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), query: Vec::new() }
    }

    pub fn chat(exercise_id: &str, interaction_id: Option<&str>) -> Self {
        let mut loc = Self::new(CHAT_PATH).with_param(EXERCISE_PARAM, exercise_id);
        if let Some(iid) = interaction_id {
            loc = loc.with_param(INTERACTION_PARAM, iid);
        }
        loc
    }

    pub fn dashboard() -> Self {
        Self::new(DASHBOARD_PATH)
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Accepts either a bare path (`/interacciones?id=e1`) or a full URL.
    pub fn parse(input: &str) -> Result<Self> {
        let base = Url::parse("http://localhost/")?;
        let url = base.join(input)?;
        Ok(Self {
            path: url.path().to_string(),
            query: url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect(),
        })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn exercise_id(&self) -> Option<&str> {
        self.param(EXERCISE_PARAM)
    }

    pub fn interaction_id(&self) -> Option<&str> {
        self.param(INTERACTION_PARAM)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.query.iter())
                .finish();
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

/// History-replacing navigation. There is no push: every move replaces the
/// current entry.
pub trait Navigator: Send + Sync {
    fn current(&self) -> Location;
    fn replace(&self, location: Location);
}

/// Replaces only when the target differs from the current location.
/// Returns whether a navigation happened.
pub fn replace_if_changed(nav: &dyn Navigator, target: Location) -> bool {
    if nav.current() == target {
        return false;
    }
    nav.replace(target);
    true
}

#[derive(Debug)]
struct History {
    current: Location,
    replaced: Vec<Location>,
}

/// In-process navigator; keeps every replacement so callers can inspect the
/// route changes.
#[derive(Debug)]
pub struct HistoryNavigator {
    inner: Mutex<History>,
}

impl HistoryNavigator {
    pub fn new(initial: Location) -> Self {
        Self { inner: Mutex::new(History { current: initial, replaced: Vec::new() }) }
    }

    pub fn replacements(&self) -> Vec<Location> {
        self.inner.lock().map(|h| h.replaced.clone()).unwrap_or_default()
    }
}

impl Navigator for HistoryNavigator {
    fn current(&self) -> Location {
        match self.inner.lock() {
            Ok(h) => h.current.clone(),
            Err(poisoned) => poisoned.into_inner().current.clone(),
        }
    }

    fn replace(&self, location: Location) {
        tracing::debug!(to = %location, "navigate (replace)");
        let mut h = match self.inner.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        h.replaced.push(location.clone());
        h.current = location;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_location_roundtrips_through_text() {
        let loc = Location::chat("e 1", Some("abc123"));
        assert_eq!(loc.to_string(), "/interacciones?id=e+1&interactionId=abc123");
        let parsed = Location::parse(&loc.to_string()).unwrap();
        assert_eq!(parsed, loc);
        assert_eq!(parsed.exercise_id(), Some("e 1"));
        assert_eq!(parsed.interaction_id(), Some("abc123"));
    }

    #[test]
    fn parse_accepts_full_urls_and_ignores_empty_params() {
        let loc = Location::parse("https://tutor.example/interacciones?id=e2&interactionId=").unwrap();
        assert_eq!(loc.path, CHAT_PATH);
        assert_eq!(loc.exercise_id(), Some("e2"));
        assert_eq!(loc.interaction_id(), None);
        assert_eq!(Location::dashboard().to_string(), "/dashboard");
    }

    #[test]
    fn replace_if_changed_skips_redundant_navigation() {
        let nav = HistoryNavigator::new(Location::chat("e1", None));
        assert!(!replace_if_changed(&nav, Location::chat("e1", None)));
        assert!(replace_if_changed(&nav, Location::chat("e1", Some("i1"))));
        assert!(!replace_if_changed(&nav, Location::chat("e1", Some("i1"))));
        assert_eq!(nav.replacements(), vec![Location::chat("e1", Some("i1"))]);
        assert_eq!(nav.current().interaction_id(), Some("i1"));
    }
}
