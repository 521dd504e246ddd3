use crate::level::Level;
use std::collections::BTreeMap;

/// Minimum level per logger namespace.
///
/// A prefix matches a logger name when the name equals it or continues it
/// at a `::` or `.` boundary, so `app::db` covers `app::db::pool` and
/// `io.acme` covers `io.acme.Server`, but `app` does not cover `application`.
/// The longest matching prefix wins; names with no match use the root level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelFilterMap {
    root: Level,
    // Longest prefix first.
    prefixes: Vec<(String, Level)>,
}

impl Default for LevelFilterMap {
    fn default() -> Self {
        LevelFilterMap::new(Level::Trace)
    }
}

impl LevelFilterMap {
    pub fn new(root: Level) -> Self {
        LevelFilterMap {
            root,
            prefixes: Vec::new(),
        }
    }

    pub fn from_map(root: Level, map: &BTreeMap<String, Level>) -> Self {
        map.iter()
            .fold(LevelFilterMap::new(root), |acc, (prefix, level)| acc.with(prefix.clone(), *level))
    }

    /// Set the minimum level for a namespace prefix. An empty prefix
    /// replaces the root level.
    pub fn with(mut self, prefix: impl Into<String>, level: Level) -> Self {
        let prefix = prefix.into();
        if prefix.is_empty() {
            self.root = level;
            return self;
        }
        self.prefixes.retain(|(p, _)| *p != prefix);
        self.prefixes.push((prefix, level));
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn root(&self) -> Level {
        self.root
    }

    pub fn minimum_for(&self, logger_name: &str) -> Level {
        self.prefixes
            .iter()
            .find(|(prefix, _)| covers(prefix, logger_name))
            .map(|(_, level)| *level)
            .unwrap_or(self.root)
    }

    pub fn admits(&self, logger_name: &str, level: Level) -> bool {
        level.is_at_least(self.minimum_for(logger_name))
    }
}

fn covers(prefix: &str, name: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with("::") || rest.starts_with('.'),
        None => false,
    }
}
