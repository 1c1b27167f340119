use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::LruCache;
use crate::level::Level;
use crate::value::FieldMap;

/// A predicate over `(level, message, fields)`; `true` keeps the record.
pub type FilterFn = Arc<dyn Fn(Level, &str, &FieldMap) -> bool + Send + Sync>;

/// How the chain combines its filter verdicts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainMode {
    /// Keep only if every enabled filter keeps.
    And,
    /// Keep if any enabled filter keeps.
    Or,
    /// Keep if exactly an odd number of enabled filters keep.
    Xor,
}

struct NamedFilter {
    name: String,
    priority: i32,
    enabled: bool,
    func: FilterFn,
}

impl std::fmt::Debug for NamedFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedFilter")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

type DecisionKey = (Level, String, [Option<String>; 3]);

/// An ordered list of named filters combined by a [`ChainMode`].
///
/// Filters run in descending priority order (insertion order breaks ties).
/// In OR mode with `stop_on_match`, evaluation ends at the first keeper.
/// `inverted` negates the combined verdict. Decisions may be cached by
/// `(level, message, first three field keys)` with a TTL.
#[derive(Debug)]
pub struct FilterChain {
    mode: ChainMode,
    filters: Vec<NamedFilter>,
    stop_on_match: bool,
    inverted: bool,
    cache: Option<Mutex<LruCache<DecisionKey, bool>>>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new(ChainMode::And)
    }
}

impl FilterChain {
    #[must_use]
    pub fn new(mode: ChainMode) -> Self {
        Self {
            mode,
            filters: Vec::new(),
            stop_on_match: false,
            inverted: false,
            cache: None,
        }
    }

    /// In OR mode, stop evaluating at the first filter that keeps.
    #[must_use]
    pub fn stop_on_match(mut self) -> Self {
        self.stop_on_match = true;
        self
    }

    /// Negate the combined verdict.
    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }

    /// Cache decisions with the given capacity and TTL.
    #[must_use]
    pub fn with_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache = Some(Mutex::new(LruCache::new(capacity, Some(ttl))));
        self
    }

    /// Appends a filter with priority 0.
    pub fn add(&mut self, name: &str, func: FilterFn) {
        self.add_with_priority(name, 0, func);
    }

    pub fn add_with_priority(&mut self, name: &str, priority: i32, func: FilterFn) {
        self.filters.push(NamedFilter {
            name: name.to_string(),
            priority,
            enabled: true,
            func,
        });
        // descending priority, stable for equal priorities
        self.filters.sort_by_key(|f| std::cmp::Reverse(f.priority));
    }

    /// Enables or disables a named filter; disabled filters are skipped.
    ///
    /// Returns false if no filter has that name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for f in &mut self.filters {
            if f.name == name {
                f.enabled = enabled;
                found = true;
            }
        }
        found
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f.name != name);
        before != self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluates the chain; `true` keeps the record.
    #[must_use]
    pub fn keep(&self, level: Level, message: &str, fields: &FieldMap) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let key = self.cache.as_ref().map(|_| decision_key(level, message, fields));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(decision) = cache.lock().get(key) {
                return decision;
            }
        }

        let decision = self.evaluate(level, message, fields);
        let decision = if self.inverted { !decision } else { decision };

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.lock().insert(key, decision);
        }
        decision
    }

    fn evaluate(&self, level: Level, message: &str, fields: &FieldMap) -> bool {
        match self.mode {
            ChainMode::And => {
                for f in self.filters.iter().filter(|f| f.enabled) {
                    if !(f.func)(level, message, fields) {
                        return false;
                    }
                }
                true
            }
            ChainMode::Or => {
                let mut any_enabled = false;
                let mut kept = false;
                for f in self.filters.iter().filter(|f| f.enabled) {
                    any_enabled = true;
                    if (f.func)(level, message, fields) {
                        kept = true;
                        if self.stop_on_match {
                            break;
                        }
                    }
                }
                kept || !any_enabled
            }
            ChainMode::Xor => {
                let mut any_enabled = false;
                let mut keepers = 0usize;
                for f in self.filters.iter().filter(|f| f.enabled) {
                    any_enabled = true;
                    if (f.func)(level, message, fields) {
                        keepers += 1;
                    }
                }
                !any_enabled || keepers % 2 == 1
            }
        }
    }
}

fn decision_key(level: Level, message: &str, fields: &FieldMap) -> DecisionKey {
    let mut keys = fields.keys();
    (
        level,
        message.to_string(),
        [
            keys.next().cloned(),
            keys.next().cloned(),
            keys.next().cloned(),
        ],
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FieldMap;

    fn min_warn() -> FilterFn {
        Arc::new(|level, _, _| level >= Level::Warn)
    }

    fn contains_db() -> FilterFn {
        Arc::new(|_, message: &str, _| message.contains("db"))
    }

    #[test]
    fn empty_chain_keeps_everything() {
        let chain = FilterChain::default();
        assert!(chain.keep(Level::Trace, "anything", &FieldMap::new()));
    }

    #[test]
    fn and_requires_all() {
        let mut chain = FilterChain::new(ChainMode::And);
        chain.add("min-warn", min_warn());
        chain.add("db-only", contains_db());
        let f = FieldMap::new();
        assert!(!chain.keep(Level::Warn, "cache miss", &f));
        assert!(chain.keep(Level::Warn, "db error", &f));
        assert!(chain.keep(Level::Error, "db down", &f));
        assert!(!chain.keep(Level::Info, "db connect", &f));
    }

    #[test]
    fn or_accepts_any() {
        let mut chain = FilterChain::new(ChainMode::Or).stop_on_match();
        chain.add("min-warn", min_warn());
        chain.add("db-only", contains_db());
        let f = FieldMap::new();
        assert!(chain.keep(Level::Info, "db connect", &f));
        assert!(chain.keep(Level::Error, "cache miss", &f));
        assert!(!chain.keep(Level::Info, "cache miss", &f));
    }

    #[test]
    fn xor_counts_keepers() {
        let mut chain = FilterChain::new(ChainMode::Xor);
        chain.add("min-warn", min_warn());
        chain.add("db-only", contains_db());
        let f = FieldMap::new();
        // both match -> even -> reject
        assert!(!chain.keep(Level::Warn, "db error", &f));
        // one matches -> keep
        assert!(chain.keep(Level::Warn, "cache miss", &f));
        assert!(!chain.keep(Level::Info, "cache miss", &f));
    }

    #[test]
    fn inverted_negates() {
        let mut chain = FilterChain::new(ChainMode::And).inverted();
        chain.add("min-warn", min_warn());
        let f = FieldMap::new();
        assert!(chain.keep(Level::Info, "x", &f));
        assert!(!chain.keep(Level::Error, "x", &f));
    }

    #[test]
    fn disabled_filters_are_skipped() {
        let mut chain = FilterChain::new(ChainMode::And);
        chain.add("min-warn", min_warn());
        assert!(!chain.keep(Level::Info, "x", &FieldMap::new()));
        assert!(chain.set_enabled("min-warn", false));
        assert!(chain.keep(Level::Info, "x", &FieldMap::new()));
        assert!(!chain.set_enabled("nope", false));
    }

    #[test]
    fn priority_orders_evaluation() {
        let mut chain = FilterChain::new(ChainMode::Or).stop_on_match();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        chain.add_with_priority(
            "low",
            1,
            Arc::new(move |_, _, _| {
                o1.lock().push("low");
                true
            }),
        );
        chain.add_with_priority(
            "high",
            10,
            Arc::new(move |_, _, _| {
                o2.lock().push("high");
                true
            }),
        );
        assert!(chain.keep(Level::Info, "x", &FieldMap::new()));
        // high priority ran first and stop_on_match ended evaluation
        assert_eq!(*order.lock(), vec!["high"]);
    }

    #[test]
    fn cache_returns_same_decision() {
        let mut chain =
            FilterChain::new(ChainMode::And).with_cache(16, Duration::from_secs(60));
        let calls: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let c = calls.clone();
        chain.add(
            "count",
            Arc::new(move |_, _, _| {
                *c.lock() += 1;
                true
            }),
        );
        let f = FieldMap::new();
        assert!(chain.keep(Level::Info, "same", &f));
        assert!(chain.keep(Level::Info, "same", &f));
        assert_eq!(*calls.lock(), 1);
    }
}
