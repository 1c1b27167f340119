use parking_lot::Mutex;
use regex::Regex;

use crate::cache::LruCache;
use crate::value::{FieldMap, FieldValue, MAX_FIELD_DEPTH};
use crate::LogmuxError;

const REDACTION_CACHE_SIZE: usize = 256;

// Field keys whose values are always fully replaced, matched
// case-insensitively against the exact key name.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "access_token",
    "refresh_token",
    "authorization",
    "auth_token",
    "ssn",
    "social_security",
    "credit_card",
    "creditcard",
];

/// One segment of a field-path rule; `*` matches any single key.
#[derive(Clone, Debug, PartialEq)]
enum PathSegment {
    Literal(String),
    Wildcard,
}

/// A rule like `user.ssn` or `users.*.email` that forces replacement of the
/// value at that path, overriding the pattern scan.
#[derive(Clone, Debug)]
pub struct FieldPathRule {
    segments: Vec<PathSegment>,
}

impl FieldPathRule {
    /// Parses a dot-separated path; `*` segments match any key.
    pub fn parse(path: &str) -> Result<Self, LogmuxError> {
        if path.is_empty() {
            return Err(LogmuxError::InvalidConfig(
                "empty redaction field path".to_string(),
            ));
        }
        let segments = path
            .split('.')
            .map(|s| {
                if s == "*" {
                    PathSegment::Wildcard
                } else {
                    PathSegment::Literal(s.to_string())
                }
            })
            .collect();
        Ok(Self { segments })
    }

    fn matches(&self, path: &[&str]) -> bool {
        self.segments.len() == path.len()
            && self
                .segments
                .iter()
                .zip(path)
                .all(|(seg, key)| match seg {
                    PathSegment::Wildcard => true,
                    PathSegment::Literal(l) => l == key,
                })
    }
}

/// Masks sensitive content in messages and structured fields.
///
/// Messages are scanned by each compiled pattern in configuration order;
/// results are cached in a small LRU. Field maps are recursed to a bounded
/// depth: sensitive key names are fully replaced, string values are scanned
/// by the patterns, and field-path rules override per path.
pub struct Redactor {
    patterns: Vec<Regex>,
    replacement: String,
    field_rules: Vec<FieldPathRule>,
    cache: Mutex<LruCache<String, String>>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("patterns", &self.patterns.len())
            .field("replacement", &self.replacement)
            .field("field_rules", &self.field_rules.len())
            .finish()
    }
}

impl Redactor {
    /// Compiles the given patterns.
    ///
    /// # Errors
    ///
    /// `LogmuxError::InvalidConfig` if any pattern does not compile.
    pub fn new(patterns: &[&str], replacement: &str) -> Result<Self, LogmuxError> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    LogmuxError::InvalidConfig(format!("bad redaction pattern {:?}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: compiled,
            replacement: replacement.to_string(),
            field_rules: Vec::new(),
            cache: Mutex::new(LruCache::new(REDACTION_CACHE_SIZE, None)),
        })
    }

    /// Adds field-path rules such as `user.ssn` or `users.*.email`.
    pub fn with_field_rules(mut self, rules: Vec<FieldPathRule>) -> Self {
        self.field_rules = rules;
        self
    }

    /// Replaces all non-overlapping pattern matches, left to right, pattern
    /// by pattern in configuration order.
    #[must_use]
    pub fn redact(&self, message: &str) -> String {
        if self.patterns.is_empty() {
            return message.to_string();
        }
        if let Some(hit) = self.cache.lock().get(&message.to_string()) {
            return hit;
        }
        let mut out = message.to_string();
        for pattern in &self.patterns {
            out = pattern
                .replace_all(&out, self.replacement.as_str())
                .into_owned();
        }
        self.cache.lock().insert(message.to_string(), out.clone());
        out
    }

    /// Redacts a structured field map in place.
    pub fn redact_fields(&self, fields: &mut FieldMap) {
        let mut path: Vec<String> = Vec::new();
        self.redact_map(fields, &mut path, 0);
    }

    fn redact_map(&self, map: &mut FieldMap, path: &mut Vec<String>, depth: usize) {
        if depth >= MAX_FIELD_DEPTH {
            return;
        }
        for (key, value) in map.iter_mut() {
            path.push(key.clone());
            if self.key_forces_replacement(key) || self.path_forces_replacement(path) {
                *value = FieldValue::Str(self.replacement.clone());
            } else {
                self.redact_value(value, path, depth + 1);
            }
            path.pop();
        }
    }

    fn redact_value(&self, value: &mut FieldValue, path: &mut Vec<String>, depth: usize) {
        if depth > MAX_FIELD_DEPTH {
            return;
        }
        match value {
            FieldValue::Str(s) => {
                let redacted = self.redact(s);
                if redacted != *s {
                    *s = redacted;
                }
            }
            FieldValue::Map(m) => self.redact_map(m, path, depth),
            FieldValue::List(items) => {
                for item in items.iter_mut() {
                    // a list element occupies one wildcard path position
                    path.push("*".to_string());
                    self.redact_value(item, path, depth + 1);
                    path.pop();
                }
            }
            _ => {}
        }
    }

    fn key_forces_replacement(&self, key: &str) -> bool {
        SENSITIVE_KEYS
            .iter()
            .any(|s| key.eq_ignore_ascii_case(s))
    }

    fn path_forces_replacement(&self, path: &[String]) -> bool {
        if self.field_rules.is_empty() {
            return false;
        }
        let borrowed: Vec<&str> = path.iter().map(String::as_str).collect();
        self.field_rules.iter().any(|r| r.matches(&borrowed))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fields;

    fn redactor() -> Redactor {
        Redactor::new(&[r"password=\S+"], "[REDACTED]").unwrap()
    }

    #[test]
    fn message_patterns_are_replaced() {
        let r = redactor();
        let out = r.redact("user=alice password=secret123 other=v");
        assert_eq!(out, "user=alice [REDACTED] other=v");
        assert!(!out.contains("secret123"));
    }

    #[test]
    fn redaction_is_idempotent() {
        let r = redactor();
        let once = r.redact("password=hunter2");
        assert_eq!(r.redact(&once), once);
    }

    #[test]
    fn sensitive_keys_are_fully_replaced() {
        let r = redactor();
        let mut fields = fields! {
            "Password" => "hunter2",
            "api_key" => "k-123",
            "user" => "alice",
        };
        r.redact_fields(&mut fields);
        assert_eq!(fields["Password"], FieldValue::Str("[REDACTED]".into()));
        assert_eq!(fields["api_key"], FieldValue::Str("[REDACTED]".into()));
        assert_eq!(fields["user"], FieldValue::Str("alice".into()));
    }

    #[test]
    fn string_values_are_pattern_scanned() {
        let r = redactor();
        let mut fields = fields! { "note" => "login with password=abc" };
        r.redact_fields(&mut fields);
        assert_eq!(
            fields["note"],
            FieldValue::Str("login with [REDACTED]".into())
        );
    }

    #[test]
    fn nested_maps_are_recursed_but_depth_bounded() {
        let r = redactor();
        let mut inner = FieldMap::new();
        inner.insert("token".to_string(), FieldValue::from("t-1"));
        let mut fields = FieldMap::new();
        fields.insert("auth".to_string(), FieldValue::Map(inner));
        r.redact_fields(&mut fields);
        match &fields["auth"] {
            FieldValue::Map(m) => {
                assert_eq!(m["token"], FieldValue::Str("[REDACTED]".into()));
            }
            other => panic!("expected map, got {:?}", other),
        }

        // below the bound nothing is touched
        let mut v = FieldValue::from("password=deep");
        for _ in 0..(MAX_FIELD_DEPTH + 2) {
            let mut m = FieldMap::new();
            m.insert("nest".to_string(), v);
            v = FieldValue::Map(m);
        }
        let mut fields = FieldMap::new();
        fields.insert("top".to_string(), v);
        r.redact_fields(&mut fields);
        let json = serde_json::to_string(&crate::value::BoundedJsonMap(&fields)).unwrap();
        assert!(!json.contains("password=deep"));
    }

    #[test]
    fn field_path_rules_override() {
        let r = redactor().with_field_rules(vec![
            FieldPathRule::parse("user.email").unwrap(),
            FieldPathRule::parse("accounts.*.pin").unwrap(),
        ]);
        let mut user = FieldMap::new();
        user.insert("email".to_string(), FieldValue::from("a@b.c"));
        user.insert("name".to_string(), FieldValue::from("alice"));
        let mut acct = FieldMap::new();
        acct.insert("pin".to_string(), FieldValue::from("0000"));
        let mut accounts = FieldMap::new();
        accounts.insert("main".to_string(), FieldValue::Map(acct));
        let mut fields = FieldMap::new();
        fields.insert("user".to_string(), FieldValue::Map(user));
        fields.insert("accounts".to_string(), FieldValue::Map(accounts));

        r.redact_fields(&mut fields);
        match (&fields["user"], &fields["accounts"]) {
            (FieldValue::Map(u), FieldValue::Map(a)) => {
                assert_eq!(u["email"], FieldValue::Str("[REDACTED]".into()));
                assert_eq!(u["name"], FieldValue::Str("alice".into()));
                match &a["main"] {
                    FieldValue::Map(m) => {
                        assert_eq!(m["pin"], FieldValue::Str("[REDACTED]".into()));
                    }
                    other => panic!("expected map, got {:?}", other),
                }
            }
            other => panic!("unexpected shapes: {:?}", other),
        }
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(Redactor::new(&["("], "[X]").is_err());
    }
}
