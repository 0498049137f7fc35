//! Topic naming and wildcard matching.
//!
//! All topics produced or consumed by the runtime live under one namespace:
//!
//! | Purpose            | Topic                            |
//! |--------------------|----------------------------------|
//! | correlated request | `<ns>.request.<topic>`           |
//! | signal             | `<ns>.slot.<topic>`              |
//! | response           | `<ns>.response.<caller-id>`      |
//! | error broadcast    | `<ns>.error`                     |
//! | health check       | `<ns>.health.<process-ident>`    |

use regex::Regex;

/// Wildcard character accepted in subscription topics.
pub const WILDCARD: char = '*';

/// Errors raised while validating a subscription topic.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic {topic:?} contains more than one wildcard")]
    MultipleWildcards { topic: String },
    #[error("topic {topic:?} cannot be compiled: {reason}")]
    InvalidPattern { topic: String, reason: String },
}

/// Namespace-aware topic builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpace {
    namespace: String,
}

impl TopicSpace {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn request(&self, topic: &str) -> String {
        format!("{}.request.{topic}", self.namespace)
    }

    #[must_use]
    pub fn slot(&self, topic: &str) -> String {
        format!("{}.slot.{topic}", self.namespace)
    }

    #[must_use]
    pub fn response(&self, sender: &str) -> String {
        format!("{}{sender}", self.response_prefix())
    }

    #[must_use]
    pub fn response_prefix(&self) -> String {
        format!("{}.response.", self.namespace)
    }

    #[must_use]
    pub fn error(&self) -> String {
        format!("{}.error", self.namespace)
    }

    #[must_use]
    pub fn health(&self, ident: &str) -> String {
        format!("{}.health.{ident}", self.namespace)
    }

    /// Returns the caller id if `topic` is a response topic of this namespace.
    #[must_use]
    pub fn response_sender<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(".response."))
            .filter(|sender| !sender.is_empty())
    }
}

/// Returns `true` if the topic contains a wildcard.
#[must_use]
pub fn is_wildcard(topic: &str) -> bool {
    topic.contains(WILDCARD)
}

/// Validates a subscription topic: non-empty, at most one wildcard.
///
/// # Errors
///
/// Returns [`TopicError`] describing the first violated rule.
pub fn validate(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.matches(WILDCARD).count() > 1 {
        return Err(TopicError::MultipleWildcards {
            topic: topic.to_string(),
        });
    }
    Ok(())
}

/// Compiled subscription pattern.
///
/// The wildcard matches any run of characters (including dots), following
/// glob-style pattern subscriptions on pub/sub brokers.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compiles a validated pattern.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError`] if the topic fails [`validate`].
    pub fn new(pattern: &str) -> Result<Self, TopicError> {
        validate(pattern)?;
        let escaped: Vec<String> = pattern.split(WILDCARD).map(regex::escape).collect();
        let source = format!("^{}$", escaped.join(".*"));
        let regex = Regex::new(&source).map_err(|e| TopicError::InvalidPattern {
            topic: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn topic_space_prefixes() {
        let space = TopicSpace::new("sb");
        assert_eq!(space.request("echo"), "sb.request.echo");
        assert_eq!(space.slot("echo"), "sb.slot.echo");
        assert_eq!(space.response("abc"), "sb.response.abc");
        assert_eq!(space.error(), "sb.error");
        assert_eq!(space.health("host-1"), "sb.health.host-1");
    }

    #[test]
    fn response_sender_extraction() {
        let space = TopicSpace::new("sb");
        assert_eq!(space.response_sender("sb.response.abc"), Some("abc"));
        assert_eq!(space.response_sender("sb.response."), None);
        assert_eq!(space.response_sender("sb.request.abc"), None);
        assert_eq!(space.response_sender("other.response.abc"), None);
    }

    #[test]
    fn validation_rules() {
        assert_eq!(validate(""), Err(TopicError::Empty));
        assert!(validate("a.*").is_ok());
        assert!(matches!(
            validate("a.*.*"),
            Err(TopicError::MultipleWildcards { .. })
        ));
    }

    #[test]
    fn wildcard_matching() {
        let pattern = TopicPattern::new("sb.request.wildcard.*").unwrap();
        assert!(pattern.matches("sb.request.wildcard.foo"));
        assert!(pattern.matches("sb.request.wildcard.foo.bar"));
        assert!(!pattern.matches("sb.request.wildcard"));
        assert!(!pattern.matches("sb.request.other.foo"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = TopicPattern::new("a+b.(c)").unwrap();
        assert!(pattern.matches("a+b.(c)"));
        assert!(!pattern.matches("aab.(c)"));
        assert!(!pattern.matches("a+bx(c)"));
    }

    proptest! {
        #[test]
        fn exact_pattern_matches_only_itself(topic in "[a-z.]{1,20}", other in "[a-z.]{1,20}") {
            let pattern = TopicPattern::new(&topic).unwrap();
            prop_assert!(pattern.matches(&topic));
            prop_assert_eq!(pattern.matches(&other), topic == other);
        }

        #[test]
        fn prefix_wildcard_matches_any_suffix(prefix in "[a-z.]{0,10}", suffix in "[a-z.]{0,10}") {
            let pattern = TopicPattern::new(&format!("{prefix}*")).unwrap();
            let topic = format!("{prefix}{suffix}");
            prop_assert!(pattern.matches(&topic));
        }
    }
}
