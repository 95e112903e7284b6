//! Failure severity classification
//!
//! Severity is derived from the handler's `error_type` via a fixed lookup
//! table that callers may extend at construction. Unknown types classify as
//! medium.

use std::collections::HashMap;

use weft_core::model::Severity;

/// Maps error types to severities
#[derive(Debug, Clone)]
pub struct SeverityClassifier {
    rules: HashMap<String, Severity>,
}

impl Default for SeverityClassifier {
    fn default() -> Self {
        let mut rules = HashMap::new();
        // Transport failures usually heal; retry aggressively.
        rules.insert("ConnectionError".to_string(), Severity::High);
        rules.insert("TransportError".to_string(), Severity::High);
        // Timeouts are ambiguous: the work may have happened.
        rules.insert("Timeout".to_string(), Severity::Medium);
        rules.insert("TimeoutError".to_string(), Severity::Medium);
        rules.insert("KeyError".to_string(), Severity::Medium);
        // Bad input does not heal on retry.
        rules.insert("ValueError".to_string(), Severity::Low);
        rules.insert("TypeError".to_string(), Severity::Low);
        // Credential failures need a human.
        rules.insert("AuthenticationError".to_string(), Severity::Critical);
        rules.insert("PermissionError".to_string(), Severity::Critical);
        Self { rules }
    }
}

impl SeverityClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or override a classification rule
    pub fn with_rule(mut self, error_type: impl Into<String>, severity: Severity) -> Self {
        self.rules.insert(error_type.into(), severity);
        self
    }

    /// Classify an error type; unknown types are medium
    pub fn classify(&self, error_type: &str) -> Severity {
        self.rules
            .get(error_type)
            .copied()
            .unwrap_or(Severity::Medium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let classifier = SeverityClassifier::new();

        assert_eq!(classifier.classify("ConnectionError"), Severity::High);
        assert_eq!(classifier.classify("Timeout"), Severity::Medium);
        assert_eq!(classifier.classify("ValueError"), Severity::Low);
        assert_eq!(classifier.classify("TypeError"), Severity::Low);
        assert_eq!(classifier.classify("AuthenticationError"), Severity::Critical);
    }

    #[test]
    fn test_unknown_is_medium() {
        let classifier = SeverityClassifier::new();
        assert_eq!(classifier.classify("SomethingNovel"), Severity::Medium);
    }

    #[test]
    fn test_caller_extension_overrides() {
        let classifier =
            SeverityClassifier::new().with_rule("QuotaExceeded", Severity::High)
                .with_rule("ValueError", Severity::Critical);

        assert_eq!(classifier.classify("QuotaExceeded"), Severity::High);
        assert_eq!(classifier.classify("ValueError"), Severity::Critical);
    }
}
