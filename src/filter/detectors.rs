//! Structural PII detectors
//!
//! A fixed battery run for every rule in the `pii` category, in addition to
//! the rule's own patterns and keywords.

use once_cell::sync::Lazy;
use regex::Regex;

struct Detector {
    name: &'static str,
    regex: Regex,
}

fn detector(name: &'static str, pattern: &str) -> Detector {
    Detector {
        name,
        // Patterns are constants covered by tests.
        regex: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid {} detector: {}", name, e)),
    }
}

static DETECTORS: Lazy<Vec<Detector>> = Lazy::new(|| {
    vec![
        detector("email", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
        detector(
            "phone",
            r"(?:\+\d{1,3}[-.\s]?)?\(?\b\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b",
        ),
        detector("national_id", r"\b\d{3}-\d{2}-\d{4}\b"),
        detector("card_number", r"\b(?:\d{4}[-\s]?){3}\d{4}\b"),
        detector(
            "ip_address",
            r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
        ),
        detector("date", r"\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4})\b"),
    ]
});

/// A detector hit; offsets are byte offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub detector: &'static str,
    pub start: usize,
    pub end: usize,
}

/// Run every detector over `text`. Overlapping hits from different
/// detectors are all reported.
pub fn detect_pii(text: &str) -> Vec<Detection> {
    DETECTORS
        .iter()
        .flat_map(|d| {
            d.regex.find_iter(text).map(move |m| Detection {
                detector: d.name,
                start: m.start(),
                end: m.end(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(text: &str) -> Vec<&'static str> {
        detect_pii(text).into_iter().map(|d| d.detector).collect()
    }

    #[test]
    fn test_each_detector() {
        assert_eq!(names("contact me at a@b.com"), vec!["email"]);
        assert_eq!(names("call 555-867-5309 today"), vec!["phone"]);
        assert_eq!(names("ssn 123-45-6789"), vec!["national_id"]);
        assert_eq!(names("card 4111 1111 1111 1111"), vec!["card_number"]);
        assert_eq!(names("from 192.168.0.1"), vec!["ip_address"]);
        assert_eq!(names("born 1990-04-12"), vec!["date"]);
        assert_eq!(names("born 4/12/1990"), vec!["date"]);
    }

    #[test]
    fn test_offsets_point_at_the_match() {
        let text = "contact me at a@b.com";
        let hits = detect_pii(text);
        assert_eq!(hits.len(), 1);
        assert_eq!(&text[hits[0].start..hits[0].end], "a@b.com");
    }

    #[test]
    fn test_clean_text() {
        assert!(detect_pii("the quick brown fox, version 2").is_empty());
        assert!(detect_pii("[REDACTED] and ******").is_empty());
    }
}
