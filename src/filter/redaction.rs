//! Span redaction

use super::models::RedactionConfig;
use tracing::warn;

pub const DEFAULT_REPLACEMENT: &str = "[REDACTED]";
pub const DEFAULT_MASK: char = '*';

/// A span to replace, with the config of the rule that recorded it
#[derive(Debug, Clone)]
pub struct RedactionSpan<'a> {
    pub start: usize,
    pub end: usize,
    pub config: &'a RedactionConfig,
}

/// Replacement text for one span
fn replacement(config: &RedactionConfig, original: &str) -> String {
    if config.preserve_length || (config.mask_char.is_some() && config.replacement.is_none()) {
        let mask = config.mask_char.unwrap_or(DEFAULT_MASK);
        return std::iter::repeat(mask).take(original.chars().count()).collect();
    }
    config
        .replacement
        .clone()
        .unwrap_or_else(|| DEFAULT_REPLACEMENT.to_string())
}

/// Apply every span in reverse start order so earlier offsets stay valid.
///
/// Spans are not merged. When two spans overlap, the later replacement
/// lands on text already rewritten by the earlier one.
pub fn redact(text: &str, spans: &[RedactionSpan<'_>]) -> String {
    let mut ordered: Vec<&RedactionSpan<'_>> = spans.iter().collect();
    ordered.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));

    let mut out = text.to_string();
    for span in ordered {
        let end = span.end.min(out.len());
        if span.start >= end
            || !out.is_char_boundary(span.start)
            || !out.is_char_boundary(end)
        {
            warn!(
                "Skipping redaction span {}..{} (text is {} bytes)",
                span.start,
                span.end,
                out.len()
            );
            continue;
        }
        let replaced = replacement(span.config, &out[span.start..end]);
        out.replace_range(span.start..end, &replaced);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn literal(replacement: &str) -> RedactionConfig {
        RedactionConfig {
            replacement: Some(replacement.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_reverse_order_keeps_offsets_valid() {
        let config = literal("[X]");
        let text = "a@b.com and c@d.org";
        let spans = [
            RedactionSpan { start: 0, end: 7, config: &config },
            RedactionSpan { start: 12, end: 19, config: &config },
        ];
        assert_eq!(redact(text, &spans), "[X] and [X]");
    }

    #[test]
    fn test_mask_preserves_length() {
        let config = RedactionConfig {
            replacement: None,
            mask_char: Some('#'),
            preserve_length: true,
        };
        let spans = [RedactionSpan { start: 4, end: 15, config: &config }];
        assert_eq!(redact("ssn 123-45-6789", &spans), "ssn ###########");
    }

    #[test]
    fn test_default_replacement() {
        let config = RedactionConfig::default();
        let spans = [RedactionSpan { start: 0, end: 5, config: &config }];
        assert_eq!(redact("hello world", &spans), "[REDACTED] world");
    }

    #[test]
    fn test_identical_spans_are_both_applied() {
        let config = RedactionConfig::default();
        let text = "contact me at a@b.com";
        let spans = [
            RedactionSpan { start: 14, end: 21, config: &config },
            RedactionSpan { start: 14, end: 21, config: &config },
        ];
        // The second pass rewrites the first 7 bytes of "[REDACTED]".
        assert_eq!(redact(text, &spans), "contact me at [REDACTED]ED]");
    }

    #[test]
    fn test_out_of_range_span_is_skipped() {
        let config = RedactionConfig::default();
        let spans = [RedactionSpan { start: 50, end: 60, config: &config }];
        assert_eq!(redact("short", &spans), "short");

        // Not a char boundary inside the two-byte 'é'
        let spans = [RedactionSpan { start: 1, end: 2, config: &config }];
        assert_eq!(redact("é", &spans), "é");
    }
}
