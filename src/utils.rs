//! Common utility functions used across the codebase.

use chrono::{DateTime, Datelike, Utc};
use sha1::{Digest, Sha1};

const ELLIPSIS: &str = "...";

/// Cap a string at `max_chars` characters, marking any cut with "...".
///
/// Used for log digests, prompt gap titles and cycle summaries, which can
/// carry arbitrary payload text. Counts characters, not bytes, so
/// multi-byte input never splits mid-character.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    // One pass: walk up to max_chars + 1 chars to learn whether a cut is
    // needed without counting the whole string.
    let mut kept = String::new();
    let mut over = false;
    for (seen, c) in s.chars().enumerate() {
        if seen == max_chars {
            over = true;
            break;
        }
        kept.push(c);
    }
    if !over {
        return kept;
    }
    if max_chars <= ELLIPSIS.len() {
        return ELLIPSIS[..max_chars].to_string();
    }
    while kept.chars().count() > max_chars - ELLIPSIS.len() {
        kept.pop();
    }
    kept.push_str(ELLIPSIS);
    kept
}

/// Sanitize an arbitrary name into a safe lowercase slug.
/// Non-alphanumeric characters become hyphens, runs collapse, edges strip.
pub fn slug(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let mut result = String::new();
    let mut prev_hyphen = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
            prev_hyphen = false;
        } else if !prev_hyphen && !result.is_empty() {
            result.push('-');
            prev_hyphen = true;
        } else {
            prev_hyphen = true;
        }
    }
    let result = result.trim_end_matches('-').to_string();
    if result.is_empty() {
        "skill".to_string()
    } else {
        result
    }
}

/// Normalize an agent id for use as a directory name.
/// Same rules as [`slug`] but keeps dots and underscores, which are common
/// in operator-chosen agent ids.
pub fn normalize_agent_id(id: &str) -> String {
    let lower = id.trim().to_lowercase();
    let mut result = String::new();
    let mut prev_sep = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            result.push(c);
            prev_sep = false;
        } else if !prev_sep && !result.is_empty() {
            result.push('-');
            prev_sep = true;
        } else {
            prev_sep = true;
        }
    }
    let result = result.trim_end_matches('-').to_string();
    if result.is_empty() {
        "agent".to_string()
    } else {
        result
    }
}

/// 16-hex-char prefix of the SHA-1 digest of `input`.
/// Stable id derivation for gaps, signals and candidates.
pub fn sha1_16(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

fn datetime_from_ms(now_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(now_ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// UTC day key (`YYYY-MM-DD`) for an epoch-ms timestamp.
pub fn day_key(now_ms: i64) -> String {
    datetime_from_ms(now_ms).format("%Y-%m-%d").to_string()
}

/// ISO-week key (`YYYY-Www`) for an epoch-ms timestamp.
pub fn iso_week_key(now_ms: i64) -> String {
    let dt = datetime_from_ms(now_ms);
    let week = dt.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// ISO-8601 UTC timestamp for log headers.
pub fn iso_timestamp(now_ms: i64) -> String {
    datetime_from_ms(now_ms)
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// Turn a dotted event type into a human-readable title
/// (`task.stale.blocked` -> "task stale blocked").
pub fn title_from_type(event_type: &str) -> String {
    event_type
        .split('.')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_passes_short_input_through() {
        assert_eq!(truncate_str("cron.tick", 80), "cron.tick");
        assert_eq!(truncate_str("", 10), "");
        assert_eq!(truncate_str("exact", 5), "exact");
    }

    #[test]
    fn truncate_cuts_and_marks() {
        assert_eq!(
            truncate_str("queue drained with overflow", 12),
            "queue dra..."
        );
        // Budgets at or under the marker yield marker fragments.
        assert_eq!(truncate_str("deploy failed", 3), "...");
        assert_eq!(truncate_str("deploy failed", 2), "..");
        assert_eq!(truncate_str("deploy failed", 0), "");
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        assert_eq!(truncate_str("日本語テスト", 5), "日本...");
        let digest = truncate_str("🦀 panicked at canary stage", 8);
        assert_eq!(digest.chars().count(), 8);
        assert!(digest.starts_with("🦀"));
        assert!(digest.ends_with("..."));
    }

    #[test]
    fn slug_collapses_and_strips() {
        assert_eq!(slug("Retry logic for webhooks"), "retry-logic-for-webhooks");
        assert_eq!(slug("  --Weird__  name!! "), "weird-name");
        assert_eq!(slug("!!!"), "skill");
    }

    #[test]
    fn agent_id_keeps_dots_and_underscores() {
        assert_eq!(normalize_agent_id("Ops.Agent_1"), "ops.agent_1");
        assert_eq!(normalize_agent_id("a b/c"), "a-b-c");
        assert_eq!(normalize_agent_id(""), "agent");
    }

    #[test]
    fn sha1_16_is_stable_and_16_hex() {
        let a = sha1_16("cron:queue.overflow");
        assert_eq!(a.len(), 16);
        assert_eq!(a, sha1_16("cron:queue.overflow"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, sha1_16("cron:queue.invalid"));
    }

    #[test]
    fn day_and_week_keys_are_utc() {
        // 2024-03-01T00:30:00Z
        let ms = 1_709_253_000_000;
        assert_eq!(day_key(ms), "2024-03-01");
        assert_eq!(iso_week_key(ms), "2024-W09");
        assert_eq!(iso_timestamp(ms), "2024-03-01T00:30:00Z");
    }

    #[test]
    fn title_from_type_replaces_dots() {
        assert_eq!(title_from_type("task.stale.blocked"), "task stale blocked");
        assert_eq!(title_from_type("cron.tick"), "cron tick");
    }

    mod proptest_utils {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The workspace log truncates event payload digests to 80 chars
            // and the prompt truncates gap titles to 60: whatever the
            // payload contains, those budgets must hold and short text must
            // survive unchanged.
            #[test]
            fn payload_digests_respect_the_log_budget(payload in "\\PC{0,200}") {
                let digest = truncate_str(&payload, 80);
                prop_assert!(digest.chars().count() <= 80);
                if payload.chars().count() <= 80 {
                    prop_assert_eq!(digest, payload);
                }
            }

            #[test]
            fn cut_titles_keep_a_recognizable_prefix(title in "[a-z0-9 .]{61,150}") {
                let shown = truncate_str(&title, 60);
                prop_assert_eq!(shown.chars().count(), 60);
                prop_assert!(shown.ends_with("..."));
                let prefix = shown.trim_end_matches("...");
                prop_assert!(title.starts_with(prefix));
            }

            #[test]
            fn slug_output_is_always_safe(s in "\\PC{0,100}") {
                let out = slug(&s);
                assert!(!out.is_empty());
                assert!(out
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
                assert!(!out.starts_with('-') && !out.ends_with('-'));
            }

            #[test]
            fn sha1_16_never_panics(s in "\\PC{0,200}") {
                let out = sha1_16(&s);
                assert_eq!(out.len(), 16);
            }
        }
    }
}
