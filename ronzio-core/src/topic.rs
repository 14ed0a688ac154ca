//! MQTT topic utilities.
//!
//! Topic names and filters are canonicalized with [`normalize`] before any
//! other processing, and [`matches`] implements MQTT wildcard matching for
//! filters against concrete topic names.

/// Canonicalize a topic string: collapse runs of `/` into a single `/` and
/// strip a trailing `/` from a non-root topic.
///
/// Idempotent: `normalize(normalize(t)) == normalize(t)`.
pub fn normalize(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    let mut prev_slash = false;

    for c in topic.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }

    out
}

/// Check if a topic name matches a filter (with wildcard support).
///
/// `+` matches exactly one level, `#` matches the remainder of the topic
/// including the parent level (`sport/#` matches `sport`).
pub fn matches(topic: &str, filter: &str) -> bool {
    let topic_parts: Vec<&str> = topic.split('/').collect();
    let mut topic_idx = 0;

    for filter_part in filter.split('/') {
        if filter_part == "#" {
            return true;
        }

        if topic_idx >= topic_parts.len() {
            return false;
        }

        if filter_part != "+" && filter_part != topic_parts[topic_idx] {
            return false;
        }
        topic_idx += 1;
    }

    topic_idx == topic_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_slashes() {
        assert_eq!(normalize("a//b"), "a/b");
        assert_eq!(normalize("a///b///c"), "a/b/c");
        assert_eq!(normalize("//a"), "/a");
    }

    #[test]
    fn test_normalize_strips_trailing_slash() {
        assert_eq!(normalize("a/b/"), "a/b");
        assert_eq!(normalize("a/"), "a");
        assert_eq!(normalize("a//"), "a");
    }

    #[test]
    fn test_normalize_keeps_root() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        for t in ["", "/", "a", "a/b", "a//b/", "//", "sensors/kitchen/temp/"] {
            let once = normalize(t);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", t);
        }
    }

    #[test]
    fn test_matches_exact() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_matches_single_level_wildcard() {
        assert!(matches("sport/tennis/player1", "sport/+/player1"));
        assert!(matches("sport/tennis", "sport/+"));
        assert!(!matches("sport/tennis/player1", "sport/+"));
        assert!(matches("/finance", "+/+"));
    }

    #[test]
    fn test_matches_multi_level_wildcard() {
        assert!(matches("sport/tennis/player1/ranking", "sport/tennis/#"));
        assert!(matches("sport/tennis", "sport/tennis/#"));
        assert!(matches("anything/at/all", "#"));
        assert!(!matches("sport/tennis", "hockey/#"));
    }

    #[test]
    fn test_matches_sys_topics_need_explicit_filters() {
        // The fabric itself matches them; the session gate is elsewhere.
        assert!(matches("$SYS/uptime", "#"));
        assert!(matches("$SYS/uptime", "$SYS/#"));
        assert!(matches("$SYS/uptime", "$SYS/+"));
    }
}
