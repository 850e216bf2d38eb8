//! Signal extraction from message content

use std::sync::LazyLock;

use regex::Regex;

use super::types::Signal;

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(\w+(?:-\w+)*)").expect("MENTION_RE regex should compile")
});

/// Parse mentions and the `!despawn` guardrail from content, mentions first
/// in textual order
pub fn parse_signals(content: &str) -> Vec<Signal> {
    let mut signals: Vec<Signal> = MENTION_RE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| Signal::mention(m.as_str().to_lowercase()))
        .collect();

    if content.to_lowercase().contains("!despawn") {
        signals.push(Signal::Despawn);
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_in_order() {
        let signals = parse_signals("@Zealot please ask @zealot-3f9a01bc and @human");
        assert_eq!(
            signals,
            vec![
                Signal::mention("zealot"),
                Signal::mention("zealot-3f9a01bc"),
                Signal::mention("human"),
            ]
        );
    }

    #[test]
    fn test_guardrails() {
        let signals = parse_signals("done here !DESPAWN");
        assert_eq!(signals, vec![Signal::Despawn]);

        let signals = parse_signals("!despawn @arbiter");
        assert_eq!(signals, vec![Signal::mention("arbiter"), Signal::Despawn]);
    }

    #[test]
    fn test_plain_prose_has_no_signals() {
        assert!(parse_signals("email me at nobody, thanks").is_empty());
        assert!(parse_signals("").is_empty());
    }
}
