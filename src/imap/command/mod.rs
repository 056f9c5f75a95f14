//! State-scoped command handlers.
//!
//! Handlers are `impl Session` blocks grouped by the session mode they belong
//! to; the mode table in the parser has already rejected commands outside
//! their legal states by the time these run.

pub mod anonymous;
pub mod anystate;
pub mod authenticated;
pub mod selected;

use itertools::Itertools;

use crate::imap::types::Flag;

/// LIST/LSUB glob match: `*` crosses hierarchy delimiters, `%` does not.
pub(crate) fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    match_at(&p, &n, 0, 0)
}

fn match_at(p: &[char], n: &[char], pi: usize, ni: usize) -> bool {
    if pi == p.len() {
        return ni == n.len();
    }
    match p[pi] {
        '*' => {
            (ni..=n.len()).any(|skip| match_at(p, n, pi + 1, skip))
        }
        '%' => {
            // any run not containing the delimiter
            (ni..=n.len())
                .take_while(|&end| n[ni..end].iter().all(|&c| c != '/'))
                .any(|end| match_at(p, n, pi + 1, end))
        }
        c => ni < n.len() && n[ni] == c && match_at(p, n, pi + 1, ni + 1),
    }
}

pub(crate) fn flags_wire(flags: &[Flag]) -> String {
    flags.iter().map(|f| f.to_string()).join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_star_crosses_hierarchy() {
        assert!(matches_wildcard("*", "INBOX/sub/deep"));
        assert!(matches_wildcard("INBOX/*", "INBOX/sub/deep"));
        assert!(!matches_wildcard("INBOX/*", "Archive"));
        assert!(matches_wildcard("*deep", "INBOX/sub/deep"));
    }

    #[test]
    fn wildcard_percent_stops_at_delimiter() {
        assert!(matches_wildcard("%", "INBOX"));
        assert!(!matches_wildcard("%", "INBOX/sub"));
        assert!(matches_wildcard("INBOX/%", "INBOX/sub"));
        assert!(!matches_wildcard("INBOX/%", "INBOX/sub/deep"));
    }

    #[test]
    fn wildcard_literal_and_mixed() {
        assert!(matches_wildcard("INBOX", "INBOX"));
        assert!(!matches_wildcard("INBOX", "INBOX2"));
        assert!(matches_wildcard("IN*X", "INBOX"));
        assert!(matches_wildcard("a%c", "abc"));
    }

    #[test]
    fn flags_render() {
        assert_eq!(
            flags_wire(&[Flag::Seen, Flag::Keyword("ToDo".into())]),
            "\\Seen ToDo"
        );
        assert_eq!(flags_wire(&[]), "");
    }
}
