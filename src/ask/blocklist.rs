use once_cell::sync::Lazy;
use regex::Regex;

/// Topics refused before any upstream call.
pub const BLOCKED_TERMS: &[&str] = &[
    "politics",
    "vote",
    "election",
    "religion",
    "porn",
    "sex",
    "attack",
    "kill",
    "murder",
    "drugs",
    "illegal",
    "password",
    "bank",
    "credit card",
    "hack",
    "terror",
];

static BLOCKLIST: Lazy<Regex> = Lazy::new(|| {
    let alternatives = BLOCKED_TERMS
        .iter()
        .map(|term| regex::escape(term))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternatives})\b")).expect("blocklist pattern is valid")
});

/// Whole-word, case-insensitive match against [`BLOCKED_TERMS`].
pub fn is_blocked(text: &str) -> bool {
    BLOCKLIST.is_match(text)
}
