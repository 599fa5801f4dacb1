use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());
static CAMEL_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());

/// Tokenize text into lowercase words.
///
/// camelCase and snake_case identifiers are split so that symbol names
/// produced by code analysis match plain-word predicates
/// (`parseHeader` → `parse`, `header`).
pub fn tokenize(text: &str) -> Vec<String> {
    let split_camel = CAMEL_BOUNDARY.replace_all(text, "$1 $2");
    let cleaned = NON_WORD.replace_all(&split_camel, " ");
    cleaned
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_')
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Unique lowercase tokens of `text`.
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Whether `text` contains every token of `needle`.
pub fn mentions(text: &str, needle: &str) -> bool {
    let wanted = tokenize(needle);
    if wanted.is_empty() {
        return false;
    }
    let have = token_set(text);
    wanted.iter().all(|w| have.contains(w))
}
