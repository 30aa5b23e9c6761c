//! Plain-text abstracts from a position-inverted index (token -> positions).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Highest token position accepted from an index. Real abstracts stay far
/// below this; anything larger is treated as a malformed index.
pub const MAX_POSITION: usize = 100_000;

static SPACE_BEFORE_PUNCT: LazyLock<Regex> = LazyLock::new(|| compile(r"\s+([,.;:!?])"));
static SPACE_AFTER_OPEN: LazyLock<Regex> = LazyLock::new(|| compile(r"\(\s+"));
static SPACE_BEFORE_CLOSE: LazyLock<Regex> = LazyLock::new(|| compile(r"\s+\)"));
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"\s{2,}"));

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex pattern is valid")
}

/// Rebuilds the abstract text.
///
/// Tokens are placed at their positions, joined by single spaces, and then
/// punctuation spacing is tidied. Returns `None` for an absent or empty index,
/// and for one with a position above [`MAX_POSITION`].
#[must_use]
pub fn reconstruct(index: Option<&HashMap<String, Vec<usize>>>) -> Option<String> {
    let index = index?;
    let max_position = index.values().flatten().copied().max()?;
    if max_position > MAX_POSITION {
        warn!(max_position, "ignoring abstract index with out-of-range position");
        return None;
    }

    let mut tokens = vec![""; max_position.checked_add(1)?];
    for (token, positions) in index {
        for &position in positions {
            tokens[position] = token.as_str();
        }
    }

    let text = tokens.join(" ");
    let text = SPACE_BEFORE_PUNCT.replace_all(text.trim(), "$1");
    let text = SPACE_AFTER_OPEN.replace_all(&text, "(");
    let text = SPACE_BEFORE_CLOSE.replace_all(&text, ")");
    let text = WHITESPACE_RUN.replace_all(&text, " ");
    let text = text.trim();

    (!text.is_empty()).then(|| text.to_string())
}
