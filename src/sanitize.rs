//! Text hygiene for user-supplied fields
//!
//! Every text field passes through [`sanitize`] before it enters a request, on
//! both transports. The transformation is idempotent:
//! `sanitize(sanitize(x)) == sanitize(x)` for all `x`.

use std::borrow::Cow;
use unicode_normalization::UnicodeNormalization;

/// Clean a user-supplied string.
///
/// Applies, until the text stops changing:
///
/// 1. HTML entity unescaping (`&amp;` -> `&`, `&#39;` -> `'`)
/// 2. Removal of everything outside printable ASCII (`' '..='~'`)
/// 3. NFKC normalization
///
/// and finally trims surrounding whitespace.
///
/// Non-ASCII characters are dropped before normalization, so compatibility
/// forms such as fullwidth letters disappear rather than fold to ASCII, and
/// NFKC leaves the remaining text unchanged. A changing pass therefore only
/// removes characters, and the loop terminates. Running to a fixed point is
/// what makes double-escaped input such as `&amp;amp;` settle in one call.
pub fn sanitize(input: &str) -> String {
    let mut current: Cow<'_, str> = Cow::Borrowed(input);
    loop {
        let next = clean_pass(&current);
        if next == current {
            break;
        }
        current = Cow::Owned(next);
    }
    current.trim().to_string()
}

fn clean_pass(input: &str) -> String {
    let unescaped = html_escape::decode_html_entities(input);
    let printable: String = unescaped.chars().filter(|c| matches!(c, ' '..='~')).collect();
    printable.nfkc().collect()
}

/// Sanitize an optional field, mapping `None` to `None`.
pub fn sanitize_opt(input: Option<&str>) -> Option<String> {
    input.map(sanitize)
}
