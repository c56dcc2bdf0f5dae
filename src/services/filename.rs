//! Validation and sanitizing of untrusted file names.
//!
//! Both checks work on single characters, so path separators, `..` segments
//! adjacent to a separator, NUL bytes, quotes and shell metacharacters never
//! make it through `validate`, and never survive `sanitize`.

/// Accept a declared file name as-is.
///
/// Returns false for empty names and for any name containing a character
/// outside `[A-Za-z0-9_.\- ]`.
pub fn validate(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| is_name_char(c) || c == ' ')
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
///
/// Spaces are replaced too, so stored names never need quoting. One `_` is
/// emitted per replaced character, which makes the function idempotent.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if is_name_char(c) { c } else { '_' })
        .collect()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}
