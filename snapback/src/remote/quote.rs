//! POSIX shell quoting for arguments that cross the remote-shell boundary.
//!
//! The remote-shell daemon joins its trailing arguments with spaces and
//! hands the result to the login shell, so each argv element is quoted
//! here to arrive on the remote side unchanged.

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | '@' | ',' | '+' | '%')
}

/// Quote a single word. Words made only of safe characters pass through.
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('\'');
    for c in word.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}
