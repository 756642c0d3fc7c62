/// Shell-escape a string by wrapping it in single quotes.
///
/// Single quotes inside the string are handled by ending the single-quoted
/// segment, inserting an escaped single quote, and starting a new segment:
/// `it's` becomes `'it'\''s'`.
pub fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Join an argument vector into a single shell command, escaping each word.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}
