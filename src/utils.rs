/// Initialise `env_logger` for tests. Safe to call more than once.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Replace every ASCII punctuation character with `_`, so an url can be
/// used as part of a file name.
pub fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_punctuation() { '_' } else { c })
        .collect()
}

/// Quote `s` for a POSIX shell, wrapping it in single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
