//! Shell argument escaping.

/// Quote `arg` so a POSIX shell passes it through as one literal word.
///
/// The result is wrapped in single quotes; each embedded `'` becomes `'\''`
/// (close quote, escaped quote, reopen quote).
pub fn escape_shell_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Join argv into a single shell-safe command line.
pub fn join_escaped<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| escape_shell_arg(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
