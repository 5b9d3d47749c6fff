//! Shell-safe interpolation.
//!
//! This is the crate's primary safety property: a template made of literal
//! fragments and interpolated [`Value`]s is rendered into a single shell
//! string such that every non-`raw` value lands in exactly one argument
//! position, regardless of what metacharacters it contains.
//!
//! The [`cmd!`] macro is the ergonomic front door; it lowers a
//! `"literal {} literal" , value, value` pair into a call to [`render`] so
//! there is exactly one escaping implementation behind every call site.

use crate::errors::{XecError, XecResult};
use std::fmt;

/// A dialect of shell the renderer should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    /// POSIX `/bin/sh` (and bash/zsh, which are supersets for quoting
    /// purposes). This is the default.
    Posix,
    /// Windows `cmd.exe`.
    Cmd,
    /// Windows PowerShell / pwsh.
    PowerShell,
}

impl Default for ShellDialect {
    fn default() -> Self {
        ShellDialect::Posix
    }
}

/// One interpolated value accepted by [`render`].
///
/// The admissible value set: string, number, boolean, an ordered
/// sequence of the preceding, or an explicitly-marked `raw` value that
/// bypasses escaping entirely.
#[derive(Debug, Clone)]
pub enum Value {
    /// A string value, escaped as a single shell token.
    Str(String),
    /// A numeric value, rendered in canonical decimal form.
    Number(f64),
    /// A boolean, rendered as `true`/`false`.
    Bool(bool),
    /// A sequence of values, each escaped and joined by a single space.
    Seq(Vec<Value>),
    /// A value inserted verbatim with no escaping. The caller accepts the
    /// injection risk; see the `raw` obligation in the data model invariants.
    Raw(String),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Seq(items.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    /// Renders this value the same way [`render`] would, using the default
    /// (POSIX) dialect. Useful for ad-hoc logging; not used on the escaping
    /// hot path, which goes through [`render`] directly so dialect is
    /// threaded through explicitly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_value(self, ShellDialect::Posix))
    }
}

/// Wrap a string as a `raw`, unescaped value.
///
/// # Security
///
/// The returned value is inserted into the rendered shell string verbatim.
/// Only use this for fragments you trust completely (e.g. a literal
/// sub-shell invocation you composed yourself) — never for untrusted input.
#[must_use]
pub fn raw(s: impl Into<String>) -> Value {
    Value::Raw(s.into())
}

/// Render a template of literal fragments interleaved with values into a
/// single shell string for `dialect`.
///
/// `fragments` must have exactly one more element than `values`
/// (`fragments[0] value[0] fragments[1] value[1] ... fragments[n]`), matching
/// how the `cmd!` macro lowers a template literal.
pub fn render(fragments: &[&str], values: &[Value], dialect: ShellDialect) -> XecResult<String> {
    debug_assert!(
        fragments.len() == values.len() + 1,
        "fragments must have exactly one more element than values"
    );
    let mut out = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        out.push_str(fragment);
        if let Some(value) = values.get(i) {
            validate(value)?;
            out.push_str(&render_value(value, dialect));
        }
    }
    Ok(out)
}

fn validate(value: &Value) -> XecResult<()> {
    match value {
        Value::Seq(items) => items.iter().try_for_each(validate),
        Value::Str(_) | Value::Number(_) | Value::Bool(_) | Value::Raw(_) => Ok(()),
    }
}

fn render_value(value: &Value, dialect: ShellDialect) -> String {
    match value {
        Value::Str(s) => quote(s, dialect),
        Value::Number(n) => format_number(*n),
        Value::Bool(b) => b.to_string(),
        Value::Raw(s) => s.clone(),
        Value::Seq(items) => items
            .iter()
            .map(|v| render_value(v, dialect))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Single-quote `s` for POSIX shells, replacing any embedded single quote
/// with the classic `'\''` escape sequence (close quote, escaped quote,
/// reopen quote).
fn quote(s: &str, dialect: ShellDialect) -> String {
    match dialect {
        ShellDialect::Posix => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for ch in s.chars() {
                if ch == '\'' {
                    out.push_str("'\\''");
                } else {
                    out.push(ch);
                }
            }
            out.push('\'');
            out
        }
        ShellDialect::Cmd => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for ch in s.chars() {
                if matches!(ch, '&' | '|' | '<' | '>' | '^' | '"') {
                    out.push('^');
                }
                out.push(ch);
            }
            out.push('"');
            out
        }
        ShellDialect::PowerShell => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for ch in s.chars() {
                if ch == '\'' {
                    out.push('`');
                }
                out.push(ch);
            }
            out.push('\'');
            out
        }
    }
}

/// Build a single shell command string from literal fragments and values,
/// escaping every value so it lands in exactly one argument position.
///
/// This is the macro analogue of a tagged template literal: it is how
/// callers actually express `` $`touch ${user}` `` in Rust. It expands to a
/// call to [`render`] with the default POSIX dialect, so every call site
/// shares one escaping implementation.
///
/// ```
/// use xec::cmd;
/// let user = "'; rm -rf /; echo '";
/// let rendered = cmd!("touch {}", user).unwrap();
/// assert!(rendered.starts_with("touch '"));
/// ```
#[macro_export]
macro_rules! cmd {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        $crate::shell::render_fmt!($fmt, $($arg),*)
    }};
}

/// Internal helper invoked by [`cmd!`]; splits a `{}`-style format literal
/// into fragments at compile time is not possible in `macro_rules!`, so this
/// crate instead evaluates the split at runtime over the literal string.
/// Kept as a separate macro so `cmd!`'s expansion stays simple.
#[macro_export]
#[doc(hidden)]
macro_rules! render_fmt {
    ($fmt:literal $(, $arg:expr)*) => {{
        let fragments: Vec<&str> = $fmt.split("{}").collect();
        let values: Vec<$crate::shell::Value> = vec![$($crate::shell::Value::from($arg)),*];
        let frag_refs: Vec<&str> = fragments.iter().copied().collect();
        $crate::shell::render(&frag_refs, &values, $crate::shell::ShellDialect::default())
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn quotes_embedded_single_quotes() {
        let rendered = render(&["touch ", ""], &[Value::from("'; rm -rf /; echo '")], ShellDialect::Posix).unwrap();
        assert_eq!(rendered, "touch ''\\''; rm -rf /; echo '\\'''");
    }

    #[test]
    fn booleans_and_numbers_render_canonically() {
        let rendered = render(
            &["echo ", " ", ""],
            &[Value::from(true), Value::from(42i64)],
            ShellDialect::Posix,
        )
        .unwrap();
        assert_eq!(rendered, "echo true 42");
    }

    #[test]
    fn sequences_join_with_single_space() {
        let rendered = render(
            &["ls ", ""],
            &[Value::Seq(vec![Value::from("-l"), Value::from("-a")])],
            ShellDialect::Posix,
        )
        .unwrap();
        assert_eq!(rendered, "ls '-l' '-a'");
    }

    #[test]
    fn raw_values_are_inserted_verbatim() {
        let rendered = render(&["", ""], &[raw("$(date)")], ShellDialect::Posix).unwrap();
        assert_eq!(rendered, "$(date)");
    }

    #[test]
    fn cmd_macro_escapes_interpolated_values() {
        let user = "'; rm -rf /; echo '";
        let rendered = cmd!("touch {}", user).unwrap();
        assert_eq!(rendered, "touch ''\\''; rm -rf /; echo '\\'''");
    }

    proptest! {
        #[test]
        fn escaping_is_sound_for_arbitrary_strings(s in ".*") {
            let rendered = render(&["printf '%s' ", ""], &[Value::from(s.clone())], ShellDialect::Posix).unwrap();
            // Re-tokenize with a POSIX-ish splitter: a single-quoted argument
            // contains no unescaped metacharacters, so the only way the
            // rendered text can differ from the literal value is via the
            // `'\''` escape sequence we introduced ourselves.
            let reconstructed = rendered
                .trim_start_matches("printf '%s' ")
                .replace("'\\''", "'");
            let reconstructed = reconstructed
                .strip_prefix('\'')
                .and_then(|r| r.strip_suffix('\''))
                .unwrap_or(&reconstructed);
            prop_assert_eq!(reconstructed, s);
        }
    }
}
