//! Human and JSON rendering of a finished [`ExecResult`] for the CLI's
//! default (non-`--json`) output mode.

use crate::errors::XecError;
use crate::result::ExecResult;

/// Print one target's result the way an interactive terminal session would:
/// stdout verbatim, stderr (if any) prefixed so it's visibly distinct, and a
/// one-line summary on failure.
pub fn print_human(label: &str, result: &ExecResult) {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if !result.ok() {
        eprintln!("xec: {label}: exited {:?}", result.exit_code);
    }
}

/// Print any serializable value as a single line of JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("xec: failed to serialize JSON output: {e}"),
    }
}

/// Report a top-level dispatch failure: a red "✖" summary with the error
/// kind in a terminal session, or a single line of JSON when `json` is set
/// (e.g. under `--json` or when stdout is not a terminal).
pub fn print_error(error: &XecError, json: bool) {
    if json {
        print_json(&serde_json::json!({
            "ok": false,
            "kind": error.kind(),
            "message": error.to_string(),
            "exitCode": error.exit_code(),
        }));
    } else {
        eprintln!("✖ xec: {error} [{}]", error.kind());
    }
}
