//! Property-based tests for the shell-safe interpolation discipline.
//!
//! These verify that no interpolated value can escape its argument
//! position, the crate's primary safety property: a value rendered through
//! `cmd!`/`render` must reach the shell's eventual tokenizer unchanged,
//! regardless of which shell metacharacters it contains.

use proptest::prelude::*;
use std::process::Command as StdCommand;
use xec::shell::{render, ShellDialect, Value};

/// Strategy for arbitrary strings including every ASCII shell metacharacter.
fn adversarial_string_strategy() -> impl Strategy<Value = String> {
    "[ -~]{0,64}".prop_filter("keep non-empty", |s| !s.is_empty())
}

proptest! {
    /// For any string value, rendering it through a `printf '%s' "$1"`
    /// template and running the result via `/bin/sh -c` must reproduce the
    /// original string byte-for-byte on stdout.
    #[test]
    fn escaped_value_survives_shell_round_trip(input in adversarial_string_strategy()) {
        let rendered = render(
            &["printf '%s' ", ""],
            &[Value::from(input.clone())],
            ShellDialect::Posix,
        ).unwrap();

        let output = StdCommand::new("/bin/sh")
            .arg("-c")
            .arg(&rendered)
            .output()
            .expect("failed to run /bin/sh");

        prop_assert_eq!(String::from_utf8_lossy(&output.stdout).into_owned(), input);
    }

    /// Rendering never panics and always yields syntactically valid POSIX
    /// shell input, regardless of how many quotes the value embeds.
    #[test]
    fn escaping_never_panics_and_parses_as_valid_shell(input in adversarial_string_strategy()) {
        let rendered = render(&["echo ", ""], &[Value::from(input)], ShellDialect::Posix).unwrap();
        let status = StdCommand::new("/bin/sh")
            .arg("-n")
            .arg("-c")
            .arg(&rendered)
            .status()
            .expect("failed to run /bin/sh -n");
        prop_assert!(status.success());
    }
}

#[test]
fn shell_injection_is_neutralized_end_to_end() {
    let user = "'; rm -rf /; echo '";
    let rendered = render(&["touch ", ""], &[Value::from(user)], ShellDialect::Posix).unwrap();
    // The payload must appear as a single quoted argument, not as two
    // separate shell statements joined by `;`.
    assert!(rendered.starts_with("touch '"));
    assert_eq!(rendered.matches("rm -rf").count(), 1);
}

#[test]
fn sequences_join_each_element_as_its_own_argument() {
    let rendered = render(
        &["printf '%s|' ", ""],
        &[Value::from(vec![Value::from("a b"), Value::from("c;d")])],
        ShellDialect::Posix,
    )
    .unwrap();
    let output = StdCommand::new("/bin/sh").arg("-c").arg(&rendered).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout), "a b|c;d|");
}
