//! # xec
//!
//! A uniform command execution engine for the local host, remote hosts over
//! SSH, Docker containers (local or over SSH), and Kubernetes pods.
//!
//! The crate exposes one execution model across four substrates: build a
//! [`Command`](command::Command) with the [`command::Options`] cascade (or
//! the [`cmd!`] macro for shell-safe interpolation), hand it to an
//! [`Engine`](engine::Engine) against a resolved [`Target`](adapter::Target),
//! and drive the returned [`ProcessHandle`](process::ProcessHandle) like a
//! future.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use xec::command::Command;
//! use xec::engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> xec::errors::XecResult<()> {
//!     let engine = Engine::new();
//!     let rendered = xec::cmd!("echo {}", "hello")?;
//!     let result = engine.local(Command::shell_string(rendered)).await?.await?;
//!     println!("{}", result.text());
//!     engine.dispose().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`shell`] — the shell-safe interpolation discipline, the crate's
//!   primary safety property.
//! - [`command`] — the immutable [`Command`](command::Command) value and the
//!   fluent [`Options`](command::Options) cascade that builds it.
//! - [`result`] — the terminal [`ExecResult`](result::ExecResult) of a
//!   finished execution.
//! - [`adapter`] — the substrate-abstracting contract every execution target
//!   (local, SSH, Docker, Kubernetes, remote-docker) implements.
//! - [`process`] — the lazy, awaitable, cancellable
//!   [`ProcessHandle`](process::ProcessHandle).
//! - [`parallel`] — bounded concurrent fan-out across handles or items.
//! - [`engine`] — the top-level entry point tying targets, adapters, and the
//!   SSH pool/Docker client together.
//! - [`config`] — the declarative configuration loader, profile/env merge
//!   cascade, and target resolver.
//! - [`task`] — the named multi-step task runner.
//! - [`forward`] — the cross-substrate port-forward/tunnel manager.
//! - [`cli`] — the `xec` binary's argument parsing and command dispatch.
//! - [`errors`] — the single error enum covering every substrate and layer.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod cli;
pub mod command;
pub mod config;
pub mod engine;
pub mod errors;
pub mod forward;
pub mod parallel;
pub mod process;
pub mod result;
pub mod shell;
pub mod task;

pub use command::{Command, Options};
pub use engine::Engine;
pub use errors::{XecError, XecResult};
pub use process::ProcessHandle;
pub use result::ExecResult;

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default per-command timeout: 30 seconds, `0` disables it.
pub const DEFAULT_TIMEOUT_MS: u64 = command::DEFAULT_TIMEOUT_MS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
