//! The `xec` binary's argument parsing and command dispatch.
//!
//! Argv parsing is `clap`-derived; the dispatcher's fallthrough chain (script
//! file → registered command → task name → `--eval` → `UnknownCommand`) is
//! implemented by letting unrecognized subcommands fall into
//! [`Command::External`] and resolving them by hand, since `clap` has no
//! notion of "a task name defined in a YAML file".

mod report;

use crate::adapter::Target;
use crate::command::Options;
use crate::config::{self, resolve_target, Configuration, LoadOptions};
use crate::engine::Engine;
use crate::errors::{XecError, XecResult};
use crate::task::{ParamValues, TaskRunner};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use report::{print_human, print_json};

/// Top-level argv shape.
#[derive(Parser, Debug)]
#[command(name = "xec", version, about = "A uniform command execution engine for local, SSH, Docker and Kubernetes targets")]
pub struct Cli {
    /// Increase log verbosity.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Suppress non-essential output.
    #[arg(short, long, global = true)]
    pub quiet: bool,
    /// Working directory for the command being run.
    #[arg(long, global = true)]
    pub cwd: Option<String>,
    /// Disable ANSI color in output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    /// Evaluate an inline script expression (delegated to the external
    /// script-runner evaluator).
    #[arg(short = 'e', long, global = true)]
    pub eval: Option<String>,
    /// Start the interactive REPL (an out-of-scope collaborator).
    #[arg(long, global = true)]
    pub repl: bool,
    /// Explicit configuration file path, bypassing the search path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Active configuration profile.
    #[arg(long, global = true)]
    pub profile: Option<String>,
    /// Emit machine-readable JSON instead of human-formatted text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command on one or more SSH hosts.
    On {
        /// Comma-separated host tokens.
        hosts: String,
        /// The command to run.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// Run against all hosts concurrently.
        #[arg(long)]
        parallel: bool,
        /// Concurrency cap when `--parallel` is set; defaults to the host count.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run a command inside a container or pod.
    In {
        /// `pod:name`, `docker:name`, or a bare configured target name.
        target: String,
        /// The command to run.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy a file or directory between local/remote/container/pod endpoints.
    Copy {
        /// Source endpoint.
        src: String,
        /// Destination endpoint.
        dst: String,
    },
    /// Open a port forward.
    Forward {
        /// Local bind endpoint (`port` or `host:port`).
        source: String,
        /// Remote endpoint (`host:port` or `pod:name:port`).
        destination: String,
    },
    /// Stream or print a target's logs.
    Logs {
        /// Configured target name.
        target: String,
        /// Keep streaming new lines as they're produced.
        #[arg(long)]
        follow: bool,
        /// Only show the last N lines.
        #[arg(long)]
        tail: Option<u64>,
        /// Only show lines produced in the last N seconds.
        #[arg(long)]
        since: Option<u64>,
    },
    /// Watch a path glob and re-run a command on change.
    Watch {
        /// Glob pattern of paths to watch.
        path_glob: String,
        /// Command to re-run on every matching change.
        #[arg(long)]
        exec: String,
    },
    /// Run a script file or a named task.
    Run {
        /// Script path or task name.
        script_or_task: String,
        /// `key=value` parameter overrides for a task.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Inspect effective configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Resolve and describe a target token.
    Inspect {
        /// Target token to resolve.
        target: String,
    },
    /// Manage secrets (delegated to an external collaborator).
    Secrets {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Scaffold a new project (out of scope: project scaffolding).
    Init,
    /// Scaffold a new file from a template (out of scope: file scaffolding).
    New {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Anything not matched above: a script file, a task name, or an
    /// unrecognized command.
    #[command(external_subcommand)]
    External(Vec<String>),
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the resolved configuration as YAML/JSON.
    Show,
    /// Print which config file would be loaded, without loading it.
    Path,
}

/// Names of every registered subcommand, used for `UnknownCommand`
/// suggestions.
const REGISTERED_COMMANDS: &[&str] =
    &["on", "in", "copy", "forward", "logs", "watch", "run", "config", "inspect", "secrets", "init", "new"];

/// Parse argv and dispatch. Returns the process exit code.
pub async fn run(argv: Vec<String>) -> i32 {
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            return 2;
        }
    };

    init_tracing(cli.verbose, cli.quiet);
    let json = cli.json;

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "command failed");
            report::print_error(&e, json);
            e.exit_code()
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn dispatch(cli: Cli) -> XecResult<i32> {
    let load_opts = LoadOptions {
        explicit_path: cli.config.clone().or_else(|| std::env::var("XEC_CONFIG").ok().map(PathBuf::from)),
        profile: cli.profile.clone().or_else(|| std::env::var("XEC_PROFILE").ok()),
        start_dir: None,
    };
    let configuration = config::load(&load_opts)?;
    let engine = Engine::new();
    let json = cli.json;

    let outcome = match cli.command {
        Command::On { hosts, command, parallel, concurrency } => {
            handle_on(&engine, &configuration, &hosts, &command, parallel, concurrency, json).await
        }
        Command::In { target, command } => handle_in(&engine, &configuration, &target, &command, json).await,
        Command::Copy { src, dst } => handle_copy(&engine, &configuration, &src, &dst).await,
        Command::Forward { source, destination } => handle_forward(&configuration, &source, &destination).await,
        Command::Logs { target, follow, tail, since } => {
            handle_logs(&configuration, &target, follow, tail, since).await
        }
        Command::Watch { path_glob, exec } => handle_watch(&path_glob, &exec).await,
        Command::Run { script_or_task, args } => handle_run(&engine, &configuration, &script_or_task, &args, json).await,
        Command::Config { action } => handle_config(&configuration, &load_opts, action, json),
        Command::Inspect { target } => handle_inspect(&configuration, &target, json),
        Command::Secrets { .. } => Err(XecError::Unsupported("secrets management is an external collaborator".to_string())),
        Command::Init => Err(XecError::Unsupported("project scaffolding is an external collaborator".to_string())),
        Command::New { .. } => Err(XecError::Unsupported("file scaffolding is an external collaborator".to_string())),
        Command::External(args) => handle_external(&engine, &configuration, &args, cli.eval.as_deref(), json).await,
    };

    engine.dispose().await.ok();
    outcome.map(|()| 0).or_else(|e| {
        if matches!(e, XecError::Unsupported(_)) {
            Ok(1)
        } else {
            Err(e)
        }
    })
}

async fn handle_on(
    engine: &Engine,
    config: &Configuration,
    hosts: &str,
    command_words: &[String],
    parallel: bool,
    concurrency: Option<usize>,
    json: bool,
) -> XecResult<()> {
    let host_tokens: Vec<&str> = hosts.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    let shell_string = command_words.join(" ");
    let options = config::options_from_defaults(&config.defaults)?;

    let mut handles = Vec::with_capacity(host_tokens.len());
    for token in &host_tokens {
        let target = resolve_target(config, token)?;
        let cmd = Engine::command_from(&options, shell_string.clone());
        handles.push((*token, engine.run(target, cmd).await?));
    }

    if parallel {
        let concurrency = concurrency.unwrap_or_else(|| host_tokens.len().max(1));
        let named: Vec<(String, crate::process::ProcessHandle)> =
            handles.into_iter().map(|(name, h)| (name.to_string(), h)).collect();
        let results = crate::parallel::batch(named, concurrency, |(name, handle)| async move {
            (name, handle.output().await)
        })
        .await;
        let mut failed = false;
        for (name, result) in results {
            failed |= print_target_result(&name, &result, json);
        }
        if failed {
            return Err(XecError::CommandFailed {
                command: shell_string,
                exit_code: 1,
                stdout: String::new(),
                stderr: "one or more hosts failed".to_string(),
            });
        }
    } else {
        for (name, handle) in handles {
            let result = handle.output().await;
            if print_target_result(name, &result, json) {
                return result.map(|_| ());
            }
        }
    }
    Ok(())
}

fn print_target_result(name: &str, result: &XecResult<crate::result::ExecResult>, json: bool) -> bool {
    match result {
        Ok(r) => {
            if json {
                print_json(&serde_json::json!({ "target": name, "result": r }));
            } else {
                print_human(name, r);
            }
            !r.ok()
        }
        Err(e) => {
            eprintln!("xec: {name}: {e}");
            true
        }
    }
}

async fn handle_in(engine: &Engine, config: &Configuration, target_token: &str, command_words: &[String], json: bool) -> XecResult<()> {
    let target = resolve_target(config, target_token)?;
    let options = config::options_from_defaults(&config.defaults)?;
    let cmd = Engine::command_from(&options, command_words.join(" "));
    let handle = engine.run(target, cmd).await?;
    let result = handle.output().await?;
    if json {
        print_json(&result);
    } else {
        print_human(target_token, &result);
    }
    if result.ok() {
        Ok(())
    } else {
        Err(XecError::CommandFailed {
            command: command_words.join(" "),
            exit_code: result.exit_code.unwrap_or(1),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}

/// One side of a `copy` endpoint, parsed from the `local-path` /
/// `host:path` / `container:path` / `pod:path` shapes.
enum CopyEndpoint {
    Local(PathBuf),
    Remote { token: String, path: String },
}

fn parse_copy_endpoint(spec: &str) -> CopyEndpoint {
    // A Windows drive letter (`C:\...`) or a bare relative/absolute path
    // with no target prefix is local; anything else with a `:` names a
    // configured target.
    if let Some((token, path)) = spec.split_once(':') {
        if token.len() > 1 {
            return CopyEndpoint::Remote { token: token.to_string(), path: path.to_string() };
        }
    }
    CopyEndpoint::Local(PathBuf::from(spec))
}

async fn handle_copy(engine: &Engine, config: &Configuration, src: &str, dst: &str) -> XecResult<()> {
    let src_endpoint = parse_copy_endpoint(src);
    let dst_endpoint = parse_copy_endpoint(dst);

    match (src_endpoint, dst_endpoint) {
        (CopyEndpoint::Local(local_src), CopyEndpoint::Remote { token, path }) => {
            let target = resolve_target(config, &token)?;
            let adapter = engine_adapter(engine, &target).await?;
            adapter.copy_in(&local_src, &path, None).await
        }
        (CopyEndpoint::Remote { token, path }, CopyEndpoint::Local(local_dst)) => {
            let target = resolve_target(config, &token)?;
            let adapter = engine_adapter(engine, &target).await?;
            adapter.copy_out(&path, &local_dst, None).await
        }
        (CopyEndpoint::Local(local_src), CopyEndpoint::Local(local_dst)) => {
            let adapter = engine_adapter(engine, &Target::Local).await?;
            let dst_str = local_dst.display().to_string();
            adapter.copy_in(&local_src, &dst_str, None).await
        }
        (CopyEndpoint::Remote { token: src_token, path: src_path }, CopyEndpoint::Remote { token: dst_token, path: dst_path }) => {
            // Remote-to-remote is staged through a local temp directory
            //.
            let src_target = resolve_target(config, &src_token)?;
            let dst_target = resolve_target(config, &dst_token)?;
            let staging = tempfile::tempdir().map_err(|e| XecError::Io(e.to_string()))?;
            let staged_path = staging.path().join("xec-copy-stage");
            let src_adapter = engine_adapter(engine, &src_target).await?;
            src_adapter.copy_out(&src_path, &staged_path, None).await?;
            let dst_adapter = engine_adapter(engine, &dst_target).await?;
            dst_adapter.copy_in(&staged_path, &dst_path, None).await
        }
    }
}

async fn engine_adapter(engine: &Engine, target: &Target) -> XecResult<std::sync::Arc<dyn crate::adapter::Adapter>> {
    engine.adapter_for(target).await
}

async fn handle_forward(config: &Configuration, source: &str, destination: &str) -> XecResult<()> {
    let source_endpoint = crate::forward::parse_endpoint(source)?;
    let dest_endpoint = crate::forward::parse_endpoint(destination)?;

    let (local_port, remote_port, target_token) = match (source_endpoint, dest_endpoint) {
        (crate::forward::ForwardEndpoint::LocalPort(lp), crate::forward::ForwardEndpoint::Remote { target_token, port }) => {
            (lp, port, target_token)
        }
        (crate::forward::ForwardEndpoint::LocalPort(lp), crate::forward::ForwardEndpoint::Pod { pod_token, port }) => {
            (lp, port, format!("pod:{pod_token}"))
        }
        _ => return Err(XecError::ConfigInvalid("forward requires a local port source and a remote destination".to_string())),
    };

    let target = resolve_target(config, &target_token)?;
    let local_addr = crate::forward::local_bind_addr(None, local_port);
    let pool = std::sync::Arc::new(crate::adapter::ssh::SshPool::new(crate::adapter::ssh::PoolConfig::default()));
    let mut forward = crate::forward::open(&target, local_addr, remote_port, pool).await?;

    tracing::info!(%local_addr, remote_port, "forward established; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.map_err(|e| XecError::Io(e.to_string()))?;
    if forward.is_alive().await {
        forward.stop().await?;
    }
    Ok(())
}

async fn handle_logs(
    config: &Configuration,
    target_token: &str,
    follow: bool,
    tail: Option<u64>,
    since_seconds: Option<u64>,
) -> XecResult<()> {
    use futures::StreamExt;
    let target = resolve_target(config, target_token)?;
    match target {
        Target::Docker(spec) => {
            let adapter = crate::adapter::DockerAdapter::new(spec.clone())?;
            let container_id = spec.container_or_image().to_string();
            let since = since_seconds.map(|s| chrono::Utc::now().timestamp() - s as i64);
            let opts = crate::adapter::docker::LogOptions { follow, tail, timestamps: false, since };
            let mut stream = Box::pin(adapter.logs(&container_id, opts));
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    crate::adapter::StreamChunk::Stdout(bytes) | crate::adapter::StreamChunk::Stderr(bytes) => {
                        print!("{}", String::from_utf8_lossy(&bytes));
                    }
                }
            }
            Ok(())
        }
        Target::K8s(spec) => {
            let adapter = crate::adapter::K8sAdapter::new(spec)?;
            let since = since_seconds.map(std::time::Duration::from_secs);
            let (stream, _stop_tx) = adapter.log_stream(follow, tail, since).await?;
            tokio::pin!(stream);
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    crate::adapter::StreamChunk::Stdout(bytes) | crate::adapter::StreamChunk::Stderr(bytes) => {
                        print!("{}", String::from_utf8_lossy(&bytes));
                    }
                }
            }
            Ok(())
        }
        other => Err(XecError::Unsupported(format!("{} targets have no log stream", other.label()))),
    }
}

async fn handle_watch(path_glob: &str, exec: &str) -> XecResult<()> {
    use notify::{RecursiveMode, Watcher};
    let glob = globset::Glob::new(path_glob)
        .map_err(|e| XecError::ConfigInvalid(format!("invalid watch glob '{path_glob}': {e}")))?
        .compile_matcher();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })
    .map_err(|e| XecError::Io(e.to_string()))?;
    watcher
        .watch(std::path::Path::new("."), RecursiveMode::Recursive)
        .map_err(|e| XecError::Io(e.to_string()))?;

    tracing::info!(glob = path_glob, "watching for changes; press ctrl-c to stop");
    let debounce = std::time::Duration::from_millis(300);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(Ok(event)) = event else { continue };
                let matched = event.paths.iter().any(|p| glob.is_match(p));
                if !matched {
                    continue;
                }
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                let engine = Engine::new();
                let handle = engine.local(crate::command::Command::shell_string(exec)).await?;
                let result = handle.output().await;
                match result {
                    Ok(r) => print_human("watch", &r),
                    Err(e) => eprintln!("xec: watch command failed: {e}"),
                }
                engine.dispose().await.ok();
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn handle_run(engine: &Engine, config: &Configuration, script_or_task: &str, args: &[String], json: bool) -> XecResult<()> {
    if looks_like_script_file(script_or_task) {
        return Err(XecError::Unsupported(format!(
            "script file '{script_or_task}' delegates to the external script-runner, which this engine does not embed"
        )));
    }
    let overrides = parse_param_overrides(args);
    let runner = TaskRunner::new(engine, config);
    let report = runner.run(script_or_task, &overrides).await?;
    for step in &report.steps {
        match &step.result {
            Ok(r) => {
                if json {
                    print_json(&serde_json::json!({ "step": step.index, "result": r }));
                } else {
                    print_human(&format!("step {}", step.index), r);
                }
            }
            Err(e) => eprintln!("xec: step {}: {e}", step.index),
        }
    }
    if report.ok() {
        Ok(())
    } else {
        Err(XecError::CommandFailed {
            command: script_or_task.to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "one or more task steps failed".to_string(),
        })
    }
}

fn handle_config(config: &Configuration, load_opts: &LoadOptions, action: ConfigAction, json: bool) -> XecResult<()> {
    match action {
        ConfigAction::Show => {
            if json {
                print_json(config);
            } else {
                let yaml = serde_yaml_ng::to_string(config).map_err(|e| XecError::ConfigInvalid(e.to_string()))?;
                println!("{yaml}");
            }
            Ok(())
        }
        ConfigAction::Path => {
            match config::find_config_path(load_opts) {
                Some(path) => println!("{}", path.display()),
                None => println!("(no configuration file found; using built-in defaults)"),
            }
            Ok(())
        }
    }
}

fn handle_inspect(config: &Configuration, target_token: &str, json: bool) -> XecResult<()> {
    match resolve_target(config, target_token) {
        Ok(target) => {
            if json {
                print_json(&serde_json::json!({ "token": target_token, "label": target.label() }));
            } else {
                println!("{target_token} -> {}", target.label());
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn handle_external(engine: &Engine, config: &Configuration, args: &[String], eval: Option<&str>, json: bool) -> XecResult<()> {
    let Some(first) = args.first() else {
        if let Some(code) = eval {
            return Err(XecError::Unsupported(format!(
                "--eval delegates to the external script-runner evaluator (got: {code})"
            )));
        }
        return Err(XecError::ConfigInvalid("no command given".to_string()));
    };

    if looks_like_script_file(first) {
        return Err(XecError::Unsupported(format!(
            "script file '{first}' delegates to the external script-runner, which this engine does not embed"
        )));
    }

    if config.tasks.contains_key(first) {
        let overrides = parse_param_overrides(&args[1..]);
        return handle_run(engine, config, first, &overrides_to_args(&overrides), json).await;
    }

    if let Some(code) = eval {
        return Err(XecError::Unsupported(format!("--eval delegates to the external script-runner evaluator (got: {code})")));
    }

    let mut candidates: Vec<&str> = REGISTERED_COMMANDS.to_vec();
    candidates.extend(config.tasks.keys().map(String::as_str));
    let suggestion = candidates
        .iter()
        .map(|c| (*c, crate::config::levenshtein(first, c)))
        .min_by_key(|(_, d)| *d)
        .filter(|(_, d)| *d <= 2)
        .map(|(c, _)| c.to_string());

    Err(XecError::ConfigInvalid(match suggestion {
        Some(s) => format!("unknown command '{first}' (did you mean '{s}'?)"),
        None => format!("unknown command '{first}'"),
    }))
}

fn looks_like_script_file(candidate: &str) -> bool {
    const SCRIPT_EXTENSIONS: &[&str] = &[".ts", ".js", ".mjs", ".xec.ts", ".xec.js"];
    if SCRIPT_EXTENSIONS.iter().any(|ext| candidate.ends_with(ext)) {
        return true;
    }
    std::path::Path::new(candidate).is_file()
}

fn parse_param_overrides(args: &[String]) -> ParamValues {
    args.iter()
        .filter_map(|a| a.strip_prefix("--").and_then(|rest| rest.split_once('=')))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn overrides_to_args(overrides: &ParamValues) -> Vec<String> {
    overrides.iter().map(|(k, v)| format!("--{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_local_copy_endpoints() {
        assert!(matches!(parse_copy_endpoint("./src"), CopyEndpoint::Local(_)));
        assert!(matches!(parse_copy_endpoint("/abs/path"), CopyEndpoint::Local(_)));
    }

    #[test]
    fn parses_remote_copy_endpoint() {
        match parse_copy_endpoint("prod-1:/var/log/app.log") {
            CopyEndpoint::Remote { token, path } => {
                assert_eq!(token, "prod-1");
                assert_eq!(path, "/var/log/app.log");
            }
            CopyEndpoint::Local(_) => panic!("expected a remote endpoint"),
        }
    }

    #[test]
    fn windows_drive_letters_are_not_mistaken_for_a_target_token() {
        assert!(matches!(parse_copy_endpoint("C:\\Users\\a\\file.txt"), CopyEndpoint::Local(_)));
    }

    #[test]
    fn param_overrides_parse_key_value_pairs() {
        let overrides = parse_param_overrides(&["--env=production".to_string(), "--count=3".to_string()]);
        assert_eq!(overrides.get("env"), Some(&"production".to_string()));
        assert_eq!(overrides.get("count"), Some(&"3".to_string()));
    }

    #[test]
    fn script_extension_is_recognized_without_touching_the_filesystem() {
        assert!(looks_like_script_file("deploy.ts"));
        assert!(looks_like_script_file("deploy.xec.ts"));
    }
}
