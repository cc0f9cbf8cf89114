//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use serde_json::{Value, json};
use thiserror::Error;

use process_duty_limiter::core::config::{Config, RoleConfig, TargetSpec, validate_limit_pct};
use process_duty_limiter::core::errors::PdlError;
use process_duty_limiter::daemon::limiter::LimiterExit;
use process_duty_limiter::daemon::loop_main::{DaemonArgs as RuntimeArgs, LimiterDaemon};

/// Process Duty Limiter: caps the CPU share of a process tree with SIGSTOP/SIGCONT.
#[derive(Debug, Parser)]
#[command(
    name = "pdl",
    author,
    version,
    about = "Process Duty Limiter - adaptive CPU limiter for process trees",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Echo limiter activity to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Limit the CPU usage of a single target.
    Limit(LimitArgs),
    /// Run every role from the config file.
    Daemon(DaemonArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Show version; build metadata with --verbose.
    Version,
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .args(["pid", "pidfile", "exe"])
))]
struct LimitArgs {
    /// Process id of the target.
    #[arg(short, long, value_name = "PID")]
    pid: Option<u32>,
    /// File holding the target pid; re-read periodically.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,
    /// Executable name of the target; the oldest match wins.
    #[arg(short, long, value_name = "NAME")]
    exe: Option<String>,
    /// CPU budget as a percentage of one core, in [0.1, 100].
    #[arg(short, long, value_name = "PERCENT")]
    limit: f64,
    /// Also limit every descendant of the target.
    #[arg(short, long)]
    include_children: bool,
    /// Exit once the target is gone instead of waiting for it.
    #[arg(short = 'z', long)]
    lazy: bool,
    /// Control period override.
    #[arg(long, value_name = "MILLISECONDS")]
    period_ms: Option<u64>,
}

impl LimitArgs {
    fn target(&self) -> Option<TargetSpec> {
        if let Some(pid) = self.pid {
            return Some(TargetSpec::Pid { pid });
        }
        if let Some(path) = &self.pidfile {
            return Some(TargetSpec::Pidfile { path: path.clone() });
        }
        self.exe.as_ref().map(|name| TargetSpec::Exe { name: name.clone() })
    }
}

#[derive(Debug, Clone, Args, Default)]
struct DaemonArgs {
    /// Only run the named role (repeatable).
    #[arg(long = "role", value_name = "NAME")]
    roles: Vec<String>,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file location.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<PdlError> for CliError {
    fn from(error: PdlError) -> Self {
        match error {
            PdlError::InvalidConfig { .. }
            | PdlError::MissingConfig { .. }
            | PdlError::ConfigParse { .. } => Self::User(error.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Limit(args) => run_limit(cli, args),
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Version => emit_version(cli),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── limit / daemon ────────────────────

fn run_limit(cli: &Cli, args: &LimitArgs) -> Result<(), CliError> {
    let target = args
        .target()
        .ok_or_else(|| CliError::User("specify --pid, --pidfile or --exe".to_string()))?;
    let name = role_name(&target);
    validate_limit_pct(&name, args.limit)?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(period_ms) = args.period_ms {
        config.limiter.period_ms = period_ms;
    }
    config.roles = vec![RoleConfig {
        name,
        limit_pct: args.limit,
        include_descendants: args.include_children,
        exit_when_absent: args.lazy,
        target,
    }];

    let exits = run_roles(cli, config)?;
    emit_exits(cli, "limit", &exits)
}

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;

    if !args.roles.is_empty() {
        if let Some(unknown) = args.roles.iter().find(|name| config.role(name).is_none()) {
            return Err(CliError::User(format!("no role named {unknown:?} in config")));
        }
        config.roles.retain(|role| args.roles.contains(&role.name));
    }
    if config.roles.is_empty() {
        return Err(CliError::User(format!(
            "no roles configured in {}",
            config.paths.config_file.display()
        )));
    }

    let exits = run_roles(cli, config)?;
    emit_exits(cli, "daemon", &exits)
}

fn run_roles(cli: &Cli, config: Config) -> Result<Vec<(String, LimiterExit)>, CliError> {
    let mut daemon = LimiterDaemon::init(
        config,
        RuntimeArgs {
            verbose: cli.verbose,
            handle_signals: true,
        },
    )?;
    Ok(daemon.run()?)
}

/// Role label for an ad-hoc `limit` run; also names the limiter thread.
fn role_name(target: &TargetSpec) -> String {
    match target {
        TargetSpec::Pid { pid } => format!("pid-{pid}"),
        TargetSpec::Pidfile { path } => path.file_stem().map_or_else(
            || "pidfile".to_string(),
            |stem| format!("pidfile-{}", stem.to_string_lossy()),
        ),
        TargetSpec::Exe { name } => format!("exe-{name}"),
        TargetSpec::Registry { key, .. } => key.clone().unwrap_or_else(|| "registry".to_string()),
    }
}

fn emit_exits(cli: &Cli, command: &str, exits: &[(String, LimiterExit)]) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if cli.verbose {
                for (role, exit) in exits {
                    println!("{role}: {}", exit.as_str());
                }
            }
        }
        OutputMode::Json => {
            let roles: Vec<Value> = exits
                .iter()
                .map(|(role, exit)| json!({ "role": role, "exit": exit.as_str() }))
                .collect();
            write_json_line(&json!({
                "command": command,
                "roles": roles,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let rendered = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{rendered}");
                }
                OutputMode::Json => {
                    let value = serde_json::to_value(&config)?;
                    write_json_line(&json!({
                        "command": "config show",
                        "config": value,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                let roles: Vec<&str> = config.roles.iter().map(|r| r.name.as_str()).collect();

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Roles: {}", config.roles.len());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "roles": roles,
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── version / output ────────────────────

fn emit_version(cli: &Cli) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("pdl {version}");
            if cli.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "binary": "pdl",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            }))?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("PDL_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_requires_exactly_one_target() {
        assert!(Cli::try_parse_from(["pdl", "limit", "--limit", "20"]).is_err());
        assert!(Cli::try_parse_from(["pdl", "limit", "-p", "42", "-l", "20"]).is_ok());
        assert!(Cli::try_parse_from(["pdl", "limit", "--exe", "yes", "--limit", "20"]).is_ok());
        assert!(
            Cli::try_parse_from(["pdl", "limit", "-p", "42", "-e", "yes", "-l", "20"]).is_err()
        );
    }

    #[test]
    fn limit_flags_map_onto_role_fields() {
        let cli = Cli::try_parse_from([
            "pdl", "limit", "--pidfile", "/run/nidps.pid", "-l", "35", "-i", "-z",
        ])
        .unwrap();
        let Command::Limit(args) = cli.command else {
            panic!("expected limit command");
        };
        assert!(args.include_children);
        assert!(args.lazy);
        assert_eq!(
            args.target(),
            Some(TargetSpec::Pidfile {
                path: PathBuf::from("/run/nidps.pid")
            })
        );
    }

    #[test]
    fn role_names_describe_the_target() {
        assert_eq!(role_name(&TargetSpec::Pid { pid: 7 }), "pid-7");
        assert_eq!(
            role_name(&TargetSpec::Exe {
                name: "suricata".to_string()
            }),
            "exe-suricata"
        );
        assert_eq!(
            role_name(&TargetSpec::Pidfile {
                path: PathBuf::from("/run/hids.pid")
            }),
            "pidfile-hids"
        );
    }

    #[test]
    fn daemon_accepts_repeated_role_filters() {
        let cli =
            Cli::try_parse_from(["pdl", "daemon", "--role", "nidps", "--role", "hidps"]).unwrap();
        let Command::Daemon(args) = cli.command else {
            panic!("expected daemon command");
        };
        assert_eq!(args.roles, vec!["nidps", "hidps"]);
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["pdl", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn config_errors_are_user_errors() {
        let err = CliError::from(PdlError::InvalidConfig {
            details: "bad".to_string(),
        });
        assert_eq!(err.exit_code(), 1);
        let err = CliError::from(PdlError::UnsupportedPlatform {
            details: "no /proc".to_string(),
        });
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(
            resolve_output_mode(true, Some("human"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("json"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("human"), false),
            OutputMode::Human
        );
        assert_eq!(
            resolve_output_mode(false, Some("auto"), true),
            OutputMode::Human
        );
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
