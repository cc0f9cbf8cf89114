//! CLI smoke tests: argument contract, config commands and lazy limiter runs
//! against the real binary.

mod common;

use serde_json::Value;

const GONE_PID: &str = "999999999";

fn lazy_role(name: &str) -> String {
    format!(
        "[[roles]]\nname = \"{name}\"\nlimit_pct = 25.0\nexit_when_absent = true\n\
         target = {{ kind = \"pid\", pid = {GONE_PID} }}\n"
    )
}

fn json_line(stdout: &str) -> Value {
    let line = stdout.lines().last().unwrap_or_default();
    serde_json::from_str(line).unwrap_or(Value::Null)
}

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: pdl [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_reports_binary() {
    let result = common::run_cli_case("version_command_reports_binary", &["version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["binary"], "pdl");
    assert_eq!(payload["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn subcommand_help_flags_work() {
    for subcmd in ["limit", "daemon", "config", "version", "completions"] {
        let case_name = format!("help_{subcmd}");
        let result = common::run_cli_case(&case_name, &[subcmd, "--help"]);
        assert!(
            result.status.success(),
            "{subcmd} --help failed; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn limit_without_target_is_rejected() {
    let result = common::run_cli_case("limit_without_target", &["limit", "--limit", "20"]);
    assert!(!result.status.success());
    assert!(
        result.stderr.contains("--pid"),
        "usage should name the target flags; log: {}",
        result.log_path.display()
    );
}

#[test]
fn limit_out_of_range_is_a_user_error() {
    let result = common::run_cli_case(
        "limit_out_of_range",
        &["limit", "--pid", "1", "--limit", "150"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("PDL-1001"));

    let result = common::run_cli_case(
        "limit_below_rate_floor",
        &["limit", "--pid", "1", "--limit", "0.05"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("PDL-1001"));
}

#[test]
fn lazy_limit_exits_when_target_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path(), "");
    let config = config.to_str().unwrap();

    let result = common::run_cli_case(
        "lazy_limit_exits_when_target_is_gone",
        &[
            "--config", config, "limit", "--pid", GONE_PID, "--limit", "20", "--lazy",
        ],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());

    let payload = json_line(&result.stdout);
    assert_eq!(payload["command"], "limit");
    assert_eq!(payload["roles"][0]["role"], format!("pid-{GONE_PID}"));
    assert_eq!(payload["roles"][0]["exit"], "target_gone");

    let log = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
    assert!(log.contains("limiter_start"));
    assert!(log.contains("limiter_stop"));
}

#[test]
fn daemon_without_roles_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path(), "");
    let result = common::run_cli_case(
        "daemon_without_roles",
        &["--config", config.to_str().unwrap(), "daemon"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("no roles configured"));
}

#[test]
fn daemon_runs_selected_lazy_roles_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let roles = format!("{}\n{}", lazy_role("nidps"), lazy_role("hidps"));
    let config = common::write_config(dir.path(), &roles);
    let config = config.to_str().unwrap();

    let result = common::run_cli_case(
        "daemon_runs_selected_lazy_roles",
        &["--config", config, "daemon", "--role", "hidps"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    let roles = payload["roles"].as_array().cloned().unwrap_or_default();
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0]["role"], "hidps");
    assert_eq!(roles[0]["exit"], "target_gone");

    let unknown = common::run_cli_case(
        "daemon_rejects_unknown_role",
        &["--config", config, "daemon", "--role", "waf"],
    );
    assert_eq!(unknown.status.code(), Some(1));
}

#[test]
fn config_validate_reports_roles_and_hash() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path(), &lazy_role("nidps"));
    let result = common::run_cli_case(
        "config_validate_reports_roles",
        &["--config", config.to_str().unwrap(), "config", "validate"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["roles"][0], "nidps");
    assert_eq!(payload["hash"].as_str().map(str::len), Some(16));
}

#[test]
fn config_validate_rejects_bad_limit() {
    let dir = tempfile::tempdir().unwrap();
    let roles = lazy_role("nidps").replace("limit_pct = 25.0", "limit_pct = 150.0");
    let config = common::write_config(dir.path(), &roles);
    let result = common::run_cli_case(
        "config_validate_rejects_bad_limit",
        &["--config", config.to_str().unwrap(), "config", "validate"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["valid"], false);
}

#[test]
fn config_show_includes_limiter_section() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_config(dir.path(), "");
    let result = common::run_cli_case(
        "config_show_includes_limiter",
        &["--config", config.to_str().unwrap(), "config", "show"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["config"]["limiter"]["period_ms"], 20);
}

#[test]
fn completions_emit_a_script() {
    let result = common::run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("pdl"));
}
