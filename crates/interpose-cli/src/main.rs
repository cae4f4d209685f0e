use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::Path;
use tracing_subscriber::EnvFilter;

use interpose_runner::{InterposeError, NoProbe, RuntimeHelpProbe, WrapperConfig};

const BINARY_NAME: &str = "interpose";
const LOG_ENV: &str = "INTERPOSE_LOG";
const WRAPPER_FAILURE_EXIT_CODE: i32 = 2;

#[derive(Parser)]
#[command(
    name = "interpose",
    version = "0.3.0",
    about = "Test-command interceptor for instrumented runtimes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Intercept a command as if this binary had been invoked as the runtime.
    Exec {
        #[arg(long, default_value = "node")]
        runtime_name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Show how a command would be classified and rewritten, without running it.
    Explain {
        #[arg(long, default_value = "node")]
        runtime_name: String,
        #[arg(long)]
        no_probe: bool,
        #[arg(long)]
        json: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Print the resolved configuration.
    Config {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Only stderr: the wrapped test framework owns stdout.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn invoked_as_multicall(argv0: Option<&str>) -> bool {
    argv0
        .and_then(|a| Path::new(a).file_stem())
        .and_then(|s| s.to_str())
        .is_some_and(|name| name != BINARY_NAME)
}

fn main() -> Result<()> {
    init_tracing();
    let argv: Vec<String> = std::env::args().collect();
    if invoked_as_multicall(argv.first().map(String::as_str)) {
        std::process::exit(intercept_exit_code(&argv));
    }

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<InterposeError>()
                    .map(InterposeError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Run an intercepted invocation and map the result to a process exit code.
fn intercept_exit_code(argv: &[String]) -> i32 {
    let result = WrapperConfig::from_env()
        .and_then(|config| interpose_runner::intercept(argv, &config));
    match result {
        Ok(interception) => interception.exit_code(),
        Err(err) => {
            eprintln!("{}: {:#}", BINARY_NAME, err);
            WRAPPER_FAILURE_EXIT_CODE
        }
    }
}

fn with_runtime_name(runtime_name: String, args: Vec<String>) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(runtime_name);
    argv.extend(args);
    argv
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Exec { runtime_name, args } => {
            let argv = with_runtime_name(runtime_name, args);
            std::process::exit(intercept_exit_code(&argv));
        }
        Commands::Explain {
            runtime_name,
            no_probe,
            json,
            args,
        } => {
            let argv = with_runtime_name(runtime_name, args);
            let config = WrapperConfig::from_env()?;
            let plan = if no_probe {
                interpose_runner::plan(&argv, &config, &mut NoProbe)?
            } else {
                let mut probe = RuntimeHelpProbe::new(
                    config.default_runtime.clone(),
                    config.probe_timeout(),
                );
                interpose_runner::plan(&argv, &config, &mut probe)?
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "explain",
                    "input": argv,
                    "plan": plan,
                })));
            }
            println!("input: {}", argv.join(" "));
            println!("classification: {}", plan.classification.as_str());
            println!("launch: {:?}", plan.launch);
            println!("effective: {}", plan.effective_argv.join(" "));
            if let Some(boundary) = plan.boundary {
                println!("boundary: {}", boundary);
            }
            match &plan.final_argv {
                Some(final_argv) => println!("final: {}", final_argv.join(" ")),
                None => println!("final: none (skipped)"),
            }
            println!("instrumented: {}", plan.instrumented);
        }
        Commands::Config { json } => {
            let config = WrapperConfig::from_env()?;
            // Intercept mode only warns about a broken settings file.
            let settings_error = interpose_runner::Settings::load(&config.settings_path())
                .err()
                .map(|e| e.to_string());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "config",
                    "config": config_to_json(&config),
                    "settings_error": settings_error,
                })));
            }
            if let Some(err) = &settings_error {
                println!("settings_error: {}", err);
            }
            println!("default_runtime: {}", config.default_runtime.display());
            println!("instrumented_runtime: {}", config.instrumented_runtime.display());
            println!("support_dir: {}", config.support_dir.display());
            println!("settings: {}", config.settings_path().display());
            println!("params: {}", config.params_path().display());
            println!("shim_script: {}", config.shim_path().display());
            println!("status_log: {}", config.status_log_path().display());
            println!("result_file: {}", config.result_path().display());
            println!("timeout_secs: {}", config.settings.timeout_secs);
            println!("probe_timeout_secs: {}", config.settings.probe_timeout_secs);
            println!("rules: {}", config.rules().len());
        }
    }
    Ok(None)
}

fn config_to_json(config: &WrapperConfig) -> Value {
    json!({
        "default_runtime": config.default_runtime.display().to_string(),
        "instrumented_runtime": config.instrumented_runtime.display().to_string(),
        "support_dir": config.support_dir.display().to_string(),
        "settings": config.settings_path().display().to_string(),
        "params": config.params_path().display().to_string(),
        "shim_script": config.shim_path().display().to_string(),
        "status_log": config.status_log_path().display().to_string(),
        "result_file": config.result_path().display().to_string(),
        "timeout_secs": config.settings.timeout_secs,
        "probe_timeout_secs": config.settings.probe_timeout_secs,
        "rules": config.rules().len(),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Explain { json, .. } | Commands::Config { json } => *json,
        Commands::Exec { .. } => false,
    }
}
