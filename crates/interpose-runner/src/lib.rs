//! Test-invocation interception: classify a command meant for the default
//! runtime, rewrite it for deterministic execution, optionally move it onto
//! the instrumented runtime, run it under a deadline and log the outcome.

pub mod classify;
pub mod config;
pub mod error;
pub mod inject;
pub mod matcher;
pub mod record;
pub mod rewrite;
pub mod rules;
pub mod supervise;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

pub use classify::{classify, decide, Classification, Decision, Launch};
pub use config::{Settings, WrapperConfig};
pub use error::InterposeError;
pub use inject::{inject, InjectionTargets};
pub use record::{SideChannel, StatusLog, StatusRecord};
pub use rewrite::{apply_rules, script_boundary, HelpProbe, NoProbe};
pub use rules::{Arity, FlagMatch, RewriteRule, RuleOp};
pub use supervise::{ExecutionOutcome, RuntimeHelpProbe};

use matcher::{flatten, Marker};
use record::{derive_status, identify_target, is_instrumented, STATUS_SKIPPED};
use rules::{sanitize_rules, INSTRUMENTED_MARKER};

/// Everything decided about an invocation before anything is spawned.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub classification: Classification,
    pub launch: Launch,
    /// The vector after sanitising, coverage unwrapping and rule application.
    pub effective_argv: Vec<String>,
    /// Index of the user's script in `effective_argv`, when instrumenting.
    pub boundary: Option<usize>,
    /// `None` when the invocation is skipped.
    pub final_argv: Option<Vec<String>>,
    pub instrumented: bool,
}

fn sanitize(argv: &[String]) -> Vec<String> {
    sanitize_rules()
        .iter()
        .fold(argv.to_vec(), |current, rule| rewrite::apply(&current, rule))
}

pub fn plan(argv: &[String], config: &WrapperConfig, probe: &mut dyn HelpProbe) -> Result<Plan> {
    // A command already aimed at the instrumented runtime is left untouched.
    let input = if Marker::ExactFlag(INSTRUMENTED_MARKER).matches(argv) {
        argv.to_vec()
    } else {
        sanitize(argv)
    };
    let Decision {
        classification,
        argv: decided,
        launch,
    } = decide(&input);

    let effective_argv = match (classification, launch) {
        (Classification::Instrument | Classification::Plain, Launch::Runtime) => {
            apply_rules(&decided, &config.rules(), probe)
        }
        _ => decided,
    };

    let boundary =
        (classification == Classification::Instrument).then(|| script_boundary(&effective_argv));
    let instrumentation_flags = if classification == Classification::Instrument {
        config.load_instrumentation_flags()?
    } else {
        Vec::new()
    };
    let default_runtime = config.default_runtime.clone();
    let instrumented_runtime = config.instrumented_runtime.clone();
    let shim_script = config.shim_path();
    let targets = InjectionTargets {
        default_runtime: &default_runtime,
        instrumented_runtime: &instrumented_runtime,
        shim_script: &shim_script,
        instrumentation_flags: &instrumentation_flags,
    };
    let final_argv = inject(
        &effective_argv,
        boundary.unwrap_or(1),
        classification,
        launch,
        &targets,
    );
    let instrumented = final_argv.as_deref().is_some_and(is_instrumented);

    Ok(Plan {
        classification,
        launch,
        effective_argv,
        boundary,
        final_argv,
        instrumented,
    })
}

/// What happened to one intercepted invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Interception {
    pub plan: Plan,
    pub outcome: Option<ExecutionOutcome>,
    pub record: Option<StatusRecord>,
}

impl Interception {
    pub fn exit_code(&self) -> i32 {
        self.outcome
            .as_ref()
            .map(ExecutionOutcome::wrapper_exit_code)
            .unwrap_or(0)
    }
}

fn append_record(log: &StatusLog, record: &StatusRecord) {
    // A lost record must not change the wrapped command's result.
    if let Err(e) = log.append(record) {
        warn!(path = %log.path().display(), "failed to append status record: {:#}", e);
    }
}

/// Classify, rewrite, run and record `argv` (a full vector whose index 0 is
/// the executable the caller invoked).
pub fn intercept(argv: &[String], config: &WrapperConfig) -> Result<Interception> {
    let mut probe = RuntimeHelpProbe::new(config.default_runtime.clone(), config.probe_timeout());
    let plan = plan(argv, config, &mut probe)?;
    info!(
        classification = plan.classification.as_str(),
        launch = ?plan.launch,
        instrumented = plan.instrumented,
        "classified invocation"
    );
    let log = StatusLog::new(config.status_log_path());

    let Some(final_argv) = plan.final_argv.clone() else {
        // Skipped runs are only logged while a campaign's log exists.
        let record = log.exists().then(|| StatusRecord {
            identified_target: flatten(argv),
            status: STATUS_SKIPPED.to_string(),
            instrumented: false,
        });
        if let Some(record) = &record {
            append_record(&log, record);
        }
        return Ok(Interception {
            plan,
            outcome: None,
            record,
        });
    };

    let side_channel = SideChannel::new(config.result_path());
    if let Err(e) = side_channel.clear() {
        warn!("{:#}", e);
    }

    info!(command = %final_argv.join(" "), "spawning");
    let mut outcome = supervise::run(&final_argv, Some(config.timeout()))?;
    outcome.reported_status = derive_status(plan.instrumented, &outcome, &side_channel);
    if outcome.timed_out {
        warn!(timeout_secs = config.settings.timeout_secs, "command timed out and was killed");
    }
    if let Some(signal) = outcome.forwarded_signal {
        warn!(signal, "wrapper was signalled, child stopped");
    }

    let record = StatusRecord {
        identified_target: identify_target(&final_argv, plan.instrumented, &config.shim_path()),
        status: outcome.reported_status.clone(),
        instrumented: plan.instrumented,
    };
    append_record(&log, &record);

    Ok(Interception {
        plan,
        outcome: Some(outcome),
        record: Some(record),
    })
}
