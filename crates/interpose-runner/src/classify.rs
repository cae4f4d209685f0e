//! Decide whether and how an intercepted command runs.

use serde::Serialize;

use crate::matcher::Marker;
use crate::rules::{
    is_script_token, looks_like_flag, BARE_SCRIPT_EXTENSIONS, COVERAGE_CHECK_DIRECTIVE,
    COVERAGE_TOOLS, INSTRUMENTED_MARKER, INSTRUMENT_MARKERS, NEVER_INSTRUMENT_MARKERS,
    PACKAGE_MANAGERS, PACKAGE_MANAGER_EXCLUDED, RUN_SCRIPT_ALLOWED, RUN_SCRIPT_KEPT_MARKER,
    SKIP_MARKERS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Do not run anything; report success.
    Skip,
    /// Caller already targets the instrumented runtime; only swap the executable.
    PassthroughInstrumented,
    /// Rewrite and run under the instrumented runtime.
    Instrument,
    /// Run under the default runtime.
    Plain,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Skip => "skip",
            Classification::PassthroughInstrumented => "passthrough_instrumented",
            Classification::Instrument => "instrument",
            Classification::Plain => "plain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Launch {
    /// `argv[0]` is replaced by a runtime executable.
    Runtime,
    /// The vector is a complete command and is spawned as-is.
    Direct,
}

/// Classification together with the vector it applies to. The vector differs
/// from the input only when a coverage tool was unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub classification: Classification,
    pub argv: Vec<String>,
    pub launch: Launch,
}

impl Decision {
    fn keep(argv: &[String], classification: Classification) -> Self {
        Self {
            classification,
            argv: argv.to_vec(),
            launch: Launch::Runtime,
        }
    }
}

pub fn classify(argv: &[String]) -> Classification {
    decide(argv).classification
}

pub fn decide(argv: &[String]) -> Decision {
    if Marker::ExactFlag(INSTRUMENTED_MARKER).matches(argv) {
        return Decision::keep(argv, Classification::PassthroughInstrumented);
    }
    if package_manager_skips(argv) {
        return Decision::keep(argv, Classification::Skip);
    }
    if SKIP_MARKERS.iter().any(|m| Marker::Text(m).matches(argv)) {
        return Decision::keep(argv, Classification::Skip);
    }
    if let Some(decision) = unwrap_coverage_tool(argv) {
        return decision;
    }
    Decision::keep(argv, instrument_or_plain(argv))
}

fn is_package_manager(token: &str) -> bool {
    PACKAGE_MANAGERS.iter().any(|pm| token.ends_with(pm))
}

/// The package manager is normally `argv[1]` (a `#!/usr/bin/env node` script);
/// a direct `npm ...` vector carries it at index 0.
fn package_manager_index(argv: &[String]) -> Option<usize> {
    [1, 0]
        .into_iter()
        .find(|&idx| argv.get(idx).is_some_and(|t| is_package_manager(t)))
}

fn package_manager_skips(argv: &[String]) -> bool {
    let Some(pm_idx) = package_manager_index(argv) else {
        return false;
    };
    let Some(subcommand) = argv.get(pm_idx + 1) else {
        return false;
    };
    if PACKAGE_MANAGER_EXCLUDED.contains(&subcommand.as_str()) {
        return true;
    }
    if subcommand == "run" {
        if argv.len() <= pm_idx + 2 {
            return false;
        }
        let script = &argv[argv.len() - 1];
        let allowed = RUN_SCRIPT_ALLOWED.iter().any(|s| script.contains(s));
        return !allowed && !script.contains(RUN_SCRIPT_KEPT_MARKER);
    }
    false
}

fn unwrap_coverage_tool(argv: &[String]) -> Option<Decision> {
    let tool_idx = COVERAGE_TOOLS
        .iter()
        .filter_map(|tool| Marker::ProgramToken(tool).position(argv))
        .min()?;

    let mut rest = tool_idx + 1;
    match argv.get(rest) {
        None => return Some(Decision::keep(argv, Classification::Skip)),
        Some(next) if next == COVERAGE_CHECK_DIRECTIVE => {
            return Some(Decision::keep(argv, Classification::Skip));
        }
        Some(_) => {}
    }
    // Coverage tool options are assumed to be inline (`--reporter=lcov`).
    while argv.get(rest).is_some_and(|t| looks_like_flag(t)) {
        rest += 1;
    }
    let Some(program) = argv.get(rest) else {
        return Some(Decision::keep(argv, Classification::Skip));
    };

    if program.contains('/') || is_script_token(program) {
        let mut inner = Vec::with_capacity(argv.len() - rest + 1);
        inner.push(argv[0].clone());
        inner.extend_from_slice(&argv[rest..]);
        let mut decision = decide(&inner);
        if matches!(
            decision.classification,
            Classification::Instrument | Classification::PassthroughInstrumented
        ) {
            decision.classification = Classification::Plain;
        }
        Some(decision)
    } else {
        Some(Decision {
            classification: Classification::Plain,
            argv: argv[rest..].to_vec(),
            launch: Launch::Direct,
        })
    }
}

fn instrument_or_plain(argv: &[String]) -> Classification {
    let worthy = INSTRUMENT_MARKERS.iter().any(|m| Marker::Text(m).matches(argv))
        || is_bare_script(argv);
    let vetoed = NEVER_INSTRUMENT_MARKERS
        .iter()
        .any(|m| Marker::Text(m).matches(argv));
    if worthy && !vetoed {
        Classification::Instrument
    } else {
        Classification::Plain
    }
}

fn is_bare_script(argv: &[String]) -> bool {
    argv.len() == 2 && BARE_SCRIPT_EXTENSIONS.iter().any(|ext| argv[1].ends_with(ext))
}
