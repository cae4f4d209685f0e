//! Static rule table: markers that drive classification and the per-framework
//! flag edits applied to a wrapped test command.

use serde::{Deserialize, Serialize};

/// Flag carried by every instrumented-runtime command line.
pub const INSTRUMENTED_MARKER: &str = "--jvm";

/// Always passed to the alternate runtime to silence its interpreter warning.
pub const WARMUP_SUPPRESSION_FLAG: &str = "--engine.WarnInterpreterOnly=false";

/// Instrumentation parameter preceding the user's script on engine command lines.
pub const INIT_PARAM_FLAG: &str = "--initParam";

/// Engine flag whose values mention `.bin/` paths that are not the target.
pub const EXCLUDE_SOURCE_FLAG: &str = "--nodeprof.ExcludeSource";

pub const PACKAGE_MANAGERS: &[&str] = &["npm", "npm-cli.js", "yarn", "pnpm"];
pub const PACKAGE_MANAGER_EXCLUDED: &[&str] = &["install", "audit", "init"];
pub const RUN_SCRIPT_ALLOWED: &[&str] = &["test", "unit", "coverage", "compile"];
pub const RUN_SCRIPT_KEPT_MARKER: &str = "lint";

pub const SKIP_MARKERS: &[&str] = &["bin/xo", "bin/karma", "bin/ng", "npm run test:instrument"];

pub const COVERAGE_TOOLS: &[&str] = &["bin/nyc", "bin/c8"];
pub const COVERAGE_CHECK_DIRECTIVE: &str = "check-coverage";

pub const INSTRUMENT_MARKERS: &[&str] = &[
    "bin/mocha",
    "bin/_mocha",
    "bin/jest",
    "/test",
    "test/",
    "tests/",
    "test.js",
    "bin/zap",
    "bin/grunt",
    "bin/taper",
];

pub const NEVER_INSTRUMENT_MARKERS: &[&str] = &[
    "bin/nyc",
    "bin/tap",
    "bin/ava",
    ".bin/grunt --force build",
    ".bin/grunt build",
];

/// Extensions that mark a token as the start of a script.
pub const SCRIPT_EXTENSIONS: &[&str] = &[".js", ".ts", ".mjs", ".cjs"];

/// Extensions accepted for a bare `node <script>` invocation to be instrumented.
pub const BARE_SCRIPT_EXTENSIONS: &[&str] = &[".js", ".ts"];

pub const FLAG_PREFIX: char = '-';

/// Runtime flags that consume following tokens before the script starts.
pub const RUNTIME_FLAG_ARITY: &[(&str, Arity)] = &[
    ("--loader", Arity::Fixed(1)),
    ("--experimental-loader", Arity::Fixed(1)),
    ("--require", Arity::Fixed(1)),
    ("-r", Arity::Fixed(1)),
    ("--import", Arity::Fixed(1)),
    ("-C", Arity::Fixed(1)),
    ("--conditions", Arity::Fixed(1)),
];

pub fn runtime_flag_arity(flag: &str) -> Option<Arity> {
    RUNTIME_FLAG_ARITY
        .iter()
        .find(|(name, _)| *name == flag)
        .map(|(_, arity)| *arity)
}

pub fn is_script_token(token: &str) -> bool {
    SCRIPT_EXTENSIONS.iter().any(|ext| token.ends_with(ext))
}

pub fn looks_like_flag(token: &str) -> bool {
    token.starts_with(FLAG_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    SetFlag,
    SetFlagWithValue,
    /// Like `SetFlagWithValue`, but a present numeric value already at or
    /// above the rule value (or `0`, "disabled") is kept.
    SetFlagAtLeast,
    RemoveFlag,
}

/// How many tokens after a flag belong to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ArityRepr", into = "ArityRepr")]
pub enum Arity {
    Fixed(usize),
    UntilNextFlagOrScript,
}

impl Default for Arity {
    fn default() -> Self {
        Arity::Fixed(0)
    }
}

const UNTIL_NEXT_FLAG_OR_SCRIPT: &str = "until-next-flag-or-script";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ArityRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<ArityRepr> for Arity {
    type Error = String;

    fn try_from(value: ArityRepr) -> Result<Self, Self::Error> {
        match value {
            ArityRepr::Count(n) => Ok(Arity::Fixed(n)),
            ArityRepr::Keyword(k) if k == UNTIL_NEXT_FLAG_OR_SCRIPT => {
                Ok(Arity::UntilNextFlagOrScript)
            }
            ArityRepr::Keyword(k) => Err(format!(
                "invalid arity '{}': expected a count or '{}'",
                k, UNTIL_NEXT_FLAG_OR_SCRIPT
            )),
        }
    }
}

impl From<Arity> for ArityRepr {
    fn from(value: Arity) -> Self {
        match value {
            Arity::Fixed(n) => ArityRepr::Count(n),
            Arity::UntilNextFlagOrScript => ArityRepr::Keyword(UNTIL_NEXT_FLAG_OR_SCRIPT.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagMatch {
    /// Token equals the flag, or is its `flag=value` form.
    #[default]
    Exact,
    /// Token contains the flag text anywhere.
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub program_marker: String,
    pub operation: RuleOp,
    /// Aliases; the first one is inserted when none is present.
    pub flags: Vec<String>,
    #[serde(default)]
    pub arity: Arity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub flag_match: FlagMatch,
    /// Apply only when the program's `--help` output contains this text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_help: Option<String>,
}

impl RewriteRule {
    fn new(program_marker: &str, operation: RuleOp, flags: &[&str]) -> Self {
        Self {
            program_marker: program_marker.to_string(),
            operation,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            arity: Arity::Fixed(0),
            value: None,
            flag_match: FlagMatch::Exact,
            requires_help: None,
        }
    }

    pub fn set(program_marker: &str, flags: &[&str]) -> Self {
        Self::new(program_marker, RuleOp::SetFlag, flags)
    }

    pub fn set_value(program_marker: &str, flags: &[&str], value: &str) -> Self {
        let mut rule = Self::new(program_marker, RuleOp::SetFlagWithValue, flags);
        rule.value = Some(value.to_string());
        rule
    }

    pub fn set_at_least(program_marker: &str, flags: &[&str], minimum: u64) -> Self {
        let mut rule = Self::new(program_marker, RuleOp::SetFlagAtLeast, flags);
        rule.value = Some(minimum.to_string());
        rule
    }

    pub fn remove(program_marker: &str, flag: &str, arity: Arity) -> Self {
        let mut rule = Self::new(program_marker, RuleOp::RemoveFlag, &[flag]);
        rule.arity = arity;
        rule
    }

    pub fn matching(mut self, flag_match: FlagMatch) -> Self {
        self.flag_match = flag_match;
        self
    }

    pub fn when_help_mentions(mut self, text: &str) -> Self {
        self.requires_help = Some(text.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.flags.is_empty() {
            return Err(format!(
                "rule for '{}' has no flags",
                self.program_marker
            ));
        }
        if self.flags.iter().any(|f| f.is_empty()) {
            return Err(format!(
                "rule for '{}' has an empty flag name",
                self.program_marker
            ));
        }
        match self.operation {
            RuleOp::SetFlagWithValue | RuleOp::SetFlagAtLeast if self.value.is_none() => Err(
                format!("rule for '{}' needs a value", self.program_marker),
            ),
            RuleOp::SetFlagAtLeast => match self.value.as_deref().map(str::parse::<u64>) {
                Some(Ok(_)) => Ok(()),
                _ => Err(format!(
                    "rule for '{}' needs a numeric minimum",
                    self.program_marker
                )),
            },
            _ => Ok(()),
        }
    }
}

/// Leftovers from taint injection that sometimes end up as arguments.
/// Applied to every invocation before classification.
pub fn sanitize_rules() -> Vec<RewriteRule> {
    vec![
        RewriteRule::remove("", "=TAINTED", Arity::Fixed(0)).matching(FlagMatch::Contains),
        RewriteRule::remove("", "--__forInTaint", Arity::Fixed(1)).matching(FlagMatch::Contains),
        RewriteRule::remove("", "--use_strict", Arity::Fixed(0)),
    ]
}

fn mocha_rules(marker: &str) -> Vec<RewriteRule> {
    // Older mocha releases lack --exit and exit on their own.
    vec![
        RewriteRule::set(marker, &["--exit"]).when_help_mentions("--exit"),
        RewriteRule::set_value(marker, &["-j", "--jobs"], "1").when_help_mentions("--jobs"),
        RewriteRule::set_at_least(marker, &["-t", "--timeout", "--timeouts"], 2000),
        RewriteRule::remove(marker, "--bail", Arity::Fixed(0)),
        RewriteRule::remove(marker, "--no-exit", Arity::Fixed(0)),
        RewriteRule::remove(marker, "--forbid-only", Arity::Fixed(0)),
    ]
}

fn jest_rules() -> Vec<RewriteRule> {
    let jest = "bin/jest";
    vec![
        RewriteRule::set(jest, &["-i", "--runInBand"]),
        RewriteRule::set(jest, &["--forceExit"]),
        RewriteRule::set_value(jest, &["--testTimeout"], "10000"),
        RewriteRule::remove(jest, "-w", Arity::Fixed(1)),
        RewriteRule::remove(jest, "--maxWorkers", Arity::Fixed(1)),
        RewriteRule::remove(jest, "--coverage", Arity::Fixed(0)),
        RewriteRule::remove(jest, "--collectCoverageFrom", Arity::Fixed(1)),
    ]
}

fn tap_rules() -> Vec<RewriteRule> {
    let tap = "bin/tap";
    vec![
        RewriteRule::set_value(tap, &["-j"], "1").when_help_mentions("--jobs"),
        RewriteRule::set_value(tap, &["-t"], "180"),
        RewriteRule::remove(tap, "--100", Arity::Fixed(0)),
        RewriteRule::remove(tap, "--coverage", Arity::Fixed(0)),
        RewriteRule::remove(tap, "--jobs-auto", Arity::Fixed(0)),
    ]
}

fn ava_rules() -> Vec<RewriteRule> {
    let ava = "bin/ava";
    vec![
        RewriteRule::set_value(ava, &["-c"], "1"),
        RewriteRule::set(ava, &["--no-worker-threads"]),
        RewriteRule::set_value(ava, &["--timeout"], "180s"),
    ]
}

fn grunt_rules() -> Vec<RewriteRule> {
    let grunt = "bin/grunt";
    // Grunt lists tasks as "<name>  <description>"; pick the test tasks and
    // leave lint/build tasks out.
    vec![
        RewriteRule::set(grunt, &["--force"]),
        RewriteRule::set(grunt, &["test"]).when_help_mentions("test  "),
        RewriteRule::set(grunt, &["jest"]).when_help_mentions("jest  "),
        RewriteRule::set(grunt, &["mochaTest"]).when_help_mentions("mochaTest  "),
    ]
}

/// Built-in framework policies, in application order.
pub fn default_rules() -> Vec<RewriteRule> {
    let mut rules = Vec::new();
    rules.extend(mocha_rules("bin/mocha"));
    rules.extend(mocha_rules("bin/_mocha"));
    rules.extend(jest_rules());
    rules.extend(tap_rules());
    rules.extend(ava_rules());
    rules.extend(grunt_rules());
    rules
}
