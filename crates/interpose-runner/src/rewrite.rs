//! Token-level edits of an argument vector.
//!
//! Every function takes the vector by reference and returns a new one. Flags
//! are searched only after the program token they belong to, so runtime
//! flags in front of the program are never touched by a framework rule.

use std::collections::BTreeMap;

use tracing::debug;

use crate::matcher::{flag_token_matches, has_inline_value, Marker};
use crate::rules::{
    is_script_token, looks_like_flag, runtime_flag_arity, Arity, FlagMatch, RewriteRule, RuleOp,
};

/// Source of `--help` output for a program token.
pub trait HelpProbe {
    /// `None` when the program could not be probed; treated as "unsupported".
    fn help_text(&mut self, program: &str) -> Option<String>;
}

impl<F> HelpProbe for F
where
    F: FnMut(&str) -> Option<String>,
{
    fn help_text(&mut self, program: &str) -> Option<String> {
        self(program)
    }
}

/// Probe that never answers; every help-gated rule is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl HelpProbe for NoProbe {
    fn help_text(&mut self, _program: &str) -> Option<String> {
        None
    }
}

/// Index where flags searched on behalf of `program_marker` start.
fn search_start(argv: &[String], program_marker: &str) -> usize {
    if program_marker.is_empty() {
        return 1;
    }
    Marker::ProgramToken(program_marker)
        .position(argv)
        .map(|idx| idx + 1)
        .unwrap_or(1)
}

fn find_flag(argv: &[String], start: usize, flag: &str, mode: FlagMatch) -> Option<usize> {
    argv.iter()
        .enumerate()
        .skip(start)
        .find(|(_, token)| flag_token_matches(token, flag, mode))
        .map(|(idx, _)| idx)
}

fn find_any_flag(argv: &[String], start: usize, aliases: &[String]) -> Option<(usize, usize)> {
    argv.iter().enumerate().skip(start).find_map(|(idx, token)| {
        aliases
            .iter()
            .position(|alias| flag_token_matches(token, alias, FlagMatch::Exact))
            .map(|alias_idx| (idx, alias_idx))
    })
}

/// Number of tokens following `argv[idx]` that belong to it.
fn arity_span(argv: &[String], idx: usize, arity: Arity) -> usize {
    let available = argv.len().saturating_sub(idx + 1);
    match arity {
        Arity::Fixed(n) => n.min(available),
        Arity::UntilNextFlagOrScript => argv[idx + 1..]
            .iter()
            .take_while(|token| !looks_like_flag(token) && !is_script_token(token))
            .count(),
    }
}

/// Delete every occurrence of `flag` (and its `arity` values) after the
/// program matched by `program_marker`.
pub fn remove_flag(
    argv: &[String],
    program_marker: &str,
    flag: &str,
    arity: Arity,
    mode: FlagMatch,
) -> Vec<String> {
    let mut out = argv.to_vec();
    if !Marker::Text(program_marker).matches(&out) {
        return out;
    }
    let start = search_start(&out, program_marker);
    while let Some(idx) = find_flag(&out, start, flag, mode) {
        let consumed = if mode == FlagMatch::Exact && has_inline_value(&out[idx], flag) {
            0
        } else {
            arity_span(&out, idx, arity)
        };
        out.drain(idx..=idx + consumed);
    }
    out
}

/// Ensure one of `aliases` is present after the program matched by
/// `program_marker`, carrying `value` when one is given.
pub fn set_flag(
    argv: &[String],
    program_marker: &str,
    aliases: &[String],
    value: Option<&str>,
) -> Vec<String> {
    set_flag_with(argv, program_marker, aliases, value, |_| true)
}

/// Like [`set_flag`] with a value, but an existing numeric value that is
/// already at least `minimum` (or `0`, meaning disabled) is kept.
pub fn set_flag_at_least(
    argv: &[String],
    program_marker: &str,
    aliases: &[String],
    minimum: u64,
) -> Vec<String> {
    let value = minimum.to_string();
    set_flag_with(argv, program_marker, aliases, Some(&value), |existing| {
        match existing.parse::<u64>() {
            Ok(0) => false,
            Ok(current) => current < minimum,
            Err(_) => true,
        }
    })
}

fn set_flag_with(
    argv: &[String],
    program_marker: &str,
    aliases: &[String],
    value: Option<&str>,
    should_overwrite: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut out = argv.to_vec();
    let Some(first_alias) = aliases.first() else {
        return out;
    };
    if !Marker::Text(program_marker).matches(&out) {
        return out;
    }
    let program_idx = if program_marker.is_empty() {
        Some(0)
    } else {
        Marker::ProgramToken(program_marker).position(&out)
    };
    let Some(program_idx) = program_idx else {
        return out;
    };

    match find_any_flag(&out, program_idx + 1, aliases) {
        Some((idx, alias_idx)) => {
            let Some(value) = value else {
                return out;
            };
            let alias = &aliases[alias_idx];
            if has_inline_value(&out[idx], alias) {
                let existing = &out[idx][alias.len() + 1..];
                if should_overwrite(existing) {
                    out[idx] = format!("{}={}", alias, value);
                }
            } else {
                match out.get(idx + 1) {
                    Some(next) if !looks_like_flag(next) => {
                        if should_overwrite(next) {
                            out[idx + 1] = value.to_string();
                        }
                    }
                    _ => out.insert(idx + 1, value.to_string()),
                }
            }
        }
        None => {
            out.insert(program_idx + 1, first_alias.clone());
            if let Some(value) = value {
                out.insert(program_idx + 2, value.to_string());
            }
        }
    }
    out
}

/// Apply one rule without consulting its help gate.
pub fn apply(argv: &[String], rule: &RewriteRule) -> Vec<String> {
    let marker = rule.program_marker.as_str();
    match rule.operation {
        RuleOp::SetFlag => set_flag(argv, marker, &rule.flags, None),
        RuleOp::SetFlagWithValue => set_flag(argv, marker, &rule.flags, rule.value.as_deref()),
        RuleOp::SetFlagAtLeast => match rule.value.as_deref().map(str::parse::<u64>) {
            Some(Ok(minimum)) => set_flag_at_least(argv, marker, &rule.flags, minimum),
            _ => argv.to_vec(),
        },
        RuleOp::RemoveFlag => rule.flags.iter().fold(argv.to_vec(), |current, flag| {
            remove_flag(&current, marker, flag, rule.arity, rule.flag_match)
        }),
    }
}

/// Apply `rules` in order. Help-gated rules probe the program token at most
/// once per invocation.
pub fn apply_rules(argv: &[String], rules: &[RewriteRule], probe: &mut dyn HelpProbe) -> Vec<String> {
    let mut help_cache: BTreeMap<String, Option<String>> = BTreeMap::new();
    let mut current = argv.to_vec();
    for rule in rules {
        if let Some(needle) = rule.requires_help.as_deref() {
            if !Marker::Text(&rule.program_marker).matches(&current) {
                continue;
            }
            let Some(idx) = Marker::ProgramToken(&rule.program_marker).position(&current) else {
                continue;
            };
            let program = current[idx].clone();
            let help = help_cache
                .entry(program.clone())
                .or_insert_with(|| probe.help_text(&program));
            if !help.as_deref().is_some_and(|text| text.contains(needle)) {
                debug!(program = %program, needle, "help text does not advertise flag, skipping rule");
                continue;
            }
        }
        let next = apply(&current, rule);
        if next != current {
            debug!(marker = %rule.program_marker, flags = ?rule.flags, op = ?rule.operation, "rule applied");
        }
        current = next;
    }
    current
}

/// Index of the first token of the user's script: everything in
/// `argv[1..boundary]` is a runtime flag or a runtime flag's value.
///
/// Stops at a bare `--`, which is left at the boundary.
pub fn script_boundary(argv: &[String]) -> usize {
    let mut idx = 1;
    while idx < argv.len() && looks_like_flag(&argv[idx]) && argv[idx] != "--" {
        let flag = &argv[idx];
        idx += 1;
        if flag.contains('=') {
            continue;
        }
        match runtime_flag_arity(flag) {
            Some(Arity::Fixed(n)) => idx += n,
            Some(Arity::UntilNextFlagOrScript) => {
                while idx < argv.len() && !looks_like_flag(&argv[idx]) && !is_script_token(&argv[idx]) {
                    idx += 1;
                }
            }
            None => {}
        }
    }
    idx.min(argv.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::default_rules;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    fn aliases(parts: &[&str]) -> Vec<String> {
        argv(parts)
    }

    #[test]
    fn remove_flag_drops_all_occurrences_with_values() {
        let cmd = argv(&["node", "bin/jest", "-w", "4", "spec", "-w", "2", "--ci"]);
        let out = remove_flag(&cmd, "bin/jest", "-w", Arity::Fixed(1), FlagMatch::Exact);
        assert_eq!(out, argv(&["node", "bin/jest", "spec", "--ci"]));
    }

    #[test]
    fn remove_flag_inline_value_consumes_nothing_else() {
        let cmd = argv(&["node", "bin/jest", "--maxWorkers=4", "spec"]);
        let out = remove_flag(&cmd, "bin/jest", "--maxWorkers", Arity::Fixed(1), FlagMatch::Exact);
        assert_eq!(out, argv(&["node", "bin/jest", "spec"]));
    }

    #[test]
    fn remove_flag_is_noop_without_marker_or_match() {
        let cmd = argv(&["node", "bin/mocha", "--bail", "spec.js"]);
        assert_eq!(
            remove_flag(&cmd, "bin/jest", "--bail", Arity::Fixed(0), FlagMatch::Exact),
            cmd
        );
        assert_eq!(
            remove_flag(&cmd, "bin/mocha", "--grep", Arity::Fixed(1), FlagMatch::Exact),
            cmd
        );
    }

    #[test]
    fn remove_flag_is_idempotent() {
        let cmd = argv(&["node", "bin/mocha", "--bail", "spec.js", "--bail"]);
        let once = remove_flag(&cmd, "bin/mocha", "--bail", Arity::Fixed(0), FlagMatch::Exact);
        let twice = remove_flag(&once, "bin/mocha", "--bail", Arity::Fixed(0), FlagMatch::Exact);
        assert_eq!(once, argv(&["node", "bin/mocha", "spec.js"]));
        assert_eq!(once, twice);
    }

    #[test]
    fn remove_flag_leaves_runtime_flags_before_program() {
        let cmd = argv(&["node", "--coverage", "bin/jest", "--coverage"]);
        let out = remove_flag(&cmd, "bin/jest", "--coverage", Arity::Fixed(0), FlagMatch::Exact);
        assert_eq!(out, argv(&["node", "--coverage", "bin/jest"]));
    }

    #[test]
    fn remove_flag_until_next_flag_or_script() {
        let cmd = argv(&["node", "bin/lab", "--files", "a", "b", "c.js", "--x"]);
        let out = remove_flag(&cmd, "bin/lab", "--files", Arity::UntilNextFlagOrScript, FlagMatch::Exact);
        assert_eq!(out, argv(&["node", "bin/lab", "c.js", "--x"]));
    }

    #[test]
    fn remove_flag_contains_mode_strips_tainted_tokens() {
        let cmd = argv(&["node", "a.js", "x=TAINTED", "--__forInTaint", "v", "--ok"]);
        let out = remove_flag(&cmd, "", "=TAINTED", Arity::Fixed(0), FlagMatch::Contains);
        let out = remove_flag(&out, "", "--__forInTaint", Arity::Fixed(1), FlagMatch::Contains);
        assert_eq!(out, argv(&["node", "a.js", "--ok"]));
    }

    #[test]
    fn set_flag_inserts_after_program() {
        let cmd = argv(&["node", "node_modules/.bin/jest", "spec"]);
        let out = set_flag(&cmd, "bin/jest", &aliases(&["-i", "--runInBand"]), None);
        assert_eq!(out, argv(&["node", "node_modules/.bin/jest", "-i", "spec"]));
    }

    #[test]
    fn set_flag_without_value_is_noop_when_present() {
        let cmd = argv(&["node", "bin/jest", "--runInBand"]);
        let out = set_flag(&cmd, "bin/jest", &aliases(&["-i", "--runInBand"]), None);
        assert_eq!(out, cmd);
    }

    #[test]
    fn set_flag_with_value_overwrites_and_is_idempotent() {
        let cmd = argv(&["node", "bin/jest", "--testTimeout", "500", "spec"]);
        let flags = aliases(&["--testTimeout"]);
        let once = set_flag(&cmd, "bin/jest", &flags, Some("10000"));
        let twice = set_flag(&once, "bin/jest", &flags, Some("10000"));
        assert_eq!(once, argv(&["node", "bin/jest", "--testTimeout", "10000", "spec"]));
        assert_eq!(once, twice);
    }

    #[test]
    fn set_flag_with_value_handles_inline_and_missing_value() {
        let flags = aliases(&["-j", "--jobs"]);
        let cmd = argv(&["node", "bin/mocha", "--jobs=4"]);
        assert_eq!(
            set_flag(&cmd, "bin/mocha", &flags, Some("1")),
            argv(&["node", "bin/mocha", "--jobs=1"])
        );
        let cmd = argv(&["node", "bin/mocha", "-j", "--exit"]);
        assert_eq!(
            set_flag(&cmd, "bin/mocha", &flags, Some("1")),
            argv(&["node", "bin/mocha", "-j", "1", "--exit"])
        );
    }

    #[test]
    fn set_flag_at_least_keeps_larger_and_disabled_values() {
        let flags = aliases(&["-t", "--timeout"]);
        let cmd = argv(&["node", "bin/mocha", "-t", "500"]);
        assert_eq!(
            set_flag_at_least(&cmd, "bin/mocha", &flags, 2000),
            argv(&["node", "bin/mocha", "-t", "2000"])
        );
        let cmd = argv(&["node", "bin/mocha", "--timeout=60000"]);
        assert_eq!(set_flag_at_least(&cmd, "bin/mocha", &flags, 2000), cmd);
        let cmd = argv(&["node", "bin/mocha", "--timeout", "0"]);
        assert_eq!(set_flag_at_least(&cmd, "bin/mocha", &flags, 2000), cmd);
        let cmd = argv(&["node", "bin/mocha", "--timeout", "5s"]);
        assert_eq!(
            set_flag_at_least(&cmd, "bin/mocha", &flags, 2000),
            argv(&["node", "bin/mocha", "--timeout", "2000"])
        );
    }

    #[test]
    fn set_flag_skips_when_marker_is_not_a_program_token() {
        let cmd = argv(&["node", "--require=bin/jest/setup", "a.js"]);
        let out = set_flag(&cmd, "bin/jest", &aliases(&["--forceExit"]), None);
        assert_eq!(out, cmd);
    }

    #[test]
    fn mocha_policy_forces_exit_and_strips_bail() {
        let cmd = argv(&["node", "bin/mocha", "--bail", "spec.js"]);
        let mut probes = Vec::new();
        let mut probe = |program: &str| {
            probes.push(program.to_string());
            Some("  --exit  Force Mocha to quit\n  --bail  Abort".to_string())
        };
        let out = apply_rules(&cmd, &default_rules(), &mut probe);
        assert_eq!(probes, vec!["bin/mocha".to_string()]);
        assert!(out.contains(&"--exit".to_string()));
        assert!(!out.contains(&"--bail".to_string()));
        assert!(!out.iter().any(|t| t == "-j" || t == "--jobs"));
        let t_idx = out
            .iter()
            .position(|t| t == "-t" || t == "--timeout" || t == "--timeouts")
            .expect("timeout flag");
        let value: u64 = out[t_idx + 1].parse().expect("numeric timeout");
        assert!(value >= 2000);
        assert_eq!(out.last().map(String::as_str), Some("spec.js"));
    }

    #[test]
    fn help_gated_rules_are_skipped_when_probe_fails() {
        let cmd = argv(&["node", "bin/mocha", "spec.js"]);
        let out = apply_rules(&cmd, &default_rules(), &mut NoProbe);
        assert!(!out.contains(&"--exit".to_string()));
        assert!(out.contains(&"-t".to_string()));
    }

    #[test]
    fn apply_rules_is_idempotent_for_default_table() {
        let cmd = argv(&["node", "node_modules/.bin/jest", "-w", "4", "--coverage", "spec"]);
        let once = apply_rules(&cmd, &default_rules(), &mut NoProbe);
        let twice = apply_rules(&once, &default_rules(), &mut NoProbe);
        assert_eq!(once, twice);
        assert!(once.contains(&"--forceExit".to_string()));
        assert!(!once.contains(&"--coverage".to_string()));
        assert!(!once.contains(&"-w".to_string()));
    }

    #[test]
    fn boundary_skips_runtime_flags_and_their_values() {
        assert_eq!(script_boundary(&argv(&["node", "script.js"])), 1);
        assert_eq!(
            script_boundary(&argv(&["node", "--require", "ts-node/register", "-x", "a.ts", "b"])),
            4
        );
        assert_eq!(script_boundary(&argv(&["node", "--loader=esm", "a.js"])), 2);
        assert_eq!(script_boundary(&argv(&["node", "--inspect", "--", "a.js"])), 2);
        assert_eq!(script_boundary(&argv(&["node", "--require"])), 2);
    }
}
