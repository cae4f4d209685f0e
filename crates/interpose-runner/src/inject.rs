//! Build the final command line from a classified, rewritten vector.

use std::path::Path;

use crate::classify::{Classification, Launch};
use crate::rules::WARMUP_SUPPRESSION_FLAG;

/// Executables and injected artifacts for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct InjectionTargets<'a> {
    pub default_runtime: &'a Path,
    pub instrumented_runtime: &'a Path,
    pub shim_script: &'a Path,
    /// Instrumentation flags; empty means the engine does not manage
    /// process substitution and the shim script is injected instead.
    pub instrumentation_flags: &'a [String],
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Final vector for `argv`, or `None` when nothing must run.
///
/// `boundary` is the index of the user's script in `argv` (see
/// [`crate::rewrite::script_boundary`]); it is only consulted when
/// instrumenting.
pub fn inject(
    argv: &[String],
    boundary: usize,
    classification: Classification,
    launch: Launch,
    targets: &InjectionTargets<'_>,
) -> Option<Vec<String>> {
    let rest = argv.get(1..).unwrap_or_default();
    match (classification, launch) {
        (Classification::Skip, _) => None,
        (_, Launch::Direct) => Some(argv.to_vec()),
        (Classification::Plain, Launch::Runtime) => {
            let mut out = Vec::with_capacity(argv.len());
            out.push(path_arg(targets.default_runtime));
            out.extend_from_slice(rest);
            Some(out)
        }
        (Classification::PassthroughInstrumented, Launch::Runtime) => {
            let mut out = Vec::with_capacity(argv.len());
            out.push(path_arg(targets.instrumented_runtime));
            out.extend_from_slice(rest);
            Some(out)
        }
        (Classification::Instrument, Launch::Runtime) => {
            let boundary = boundary.clamp(1, argv.len().max(1));
            let runtime_flags = argv.get(1..boundary).unwrap_or_default();
            let script = argv.get(boundary..).unwrap_or_default();

            let mut out = Vec::with_capacity(
                argv.len() + targets.instrumentation_flags.len() + 3,
            );
            out.push(path_arg(targets.instrumented_runtime));
            out.push(WARMUP_SUPPRESSION_FLAG.to_string());
            out.extend_from_slice(runtime_flags);
            out.extend(targets.instrumentation_flags.iter().cloned());
            if targets.instrumentation_flags.is_empty() {
                // The shim is a script, so it goes after a `--` terminator.
                let (terminator, script) = match script.split_first() {
                    Some((first, tail)) if first == "--" => (Some(first), tail),
                    _ => (None, script),
                };
                out.extend(terminator.cloned());
                out.push(path_arg(targets.shim_script));
                out.extend_from_slice(script);
            } else {
                out.extend_from_slice(script);
            }
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    struct Fixture {
        default_runtime: PathBuf,
        instrumented_runtime: PathBuf,
        shim: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                default_runtime: PathBuf::from("/opt/node/bin/node"),
                instrumented_runtime: PathBuf::from("/opt/graal/bin/node"),
                shim: PathBuf::from("/opt/interpose/script-wrapper.js"),
            }
        }

        fn targets<'a>(&'a self, flags: &'a [String]) -> InjectionTargets<'a> {
            InjectionTargets {
                default_runtime: &self.default_runtime,
                instrumented_runtime: &self.instrumented_runtime,
                shim_script: &self.shim,
                instrumentation_flags: flags,
            }
        }
    }

    #[test]
    fn instrument_splices_flags_before_script_without_shim() {
        let fx = Fixture::new();
        let flags = argv(&["--jvm", "--nodeprof", "--initParam", "x"]);
        let out = inject(
            &argv(&["node", "script.js"]),
            1,
            Classification::Instrument,
            Launch::Runtime,
            &fx.targets(&flags),
        )
        .expect("instrumented vector");
        assert_eq!(
            out,
            argv(&[
                "/opt/graal/bin/node",
                WARMUP_SUPPRESSION_FLAG,
                "--jvm",
                "--nodeprof",
                "--initParam",
                "x",
                "script.js"
            ])
        );
    }

    #[test]
    fn instrument_keeps_runtime_flags_ahead_of_engine_flags() {
        let fx = Fixture::new();
        let flags = argv(&["--jvm"]);
        let out = inject(
            &argv(&["node", "--require", "hook.js", "bin/mocha", "spec.js"]),
            3,
            Classification::Instrument,
            Launch::Runtime,
            &fx.targets(&flags),
        )
        .expect("instrumented vector");
        assert_eq!(
            out[2..],
            argv(&["--require", "hook.js", "--jvm", "bin/mocha", "spec.js"])[..]
        );
    }

    #[test]
    fn instrument_without_flags_injects_shim() {
        let fx = Fixture::new();
        let out = inject(
            &argv(&["node", "--inspect", "--", "a.js"]),
            2,
            Classification::Instrument,
            Launch::Runtime,
            &fx.targets(&[]),
        )
        .expect("instrumented vector");
        assert_eq!(
            out,
            argv(&[
                "/opt/graal/bin/node",
                WARMUP_SUPPRESSION_FLAG,
                "--inspect",
                "--",
                "/opt/interpose/script-wrapper.js",
                "a.js"
            ])
        );
    }

    #[test]
    fn plain_and_passthrough_only_swap_the_executable() {
        let fx = Fixture::new();
        let flags = argv(&["--jvm"]);
        let cmd = argv(&["node", "--jvm", "a.js"]);
        let out = inject(
            &cmd,
            2,
            Classification::PassthroughInstrumented,
            Launch::Runtime,
            &fx.targets(&flags),
        )
        .expect("passthrough vector");
        assert_eq!(out, argv(&["/opt/graal/bin/node", "--jvm", "a.js"]));

        let out = inject(
            &argv(&["node", "server.js"]),
            1,
            Classification::Plain,
            Launch::Runtime,
            &fx.targets(&flags),
        )
        .expect("plain vector");
        assert_eq!(out, argv(&["/opt/node/bin/node", "server.js"]));
    }

    #[test]
    fn skip_and_direct_launches() {
        let fx = Fixture::new();
        let cmd = argv(&["mocha", "test"]);
        assert!(inject(&cmd, 1, Classification::Skip, Launch::Runtime, &fx.targets(&[])).is_none());
        assert_eq!(
            inject(&cmd, 1, Classification::Plain, Launch::Direct, &fx.targets(&[])),
            Some(cmd.clone())
        );
    }
}
