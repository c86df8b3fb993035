//! Sandbox wrapper command-line composition.
//!
//! Every stage command runs under the external `nsjail` binary with
//! per-stage resource limits, env vars, and bind-mounts. The wrapper
//! line is assembled as one string and tokenized on spaces, so stage
//! commands and mount paths must not contain them. The `{sources}`
//! placeholder is substituted after the sandbox flags are assembled, so
//! the substitution cannot alter flag parsing.

use std::fmt::Write as _;

use crate::rules::Stage;

/// Path of the sandbox wrapper binary.
pub const NSJAIL_PATH: &str = "/usr/bin/nsjail";

/// Placeholder in stage commands replaced by the space-joined staged
/// file paths.
pub const SOURCES_PLACEHOLDER: &str = "{sources}";

/// Compose the sandboxed command line for a stage.
///
/// Returns the full command string (for logging) and the argv produced
/// by splitting it on ASCII spaces.
#[must_use]
pub fn jail_argv(stage: &Stage, source_files: &[String]) -> (String, Vec<String>) {
    let limits = &stage.limits;

    let mut cmd = format!("{NSJAIL_PATH} --really_quiet --nice_level=0");
    for mount in &stage.mounts {
        let _ = write!(cmd, " --bindmount={mount}");
    }
    for env_var in &stage.env {
        let _ = write!(cmd, " --env={env_var}");
    }
    let _ = write!(
        cmd,
        " --time_limit={:.1} --rlimit_as={} --rlimit_core=0 --rlimit_fsize={} --rlimit_nofile={} --rlimit_nproc={} --chroot / -- ",
        limits.run_time_sec,
        limits.address_space_mb,
        limits.file_writes_mb,
        limits.file_descriptors,
        limits.threads,
    );
    cmd.push_str(&stage.command);

    let cmd = cmd.replace(SOURCES_PLACEHOLDER, &source_files.join(" "));
    let argv = cmd
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect();
    (cmd, argv)
}
