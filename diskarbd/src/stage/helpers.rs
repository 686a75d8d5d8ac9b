//! External helper dispatch (spec.md §9 Design Note "External helper
//! dispatch"): probe/repair/mount/unmount/eject are modeled as child
//! processes whose completion is delivered as a typed event on a
//! dedicated channel, never invoked synchronously from the stage engine.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct HelperOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program` with `args`, capturing output. The stage engine awaits
/// this directly rather than polling — `tokio::process::Command` drives
/// the child via the reactor, so no dedicated OS thread is needed for
/// what is, underneath, still a CPU-bound blocking call.
pub async fn run_helper(program: &Path, args: &[String]) -> std::io::Result<HelperOutcome> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    Ok(HelperOutcome {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Parses `key=value` lines emitted by the probe/repair helpers on
/// stdout, matching the simple line-oriented protocol described in
/// `DESIGN.md` for these external collaborators.
pub fn parse_kv_lines(stdout: &str) -> std::collections::HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_key_value_protocol() {
        let kv = parse_kv_lines("kind=vfat\nname=USB\ndirty=false\n");
        assert_eq!(kv.get("kind").map(String::as_str), Some("vfat"));
        assert_eq!(kv.get("dirty").map(String::as_str), Some("false"));
    }
}
