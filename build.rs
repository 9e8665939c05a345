use std::process::Command;

fn main() {
    // Build timestamp (UTC ISO-8601) for the startup banner
    let built_at = command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]);
    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");

    // Short git SHA if the crate is built from a checkout
    let git_sha = command_output("git", &["rev-parse", "--short", "HEAD"]);
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".into());
    println!("cargo:rustc-env=BUILD_PROFILE={profile}");

    println!("cargo:rerun-if-changed=.git/HEAD");
}

/// Trimmed stdout of a helper command, or `"unknown"` when it is unavailable.
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
