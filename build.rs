use std::process::Command;

/// Trimmed stdout of `cmd`, or "unknown" when it cannot run.
fn capture(cmd: &str, args: &[&str]) -> String {
    Command::new(cmd)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=BUILD_COMMIT={}", capture("git", &["rev-parse", "--short", "HEAD"]));
    println!("cargo:rustc-env=BUILD_DATE={}", capture("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]));
    println!("cargo:rerun-if-changed=.git/HEAD");
}
