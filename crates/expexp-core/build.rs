use std::process::Command;

/// Overrides the revision for builds outside a git checkout (release tarballs).
const REVISION_ENV: &str = "EXPEXP_BUILD_REVISION";

fn main() {
    println!("cargo:rerun-if-env-changed={REVISION_ENV}");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");

    let revision = std::env::var(REVISION_ENV)
        .ok()
        .filter(|r| !r.trim().is_empty())
        .or_else(git_revision)
        .unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=GIT_SHA={}", revision.trim());
}

/// Short hash of HEAD, suffixed with `-dirty` when the tree has local edits.
fn git_revision() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    String::from_utf8(out.stdout).ok()
}
