//! Directory layout for sessions, steps, pods and attempts.
//!
//! ```text
//! .pods/
//!   config.toml
//!   .gitignore
//!   sessions/<workflow>-<timestamp>-<id>/
//!     checkpoint.json
//!     report.json
//!     steps/<step_id>/pod-<name>-<uuid>/
//!       attempts/<N>/instructions.json
//!       attempts/<N>/workers/<worker>/<output_path>
//!       attempts/<N>/feedback.json
//!       result.json
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

pub const PODS_DIR: &str = ".pods";
pub const FINAL_RESULT_FILE: &str = "result.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const REPORT_FILE: &str = "report.json";

const GITIGNORE_CONTENTS: &str = "sessions/\n";

/// Well-known paths under a project root.
#[derive(Debug, Clone)]
pub struct PodsPaths {
    pub root: PathBuf,
    pub pods_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub sessions_dir: PathBuf,
}

impl PodsPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let pods_dir = root.join(PODS_DIR);
        Self {
            config_path: pods_dir.join("config.toml"),
            gitignore_path: pods_dir.join(".gitignore"),
            sessions_dir: pods_dir.join("sessions"),
            pods_dir,
            root,
        }
    }

    /// Create `.pods/` and its `.gitignore` if missing.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.sessions_dir)
            .with_context(|| format!("create {}", self.sessions_dir.display()))?;
        if !self.gitignore_path.exists() {
            fs::write(&self.gitignore_path, GITIGNORE_CONTENTS)
                .with_context(|| format!("write {}", self.gitignore_path.display()))?;
        }
        Ok(())
    }
}

/// Create a fresh, uniquely named session directory for `workflow`.
pub fn create_session_dir(paths: &PodsPaths, workflow: &str) -> Result<PathBuf> {
    paths.ensure()?;
    let name = format!(
        "{}-{}-{}",
        slug(workflow),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        short_id()
    );
    let dir = paths.sessions_dir.join(name);
    fs::create_dir(&dir).with_context(|| format!("create session {}", dir.display()))?;
    debug!(session = %dir.display(), "session created");
    Ok(dir)
}

/// Unique directory name for one Pod instance.
pub fn pod_dir_name(pod_name: &str) -> String {
    format!("pod-{}-{}", slug(pod_name), Uuid::new_v4().simple())
}

/// Per-step subtree, relative to the session root.
pub fn step_dir(step_id: &str) -> PathBuf {
    Path::new("steps").join(slug(step_id))
}

/// Paths of one attempt, relative to the Pod directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub instructions: PathBuf,
    pub feedback: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempt: u32) -> Self {
        let dir = Path::new("attempts").join(attempt.to_string());
        Self {
            instructions: dir.join("instructions.json"),
            feedback: dir.join("feedback.json"),
            dir,
        }
    }

    pub fn worker_result(&self, worker: &str, output_path: &str) -> PathBuf {
        self.dir.join("workers").join(worker).join(output_path)
    }
}

/// Whether `path` is a non-empty relative path made only of plain names,
/// so joining it never leaves the directory it is joined to.
pub fn stays_inside(path: &str) -> bool {
    let path = Path::new(path);
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Lowercase alphanumerics with single dashes; never empty.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_normalizes_names() {
        assert_eq!(slug("Draft Report!"), "draft-report");
        assert_eq!(slug("  a__b  "), "a-b");
        assert_eq!(slug("???"), "unnamed");
    }

    #[test]
    fn pod_dirs_are_unique() {
        assert_ne!(pod_dir_name("a"), pod_dir_name("a"));
        assert!(pod_dir_name("My Pod").starts_with("pod-my-pod-"));
    }

    #[test]
    fn attempt_paths_follow_layout() {
        let paths = AttemptPaths::new(2);
        assert_eq!(paths.instructions, Path::new("attempts/2/instructions.json"));
        assert_eq!(paths.feedback, Path::new("attempts/2/feedback.json"));
        assert_eq!(
            paths.worker_result("echo", "result.json"),
            Path::new("attempts/2/workers/echo/result.json")
        );
    }

    #[test]
    fn output_paths_must_stay_inside_the_pod() {
        assert!(stays_inside("result.json"));
        assert!(stays_inside("out/result.json"));
        for escaping in ["", "/tmp/out.json", "../out.json", "out/../../x.json", "./"] {
            assert!(!stays_inside(escaping), "{escaping:?} accepted");
        }
    }

    #[test]
    fn sessions_are_created_under_pods_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PodsPaths::new(temp.path());
        let first = create_session_dir(&paths, "Demo Flow").expect("session");
        let second = create_session_dir(&paths, "Demo Flow").expect("session");
        assert_ne!(first, second);
        assert!(first.starts_with(&paths.sessions_dir));
        assert!(first.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            GITIGNORE_CONTENTS
        );
    }
}
