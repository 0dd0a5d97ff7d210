//! Process execution for actions that shell out.

pub mod local;

use std::path::PathBuf;

/// Output from running a script or program.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr together, for pattern checks and error messages.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Working directory and extra environment for a child process.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ExecOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput { exit_code: 0, stdout: "ok".into(), stderr: "".into() };
        assert!(ok.success());
        let fail = ExecOutput { exit_code: 1, stdout: "".into(), stderr: "err".into() };
        assert!(!fail.success());
        let sig = ExecOutput { exit_code: -1, stdout: "".into(), stderr: "killed".into() };
        assert!(!sig.success());
    }

    #[test]
    fn test_exec_output_combined() {
        let out = ExecOutput { exit_code: 0, stdout: "a\n".into(), stderr: "b\n".into() };
        assert_eq!(out.combined(), "a\nb\n");
    }

    #[test]
    fn test_exec_options_builder() {
        let opts = ExecOptions::in_dir("/tmp").with_env("PATH", "/bin");
        assert_eq!(opts.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(opts.env, vec![("PATH".to_string(), "/bin".to_string())]);
    }
}
