use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Coarse classification of a failure, used when failures are aggregated
/// into a [`crate::pipeline::PipelineReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Config,
    Subprocess,
    Filesystem,
    Cancelled,
}

/// Errors detected before any stage runs. These are the only failures that
/// abort a pipeline run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No valid directory provided for <SYNC_DIR>: {0:?}")]
    SyncDirMissing(PathBuf),

    #[error("Target binary not found: {0:?}")]
    TargetMissing(PathBuf),

    #[error("Target command is empty")]
    EmptyTarget,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The failure of a single stage call, or of one sample inside a stage.
///
/// Stage failures are fail-soft: they are logged and recorded in the report,
/// and the pipeline carries on with the next sample or stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An external command ran and exited unsuccessfully, or could not be started.
    #[error("{command} failed: {reason}")]
    Subprocess { command: String, reason: String },

    /// A filesystem operation on `path` failed.
    #[error("{action} {path:?}: {source}")]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Config(_) => ErrorKind::Config,
            StageError::Subprocess { .. } => ErrorKind::Subprocess,
            StageError::Filesystem { .. } => ErrorKind::Filesystem,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn fs(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        StageError::Filesystem {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Builds a [`StageError::Subprocess`] from the exit status of `command`.
    pub fn exit_status(command: &str, status: std::process::ExitStatus) -> Self {
        StageError::Subprocess {
            command: command.to_string(),
            reason: describe_exit(status),
        }
    }
}

/// Formats an exit status the way diagnostics report it: the exit code when
/// there is one, otherwise the terminating signal.
pub fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited abnormally".to_string()
}

/// Fatal pipeline errors. Everything else is reported through the
/// [`crate::pipeline::PipelineReport`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        let sub = StageError::Subprocess {
            command: "afl-cmin".into(),
            reason: "exited with code 1".into(),
        };
        assert_eq!(sub.kind(), ErrorKind::Subprocess);
        assert!(sub.to_string().contains("code 1"));

        let fs_err = StageError::fs(
            "failed to move",
            Path::new("/tmp/x"),
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        );
        assert_eq!(fs_err.kind(), ErrorKind::Filesystem);
        assert!(fs_err.to_string().starts_with("failed to move"));

        let cfg: StageError = ConfigError::EmptyTarget.into();
        assert_eq!(cfg.kind(), ErrorKind::Config);
        assert_eq!(StageError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[cfg(unix)]
    #[test]
    fn describe_exit_reports_code() {
        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();
        assert_eq!(describe_exit(status), "exited with code 3");
    }
}
