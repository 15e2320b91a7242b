use crate::config::{TimeoutPolicy, VerifySettings};
use crate::error::StageError;
use crate::process::{CancelToken, ExitOutcome, StdinSource, execute_with_timeout};
use crate::sample::{Sample, SampleSet};
use crate::target::TargetCommand;
use rayon::prelude::*;
use std::time::Duration;

/// Replays samples against the target and reports which of them do NOT
/// crash it.
///
/// An error means the classification is incomplete; callers must not treat
/// any sample as crashing in that case.
pub trait CrashVerifier: Send + Sync {
    fn non_crashing(
        &self,
        samples: &SampleSet,
        target: &TargetCommand,
        cancel: &CancelToken,
    ) -> Result<SampleSet, StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Crash,
    NoCrash,
}

/// [`CrashVerifier`] that executes the target once per sample on a bounded
/// rayon pool.
///
/// A sample crashes when the target dies from a signal, or exits non-zero if
/// `crash_on_exit_code` is set. Hangs follow the configured [`TimeoutPolicy`].
#[derive(Debug, Clone)]
pub struct ExecCrashVerifier {
    workers: usize,
    timeout: Duration,
    on_timeout: TimeoutPolicy,
    crash_on_exit_code: bool,
}

impl ExecCrashVerifier {
    pub fn new(settings: &VerifySettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            timeout: settings.timeout(),
            on_timeout: settings.on_timeout,
            crash_on_exit_code: settings.crash_on_exit_code,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn verdict(&self, outcome: ExitOutcome) -> Verdict {
        match outcome {
            ExitOutcome::TimedOut => match self.on_timeout {
                TimeoutPolicy::Retain => Verdict::NoCrash,
                TimeoutPolicy::Quarantine => Verdict::Crash,
            },
            ExitOutcome::Exited(status) => {
                if killed_by_signal(status) || (self.crash_on_exit_code && !status.success()) {
                    Verdict::Crash
                } else {
                    Verdict::NoCrash
                }
            }
        }
    }

    fn verify_one(
        &self,
        sample: &Sample,
        target: &TargetCommand,
        cancel: &CancelToken,
    ) -> Result<Verdict, StageError> {
        cancel.check()?;
        let command = target.for_sample(sample.path());
        let stdin = if target.has_placeholder() {
            StdinSource::Null
        } else {
            StdinSource::File(sample.path())
        };
        let outcome = execute_with_timeout(&command, stdin, self.timeout, cancel)?;
        let verdict = self.verdict(outcome);
        if outcome == ExitOutcome::TimedOut {
            log::warn!("Sample {:?} timed out, counted as {verdict:?}", sample.path());
        } else {
            log::debug!("Sample {:?}: {verdict:?}", sample.path());
        }
        Ok(verdict)
    }
}

impl Default for ExecCrashVerifier {
    fn default() -> Self {
        Self::new(&VerifySettings::default())
    }
}

#[cfg(unix)]
fn killed_by_signal(status: std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: std::process::ExitStatus) -> bool {
    false
}

impl CrashVerifier for ExecCrashVerifier {
    fn non_crashing(
        &self,
        samples: &SampleSet,
        target: &TargetCommand,
        cancel: &CancelToken,
    ) -> Result<SampleSet, StageError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| StageError::Subprocess {
                command: "crash verifier".to_string(),
                reason: format!("failed to create thread pool: {e}"),
            })?;

        let verdicts: Vec<Result<Verdict, StageError>> = pool.install(|| {
            samples
                .as_slice()
                .par_iter()
                .map(|sample| self.verify_one(sample, target, cancel))
                .collect()
        });

        // Zip keeps the input order; a single error voids the whole run.
        let mut retained = Vec::new();
        for (sample, verdict) in samples.iter().zip(verdicts) {
            if verdict? == Verdict::NoCrash {
                retained.push(sample.clone());
            }
        }
        Ok(SampleSet::new(retained))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    use tempfile::tempdir;

    /// Crashes with SIGSEGV when the sample contains CRASH, hangs on HANG and
    /// exits 1 on FAIL.
    const SCRIPT: &str = r#"
        if grep -q CRASH "$1"; then kill -SEGV $$; fi
        if grep -q HANG "$1"; then sleep 5; fi
        if grep -q FAIL "$1"; then exit 1; fi
        exit 0
    "#;

    fn samples(dir: &std::path::Path, contents: &[(&str, &str)]) -> SampleSet {
        for (name, data) in contents {
            fs::write(dir.join(name), data).unwrap();
        }
        SampleSet::from_dir(dir).unwrap()
    }

    fn names(set: &SampleSet) -> Vec<String> {
        set.iter()
            .map(|s| s.file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn with_script(dir: &std::path::Path) -> TargetCommand {
        let script = dir.join("target.sh");
        fs::write(&script, SCRIPT).unwrap();
        TargetCommand::parse(&["/bin/sh", script.to_str().unwrap(), "@@"], "@@").unwrap()
    }

    #[test]
    fn crashing_samples_are_excluded() {
        let work = tempdir().unwrap();
        let corpus = tempdir().unwrap();
        let set = samples(corpus.path(), &[("a", "ok"), ("b", "CRASH"), ("c", "FAIL")]);
        let verifier = ExecCrashVerifier::new(&VerifySettings {
            workers: 2,
            ..VerifySettings::default()
        });
        let retained = verifier
            .non_crashing(&set, &with_script(work.path()), &CancelToken::new())
            .unwrap();
        assert_eq!(names(&retained), ["a", "c"]);
    }

    #[test]
    fn exit_code_counts_as_crash_when_configured() {
        let work = tempdir().unwrap();
        let corpus = tempdir().unwrap();
        let set = samples(corpus.path(), &[("a", "ok"), ("c", "FAIL")]);
        let verifier = ExecCrashVerifier::new(&VerifySettings {
            crash_on_exit_code: true,
            ..VerifySettings::default()
        });
        let retained = verifier
            .non_crashing(&set, &with_script(work.path()), &CancelToken::new())
            .unwrap();
        assert_eq!(names(&retained), ["a"]);
    }

    #[test]
    fn timeout_policy_decides_hangs() {
        let work = tempdir().unwrap();
        let corpus = tempdir().unwrap();
        let set = samples(corpus.path(), &[("h", "HANG")]);
        let target = with_script(work.path());

        let retain = ExecCrashVerifier::new(&VerifySettings {
            timeout_ms: 100,
            ..VerifySettings::default()
        });
        assert_eq!(
            retain.non_crashing(&set, &target, &CancelToken::new()).unwrap().len(),
            1
        );

        let quarantine = ExecCrashVerifier::new(&VerifySettings {
            timeout_ms: 100,
            on_timeout: TimeoutPolicy::Quarantine,
            ..VerifySettings::default()
        });
        assert!(
            quarantine
                .non_crashing(&set, &target, &CancelToken::new())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn cancelled_verification_is_an_error() {
        let work = tempdir().unwrap();
        let corpus = tempdir().unwrap();
        let set = samples(corpus.path(), &[("a", "ok")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ExecCrashVerifier::default()
            .non_crashing(&set, &with_script(work.path()), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn samples_fed_on_stdin_without_placeholder() {
        let corpus = tempdir().unwrap();
        let set = samples(corpus.path(), &[("a", "ok"), ("b", "CRASH")]);
        let work = tempdir().unwrap();
        let script = work.path().join("stdin.sh");
        fs::write(&script, "if grep -q CRASH; then kill -SEGV $$; fi\nexit 0\n").unwrap();
        let target = TargetCommand::parse(&["/bin/sh", script.to_str().unwrap()], "@@").unwrap();
        let retained = ExecCrashVerifier::default()
            .non_crashing(&set, &target, &CancelToken::new())
            .unwrap();
        assert_eq!(names(&retained), ["a"]);
    }
}
