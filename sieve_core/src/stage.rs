use crate::error::StageError;
use crate::minimize::{CorpusMinimizer, TestcaseMinimizer};
use crate::process::CancelToken;
use crate::sample::{Sample, SampleSet};
use crate::target::TargetCommand;
use crate::verify::CrashVerifier;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Output directory and number of samples a stage handled successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub output_dir: PathBuf,
    pub count: usize,
}

/// A per-sample failure that did not stop its stage.
#[derive(Debug)]
pub struct SampleFailure {
    pub sample: PathBuf,
    pub error: StageError,
}

/// Result of minimize-testcases: how many samples made it, and why the
/// others did not.
#[derive(Debug)]
pub struct TestcaseReport {
    pub result: StageResult,
    pub failures: Vec<SampleFailure>,
}

/// Split of a sample set into crashing and non-crashing samples.
///
/// Every input sample lands in exactly one side, and input order is kept on
/// both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashPartition {
    pub quarantined: SampleSet,
    pub retained: SampleSet,
}

impl CrashPartition {
    /// Classifies `samples` given the subset the verifier found not to crash.
    /// Membership is decided by path; entries of `non_crashing` that are not
    /// part of `samples` are ignored.
    pub fn classify(samples: &SampleSet, non_crashing: &SampleSet) -> Self {
        let keep: HashSet<&Path> = non_crashing.paths().collect();
        let mut seen: HashSet<&Path> = HashSet::new();
        let (mut quarantined, mut retained) = (Vec::new(), Vec::new());
        for sample in samples {
            if !seen.insert(sample.path()) {
                continue;
            }
            if keep.contains(sample.path()) {
                retained.push(sample.clone());
            } else {
                quarantined.push(sample.clone());
            }
        }
        Self {
            quarantined: SampleSet::new(quarantined),
            retained: SampleSet::new(retained),
        }
    }
}

/// Result of a dry-run: the partition, which crashing samples were actually
/// moved, and which could not be.
#[derive(Debug)]
pub struct QuarantineReport {
    pub crash_dir: PathBuf,
    pub partition: CrashPartition,
    pub moved: Vec<PathBuf>,
    pub failures: Vec<SampleFailure>,
}

impl QuarantineReport {
    pub fn quarantined(&self) -> usize {
        self.moved.len()
    }
}

/// Runs the individual pipeline stages against their collaborators and owns
/// the directory policy around them.
pub struct StageInvoker {
    corpus_minimizer: Box<dyn CorpusMinimizer>,
    testcase_minimizer: Box<dyn TestcaseMinimizer>,
    crash_verifier: Box<dyn CrashVerifier>,
}

impl StageInvoker {
    pub fn new(
        corpus_minimizer: Box<dyn CorpusMinimizer>,
        testcase_minimizer: Box<dyn TestcaseMinimizer>,
        crash_verifier: Box<dyn CrashVerifier>,
    ) -> Self {
        Self {
            corpus_minimizer,
            testcase_minimizer,
            crash_verifier,
        }
    }

    /// Runs the corpus minimizer once over `input_dir`. On success the count
    /// is the number of samples left in `output_dir`.
    pub fn minimize_corpus(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        target: &TargetCommand,
    ) -> Result<StageResult, StageError> {
        create_dir(output_dir)?;
        self.corpus_minimizer
            .minimize_corpus(input_dir, output_dir, target)?;
        let count = SampleSet::from_dir(output_dir)?.len();
        Ok(StageResult {
            output_dir: output_dir.to_path_buf(),
            count,
        })
    }

    /// Minimizes every sample independently into `output_dir/<basename>`.
    /// A failing sample is logged and skipped; the others still run.
    pub fn minimize_testcases(
        &self,
        samples: &SampleSet,
        output_dir: &Path,
        target: &TargetCommand,
        cancel: &CancelToken,
    ) -> Result<TestcaseReport, StageError> {
        create_dir(output_dir)?;

        let mut count = 0;
        let mut failures = Vec::new();
        for sample in samples {
            cancel.check()?;
            let output = output_dir.join(sample.file_name());
            match self
                .testcase_minimizer
                .minimize_testcase(sample.path(), &output, target)
            {
                Ok(()) => count += 1,
                Err(error) => {
                    log::warn!("Minimizing {:?} failed: {error}", sample.path());
                    failures.push(SampleFailure {
                        sample: sample.path().to_path_buf(),
                        error,
                    });
                }
            }
        }

        Ok(TestcaseReport {
            result: StageResult {
                output_dir: output_dir.to_path_buf(),
                count,
            },
            failures,
        })
    }

    /// Replays `samples`, then moves every crashing one into `crash_dir`.
    ///
    /// Nothing is moved unless the verifier classified the whole set. A move
    /// never overwrites an existing file; each failed move is reported and the
    /// sample stays where it was.
    pub fn dry_run(
        &self,
        samples: &SampleSet,
        crash_dir: &Path,
        target: &TargetCommand,
        cancel: &CancelToken,
    ) -> Result<QuarantineReport, StageError> {
        let non_crashing = self.crash_verifier.non_crashing(samples, target, cancel)?;
        let partition = CrashPartition::classify(samples, &non_crashing);

        let mut moved = Vec::new();
        let mut failures = Vec::new();
        if !partition.quarantined.is_empty() {
            create_dir(crash_dir)?;
            for sample in &partition.quarantined {
                match move_sample(sample, crash_dir) {
                    Ok(destination) => moved.push(destination),
                    Err(error) => {
                        log::warn!("Quarantining {:?} failed: {error}", sample.path());
                        failures.push(SampleFailure {
                            sample: sample.path().to_path_buf(),
                            error,
                        });
                    }
                }
            }
        }

        log::info!(
            "Moved {} crash samples from the corpus to {:?}.",
            moved.len(),
            crash_dir
        );
        Ok(QuarantineReport {
            crash_dir: crash_dir.to_path_buf(),
            partition,
            moved,
            failures,
        })
    }
}

fn create_dir(dir: &Path) -> Result<(), StageError> {
    fs::create_dir_all(dir).map_err(|e| StageError::fs("failed to create", dir, e))
}

/// Moves `sample` into `dir` under its base name, falling back to copy and
/// remove when a rename is not possible (e.g. across filesystems).
fn move_sample(sample: &Sample, dir: &Path) -> Result<PathBuf, StageError> {
    let destination = dir.join(sample.file_name());
    if destination.exists() {
        return Err(StageError::fs(
            "refusing to overwrite",
            &destination,
            io::Error::from(io::ErrorKind::AlreadyExists),
        ));
    }
    if fs::rename(sample.path(), &destination).is_ok() {
        return Ok(destination);
    }
    fs::copy(sample.path(), &destination)
        .map_err(|e| StageError::fs("failed to move", sample.path(), e))?;
    if let Err(e) = fs::remove_file(sample.path()) {
        // Keep the sample in exactly one place.
        let _ = fs::remove_file(&destination);
        return Err(StageError::fs("failed to move", sample.path(), e));
    }
    Ok(destination)
}
