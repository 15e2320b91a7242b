//! Stage sequencing.
//!
//! The set of stages and the directories they read and write are a pure
//! function of [`Mode`] (see [`Mode::plan`]). [`PipelineController`] executes
//! a plan against its collaborators and aggregates every failure into a
//! [`PipelineReport`] instead of aborting; only configuration errors stop a
//! run before it starts.

use crate::collect::CorpusCollector;
use crate::error::{ConfigError, ErrorKind, PipelineError, StageError};
use crate::process::CancelToken;
use crate::sample::SampleSet;
use crate::stage::{SampleFailure, StageInvoker};
use crate::target::TargetCommand;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const CMIN_SUFFIX: &str = ".cmin";
pub const TMIN_SUFFIX: &str = ".tmin";
pub const CRASHES_SUFFIX: &str = ".crashes";

const NO_OPERATION_MESSAGE: &str = "No operation requested. You should at least provide '-c' \
for sample collection or '-d' for a dry-run. Use '--help' for usage instructions.";

/// Appends `suffix` to the last component of `path`: `out` + `.cmin` is `out.cmin`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn normalize(path: &Path) -> Result<PathBuf, std::io::Error> {
    Ok(std::path::absolute(path)?.components().collect())
}

/// What a run was asked to do. Built once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    sync_dir: PathBuf,
    collection_dir: Option<PathBuf>,
    cmin: bool,
    tmin: bool,
    dry_run: bool,
}

impl Mode {
    pub fn new(
        sync_dir: impl Into<PathBuf>,
        collection_dir: Option<PathBuf>,
        cmin: bool,
        tmin: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            sync_dir: sync_dir.into(),
            collection_dir: collection_dir.map(|p| p.components().collect()),
            cmin,
            tmin,
            dry_run,
        }
    }

    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }

    pub fn collection_dir(&self) -> Option<&Path> {
        self.collection_dir.as_deref()
    }

    pub fn collect(&self) -> bool {
        self.collection_dir.is_some()
    }

    pub fn cmin(&self) -> bool {
        self.cmin
    }

    pub fn tmin(&self) -> bool {
        self.tmin
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Neither collection nor dry-run requested: there is nothing to do.
    pub fn is_noop(&self) -> bool {
        !self.collect() && !self.dry_run
    }

    /// Checks the sync directory and makes every path absolute.
    pub fn resolve(&self) -> Result<Mode, ConfigError> {
        let sync_dir = normalize(&self.sync_dir)
            .map_err(|_| ConfigError::SyncDirMissing(self.sync_dir.clone()))?;
        if !sync_dir.is_dir() {
            return Err(ConfigError::SyncDirMissing(sync_dir));
        }
        let collection_dir = match &self.collection_dir {
            Some(dir) => Some(normalize(dir).map_err(|e| {
                ConfigError::Invalid(format!("collection directory {dir:?}: {e}"))
            })?),
            None => None,
        };
        Ok(Mode {
            sync_dir,
            collection_dir,
            ..self.clone()
        })
    }

    /// The ordered stages this mode runs, with the directory each one reads
    /// and writes. Every stage reads the directory the previous one produced.
    pub fn plan(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        match &self.collection_dir {
            Some(collection) => {
                steps.push(Step::Collect {
                    output: collection.clone(),
                });
                let mut current = collection.clone();
                if self.cmin {
                    let output = with_suffix(&current, CMIN_SUFFIX);
                    steps.push(Step::MinimizeCorpus {
                        input: current,
                        output: output.clone(),
                    });
                    current = output;
                }
                if self.tmin {
                    let output = with_suffix(&current, TMIN_SUFFIX);
                    steps.push(Step::MinimizeTestcases {
                        input: current,
                        output: output.clone(),
                    });
                    current = output;
                }
                if self.dry_run {
                    let crash_dir = with_suffix(&current, CRASHES_SUFFIX);
                    steps.push(Step::DryRun {
                        input: current,
                        crash_dir,
                    });
                }
            }
            None if self.dry_run => steps.push(Step::DryRunQueues),
            None => {}
        }
        steps
    }
}

/// One planned stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Collect { output: PathBuf },
    MinimizeCorpus { input: PathBuf, output: PathBuf },
    MinimizeTestcases { input: PathBuf, output: PathBuf },
    DryRun { input: PathBuf, crash_dir: PathBuf },
    /// Dry-run every queue of every fuzzer instance in place.
    DryRunQueues,
}

impl Step {
    pub fn kind(&self) -> StageKind {
        match self {
            Step::Collect { .. } => StageKind::Collect,
            Step::MinimizeCorpus { .. } => StageKind::MinimizeCorpus,
            Step::MinimizeTestcases { .. } => StageKind::MinimizeTestcases,
            Step::DryRun { .. } | Step::DryRunQueues => StageKind::DryRun,
        }
    }

    /// Directory the stage writes its result to, when known up front.
    pub fn output(&self) -> Option<&Path> {
        match self {
            Step::Collect { output }
            | Step::MinimizeCorpus { output, .. }
            | Step::MinimizeTestcases { output, .. } => Some(output.as_path()),
            Step::DryRun { crash_dir, .. } => Some(crash_dir.as_path()),
            Step::DryRunQueues => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Collect,
    MinimizeCorpus,
    MinimizeTestcases,
    DryRun,
}

impl StageKind {
    fn state(self) -> PipelineState {
        match self {
            StageKind::Collect => PipelineState::Collecting,
            StageKind::MinimizeCorpus => PipelineState::Minimizing,
            StageKind::MinimizeTestcases => PipelineState::TestcaseMinimizing,
            StageKind::DryRun => PipelineState::DryRunning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Collecting,
    Minimizing,
    TestcaseMinimizing,
    DryRunning,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    NoOp,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub sample: Option<PathBuf>,
    pub message: String,
}

impl FailureRecord {
    fn from_error(error: &StageError, sample: Option<PathBuf>) -> Self {
        Self {
            kind: error.kind(),
            sample,
            message: error.to_string(),
        }
    }
}

impl From<SampleFailure> for FailureRecord {
    fn from(failure: SampleFailure) -> Self {
        Self::from_error(&failure.error, Some(failure.sample))
    }
}

/// What one stage did. `completed` is false when the stage as a whole
/// failed; per-sample failures alone leave it true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub count: usize,
    pub completed: bool,
    pub failures: Vec<FailureRecord>,
}

impl StageReport {
    fn new(stage: StageKind, input: Option<&Path>, output: Option<&Path>) -> Self {
        Self {
            stage,
            input: input.map(Path::to_path_buf),
            output: output.map(Path::to_path_buf),
            count: 0,
            completed: false,
            failures: Vec::new(),
        }
    }

    fn finish(mut self, result: Result<usize, StageError>) -> Self {
        match result {
            Ok(count) => {
                self.count = count;
                self.completed = true;
            }
            Err(error) => {
                log::error!("{:?} stage failed: {error}", self.stage);
                self.failures.push(FailureRecord::from_error(&error, None));
            }
        }
        self
    }

    fn was_cancelled(&self) -> bool {
        self.failures.iter().any(|f| f.kind == ErrorKind::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub outcome: Outcome,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, kind: StageKind) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(move |s| s.stage == kind)
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.stages.iter().flat_map(|s| s.failures.iter())
    }

    /// Output directory of the last stage that produced a corpus.
    pub fn final_corpus(&self) -> Option<&Path> {
        self.stages
            .iter()
            .rev()
            .find(|s| s.stage != StageKind::DryRun)
            .and_then(|s| s.output.as_deref())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Drives one pipeline run.
pub struct PipelineController {
    mode: Mode,
    target: TargetCommand,
    collector: Box<dyn CorpusCollector>,
    stages: StageInvoker,
    cancel: CancelToken,
    state: PipelineState,
}

impl PipelineController {
    pub fn new(
        mode: Mode,
        target: TargetCommand,
        collector: Box<dyn CorpusCollector>,
        stages: StageInvoker,
    ) -> Self {
        Self {
            mode,
            target,
            collector,
            stages,
            cancel: CancelToken::new(),
            state: PipelineState::NotStarted,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        log::debug!("Pipeline state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs every planned stage in order.
    ///
    /// Returns an error only for configuration problems, detected before
    /// anything touches the filesystem. Stage failures are in the report.
    pub fn run(&mut self) -> Result<PipelineReport, PipelineError> {
        if self.mode.is_noop() {
            log::info!("{NO_OPERATION_MESSAGE}");
            self.transition(PipelineState::Done);
            return Ok(PipelineReport::new(Outcome::NoOp));
        }
        if !self.mode.collect() && (self.mode.cmin() || self.mode.tmin()) {
            log::warn!("--cmin and --tmin have no effect without --collect");
        }

        let mode = self.mode.resolve()?;
        let target = self.target.clone().resolve()?;

        let mut report = PipelineReport::new(Outcome::Completed);
        for step in mode.plan() {
            if self.cancel.is_cancelled() {
                report.outcome = Outcome::Cancelled;
                break;
            }
            self.transition(step.kind().state());
            let stage_reports = self.execute(&mode, &target, &step);
            let cancelled = stage_reports.iter().any(StageReport::was_cancelled);
            report.stages.extend(stage_reports);
            if cancelled {
                report.outcome = Outcome::Cancelled;
                break;
            }
        }

        self.transition(PipelineState::Done);
        Ok(report)
    }

    fn execute(&self, mode: &Mode, target: &TargetCommand, step: &Step) -> Vec<StageReport> {
        match step {
            Step::Collect { output } => vec![self.collect(mode.sync_dir(), output)],
            Step::MinimizeCorpus { input, output } => {
                vec![self.minimize_corpus(input, output, target)]
            }
            Step::MinimizeTestcases { input, output } => {
                vec![self.minimize_testcases(input, output, target)]
            }
            Step::DryRun { input, crash_dir } => {
                log::info!("Performing dry-run in {input:?}...");
                log::info!("Be patient! Depending on the corpus size this step can take hours...");
                vec![self.dry_run(input, crash_dir, target)]
            }
            Step::DryRunQueues => self.dry_run_queues(mode.sync_dir(), target),
        }
    }

    fn collect(&self, sync_dir: &Path, output: &Path) -> StageReport {
        let report = StageReport::new(StageKind::Collect, Some(sync_dir), Some(output));
        let result = (|| {
            log::info!("Looking for fuzzing queues in {sync_dir:?}.");
            let instances = self.collector.list_instances(sync_dir)?;
            log::info!("Found {} fuzzers, collecting samples.", instances.len());
            let index = self.collector.build_index(sync_dir, output, &instances)?;
            log::info!(
                "Successfully indexed {} samples ({} duplicates skipped).",
                index.len(),
                index.duplicates
            );
            log::info!("Copying {} samples into collection directory...", index.len());
            self.collector.copy_samples(&index)
        })();
        report.finish(result)
    }

    fn minimize_corpus(&self, input: &Path, output: &Path, target: &TargetCommand) -> StageReport {
        let report = StageReport::new(StageKind::MinimizeCorpus, Some(input), Some(output));
        log::info!("Minimizing corpus {input:?} into {output:?} for target: {target}");
        let result = self
            .stages
            .minimize_corpus(input, output, target)
            .map(|r| r.count);
        if let Ok(count) = &result {
            log::info!("Corpus minimizer kept {count} samples.");
        }
        report.finish(result)
    }

    fn minimize_testcases(
        &self,
        input: &Path,
        output: &Path,
        target: &TargetCommand,
    ) -> StageReport {
        let mut report = StageReport::new(StageKind::MinimizeTestcases, Some(input), Some(output));
        log::info!("Minimizing test cases in {input:?} into {output:?} for target: {target}");
        let result = SampleSet::from_dir(input).and_then(|samples| {
            let outcome = self
                .stages
                .minimize_testcases(&samples, output, target, &self.cancel)?;
            log::info!(
                "Minimized {} of {} test cases.",
                outcome.result.count,
                samples.len()
            );
            report
                .failures
                .extend(outcome.failures.into_iter().map(FailureRecord::from));
            Ok(outcome.result.count)
        });
        report.finish(result)
    }

    fn dry_run(&self, input: &Path, crash_dir: &Path, target: &TargetCommand) -> StageReport {
        let mut report = StageReport::new(StageKind::DryRun, Some(input), Some(crash_dir));
        let result = SampleSet::from_dir(input).and_then(|samples| {
            let outcome = self
                .stages
                .dry_run(&samples, crash_dir, target, &self.cancel)?;
            let quarantined = outcome.quarantined();
            report
                .failures
                .extend(outcome.failures.into_iter().map(FailureRecord::from));
            Ok(quarantined)
        });
        report.finish(result)
    }

    fn dry_run_queues(&self, sync_dir: &Path, target: &TargetCommand) -> Vec<StageReport> {
        let instances = match self.collector.list_instances(sync_dir) {
            Ok(instances) => instances,
            Err(error) => {
                return vec![
                    StageReport::new(StageKind::DryRun, Some(sync_dir), None).finish(Err(error)),
                ];
            }
        };

        log::info!("Found {} fuzzers, performing dry run.", instances.len());
        log::info!("Be patient! Depending on the corpus size this step can take hours...");
        let mut reports = Vec::new();
        for instance in &instances {
            let crash_dir = instance.crash_dir(sync_dir);
            for queue in instance.queue_paths(sync_dir) {
                if self.cancel.is_cancelled() {
                    reports.push(
                        StageReport::new(StageKind::DryRun, Some(queue.as_path()), Some(crash_dir.as_path()))
                            .finish(Err(StageError::Cancelled)),
                    );
                    return reports;
                }
                log::info!("Processing {queue:?}...");
                let report = self.dry_run(&queue, &crash_dir, target);
                let cancelled = report.was_cancelled();
                reports.push(report);
                if cancelled {
                    return reports;
                }
            }
        }
        reports
    }
}
