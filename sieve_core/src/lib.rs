pub mod collect;
pub mod config;
pub mod error;
pub mod minimize;
pub mod pipeline;
pub mod process;
pub mod sample;
pub mod stage;
pub mod target;
pub mod verify;

pub use collect::{CorpusCollector, FuzzerInstance, QueueCollector, SampleIndex};
pub use config::{SieveConfig, TimeoutPolicy};
pub use error::{ConfigError, ErrorKind, PipelineError, StageError};
pub use minimize::{AflCmin, AflTmin, CorpusMinimizer, TestcaseMinimizer};
pub use pipeline::{Mode, Outcome, PipelineController, PipelineReport, PipelineState, StageKind};
pub use process::{CancelToken, CommandLine, ProcessRunner, SystemProcessRunner};
pub use sample::{Sample, SampleSet};
pub use stage::{CrashPartition, StageInvoker, StageResult};
pub use target::TargetCommand;
pub use verify::{CrashVerifier, ExecCrashVerifier};
