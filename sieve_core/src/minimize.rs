use crate::config::ToolSettings;
use crate::error::StageError;
use crate::process::{CommandLine, ProcessRunner, SystemProcessRunner};
use crate::target::TargetCommand;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Reduces a directory of samples to a subset with equivalent coverage.
pub trait CorpusMinimizer: Send + Sync {
    fn minimize_corpus(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        target: &TargetCommand,
    ) -> Result<(), StageError>;
}

/// Shrinks a single sample while preserving its behaviour.
pub trait TestcaseMinimizer: Send + Sync {
    fn minimize_testcase(
        &self,
        sample: &Path,
        output: &Path,
        target: &TargetCommand,
    ) -> Result<(), StageError>;
}

fn afl_command(tool: &Path, input: &Path, output: &Path, target: &TargetCommand) -> CommandLine {
    let mut args: Vec<OsString> = vec![
        "-i".into(),
        input.into(),
        "-o".into(),
        output.into(),
        "--".into(),
    ];
    args.extend(target.template_argv());
    CommandLine::new(tool, args)
}

/// `afl-cmin -i <in> -o <out> -- <target...>`
pub struct AflCmin<R: ProcessRunner = SystemProcessRunner> {
    tool: PathBuf,
    runner: R,
}

impl AflCmin {
    pub fn new(tools: &ToolSettings) -> Self {
        Self::with_runner(tools, SystemProcessRunner)
    }
}

impl<R: ProcessRunner> AflCmin<R> {
    pub fn with_runner(tools: &ToolSettings, runner: R) -> Self {
        Self {
            tool: tools.cmin.clone(),
            runner,
        }
    }

    pub fn command(&self, input_dir: &Path, output_dir: &Path, target: &TargetCommand) -> CommandLine {
        afl_command(&self.tool, input_dir, output_dir, target)
    }
}

impl<R: ProcessRunner> CorpusMinimizer for AflCmin<R> {
    fn minimize_corpus(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        target: &TargetCommand,
    ) -> Result<(), StageError> {
        self.runner.run(&self.command(input_dir, output_dir, target))
    }
}

/// `afl-tmin -i <sample> -o <out> -- <target...>`
pub struct AflTmin<R: ProcessRunner = SystemProcessRunner> {
    tool: PathBuf,
    runner: R,
}

impl AflTmin {
    pub fn new(tools: &ToolSettings) -> Self {
        Self::with_runner(tools, SystemProcessRunner)
    }
}

impl<R: ProcessRunner> AflTmin<R> {
    pub fn with_runner(tools: &ToolSettings, runner: R) -> Self {
        Self {
            tool: tools.tmin.clone(),
            runner,
        }
    }

    pub fn command(&self, sample: &Path, output: &Path, target: &TargetCommand) -> CommandLine {
        afl_command(&self.tool, sample, output, target)
    }
}

impl<R: ProcessRunner> TestcaseMinimizer for AflTmin<R> {
    fn minimize_testcase(
        &self,
        sample: &Path,
        output: &Path,
        target: &TargetCommand,
    ) -> Result<(), StageError> {
        self.runner.run(&self.command(sample, output, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ProcessRunner for RecordingRunner {
        fn run(&self, command: &CommandLine) -> Result<(), StageError> {
            self.calls.lock().unwrap().push(command.to_string());
            if self.fail {
                Err(StageError::Subprocess {
                    command: command.program().to_string_lossy().into_owned(),
                    reason: "exited with code 1".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn target() -> TargetCommand {
        TargetCommand::parse(&["/bin/target", "-f", "@@"], "@@").unwrap()
    }

    #[test]
    fn cmin_builds_afl_command_line() {
        let cmin = AflCmin::with_runner(&ToolSettings::default(), RecordingRunner::default());
        cmin.minimize_corpus(Path::new("/c"), Path::new("/c.cmin"), &target())
            .unwrap();
        assert_eq!(
            *cmin.runner.calls.lock().unwrap(),
            ["afl-cmin -i /c -o /c.cmin -- /bin/target -f @@"]
        );
    }

    #[test]
    fn custom_placeholder_is_passed_to_afl_as_marker() {
        let target = TargetCommand::parse(&["/bin/t", "--in", "{}"], "{}").unwrap();
        let cmin = AflCmin::with_runner(&ToolSettings::default(), RecordingRunner::default());
        cmin.minimize_corpus(Path::new("/c"), Path::new("/c.cmin"), &target)
            .unwrap();
        let tmin = AflTmin::with_runner(&ToolSettings::default(), RecordingRunner::default());
        tmin.minimize_testcase(Path::new("/c/x"), Path::new("/c.tmin/x"), &target)
            .unwrap();
        assert_eq!(
            *cmin.runner.calls.lock().unwrap(),
            ["afl-cmin -i /c -o /c.cmin -- /bin/t --in @@"]
        );
        assert_eq!(
            *tmin.runner.calls.lock().unwrap(),
            ["afl-tmin -i /c/x -o /c.tmin/x -- /bin/t --in @@"]
        );
    }

    #[test]
    fn tmin_uses_configured_tool_and_propagates_failure() {
        let tools = ToolSettings {
            tmin: PathBuf::from("/opt/afl/afl-tmin"),
            ..ToolSettings::default()
        };
        let runner = RecordingRunner {
            fail: true,
            ..RecordingRunner::default()
        };
        let tmin = AflTmin::with_runner(&tools, runner);
        let err = tmin
            .minimize_testcase(Path::new("/c/a"), Path::new("/c.tmin/a"), &target())
            .unwrap_err();
        assert!(err.to_string().contains("code 1"));
        assert_eq!(
            *tmin.runner.calls.lock().unwrap(),
            ["/opt/afl/afl-tmin -i /c/a -o /c.tmin/a -- /bin/target -f @@"]
        );
    }
}
