use crate::error::ConfigError;
use crate::process::CommandLine;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

/// Sample marker understood by afl-cmin and afl-tmin.
pub const AFL_PLACEHOLDER: &str = "@@";

/// The binary under test plus its argument template.
///
/// One argument may contain the placeholder (`@@` by default), which marks
/// where a sample's path is substituted when the target is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCommand {
    program: PathBuf,
    args: Vec<String>,
    placeholder: String,
}

impl TargetCommand {
    /// Builds a target from command-line words. Words are re-split on
    /// whitespace so `"./target -f @@"` and `["./target", "-f", "@@"]` are
    /// equivalent.
    pub fn parse<S: AsRef<str>>(words: &[S], placeholder: &str) -> Result<Self, ConfigError> {
        let mut parts = words
            .iter()
            .flat_map(|w| w.as_ref().split_whitespace())
            .map(str::to_string);
        let program = parts.next().ok_or(ConfigError::EmptyTarget)?;
        Ok(Self {
            program: PathBuf::from(program),
            args: parts.collect(),
            placeholder: placeholder.to_string(),
        })
    }

    /// Resolves the program to an absolute path and checks that it exists.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        let absolute = std::path::absolute(&self.program)
            .map_err(|_| ConfigError::TargetMissing(self.program.clone()))?;
        if !absolute.exists() {
            return Err(ConfigError::TargetMissing(absolute));
        }
        self.program = absolute;
        Ok(self)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn has_placeholder(&self) -> bool {
        !self.placeholder.is_empty() && self.args.iter().any(|a| a.contains(&self.placeholder))
    }

    /// Program and template arguments for the AFL tools, which only
    /// recognize `@@`. A custom placeholder is rewritten to it.
    pub fn template_argv(&self) -> Vec<OsString> {
        let afl_marker = OsStr::new(AFL_PLACEHOLDER);
        std::iter::once(self.program.clone().into_os_string())
            .chain(self.args.iter().map(|a| self.substitute(a, afl_marker)))
            .collect()
    }

    /// The concrete command line for running the target on one sample.
    pub fn for_sample(&self, sample: &Path) -> CommandLine {
        CommandLine::new(
            self.program.clone(),
            self.args
                .iter()
                .map(|a| self.substitute(a, sample.as_os_str())),
        )
    }

    // Built piecewise so a non-UTF-8 replacement survives intact.
    fn substitute(&self, arg: &str, replacement: &OsStr) -> OsString {
        if self.placeholder.is_empty() {
            return OsString::from(arg);
        }
        let mut pieces = arg.split(self.placeholder.as_str());
        let mut out = OsString::from(pieces.next().unwrap_or_default());
        for piece in pieces {
            out.push(replacement);
            out.push(piece);
        }
        out
    }
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_splits_joined_words() {
        let target = TargetCommand::parse(&["./bin -f @@", "--fast"], "@@").unwrap();
        assert_eq!(target.program(), Path::new("./bin"));
        assert_eq!(target.args(), ["-f", "@@", "--fast"]);
        assert!(target.has_placeholder());
        assert_eq!(target.to_string(), "./bin -f @@ --fast");
    }

    #[test]
    fn parse_rejects_empty() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            TargetCommand::parse(&empty, "@@"),
            Err(ConfigError::EmptyTarget)
        ));
        assert!(matches!(
            TargetCommand::parse(&["   "], "@@"),
            Err(ConfigError::EmptyTarget)
        ));
    }

    #[test]
    fn for_sample_substitutes_placeholder() {
        let target = TargetCommand::parse(&["/bin/t", "--in=@@", "x"], "@@").unwrap();
        let cmd = target.for_sample(Path::new("/corpus/id:000001"));
        assert_eq!(cmd.program(), Path::new("/bin/t").as_os_str());
        assert_eq!(cmd.args(), [OsString::from("--in=/corpus/id:000001"), "x".into()]);
    }

    #[test]
    fn custom_placeholder_becomes_afl_marker() {
        let target = TargetCommand::parse(&["/bin/t", "--in={}", "{}"], "{}").unwrap();
        assert_eq!(
            target.template_argv(),
            vec![
                OsString::from("/bin/t"),
                OsString::from("--in=@@"),
                OsString::from("@@")
            ]
        );
        let cmd = target.for_sample(Path::new("/c/x"));
        assert_eq!(cmd.args(), [OsString::from("--in=/c/x"), "/c/x".into()]);
    }

    #[cfg(unix)]
    #[test]
    fn for_sample_keeps_non_utf8_paths() {
        use std::os::unix::ffi::{OsStrExt, OsStringExt};
        let target = TargetCommand::parse(&["/bin/t", "--in=@@"], "@@").unwrap();
        let sample = Path::new(OsStr::from_bytes(b"/c/id:\xff\xfe"));
        let cmd = target.for_sample(sample);
        assert_eq!(
            cmd.args()[0].clone().into_vec(),
            b"--in=/c/id:\xff\xfe".to_vec()
        );
    }

    #[test]
    fn template_argv_keeps_placeholder() {
        let target = TargetCommand::parse(&["/bin/t", "@@"], "@@").unwrap();
        assert_eq!(
            target.template_argv(),
            vec![OsString::from("/bin/t"), OsString::from("@@")]
        );
    }

    #[test]
    fn resolve_requires_existing_binary() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let target = TargetCommand::parse(&[missing.to_str().unwrap()], "@@").unwrap();
        assert!(matches!(
            target.resolve(),
            Err(ConfigError::TargetMissing(_))
        ));

        let present = dir.path().join("present");
        std::fs::write(&present, b"#!/bin/sh\n").unwrap();
        let target = TargetCommand::parse(&[present.to_str().unwrap(), "@@"], "@@")
            .unwrap()
            .resolve()
            .unwrap();
        assert!(target.program().is_absolute());
    }
}
