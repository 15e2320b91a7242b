use crate::error::StageError;
use std::fs;
use std::path::{Path, PathBuf};

/// AFL drops this file into crash directories; it is never a sample.
const AFL_README: &str = "README.txt";

/// One fuzz input on disk. A sample has no identity beyond its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sample {
    path: PathBuf,
}

impl Sample {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory that currently owns the sample.
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// Base name used when the sample is written or moved elsewhere.
    pub fn file_name(&self) -> &std::ffi::OsStr {
        self.path.file_name().unwrap_or(self.path.as_os_str())
    }
}

impl From<PathBuf> for Sample {
    fn from(path: PathBuf) -> Self {
        Sample::new(path)
    }
}

/// An ordered sequence of samples, usually the listing of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Lists the samples directly inside `dir`, sorted by file name.
    ///
    /// Sub-directories, dot-files and AFL's `README.txt` are skipped; paths
    /// are made absolute so they stay valid whatever the working directory.
    pub fn from_dir(dir: &Path) -> Result<Self, StageError> {
        let dir = std::path::absolute(dir).map_err(|e| StageError::fs("failed to resolve", dir, e))?;
        let entries = fs::read_dir(&dir).map_err(|e| StageError::fs("failed to list", &dir, e))?;

        let mut samples = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StageError::fs("failed to list", &dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') || name == AFL_README {
                    continue;
                }
            }
            samples.push(Sample::new(path));
        }
        samples.sort();
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.samples.iter().map(Sample::path)
    }
}

impl FromIterator<Sample> for SampleSet {
    fn from_iter<T: IntoIterator<Item = Sample>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for SampleSet {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}

impl<'a> IntoIterator for &'a SampleSet {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn from_dir_lists_files_sorted_and_skips_noise() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("id:000002"), b"b").unwrap();
        fs::write(dir.path().join("id:000001"), b"a").unwrap();
        fs::write(dir.path().join(".cur_input"), b"x").unwrap();
        fs::write(dir.path().join(AFL_README), b"readme").unwrap();
        fs::create_dir(dir.path().join(".state")).unwrap();

        let set = SampleSet::from_dir(dir.path()).unwrap();
        let names: Vec<_> = set.iter().map(|s| s.file_name().to_owned()).collect();
        assert_eq!(names, ["id:000001", "id:000002"]);
        assert!(set.paths().all(Path::is_absolute));
        assert_eq!(set.as_slice()[0].dir(), Some(dir.path()));
    }

    #[test]
    fn from_dir_on_empty_dir_is_empty() {
        let dir = tempdir().unwrap();
        assert!(SampleSet::from_dir(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn from_missing_dir_is_filesystem_error() {
        let dir = tempdir().unwrap();
        let err = SampleSet::from_dir(&dir.path().join("gone")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
    }
}
