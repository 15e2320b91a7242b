//! Discovery of fuzzer instances in a sync directory and collection of their
//! queue samples into a single deduplicated corpus directory.

use crate::error::StageError;
use crate::sample::SampleSet;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const QUEUE_DIR_PREFIX: &str = "queue";

/// One parallel fuzzing worker inside a sync directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuzzerInstance {
    pub name: String,
    /// Queue directory names, relative to the instance directory.
    pub queue_dirs: Vec<String>,
}

impl FuzzerInstance {
    pub fn queue_paths<'a>(&'a self, sync_dir: &'a Path) -> impl Iterator<Item = PathBuf> + 'a {
        self.queue_dirs
            .iter()
            .map(move |q| sync_dir.join(&self.name).join(q))
    }

    /// Quarantine directory for this instance when dry-running raw queues.
    pub fn crash_dir(&self, sync_dir: &Path) -> PathBuf {
        sync_dir.join(&self.name).join("crashes")
    }
}

/// A sample selected for the collection, with the name it gets there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub source: PathBuf,
    pub output: PathBuf,
    pub fuzzer: String,
    pub digest: String,
}

/// The canonical, deduplicated list of samples to copy into a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleIndex {
    pub out_dir: PathBuf,
    pub entries: Vec<IndexEntry>,
    /// Samples skipped because an identical one was already indexed.
    pub duplicates: usize,
}

impl SampleIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of the corpus: discovers fuzzer instances, indexes their samples
/// and copies the index into a collection directory.
pub trait CorpusCollector: Send + Sync {
    fn list_instances(&self, sync_dir: &Path) -> Result<Vec<FuzzerInstance>, StageError>;

    fn build_index(
        &self,
        sync_dir: &Path,
        out_dir: &Path,
        instances: &[FuzzerInstance],
    ) -> Result<SampleIndex, StageError>;

    /// Copies every indexed sample into `index.out_dir` and returns how many
    /// were copied.
    fn copy_samples(&self, index: &SampleIndex) -> Result<usize, StageError>;
}

/// [`CorpusCollector`] for AFL-style sync directories:
/// `<sync>/<instance>/queue*/<sample>`. Samples are deduplicated by the MD5
/// digest of their content.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueCollector;

impl QueueCollector {
    pub fn new() -> Self {
        QueueCollector
    }

    fn sorted_subdirs(dir: &Path) -> Result<Vec<String>, StageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| StageError::fs("failed to list", dir, e))? {
            let entry = entry.map_err(|e| StageError::fs("failed to list", dir, e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl CorpusCollector for QueueCollector {
    fn list_instances(&self, sync_dir: &Path) -> Result<Vec<FuzzerInstance>, StageError> {
        let mut instances = Vec::new();
        for name in Self::sorted_subdirs(sync_dir)? {
            let queue_dirs: Vec<String> = Self::sorted_subdirs(&sync_dir.join(&name))?
                .into_iter()
                .filter(|d| d.starts_with(QUEUE_DIR_PREFIX))
                .collect();
            if queue_dirs.is_empty() {
                log::debug!("Skipping {name:?}: no queue directories");
                continue;
            }
            instances.push(FuzzerInstance { name, queue_dirs });
        }
        Ok(instances)
    }

    fn build_index(
        &self,
        sync_dir: &Path,
        out_dir: &Path,
        instances: &[FuzzerInstance],
    ) -> Result<SampleIndex, StageError> {
        let mut seen = HashSet::new();
        let mut index = SampleIndex {
            out_dir: out_dir.to_path_buf(),
            ..SampleIndex::default()
        };

        for instance in instances {
            for queue in instance.queue_paths(sync_dir) {
                for sample in &SampleSet::from_dir(&queue)? {
                    let content = fs::read(sample.path())
                        .map_err(|e| StageError::fs("failed to read", sample.path(), e))?;
                    let digest = md5::compute(&content);
                    if !seen.insert(digest.0) {
                        index.duplicates += 1;
                        continue;
                    }
                    let mut output_name = std::ffi::OsString::from(format!("{}:", instance.name));
                    output_name.push(sample.file_name());
                    index.entries.push(IndexEntry {
                        source: sample.path().to_path_buf(),
                        output: out_dir.join(output_name),
                        fuzzer: instance.name.clone(),
                        digest: format!("{digest:x}"),
                    });
                }
            }
        }
        Ok(index)
    }

    fn copy_samples(&self, index: &SampleIndex) -> Result<usize, StageError> {
        fs::create_dir_all(&index.out_dir)
            .map_err(|e| StageError::fs("failed to create", &index.out_dir, e))?;
        for entry in &index.entries {
            fs::copy(&entry.source, &entry.output)
                .map_err(|e| StageError::fs("failed to copy", &entry.source, e))?;
        }
        Ok(index.entries.len())
    }
}
