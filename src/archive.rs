//! Archive set: the serialized state documents a replay run works from.
//!
//! The master only needs the per-kind pipeline totals to partition work;
//! workers load the documents fully and replay them in path order, with
//! pipeline indices numbered globally across the whole set.

use std::fs;
use std::path::PathBuf;

use crate::errors::ArchiveError;
use crate::state::document::{self, StateDocument};

/// Ordered set of archive paths.
#[derive(Clone, Debug)]
pub struct ArchiveSet {
    paths: Vec<PathBuf>,
}

/// Totals the master partitions over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineCounts {
    pub graphics: u32,
    pub compute: u32,
}

impl ArchiveSet {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Loads and validates every document in path order.
    pub fn load(&self) -> Result<Vec<StateDocument>, ArchiveError> {
        let mut docs = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let text = fs::read_to_string(path).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
            let doc = document::parse_document(&text).map_err(|source| ArchiveError::Parse {
                path: path.clone(),
                source,
            })?;
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Sums pipeline counts across the set.
    pub fn count_pipelines(&self) -> Result<PipelineCounts, ArchiveError> {
        let mut counts = PipelineCounts::default();
        for doc in self.load()? {
            counts.graphics += doc.graphics_pipelines.len() as u32;
            counts.compute += doc.compute_pipelines.len() as u32;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn counts_sum_across_archives() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        fs::File::create(&a)
            .unwrap()
            .write_all(b"{\"graphicsPipelines\":[],\"computePipelines\":[]}")
            .unwrap();
        fs::File::create(&b).unwrap().write_all(b"{}").unwrap();

        let set = ArchiveSet::new(vec![a, b]);
        assert_eq!(
            set.count_pipelines().unwrap(),
            PipelineCounts {
                graphics: 0,
                compute: 0
            }
        );
    }

    #[test]
    fn missing_file_is_io_error() {
        let set = ArchiveSet::new(vec![PathBuf::from("/nonexistent/archive.json")]);
        match set.count_pipelines() {
            Err(ArchiveError::Io { .. }) => {}
            other => panic!("expected Io error, got {:?}", other.err()),
        }
    }

    #[test]
    fn bad_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").unwrap();
        let set = ArchiveSet::new(vec![path]);
        match set.count_pipelines() {
            Err(ArchiveError::Parse { .. }) => {}
            other => panic!("expected Parse error, got {:?}", other.err()),
        }
    }
}
