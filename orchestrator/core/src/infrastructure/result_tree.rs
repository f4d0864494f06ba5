// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local result tree: `<result_dir>/<experiment>-<YYYYmmdd-HHMMSS>/<node>/`.
//!
//! The tree is append-only for a run. Each node directory is created exactly
//! once, by the collector that owns that node, so concurrent collections
//! never touch the same path.

use chrono::{DateTime, Local};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const SUMMARY_FILE: &str = "summary.txt";

#[derive(Debug, Error)]
pub enum ResultTreeError {
    #[error("Result directory {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("Invalid node directory name '{0}'")]
    InvalidNode(String),

    #[error("Failed to unpack archive: {0}")]
    Archive(String),

    #[error("I/O error in result tree: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ResultTree {
    root: PathBuf,
}

impl ResultTree {
    pub fn dir_name(experiment: &str, at: DateTime<Local>) -> String {
        format!("{}-{}", experiment, at.format("%Y%m%d-%H%M%S"))
    }

    /// Create the run directory. Fails if it is already there.
    pub fn create(
        result_dir: &Path,
        experiment: &str,
        at: DateTime<Local>,
    ) -> Result<Self, ResultTreeError> {
        fs::create_dir_all(result_dir)?;
        let root = result_dir.join(Self::dir_name(experiment, at));
        match fs::create_dir(&root) {
            Ok(()) => Ok(Self { root }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ResultTreeError::AlreadyExists(root))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// Unpack a tar stream of one node's artifacts into `<root>/<node>/`.
    /// Returns the unpacked file paths relative to the node directory.
    pub fn unpack_node(&self, node: &str, archive: &[u8]) -> Result<Vec<PathBuf>, ResultTreeError> {
        if node.is_empty() || node.contains('/') || node == "." || node == ".." {
            return Err(ResultTreeError::InvalidNode(node.to_string()));
        }
        let dir = self.node_dir(node);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ResultTreeError::AlreadyExists(dir))
            }
            Err(e) => return Err(e.into()),
        }

        let mut tar = tar::Archive::new(Cursor::new(archive));
        let mut files = Vec::new();
        let entries = tar
            .entries()
            .map_err(|e| ResultTreeError::Archive(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ResultTreeError::Archive(e.to_string()))?;
            let is_file = entry.header().entry_type().is_file();
            let path = entry
                .path()
                .map_err(|e| ResultTreeError::Archive(e.to_string()))?
                .into_owned();
            // unpack_in refuses entries escaping the node directory
            let unpacked = entry
                .unpack_in(&dir)
                .map_err(|e| ResultTreeError::Archive(e.to_string()))?;
            if unpacked && is_file {
                files.push(
                    path.components()
                        .filter(|c| !matches!(c, Component::CurDir))
                        .collect(),
                );
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn write_summary(&self, content: &str) -> Result<PathBuf, ResultTreeError> {
        let path = self.root.join(SUMMARY_FILE);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(content.as_bytes())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(ResultTree::dir_name("exp", at()), "exp-20260304-050607");
    }

    #[test]
    fn test_unpack_node_partitions_by_node() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ResultTree::create(dir.path(), "exp", at()).unwrap();

        let files = tree
            .unpack_node(
                "worker-1",
                &archive(&[("producer.log", b"p"), ("observer-eth0.pcap", b"x")]),
            )
            .unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("observer-eth0.pcap"), PathBuf::from("producer.log")]
        );
        assert_eq!(
            fs::read(tree.node_dir("worker-1").join("producer.log")).unwrap(),
            b"p"
        );

        tree.unpack_node("worker-2", &archive(&[("consumer.log", b"c")]))
            .unwrap();
        assert!(!tree.node_dir("worker-1").join("consumer.log").exists());
    }

    #[test]
    fn test_tree_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ResultTree::create(dir.path(), "exp", at()).unwrap();
        assert!(matches!(
            ResultTree::create(dir.path(), "exp", at()),
            Err(ResultTreeError::AlreadyExists(_))
        ));

        tree.unpack_node("worker-1", &archive(&[])).unwrap();
        assert!(matches!(
            tree.unpack_node("worker-1", &archive(&[])),
            Err(ResultTreeError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.unpack_node("../escape", &archive(&[])),
            Err(ResultTreeError::InvalidNode(_))
        ));

        tree.write_summary("first").unwrap();
        assert!(tree.write_summary("second").is_err());
    }
}
