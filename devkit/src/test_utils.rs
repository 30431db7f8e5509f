/*!
Fixtures for kernel tests

Registration lists and throwaway data directories backed by `tempfile`.
*/

use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};

/// Writes `lines` to a temporary registration list, one record per line.
pub fn reglist_file(lines: &[&str]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    Ok(file)
}

/// Temporary data directory deleted on drop.
pub struct TempDataDir {
    dir: TempDir,
}

impl TempDataDir {
    pub fn new() -> Result<Self> {
        Ok(Self { dir: tempfile::tempdir()? })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Location for a component store inside the directory.
    pub fn store_path(&self) -> PathBuf {
        self.dir.path().join("components.json")
    }

    pub fn write(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reglist_lines_are_written_in_order() {
        let file = reglist_file(&["# header", "ingest,node7,warden/components/node7-ingest"]).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("# header"));
    }

    #[test]
    fn data_dir_is_removed_on_drop() {
        let dir = TempDataDir::new().unwrap();
        let path = dir.path().to_path_buf();
        dir.write("x.json", "{}").unwrap();
        assert!(path.join("x.json").exists());
        drop(dir);
        assert!(!path.exists());
    }
}
