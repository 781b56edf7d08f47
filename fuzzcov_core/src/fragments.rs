//! Raw profile fragments named by an `LLVM_PROFILE_FILE`-style pattern.
//!
//! Instrumented binaries expand `%p` in the pattern to their process id, so one
//! invocation may leave several fragments behind (one per process it spawned).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable instrumented binaries read the fragment pattern from.
pub const PROFILE_FILE_ENV: &str = "LLVM_PROFILE_FILE";

const PID_PLACEHOLDER: &str = "%p";

/// A fragment file name pattern rooted in a single directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPattern {
    dir: PathBuf,
    prefix: String,
    suffix: String,
}

impl FragmentPattern {
    /// Builds a pattern for `<dir>/<stem>_%p.profraw`.
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: format!("{stem}_"),
            suffix: ".profraw".to_string(),
        }
    }

    /// The value to export as [`PROFILE_FILE_ENV`].
    pub fn env_value(&self) -> String {
        self.dir
            .join(format!("{}{PID_PLACEHOLDER}{}", self.prefix, self.suffix))
            .to_string_lossy()
            .into_owned()
    }

    fn matches_name(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
            && is_pid(&name[self.prefix.len()..name.len() - self.suffix.len()])
    }

    fn matching_paths(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| self.matches_name(n)) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Deletes every fragment left over from a previous run of this pattern.
    pub fn erase(&self) -> io::Result<usize> {
        let stale = self.matching_paths()?;
        for path in &stale {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if !stale.is_empty() {
            debug!(pattern = %self.env_value(), count = stale.len(), "erased stale fragments");
        }
        Ok(stale.len())
    }

    /// Fragments that actually hold data. A zero-byte file means the process
    /// never flushed its counters and is treated as absent.
    pub fn usable(&self) -> io::Result<Vec<PathBuf>> {
        let mut usable = Vec::new();
        for path in self.matching_paths()? {
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => usable.push(path),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(usable)
    }
}

fn is_pid(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_value_contains_pid_placeholder() {
        let pattern = FragmentPattern::new(Path::new("/tmp/report"), "png_fuzzer");
        assert_eq!(pattern.env_value(), "/tmp/report/png_fuzzer_%p.profraw");
    }

    #[test]
    fn usable_skips_empty_and_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pattern = FragmentPattern::new(dir.path(), "target");
        fs::write(dir.path().join("target_100.profraw"), b"data").unwrap();
        fs::write(dir.path().join("target_101.profraw"), b"").unwrap();
        fs::write(dir.path().join("target_0_102.profraw"), b"per-file").unwrap();
        fs::write(dir.path().join("other_103.profraw"), b"data").unwrap();
        fs::write(dir.path().join("target.profdata"), b"merged").unwrap();

        let usable = pattern.usable().expect("list fragments");
        assert_eq!(usable, vec![dir.path().join("target_100.profraw")]);
    }

    #[test]
    fn erase_removes_empty_fragments_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pattern = FragmentPattern::new(dir.path(), "target_3");
        fs::write(dir.path().join("target_3_7.profraw"), b"").unwrap();
        fs::write(dir.path().join("target_3_8.profraw"), b"x").unwrap();
        fs::write(dir.path().join("target_8.profraw"), b"x").unwrap();

        assert_eq!(pattern.erase().expect("erase"), 2);
        assert!(pattern.usable().unwrap().is_empty());
        assert!(dir.path().join("target_8.profraw").exists());
    }

    #[test]
    fn missing_directory_has_no_fragments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pattern = FragmentPattern::new(&dir.path().join("absent"), "t");
        assert!(pattern.usable().unwrap().is_empty());
        assert_eq!(pattern.erase().unwrap(), 0);
    }
}
