//! Scoped build directory.
//!
//! Toolchain commands run with the build directory as *their* working
//! directory; the process working directory is never touched, so concurrent
//! compilations in one process cannot observe each other's directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The `__pyaot__` directory of one build. Intermediate files registered
/// with [`BuildDir::temporary`] are removed when the guard is dropped, on
/// every exit path of the build.
#[derive(Debug)]
pub struct BuildDir {
    path: PathBuf,
    temporaries: Vec<PathBuf>,
}

impl BuildDir {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        fs::create_dir_all(path)?;
        debug!(dir = %path.display(), "build directory acquired");
        Ok(Self {
            path: path.to_path_buf(),
            temporaries: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name an intermediate file inside the build directory
    pub fn temporary(&mut self, name: impl AsRef<Path>) -> PathBuf {
        let path = self.path.join(name);
        self.temporaries.push(path.clone());
        path
    }
}

impl Drop for BuildDir {
    fn drop(&mut self) {
        for path in &self.temporaries {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "cannot remove intermediate file: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::thread;

    #[test]
    fn temporaries_are_removed_after_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("__pyaot__");
        let result: Result<(), String> = (|| {
            let mut scope = BuildDir::acquire(&build_dir).map_err(|e| e.to_string())?;
            let object = scope.temporary("kernels.o");
            fs::write(&object, b"obj").map_err(|e| e.to_string())?;
            fs::write(scope.path().join("kernels.c"), b"int x;").map_err(|e| e.to_string())?;
            Err("toolchain failed".to_string())
        })();
        assert!(result.is_err());
        assert!(!build_dir.join("kernels.o").exists());
        assert!(build_dir.join("kernels.c").is_file());
    }

    #[test]
    fn concurrent_builds_leave_the_process_directory_alone() {
        let before = env::current_dir().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    let dir = tempfile::tempdir().unwrap();
                    let mut scope = BuildDir::acquire(&dir.path().join("__pyaot__")).unwrap();
                    fs::write(scope.temporary(format!("m{}.o", i)), b"obj").unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(env::current_dir().unwrap(), before);
    }
}
