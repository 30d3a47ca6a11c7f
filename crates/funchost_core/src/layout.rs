//! On-disk layout of the host binaries.

use std::path::{Path, PathBuf};

use crate::error::{CompatibilityError, CoreResult};
use crate::variant::HostVariant;

/// File name of every host executable.
pub const HOST_EXECUTABLE: &str = if cfg!(windows) { "func.exe" } else { "func" };

/// `<root>/<variant dir>/func[.exe]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at the directory containing the running executable.
    pub fn from_current_exe() -> CoreResult<Self> {
        let exe = std::env::current_exe()?;
        let root = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn executable_for(&self, variant: HostVariant) -> PathBuf {
        self.root
            .join(variant.rule().directory)
            .join(HOST_EXECUTABLE)
    }

    /// Path of the variant's executable, or `HostBinaryNotFound`.
    pub fn locate(&self, variant: HostVariant) -> Result<PathBuf, CompatibilityError> {
        let path = self.executable_for(variant);
        if path.is_file() {
            Ok(path)
        } else {
            Err(CompatibilityError::HostBinaryNotFound { variant, path })
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_executable_paths() {
        let layout = HostLayout::new("/opt/funchost");
        assert_eq!(
            layout.executable_for(HostVariant::InProc8),
            PathBuf::from("/opt/funchost/in-proc8").join(HOST_EXECUTABLE)
        );
        assert_eq!(
            layout.executable_for(HostVariant::Default),
            PathBuf::from("/opt/funchost/out-of-proc").join(HOST_EXECUTABLE)
        );
    }

    #[test]
    fn test_locate_missing_binary() {
        let temp = TempDir::new().unwrap();
        let err = HostLayout::new(temp.path())
            .locate(HostVariant::InProc6)
            .unwrap_err();

        assert_eq!(err.kind(), "variant-host-binary-not-found");
        assert!(err
            .to_string()
            .starts_with("Failed to locate the inproc6 model host at"));
    }

    #[test]
    fn test_locate_existing_binary() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("out-of-proc");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(HOST_EXECUTABLE), "").unwrap();

        let path = HostLayout::new(temp.path()).locate(HostVariant::Default).unwrap();
        assert!(path.ends_with(HOST_EXECUTABLE));
    }
}
