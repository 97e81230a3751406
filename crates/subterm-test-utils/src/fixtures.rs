use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestFixtures {
    temp_dir: TempDir,
}

impl TestFixtures {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    pub fn create_test_script(&self, name: &str, content: &str) -> Result<PathBuf> {
        let script_path = self.temp_dir.path().join(name);
        std::fs::write(&script_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms)?;
        }

        Ok(script_path)
    }

    pub fn create_test_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// A path inside the fixture directory that does not exist
    pub fn missing_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name).join("missing")
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

// Common test data
pub mod data {
    pub const HELLO_WORLD: &str = "Hello, World!\n";

    pub const UNICODE_TEST: &str = "🦀 Rust 日本語 العربية\n";

    pub const ANSI_COLORS: &str = "\x1b[31mRed\x1b[0m \x1b[32mGreen\x1b[0m \x1b[34mBlue\x1b[0m\n";

    pub fn generate_text_lines(count: usize) -> String {
        (0..count)
            .map(|i| format!("Line {i}: The quick brown fox jumps over the lazy dog"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
