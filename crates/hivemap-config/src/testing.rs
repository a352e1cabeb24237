//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated temporary directory
//! - Backing files of a given size with recognisable content
//! - A config tuned for small, fast view caches
//!
//! # Usage
//!
//! ```ignore
//! use hivemap_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let hive = env.create_backing_file("system.hive", 64 * 1024)?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the isolated directory tree
    pub root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join(format!("hivemap-test-{test_id}"));
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            test_id,
        })
    }

    /// Create a backing file of `len` bytes. Byte `i` holds `pattern_byte(i)`
    /// so tests can check which range a view maps.
    pub fn create_backing_file(&self, name: &str, len: usize) -> anyhow::Result<PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content: Vec<u8> = (0..len as u64).map(pattern_byte).collect();
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Config with small views so a few KiB of file exercise eviction.
    pub fn small_config(&self, view_size: u32, max_views: u32) -> Config {
        let mut cfg = Config::default();
        cfg.views.view_size = view_size;
        cfg.views.page_size = view_size.min(4096);
        cfg.views.max_views_per_file = max_views;
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

/// Content of byte `offset` in files made by [`TestEnvironment::create_backing_file`].
/// Mixes in the page number so equal in-page offsets differ between pages.
pub fn pattern_byte(offset: u64) -> u8 {
    (offset as u8) ^ ((offset >> 12) as u8).wrapping_mul(31)
}
