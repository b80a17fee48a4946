use std::path::PathBuf;

use crate::random::random_string;

/// A path in the temp dir that nothing exists at yet.
pub fn temp_file() -> PathBuf {
    std::env::temp_dir().join(random_string(16))
}
