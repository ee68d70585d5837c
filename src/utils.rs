//! Utility functions for directory management
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Data: `~/.local/share/appwall/` - profiles, rules, config, decision log
//! - State: `~/.local/state/appwall/` - tracing log file
//!
//! # Example
//!
//! ```
//! use appwall::utils::get_data_dir;
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Open the profile store under data_path
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "appwall", "appwall").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "appwall", "appwall")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` (and parents) readable by the current user only.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}
