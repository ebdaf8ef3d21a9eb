//! Configuration system.
//!
//! Merges configuration from four tiers, field by field:
//! 1. **Defaults** - built into the binary
//! 2. **Project** - `$CWD/tasksync/config.yaml`
//! 3. **User** - `~/.tasksync/config.yaml`
//! 4. **Environment** - `TASKSYNC_*` variables
//!
//! ## Environment Variables
//! - `TASKSYNC_CONFIG_PATH` - Explicit config file (bypasses the file tiers)
//! - `TASKSYNC_PROJECT_DIR` - Project config dir (default: `./tasksync`)
//! - `TASKSYNC_USER_DIR` - User config dir (default: `~/.tasksync`)
//! - `TASKSYNC_API_BASE` - Task service base URL
//! - `TASKSYNC_API_TOKEN` - Bearer token
//! - `TASKSYNC_USER_ID` - Current user id
//! - `TASKSYNC_PROJECT` - Selected project id

mod loader;
mod merge;
mod types;
pub mod watcher;

pub use loader::{CONFIG_FILE, ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
