use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const APPFLOW_DIR: &str = ".appflow";

pub const CONFIG_FILE: &str = ".appflow/config.yaml";
pub const STORE_FILE: &str = ".appflow/store.redb";
pub const QUEUE_FILE: &str = ".appflow/queue.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn appflow_dir(root: &Path) -> PathBuf {
    root.join(APPFLOW_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}

pub fn queue_path(root: &Path) -> PathBuf {
    root.join(QUEUE_FILE)
}
