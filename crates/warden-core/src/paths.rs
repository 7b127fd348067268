use std::path::{Path, PathBuf};

pub const WARDEN_DIR: &str = ".warden";
pub const CONFIG_FILE: &str = ".warden/config.yaml";
pub const DB_FILE: &str = ".warden/warden.db";

pub fn warden_dir(root: &Path) -> PathBuf {
    root.join(WARDEN_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

pub fn is_initialized(root: &Path) -> bool {
    warden_dir(root).is_dir()
}
