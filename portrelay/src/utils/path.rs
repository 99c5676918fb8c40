use std::path::{Path, PathBuf};

/// First free `<file>.corrupted.N` sibling used to set aside an unreadable config file
pub fn corrupted_backup_path(path: &Path) -> PathBuf {
    let mut number_of_corruptions = 1;
    let mut backup_path = path.with_extension(format!("corrupted.{}", number_of_corruptions));
    while backup_path.exists() {
        number_of_corruptions += 1;
        backup_path = path.with_extension(format!("corrupted.{}", number_of_corruptions));
    }
    backup_path
}

/// Force a `.json` extension on a config path
pub fn with_json_extension(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref().with_extension("json")
}
