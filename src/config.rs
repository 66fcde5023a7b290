use std::path::{Path, PathBuf};

use crate::DEFAULT_PORT;

/// Server configuration, populated from the command line before startup
/// and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory holding the snapshot file.
    pub dir: String,
    /// Snapshot file name inside `dir`.
    pub dbfilename: String,
}

impl Config {
    /// The string view served by `CONFIG GET`.
    pub fn get(&self, param: &str) -> Option<&str> {
        match param {
            "dir" => Some(&self.dir),
            "dbfilename" => Some(&self.dbfilename),
            _ => None,
        }
    }

    /// Full path of the snapshot file.
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.dbfilename)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            dir: "databases".to_string(),
            dbfilename: "save.rdb".to_string(),
        }
    }
}
