//! Native library discovery for libjq.
//!
//! libjq ships with the system package manager rather than as a prebuilt
//! archive, so discovery only looks at well-known locations and otherwise
//! leaves resolution to the system loader.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming a directory that holds libjq.
pub const LIB_DIR_ENV: &str = "JQ_LIB_DIR";

/// Per-user install location: ~/.local/lib/
fn home_lib_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".local").join("lib"))
}

/// Library file names to try, most specific first.
pub(crate) fn get_lib_names() -> &'static [&'static str] {
    #[cfg(target_os = "macos")]
    {
        &["libjq.1.dylib", "libjq.dylib"]
    }
    #[cfg(target_os = "windows")]
    {
        &["jq.dll", "libjq-1.dll"]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        &["libjq.so.1", "libjq.so"]
    }
}

fn existing_in_dir(dir: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    get_lib_names()
        .iter()
        .map(move |name| dir.join(name))
        .filter(|path| path.exists())
}

/// Returns the directories searched for libjq, in priority order.
///
/// 1. `JQ_LIB_DIR` environment variable
/// 2. `~/.local/lib/`
pub fn library_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = env::var(LIB_DIR_ENV) {
        dirs.push(PathBuf::from(dir));
    }
    dirs.extend(home_lib_dir());
    dirs
}

/// Returns the library paths to try loading, in priority order: the files
/// present in each of [`library_dirs`], then the bare library names for the
/// system loader to resolve.
pub fn library_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = library_dirs()
        .iter()
        .flat_map(|dir| existing_in_dir(dir).collect::<Vec<_>>())
        .collect();

    candidates.extend(get_lib_names().iter().map(PathBuf::from));
    candidates
}
