//! A set of built-in tools that models can use.
//!
//! `read_file` and `glob` only look around and run freely. `write_file`
//! and `shell` change the machine, so they ask first and run one at a time.

mod glob;
mod read_file;
mod shell;
mod write_file;

use std::path::{Path, PathBuf};

pub use glob::GlobTool;
pub use read_file::ReadFileTool;
pub use shell::ShellTool;
pub use write_file::WriteFileTool;

/// Resolves `path` against `root` unless it's absolute.
fn resolve(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_owned()
    } else {
        root.join(path)
    }
}
