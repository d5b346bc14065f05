use std::path::{Path, PathBuf};

use coderelay_agent::AgentClient;

pub fn expand_home(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(path.strip_prefix("~").unwrap_or(path));
        }
    }
    path.to_path_buf()
}

/// `~`-expanded and anchored at the process working directory.
pub fn absolutize(path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        return expanded;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(expanded),
        Err(_) => expanded,
    }
}

/// The override when it still exists on disk, else the default.
pub fn effective_working_directory(custom: Option<&str>, default: &Path) -> PathBuf {
    if let Some(custom) = custom {
        let custom = PathBuf::from(custom);
        if custom.is_dir() {
            return custom;
        }
        tracing::warn!(
            custom = %custom.display(),
            "custom working directory is gone, using default"
        );
    }
    default.to_path_buf()
}

/// Holds a client's working directory at `directory` for one call and puts
/// the previous value back on drop, including on early returns.
pub struct WorkingDirectoryScope<'a> {
    client: &'a dyn AgentClient,
    previous: Option<PathBuf>,
}

impl<'a> WorkingDirectoryScope<'a> {
    pub fn enter(client: &'a dyn AgentClient, directory: PathBuf) -> Self {
        let previous = client.working_directory();
        client.set_working_directory(directory);
        Self {
            client,
            previous: Some(previous),
        }
    }
}

impl Drop for WorkingDirectoryScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.client.set_working_directory(previous);
        }
    }
}
