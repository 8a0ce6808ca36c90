// Utility functions

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Get the .gitswarm state directory for a repository.
#[inline]
pub fn gitswarm_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(".gitswarm")
}

/// Get the .gitswarm/teams directory for a repository.
#[inline]
pub fn teams_dir(repo_path: &Path) -> PathBuf {
    gitswarm_dir(repo_path).join("teams")
}

/// Get the .gitswarm/config.toml path for a repository.
#[inline]
pub fn config_path(repo_path: &Path) -> PathBuf {
    gitswarm_dir(repo_path).join("config.toml")
}

/// Lock a mutex, recovering from poisoning instead of panicking.
///
/// A panicked session task must not take down the whole team; the guarded
/// state is plain data that stays usable after a writer panic.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Sanitize a string for use in a branch name.
pub fn sanitize_branch_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Sanitize a string for use as a path component.
pub fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("WI-1.1"), "wi-1-1");
        assert_eq!(sanitize_branch_name("my feature/item"), "my-feature-item");
        assert_eq!(sanitize_branch_name("CAPS_123"), "caps_123");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("WI-1.1"), "WI-1_1");
        assert_eq!(sanitize_path_component("my/path"), "my_path");
    }

    #[test]
    fn test_gitswarm_paths() {
        let dir = gitswarm_dir(Path::new("/repo"));
        assert_eq!(dir, PathBuf::from("/repo/.gitswarm"));
        assert_eq!(config_path(Path::new("/repo")), dir.join("config.toml"));
    }
}
