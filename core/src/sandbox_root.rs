use std::io;
use std::path::Path;
use std::path::PathBuf;

/// Environment variables that force the sandbox root, in precedence order.
/// Each is honored only when it names an existing directory.
pub const SANDBOX_ROOT_ENV_VARS: [&str; 2] = ["SHEMCP_SANDBOX_ROOT", "SHEMCP_ROOT"];

/// Selects the sandbox root for the lifetime of the process: the first env
/// override that names an existing directory, else the nearest ancestor of
/// the current directory containing a `.git` entry, else the current
/// directory itself. The result is canonicalized exactly once; the root is
/// never re-resolved after startup.
pub fn resolve_sandbox_root() -> io::Result<PathBuf> {
    let overrides: Vec<Option<PathBuf>> = SANDBOX_ROOT_ENV_VARS
        .iter()
        .map(|name| std::env::var_os(name).map(PathBuf::from))
        .collect();
    let cwd = std::env::current_dir()?;
    resolve_from(&overrides, &cwd)
}

fn resolve_from(overrides: &[Option<PathBuf>], cwd: &Path) -> io::Result<PathBuf> {
    for candidate in overrides.iter().flatten() {
        if candidate.is_dir() {
            return candidate.canonicalize();
        }
    }

    if let Some(repo_root) = nearest_git_ancestor(cwd) {
        return repo_root.canonicalize();
    }

    cwd.canonicalize()
}

/// Walk up from `start` looking for a directory containing a `.git` entry.
/// A plain `exists()` check covers both regular repositories (`.git` dir)
/// and worktree checkouts (`.git` file).
fn nearest_git_ancestor(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn env_override_wins_when_directory_exists() {
        let tmp = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let overrides = vec![Some(tmp.path().to_path_buf()), None];
        let root = resolve_from(&overrides, cwd.path()).unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_override_falls_through_to_second() {
        let tmp = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let overrides = vec![
            Some(tmp.path().join("does-not-exist")),
            Some(tmp.path().to_path_buf()),
        ];
        let root = resolve_from(&overrides, cwd.path()).unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn git_ancestor_beats_plain_cwd() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        let nested = tmp.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        let root = resolve_from(&[], &nested).unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn falls_back_to_cwd_outside_any_repo() {
        let tmp = TempDir::new().unwrap();
        let root = resolve_from(&[], tmp.path()).unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
    }
}
