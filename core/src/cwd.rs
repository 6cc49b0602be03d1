use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;
use crate::error::ShemcpErr;
use crate::policy::Policy;
use crate::worktree::WorktreeRegistry;

/// Resolves a relative cwd against the sandbox root and normalizes away
/// `.`/`..` components without touching the filesystem.
pub fn resolve_requested_cwd(sandbox_root: &Path, cwd: Option<&str>) -> PathBuf {
    match cwd {
        Some(rel) if !rel.is_empty() => normalize_lexically(&sandbox_root.join(rel)),
        _ => sandbox_root.to_path_buf(),
    }
}

/// Validates `candidate` (absolute, lexically normalized) against the
/// sandbox boundary. Acceptance requires containment in the sandbox root,
/// the session worktree allowlist, or a freshly verified worktree; after
/// that, the directory must be traversable and its realpath must stay
/// inside the (realpath of the) boundary.
///
/// The two failure classes are deliberately distinct so callers can tell a
/// typo ("not accessible") from a boundary violation ("not allowed").
pub async fn validate_cwd(
    candidate: &Path,
    policy: &Policy,
    registry: &WorktreeRegistry,
) -> Result<PathBuf> {
    let sandbox_root = normalize_lexically(policy.sandbox_root());
    let candidate = normalize_lexically(candidate);

    if candidate.starts_with(&sandbox_root) {
        return accessibility_check(&candidate, &sandbox_root);
    }

    if let Some(worktree_root) = registry.allowlisted_root_for(&candidate).await {
        return accessibility_check(&candidate, &worktree_root);
    }

    if policy.worktree_detection()
        && let Some(worktree_root) = registry
            .validate_worktree_path(&candidate, &sandbox_root)
            .await
    {
        registry.insert_allowlisted(worktree_root.clone()).await;
        return accessibility_check(&candidate, &worktree_root);
    }

    Err(ShemcpErr::CwdNotAllowed {
        path: candidate.display().to_string(),
        root: sandbox_root.display().to_string(),
    })
}

/// (a) the directory must be readable and executable (traversal); (b) after
/// resolving symlinks, the path must not ascend out of the resolved
/// boundary.
fn accessibility_check(candidate: &Path, boundary: &Path) -> Result<PathBuf> {
    if std::fs::read_dir(candidate).is_err() {
        return Err(ShemcpErr::CwdNotAccessible(candidate.display().to_string()));
    }

    let real_candidate = candidate
        .canonicalize()
        .map_err(|_| ShemcpErr::CwdNotAccessible(candidate.display().to_string()))?;
    let real_boundary = boundary
        .canonicalize()
        .map_err(|_| ShemcpErr::CwdNotAccessible(boundary.display().to_string()))?;

    if real_candidate.strip_prefix(&real_boundary).is_err() {
        return Err(ShemcpErr::CwdEscapesRoot(candidate.display().to_string()));
    }

    Ok(candidate.to_path_buf())
}

/// Pure-lexical resolution: `.` dropped, `..` pops (never above the root),
/// no symlink following.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` above the root is dropped rather than preserved.
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn policy_for(root: &Path, worktree_detection: bool) -> Policy {
        Policy::new(
            root.to_path_buf(),
            worktree_detection,
            Vec::new(),
            Vec::new(),
            300_000,
            10_000_000,
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexically(Path::new("/a/../../b")), PathBuf::from("/b"));
    }

    #[test]
    fn relative_cwd_resolves_against_root() {
        let root = Path::new("/u/proj");
        assert_eq!(resolve_requested_cwd(root, None), PathBuf::from("/u/proj"));
        assert_eq!(
            resolve_requested_cwd(root, Some(".")),
            PathBuf::from("/u/proj")
        );
        assert_eq!(
            resolve_requested_cwd(root, Some("src/../docs")),
            PathBuf::from("/u/proj/docs")
        );
        assert_eq!(
            resolve_requested_cwd(root, Some("../proj-feature")),
            PathBuf::from("/u/proj-feature")
        );
    }

    #[tokio::test]
    async fn accepts_root_and_subdirectories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        let policy = policy_for(&root, false);
        let registry = WorktreeRegistry::new();

        assert_eq!(validate_cwd(&root, &policy, &registry).await.unwrap(), root);
        assert_eq!(
            validate_cwd(&root.join("src"), &policy, &registry).await.unwrap(),
            root.join("src")
        );
    }

    #[tokio::test]
    async fn rejects_paths_outside_the_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let policy = policy_for(&root, false);
        let registry = WorktreeRegistry::new();

        let outside = root.parent().unwrap().to_path_buf();
        let err = validate_cwd(&outside, &policy, &registry).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cwd not allowed"), "{message}");
        assert!(message.contains("must be within"), "{message}");
    }

    #[tokio::test]
    async fn missing_directory_is_not_accessible() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let policy = policy_for(&root, false);
        let registry = WorktreeRegistry::new();

        let err = validate_cwd(&root.join("gone"), &policy, &registry)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("cwd not accessible"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_a_boundary_violation() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let elsewhere = tmp.path().join("elsewhere");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&elsewhere).unwrap();
        std::os::unix::fs::symlink(&elsewhere, root.join("link")).unwrap();

        let root = root.canonicalize().unwrap();
        let policy = policy_for(&root, false);
        let registry = WorktreeRegistry::new();

        let err = validate_cwd(&root.join("link"), &policy, &registry)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resolved outside sandbox root"));
    }

    #[tokio::test]
    async fn allowlisted_worktree_skips_git() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("proj");
        let worktree = tmp.path().join("proj-feature");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(worktree.join("src")).unwrap();
        let root = root.canonicalize().unwrap();
        let worktree = worktree.canonicalize().unwrap();

        // Worktree detection disabled: only the pre-populated allowlist can
        // admit the sibling, proving no git invocation happens.
        let policy = policy_for(&root, false);
        let registry = WorktreeRegistry::new();
        registry.insert_allowlisted(worktree.clone()).await;

        let accepted = validate_cwd(&worktree.join("src"), &policy, &registry)
            .await
            .unwrap();
        assert_eq!(accepted, worktree.join("src"));
    }
}
