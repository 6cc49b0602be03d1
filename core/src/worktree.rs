use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

/// Timeout for `git worktree list` so a wedged repository cannot stall the
/// request pipeline.
const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a fetched worktree list stays valid.
const WORKTREE_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
}

#[derive(Debug)]
struct WorktreeCache {
    entries: Vec<WorktreeListEntry>,
    fetched_at: Instant,
    sandbox_root: PathBuf,
}

/// Process-wide registry of verified sibling worktrees.
///
/// Holds two pieces of shared state: a TTL cache of `git worktree list`
/// output and the session allowlist of worktree roots that have already
/// passed verification. The allowlist only ever grows.
#[derive(Debug, Default)]
pub struct WorktreeRegistry {
    cache: Mutex<Option<WorktreeCache>>,
    allowlist: Mutex<BTreeSet<PathBuf>>,
}

impl WorktreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the allowlisted root containing `path`, if any.
    pub async fn allowlisted_root_for(&self, path: &Path) -> Option<PathBuf> {
        let allowlist = self.allowlist.lock().await;
        allowlist
            .iter()
            .find(|root| path == root.as_path() || path.starts_with(root))
            .cloned()
    }

    /// Idempotent; concurrent discoveries of the same root collapse to one
    /// entry.
    pub async fn insert_allowlisted(&self, root: PathBuf) {
        self.allowlist.lock().await.insert(root);
    }

    pub async fn allowlist_snapshot(&self) -> Vec<PathBuf> {
        self.allowlist.lock().await.iter().cloned().collect()
    }

    /// Drops the cached worktree list so the next lookup re-runs git.
    pub async fn clear_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Validates that `requested` is a legitimate worktree of the repository
    /// at `sandbox_root` (or a path inside one) and returns the worktree
    /// root. The shape filter runs first so unrelated siblings never cost a
    /// git invocation.
    pub async fn validate_worktree_path(
        &self,
        requested: &Path,
        sandbox_root: &Path,
    ) -> Option<PathBuf> {
        let candidate = worktree_shape_candidate(requested, sandbox_root)?;
        let entries = self.list_worktrees(sandbox_root).await;
        entries
            .iter()
            .find(|entry| candidate == entry.path || candidate.starts_with(&entry.path))
            .map(|entry| entry.path.clone())
    }

    async fn list_worktrees(&self, sandbox_root: &Path) -> Vec<WorktreeListEntry> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.sandbox_root == sandbox_root
            && cached.fetched_at.elapsed() < WORKTREE_CACHE_TTL
        {
            return cached.entries.clone();
        }

        let entries = fetch_worktree_list(sandbox_root).await;
        *cache = Some(WorktreeCache {
            entries: entries.clone(),
            fetched_at: Instant::now(),
            sandbox_root: sandbox_root.to_path_buf(),
        });
        entries
    }
}

/// Walk from `requested` up toward the filesystem root looking for a
/// sibling-of-the-sandbox directory whose basename extends the sandbox
/// basename (`myproject-feature`, `myproject_bugfix`, ...).
fn worktree_shape_candidate(requested: &Path, sandbox_root: &Path) -> Option<PathBuf> {
    let root_parent = sandbox_root.parent()?;
    let root_name = sandbox_root.file_name()?.to_str()?;

    let mut current = Some(requested);
    while let Some(path) = current {
        if path.parent() == Some(root_parent)
            && path != sandbox_root
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with(root_name)
        {
            return Some(path.to_path_buf());
        }
        current = path.parent();
    }
    None
}

/// Any subprocess failure (missing git, non-zero exit, timeout) degrades to
/// an empty list; the caller's cwd validation will then reject the path.
async fn fetch_worktree_list(sandbox_root: &Path) -> Vec<WorktreeListEntry> {
    let result = timeout(
        GIT_COMMAND_TIMEOUT,
        Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(sandbox_root)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            parse_worktree_list_porcelain(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(Ok(output)) => {
            warn!(
                "git worktree list failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!("git worktree list could not run: {err}");
            Vec::new()
        }
        Err(_) => {
            warn!("git worktree list timed out after {GIT_COMMAND_TIMEOUT:?}");
            Vec::new()
        }
    }
}

/// Porcelain records are blank-line separated:
///
/// ```text
/// worktree /abs/path
/// HEAD <sha>
/// branch refs/heads/name   (or: detached)
/// ```
pub fn parse_worktree_list_porcelain(stdout: &str) -> Vec<WorktreeListEntry> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, head: &mut Option<String>, branch: &mut Option<String>| {
        if let (Some(path), Some(head)) = (path.take(), head.take()) {
            entries.push(WorktreeListEntry {
                path,
                head,
                branch: branch.take(),
            });
        } else {
            *path = None;
            *head = None;
            *branch = None;
        }
    };

    for line in stdout.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch);
        } else if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.to_string());
        }
        // `detached` and unknown attributes are ignored.
    }
    flush(&mut path, &mut head, &mut branch);

    entries
}
