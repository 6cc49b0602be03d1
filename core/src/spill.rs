use std::path::Path;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use uuid::Uuid;

use crate::error::Result;
use crate::error::ShemcpErr;

/// URI scheme under which spill files are addressable by callers.
pub const SPILL_URI_SCHEME: &str = "mcp://tmp/";

/// Disk-backed overflow store for execution output, rooted at
/// `$SHEMCP_HOME/tmp`. Files are owned by the execution that created them;
/// ownership passes to the caller via the returned URI.
#[derive(Debug, Clone)]
pub struct SpillStore {
    dir: PathBuf,
}

/// Paths and URIs for one execution's spill pair. Each side is retained
/// only if it actually received bytes.
#[derive(Debug, Clone)]
pub struct SpillHandle {
    pub stdout_uri: String,
    pub stdout_path: PathBuf,
    pub stderr_uri: String,
    pub stderr_path: PathBuf,
}

impl SpillStore {
    pub fn new(shemcp_home: &Path) -> Self {
        Self {
            dir: shemcp_home.join("tmp"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocates a fresh `exec-<uuid>.out` / `.err` pair. The directory is
    /// created lazily here; the files themselves are created by the first
    /// write.
    pub fn allocate(&self) -> Result<SpillHandle> {
        std::fs::create_dir_all(&self.dir)?;
        let id = Uuid::new_v4();
        let out_name = format!("exec-{id}.out");
        let err_name = format!("exec-{id}.err");
        Ok(SpillHandle {
            stdout_uri: format!("{SPILL_URI_SCHEME}{out_name}"),
            stdout_path: self.dir.join(out_name),
            stderr_uri: format!("{SPILL_URI_SCHEME}{err_name}"),
            stderr_path: self.dir.join(err_name),
        })
    }

    /// Maps an `mcp://tmp/...` URI back to a path inside the spill
    /// directory. Foreign schemes and anything that is not a plain basename
    /// are rejected.
    pub fn path_for_uri(&self, uri: &str) -> Result<PathBuf> {
        let Some(basename) = uri.strip_prefix(SPILL_URI_SCHEME) else {
            return Err(ShemcpErr::InvalidUri(format!(
                "invalid uri: must start with {SPILL_URI_SCHEME}"
            )));
        };
        if basename.is_empty()
            || basename.contains('/')
            || basename.contains('\\')
            || basename.contains("..")
        {
            return Err(ShemcpErr::InvalidUri(format!("invalid uri: {uri}")));
        }
        Ok(self.dir.join(basename))
    }
}

/// Streaming read of `[start, end)` from a spill file. `end <= start`
/// returns empty; the range is trimmed to the file size taken from a stat
/// call so the whole file is never loaded.
pub async fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let metadata = tokio::fs::metadata(path).await?;
    let end = end.min(metadata.len());
    if end <= start {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut data = Vec::with_capacity((end - start) as usize);
    let mut remaining = (end - start) as usize;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        remaining -= n;
    }
    Ok(data)
}

/// Number of LF-delimited segments in the chunk; an unterminated trailing
/// segment still counts.
pub fn line_count(chunk: &str) -> u64 {
    if chunk.is_empty() {
        return 0;
    }
    let newlines = chunk.bytes().filter(|b| *b == b'\n').count() as u64;
    if chunk.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn allocate_names_and_uris_line_up() {
        let tmp = TempDir::new().unwrap();
        let store = SpillStore::new(tmp.path());
        let handle = store.allocate().unwrap();
        assert!(handle.stdout_uri.starts_with("mcp://tmp/exec-"));
        assert!(handle.stdout_uri.ends_with(".out"));
        assert!(handle.stderr_uri.ends_with(".err"));
        assert_eq!(
            store.path_for_uri(&handle.stdout_uri).unwrap(),
            handle.stdout_path
        );
        assert!(tmp.path().join("tmp").is_dir());
    }

    #[test]
    fn uri_validation_rejects_foreign_and_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = SpillStore::new(tmp.path());
        assert!(store.path_for_uri("file:///etc/passwd").is_err());
        assert!(store.path_for_uri("mcp://tmp/").is_err());
        assert!(store.path_for_uri("mcp://tmp/../escape").is_err());
        assert!(store.path_for_uri("mcp://tmp/a/b").is_err());
    }

    #[tokio::test]
    async fn read_range_is_inclusive_exclusive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("exec-test.out");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        assert_eq!(read_range(&path, 0, 4).await.unwrap(), b"0123");
        assert_eq!(read_range(&path, 4, 10).await.unwrap(), b"456789");
        // End past EOF is trimmed by the stat size.
        assert_eq!(read_range(&path, 8, 100).await.unwrap(), b"89");
        // end <= start yields empty.
        assert_eq!(read_range(&path, 5, 5).await.unwrap(), Vec::<u8>::new());
        assert_eq!(read_range(&path, 7, 3).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn read_range_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(read_range(&tmp.path().join("nope"), 0, 1).await.is_err());
    }

    #[test]
    fn line_count_counts_unterminated_tail() {
        assert_eq!(line_count(""), 0);
        assert_eq!(line_count("a"), 1);
        assert_eq!(line_count("a\n"), 1);
        assert_eq!(line_count("a\nb"), 2);
        assert_eq!(line_count("a\nb\n"), 2);
    }
}
