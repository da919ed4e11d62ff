use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// The end of one log file.
#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    pub name: String,
    pub path: PathBuf,
    pub content: String,
    /// Earlier content was cut off.
    pub truncated: bool,
}

/// Last `max_bytes` of a file. A cut-off first line is dropped so the tail
/// starts on a line boundary.
pub fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<(String, bool)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let truncated = len > max_bytes;
    if truncated {
        file.seek(SeekFrom::Start(len - max_bytes))?;
    }
    let mut buf = Vec::with_capacity(len.min(max_bytes) as usize);
    file.take(max_bytes).read_to_end(&mut buf)?;

    let text = String::from_utf8_lossy(&buf);
    let text = match (truncated, text.find('\n')) {
        (true, Some(nl)) => text[nl + 1..].to_string(),
        _ => text.into_owned(),
    };
    Ok((text, truncated))
}

/// Tails of every `*.log` file in `logs_dir`, by file name. A missing
/// directory yields nothing.
pub fn collect_tails(logs_dir: &Path, max_bytes: u64) -> Vec<LogTail> {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let name = path.file_stem()?.to_string_lossy().to_string();
            match read_tail(&path, max_bytes) {
                Ok((content, truncated)) => Some(LogTail {
                    name,
                    path,
                    content,
                    truncated,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read log tail");
                    None
                }
            }
        })
        .collect()
}
