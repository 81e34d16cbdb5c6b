use crate::error::Result;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting state files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file only if it does not already exist. Returns true if written.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

/// Append text to a file in a single write, creating it if it doesn't exist.
///
/// The data is flushed to disk before returning so a crash right after an
/// append cannot lose a line that callers already consider durable.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.write_all(text.as_bytes())?;
    f.sync_data()?;
    Ok(())
}

/// Read a file to a string, treating a missing file as empty.
pub fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Visit the non-blank lines of `path` from last to first until `visit`
/// returns `false`. The file is read backwards in blocks, so the cost follows
/// how far the caller walks rather than the file size. A missing file has no
/// lines.
pub fn for_each_line_rev(path: &Path, mut visit: impl FnMut(&str) -> bool) -> Result<()> {
    const BLOCK: u64 = 16 * 1024;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut pos = file.metadata()?.len();
    // Bytes of a line whose start lies in an earlier block.
    let mut carry: Vec<u8> = Vec::new();

    while pos > 0 {
        let start = pos.saturating_sub(BLOCK);
        let mut block = vec![0u8; (pos - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block)?;
        block.extend_from_slice(&carry);

        let mut end = block.len();
        while let Some(nl) = block[..end].iter().rposition(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&block[nl + 1..end]);
            if !line.trim().is_empty() && !visit(&line) {
                return Ok(());
            }
            end = nl;
        }
        block.truncate(end);
        carry = block;
        pos = start;
    }

    let first = String::from_utf8_lossy(&carry);
    if !first.trim().is_empty() {
        visit(&first);
    }
    Ok(())
}
