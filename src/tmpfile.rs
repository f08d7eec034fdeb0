//! Temp files for request bodies too large to inline.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Write `contents` to a fresh temp file and keep it on disk.
///
/// The caller owns the file and removes it with [`remove`].
pub fn write(contents: &str) -> io::Result<PathBuf> {
    let mut file = tempfile::Builder::new().prefix("snailwire-").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    let path = file.into_temp_path().keep().map_err(|e| e.error)?;
    debug!("Spilled {} bytes to {}", contents.len(), path.display());
    Ok(path)
}

/// Best-effort delete. A file that is already gone is not an error.
pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_remove() {
        let path = write("x = 1\ny = 2\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x = 1\ny = 2\n");

        remove(&path);
        assert!(!path.exists());

        // Second removal finds nothing and stays quiet.
        remove(&path);
    }
}
