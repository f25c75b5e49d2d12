use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

/// Either a plain or a gzip/bgzip-compressed file, read transparently.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Opens a file, detecting gzip by its magic bytes rather than its extension.
pub fn open_maybe_gzipped(path: &Path) -> io::Result<FileReader> {
    let gz = is_gzipped(path)?;
    let reader = BufReader::new(File::open(path)?);
    if gz {
        Ok(FileReader::Gzipped(MultiGzDecoder::new(reader)))
    } else {
        Ok(FileReader::Uncompressed(reader))
    }
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Resolves `path` against `cwd` unless it is already absolute.
pub fn absolute_path(path: impl AsRef<Path>, cwd: &Path) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// True when `path` is a regular file holding at least one byte.
pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
