//! Model file validation
//!
//! Cheap sanity checks on a GGUF file before the path is handed to the
//! backend loader, so a bad path fails fast with a typed error instead
//! of deep inside llama.cpp.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian "GGUF")
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Minimum header: magic + version + tensor count + metadata kv count
const HEADER_LEN: usize = 24;

/// Supported GGUF format versions
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: magic 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to hold a GGUF header")]
    FileTooSmall,
}

/// Header fields of a GGUF model file.
#[derive(Debug, Clone, Copy)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and validates the GGUF header of the file at `path`.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = file.read_exact(&mut header) {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(ModelError::FileTooSmall),
            _ => Err(ModelError::Io(e)),
        };
    }

    let u32_at = |off: usize| u32::from_le_bytes(header[off..off + 4].try_into().unwrap_or([0; 4]));
    let u64_at = |off: usize| u64::from_le_bytes(header[off..off + 8].try_into().unwrap_or([0; 8]));

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32_at(4);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}

/// Quick screen for model picker paths: right extension and a header
/// that validates.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let has_ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);
    has_ext && validate_gguf(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_header(magic: u32, version: u32) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&12u64.to_le_bytes()).unwrap(); // tensor_count
        file.write_all(&7u64.to_le_bytes()).unwrap(); // metadata_kv_count
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_valid_header() {
        let file = write_header(GGUF_MAGIC, 3);
        let header = validate_gguf(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 12);
        assert_eq!(header.metadata_kv_count, 7);
    }

    #[test]
    fn test_bad_magic() {
        let file = write_header(0xDEADBEEF, 3);
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::InvalidMagic(0xDEADBEEF))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let file = write_header(GGUF_MAGIC, 99);
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::FileTooSmall)
        ));
    }

    #[test]
    fn test_is_gguf_file_checks_extension() {
        let gguf = write_header(GGUF_MAGIC, 2);
        assert!(is_gguf_file(gguf.path()));

        let mut other = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        other.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        other.write_all(&2u32.to_le_bytes()).unwrap();
        other.write_all(&[0u8; 16]).unwrap();
        other.flush().unwrap();
        assert!(!is_gguf_file(other.path()));
    }
}
