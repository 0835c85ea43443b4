use super::ContentHash;
use std::fs::File;
use std::hash::Hasher as _;
use std::io::{self, BufReader, Read};
use std::path::Path;
use twox_hash::XxHash64;

const SIGNATURE_PREFIX_LENGTH: usize = 1024; // 1KB
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Whole-file BLAKE3 digest. Files larger than `streaming_threshold` are read
/// through a fixed buffer instead of being loaded whole.
pub fn hash_file(path: &Path, streaming_threshold: u64) -> io::Result<ContentHash> {
    let len = std::fs::metadata(path)?.len();
    if len > streaming_threshold {
        hash_streaming(path)
    } else {
        let data = read_full_file(path)?;
        Ok(blake3::hash(&data).into())
    }
}

fn hash_streaming(path: &Path) -> io::Result<ContentHash> {
    let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Cheap metadata signature: XxHash64 over size, mtime and the first 1KB.
/// Used to detect that a cached content hash is still trustworthy.
pub fn signature(path: &Path, size: u64, mtime_nanos: i64) -> io::Result<u64> {
    let prefix = read_portion(path)?;
    let mut hasher = XxHash64::with_seed(0);
    hasher.write_u64(size);
    hasher.write_i64(mtime_nanos);
    hasher.write(&prefix);
    Ok(hasher.finish())
}

/// Short stable digest of a path string, used to keep flat relocation names unique.
pub fn path_digest(path: &Path) -> String {
    let hash = blake3::hash(path.to_string_lossy().as_bytes());
    hash.to_hex()[..8].to_string()
}

fn read_portion(file: &Path) -> io::Result<Vec<u8>> {
    let mut f = File::open(file)?;
    let mut buffer = vec![0; SIGNATURE_PREFIX_LENGTH];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = f.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

pub fn read_full_file(file: &Path) -> io::Result<Vec<u8>> {
    let mut f = File::open(file)?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_streaming_and_in_memory_hashes_agree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let in_memory = hash_file(&path, u64::MAX).unwrap();
        let streamed = hash_file(&path, 0).unwrap();
        assert_eq!(in_memory, streamed);
        assert_eq!(in_memory, ContentHash::from(blake3::hash(&data)));
    }

    #[test]
    fn test_signature_tracks_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello").unwrap();
        let a = signature(&path, 5, 1_000).unwrap();
        let b = signature(&path, 5, 2_000).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, signature(&path, 5, 1_000).unwrap());
    }

    #[test]
    fn test_path_digest_is_short_and_stable() {
        let d1 = path_digest(Path::new("/a/b/c.txt"));
        assert_eq!(d1.len(), 8);
        assert_eq!(d1, path_digest(Path::new("/a/b/c.txt")));
        assert_ne!(d1, path_digest(Path::new("/a/b/d.txt")));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(hash_file(&dir.path().join("nope"), 1024).is_err());
    }
}
