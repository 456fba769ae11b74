//! Streaming digests, digest selection, and quarantine.
//!
//! The digest is computed during the streaming write, never as a second
//! pass over the finished file. Servers publish hashes as a duck-typed
//! `{algo: digest}` object; algorithm names are normalized (uppercased,
//! whitespace stripped) and SHA-256 is selected with documented fallbacks.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// Buffer size for re-hashing existing bytes (64 KiB).
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithms the engine understands, in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Blake3,
    AutoV2,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Blake3 => "BLAKE3",
            Self::AutoV2 => "AutoV2",
        }
    }
}

/// Selects the comparison digest from a server-published hash map.
///
/// Keys are normalized by uppercasing and stripping whitespace, so
/// `"sha256"`, `"SHA 256"` and `"SHA-256"` all select SHA-256. Preference:
/// SHA-256, then BLAKE3, then AutoV2.
pub fn select_digest(hashes: &HashMap<String, String>) -> Option<(HashAlgo, String)> {
    let normalized: HashMap<String, &String> = hashes
        .iter()
        .map(|(k, v)| {
            let key: String = k
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .collect::<String>()
                .to_uppercase();
            (key, v)
        })
        .collect();

    for (key, algo) in [
        ("SHA256", HashAlgo::Sha256),
        ("BLAKE3", HashAlgo::Blake3),
        ("AUTOV2", HashAlgo::AutoV2),
    ] {
        if let Some(digest) = normalized.get(key) {
            return Some((algo, digest.to_lowercase()));
        }
    }
    None
}

/// SHA-256 state updated chunk-by-chunk during a streaming write.
#[derive(Debug)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Total bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalizes into a lowercase hex digest.
    pub fn finalize(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }

    /// Seeds the state by re-hashing an existing partial file, returning
    /// the number of bytes consumed. Used when resuming a `.tmp` file so
    /// the final digest covers the whole artifact.
    pub fn seed_from_file(&mut self, path: &Path) -> EngineResult<u64> {
        let mut file = fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = file
                .read(&mut buffer)
                .map_err(|e| EngineError::io(path, e))?;
            if n == 0 {
                break;
            }
            self.update(&buffer[..n]);
            total += n as u64;
        }
        Ok(total)
    }
}

impl Default for StreamingDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the SHA-256 of a whole file (lowercase hex).
///
/// Used for verifying pre-existing final files before skipping them.
pub fn hash_file(path: &Path) -> EngineResult<String> {
    let mut digest = StreamingDigest::new();
    digest.seed_from_file(path)?;
    Ok(digest.finalize())
}

/// Case-insensitive digest comparison (servers publish mixed case).
pub fn digests_match(computed: &str, declared: &str) -> bool {
    computed.eq_ignore_ascii_case(declared)
}

/// Moves a failed temp file into `<corrupted_root>/<task_id>/`, preserving
/// its file name for forensic review. Returns the quarantine path.
///
/// Successive failures of the same task keep distinct files (`name`,
/// `name.2`, `name.3`, ...).
pub fn quarantine(tmp: &Path, corrupted_root: &Path, task_id: &str) -> EngineResult<PathBuf> {
    let dir = corrupted_root.join(task_id);
    fs::create_dir_all(&dir).map_err(|e| EngineError::io(dir.clone(), e))?;

    let file_name = tmp
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corrupted.bin".to_string());
    let mut dest = dir.join(&file_name);
    let mut suffix = 2;
    while dest.exists() {
        dest = dir.join(format!("{file_name}.{suffix}"));
        suffix += 1;
    }

    // Rename within a filesystem; fall back to copy+remove across mounts.
    if fs::rename(tmp, &dest).is_err() {
        fs::copy(tmp, &dest).map_err(|e| EngineError::io(dest.clone(), e))?;
        fs::remove_file(tmp).map_err(|e| EngineError::io(tmp, e))?;
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_streaming_digest_matches_known_vector() {
        let mut digest = StreamingDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.bytes(), 11);
        assert_eq!(
            digest.finalize(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_seed_from_file_resumes_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.bin");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"hello ")
            .unwrap();

        let mut digest = StreamingDigest::new();
        let seeded = digest.seed_from_file(&path).unwrap();
        assert_eq!(seeded, 6);
        digest.update(b"world");

        assert_eq!(
            digest.finalize(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_select_digest_prefers_sha256() {
        let mut hashes = HashMap::new();
        hashes.insert("AutoV2".to_string(), "ABCD1234".to_string());
        hashes.insert("sha 256".to_string(), "FFEE".to_string());
        let (algo, digest) = select_digest(&hashes).unwrap();
        assert_eq!(algo, HashAlgo::Sha256);
        assert_eq!(digest, "ffee");
    }

    #[test]
    fn test_select_digest_fallback_order() {
        let mut hashes = HashMap::new();
        hashes.insert("AutoV2".to_string(), "aa".to_string());
        hashes.insert("BLAKE3".to_string(), "bb".to_string());
        let (algo, _) = select_digest(&hashes).unwrap();
        assert_eq!(algo, HashAlgo::Blake3);

        let mut hashes = HashMap::new();
        hashes.insert("AutoV2".to_string(), "aa".to_string());
        let (algo, _) = select_digest(&hashes).unwrap();
        assert_eq!(algo, HashAlgo::AutoV2);

        assert!(select_digest(&HashMap::new()).is_none());
    }

    #[test]
    fn test_digests_match_case_insensitive() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "abcde0"));
    }

    #[test]
    fn test_quarantine_moves_file() {
        let temp = TempDir::new().unwrap();
        let tmp = temp.path().join("model.safetensors.tmp");
        fs::write(&tmp, b"bad bytes").unwrap();
        let corrupted = temp.path().join("corrupted");

        let dest = quarantine(&tmp, &corrupted, "task-123").unwrap();

        assert!(!tmp.exists());
        assert_eq!(
            dest,
            corrupted.join("task-123").join("model.safetensors.tmp")
        );
        assert_eq!(fs::read(&dest).unwrap(), b"bad bytes");
    }

    #[test]
    fn test_quarantine_keeps_successive_failures() {
        let temp = TempDir::new().unwrap();
        let corrupted = temp.path().join("corrupted");
        let tmp = temp.path().join("f.bin.tmp");

        for round in 0..3 {
            fs::write(&tmp, vec![round as u8; 4]).unwrap();
            quarantine(&tmp, &corrupted, "t1").unwrap();
        }

        let entries = fs::read_dir(corrupted.join("t1")).unwrap().count();
        assert_eq!(entries, 3);
    }
}
