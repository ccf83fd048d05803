//! Content identities.
//!
//! A [`ContentHash`] is a 256-bit digest spelled as 64 lowercase hex
//! characters. It is used as the object key in the content store, so its
//! spelling is part of the on-disk format.

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Read/write buffer used when streaming file contents.
pub const CHUNK_SIZE: usize = 64 * 1024;
const DIGEST_HEX_LEN: usize = 64;

/// The digest used to compute content hashes.
///
/// Both algorithms produce 256-bit digests; SHA-256 is the default because
/// existing backups are keyed by it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}
impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    pub fn hasher(&self) -> StreamHasher {
        StreamHasher::new(*self)
    }

    pub fn hash_bytes(&self, data: impl AsRef<[u8]>) -> ContentHash {
        let mut hasher = self.hasher();
        hasher.update(data.as_ref());
        hasher.finalize()
    }

    /// Identity hash of a path string, independent of what the path contains.
    ///
    /// Used as a stable key for "this tracked folder", e.g. to find the most
    /// recent backup of a source.
    pub fn hash_path(&self, path: impl AsRef<Path>) -> ContentHash {
        self.hash_bytes(path.as_ref().to_string_lossy().as_bytes())
    }

    /// Hash everything a reader yields, returning the digest and byte count.
    pub fn hash_reader(&self, mut reader: impl Read) -> io::Result<(ContentHash, u64)> {
        let mut hasher = self.hasher();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..read]);
            total += read as u64;
        }
        Ok((hasher.finalize(), total))
    }

    /// Stream `reader` into `writer`, hashing the bytes on the way through.
    ///
    /// The writer is flushed before returning; some writers only report
    /// errors on flush.
    pub fn copy_and_hash(&self, mut reader: impl Read, mut writer: impl Write) -> io::Result<(ContentHash, u64)> {
        let mut hasher = self.hasher();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..read]);
            writer.write_all(&buffer[..read])?;
            total += read as u64;
        }
        writer.flush()?;
        Ok((hasher.finalize(), total))
    }

    /// Directory hash: the digest of the concatenated `{path}:{hash}` strings
    /// of every file, sorted by path.
    ///
    /// Sorting happens here, so the result doesn't depend on the order in
    /// which a filesystem happened to enumerate the tree.
    pub fn combine<'a>(&self, entries: impl IntoIterator<Item = (&'a str, &'a ContentHash)>) -> ContentHash {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut hasher = self.hasher();
        for (path, hash) in entries {
            hasher.update(path.as_bytes());
            hasher.update(b":");
            hasher.update(hash.as_str().as_bytes());
        }
        hasher.finalize()
    }
}
impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for HashAlgorithm {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => exn::bail!(ErrorKind::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher for either [`HashAlgorithm`].
pub struct StreamHasher(Inner);
enum Inner {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}
impl StreamHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self(match algorithm {
            HashAlgorithm::Sha256 => Inner::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Blake3 => Inner::Blake3(Box::new(blake3::Hasher::new())),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            Inner::Sha256(h) => h.update(data),
            Inner::Blake3(h) => {
                h.update(data);
            },
        }
    }

    pub fn finalize(self) -> ContentHash {
        let hex = match self.0 {
            Inner::Sha256(h) => format!("{:x}", h.finalize()),
            Inner::Blake3(h) => h.finalize().to_hex().to_string(),
        };
        ContentHash(hex)
    }
}

/// A 256-bit content digest, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);
impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl FromStr for ContentHash {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            exn::bail!(ErrorKind::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}
impl TryFrom<String> for ContentHash {
    type Error = Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}
impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    const SHA256_HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[rstest]
    #[case(b"hello".as_slice(), SHA256_HELLO)]
    #[case(b"".as_slice(), SHA256_EMPTY)]
    fn test_sha256_known_digests(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(HashAlgorithm::Sha256.hash_bytes(input).as_str(), expected);
    }

    #[rstest]
    #[case(HashAlgorithm::Sha256)]
    #[case(HashAlgorithm::Blake3)]
    fn test_digests_are_256_bit_hex(#[case] algorithm: HashAlgorithm) {
        let hash = algorithm.hash_bytes(b"some bytes");
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_algorithms_differ() {
        assert_ne!(HashAlgorithm::Sha256.hash_bytes(b"x"), HashAlgorithm::Blake3.hash_bytes(b"x"));
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 13];
        let (hash, size) = HashAlgorithm::Sha256.hash_reader(Cursor::new(&data)).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(hash, HashAlgorithm::Sha256.hash_bytes(&data));
    }

    #[test]
    fn test_copy_and_hash() {
        let mut out = Vec::new();
        let (hash, size) = HashAlgorithm::Blake3.copy_and_hash(Cursor::new(b"hello"), &mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(size, 5);
        assert_eq!(hash, HashAlgorithm::Blake3.hash_bytes(b"hello"));
    }

    #[test]
    fn test_combine_is_order_independent() {
        let a = HashAlgorithm::Sha256.hash_bytes(b"hello");
        let b = HashAlgorithm::Sha256.hash_bytes(b"world");
        let forward = HashAlgorithm::Sha256.combine([("a.txt", &a), ("b.txt", &b)]);
        let backward = HashAlgorithm::Sha256.combine([("b.txt", &b), ("a.txt", &a)]);
        assert_eq!(forward, backward);
        let expected = HashAlgorithm::Sha256.hash_bytes(format!("a.txt:{a}b.txt:{b}"));
        assert_eq!(forward, expected);
    }

    #[test]
    fn test_combine_detects_renames() {
        let a = HashAlgorithm::Sha256.hash_bytes(b"hello");
        let one = HashAlgorithm::Sha256.combine([("a.txt", &a)]);
        let two = HashAlgorithm::Sha256.combine([("renamed.txt", &a)]);
        assert_ne!(one, two);
    }

    #[test]
    fn test_hash_path_is_content_independent() {
        let one = HashAlgorithm::Sha256.hash_path("/home/user/thesis");
        let two = HashAlgorithm::Sha256.hash_path("/home/user/thesis");
        assert_eq!(one, two);
        assert_ne!(one, HashAlgorithm::Sha256.hash_path("/home/user/other"));
    }

    #[rstest]
    #[case("not-a-hash")]
    #[case("")]
    #[case("zz3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85")]
    fn test_invalid_hashes(#[case] input: &str) {
        let err = input.parse::<ContentHash>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidHash(_)));
    }

    #[test]
    fn test_hash_parse_lowercases() {
        let parsed: ContentHash = SHA256_EMPTY.to_ascii_uppercase().parse().unwrap();
        assert_eq!(parsed.as_str(), SHA256_EMPTY);
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("blake3".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Blake3);
        let err = "md5".parse::<HashAlgorithm>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownAlgorithm(name) if name == "md5"));
    }
}
