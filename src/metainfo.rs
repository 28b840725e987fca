//! Torrent metadata: the conventional bencoded `.torrent` file format, and
//! the engine's own JSON "descriptor" format used wherever the bencoded
//! info-dict isn't available (magnet links, the tracker's metainfo
//! endpoint).
//!
//! `spec.md` §4.6/§9 treats descriptor creation as belonging to a separate
//! CLI tool; this module only consumes descriptors, it doesn't author them.

use sha1::{Digest, Sha1};

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// A parsed bencoded `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    pub fn tracker_url(&self) -> &str {
        &self.announce
    }

    /// Hashes the bencode-reserialized info dict, per BEP 3. This is the
    /// conventional info hash used when a peer was discovered via a
    /// `.torrent` file rather than a magnet link or descriptor.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        Ok(sha1_of(&info))
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    pub fn structure(&self) -> FsStructure {
        match (&self.info.files, self.info.length) {
            (Some(files), _) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|f| {
                        let info = FileInfo {
                            path: f.path.iter().collect(),
                            len: f.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += info.len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            (None, Some(length)) => FsStructure::File(FileInfo {
                path: self.info.name.clone().into(),
                len: length,
                torrent_offset: 0,
            }),
            (None, None) => FsStructure::File(FileInfo {
                path: self.info.name.clone().into(),
                len: 0,
                torrent_offset: 0,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// The engine's own torrent descriptor format: a JSON document describing a
/// content-addressed download, used whenever a `.torrent` file's bencoded
/// info-dict isn't the source of truth (a magnet link resolved against the
/// tracker's `/metainfo` endpoint, or a descriptor handed directly to
/// [`crate::engine::Engine::add_from_descriptor`]).
///
/// Field names match the wire format spelled out for the descriptor file
/// (`name, piece_length, piece_count, files, tracker, pieces, info_hash`);
/// `pieces` and `info_hash` are hex-encoded, matching
/// `examples/original_source/create_torrent.py`'s JSON emission.
///
/// Per `DESIGN.md`'s resolution of the corresponding Open Question, the
/// descriptor's authoritative fingerprint is the SHA-1 of its own
/// serialized JSON bytes, not a BEP-3-compatible bencoded info-dict hash,
/// and is always re-derived via [`Descriptor::fingerprint`] rather than
/// trusted from the `info_hash` field embedded in the document (which may
/// be stale or attacker-supplied).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub piece_length: u32,
    pub piece_count: usize,
    pub files: Vec<DescriptorFile>,
    pub tracker: String,
    pub pieces: Vec<String>,
    #[serde(default)]
    pub info_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescriptorFile {
    pub path: String,
    pub length: u64,
}

impl Descriptor {
    /// Validates internal consistency: `sum(files.length) == (P-1) *
    /// piece_length + last_piece_length` with `0 < last_piece_length <=
    /// piece_length`, `len(pieces) == piece_count`, and every hash decodes
    /// to exactly 20 bytes, per `spec.md` §8's testable properties.
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(Error::DescriptorInvalid(
                "piece_length is zero".into(),
            ));
        }
        if self.files.is_empty() {
            return Err(Error::DescriptorInvalid("no files listed".into()));
        }
        let total_len: u64 = self.files.iter().map(|f| f.length).sum();
        let expected_piece_count = ((total_len
            + self.piece_length as u64
            - 1)
            / self.piece_length as u64)
            .max(1) as usize;
        if self.piece_count != expected_piece_count {
            return Err(Error::DescriptorInvalid(format!(
                "expected piece_count {} for a {}-byte download at piece \
                 length {}, got {}",
                expected_piece_count,
                total_len,
                self.piece_length,
                self.piece_count
            )));
        }
        if self.pieces.len() != self.piece_count {
            return Err(Error::DescriptorInvalid(format!(
                "piece_count is {} but {} piece hashes were listed",
                self.piece_count,
                self.pieces.len()
            )));
        }
        for hash in &self.pieces {
            let decoded = hex::decode(hash).map_err(|_| {
                Error::DescriptorInvalid(format!(
                    "piece hash {} is not valid hex",
                    hash
                ))
            })?;
            if decoded.len() != 20 {
                return Err(Error::DescriptorInvalid(
                    "piece hash is not 20 bytes".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        self.pieces
            .iter()
            .map(|hex_hash| {
                let decoded = hex::decode(hex_hash).map_err(|_| {
                    Error::DescriptorInvalid(format!(
                        "piece hash {} is not valid hex",
                        hex_hash
                    ))
                })?;
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&decoded);
                Ok(hash)
            })
            .collect()
    }

    pub fn structure(&self) -> FsStructure {
        if self.files.len() == 1 {
            let f = &self.files[0];
            FsStructure::File(FileInfo {
                path: f.path.clone().into(),
                len: f.length,
                torrent_offset: 0,
            })
        } else {
            let mut torrent_offset = 0;
            let files = self
                .files
                .iter()
                .map(|f| {
                    let info = FileInfo {
                        path: f.path.clone().into(),
                        len: f.length,
                        torrent_offset,
                    };
                    torrent_offset += info.len;
                    info
                })
                .collect();
            FsStructure::Archive { files }
        }
    }

    /// The JSON bytes the fingerprint is derived from. Field order in
    /// [`Descriptor`] is significant: this must serialize deterministically
    /// for the fingerprint to be reproducible.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The descriptor's content-addressed fingerprint: the SHA-1 of its own
    /// canonical JSON serialization.
    pub fn fingerprint(&self) -> Result<Sha1Hash> {
        Ok(sha1_of(&self.canonical_bytes()?))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let descriptor: Self = serde_json::from_slice(bytes)?;
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn sha1_of(bytes: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> Descriptor {
        Descriptor {
            name: "sample".into(),
            piece_length: 16,
            piece_count: 2,
            pieces: vec![hex::encode([1u8; 20]), hex::encode([2u8; 20])],
            files: vec![DescriptorFile {
                path: "sample.bin".into(),
                length: 32,
            }],
            tracker: "http://tracker.example/announce".into(),
            info_hash: String::new(),
        }
    }

    #[test]
    fn validate_accepts_consistent_descriptor() {
        assert!(sample_descriptor().validate().is_ok());
    }

    #[test]
    fn validate_rejects_mismatched_piece_hash_count() {
        let mut descriptor = sample_descriptor();
        descriptor.pieces.pop();
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn piece_hashes_decodes_hex() {
        let descriptor = sample_descriptor();
        let hashes = descriptor.piece_hashes().unwrap();
        assert_eq!(hashes, vec![[1u8; 20], [2u8; 20]]);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let descriptor = sample_descriptor();
        assert_eq!(
            descriptor.fingerprint().unwrap(),
            descriptor.fingerprint().unwrap()
        );
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = sample_descriptor();
        let mut b = sample_descriptor();
        b.name = "other".into();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn from_json_roundtrips_and_validates() {
        let descriptor = sample_descriptor();
        let bytes = descriptor.canonical_bytes().unwrap();
        let parsed = Descriptor::from_json(&bytes).unwrap();
        assert_eq!(parsed.name, descriptor.name);
    }
}
