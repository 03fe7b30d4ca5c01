use std::borrow::Cow;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{util, Error, Result};

/// Multiple File Mode file entry, as it appears on the wire.
///
/// Field order matters: bencoded dictionaries are key-sorted, and `Info` is
/// re-serialized to compute the info hash, so declarations follow the sorted
/// key order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawFile<'a> {
    /// Length of the file in bytes
    pub length: u64,
    /// MD5 sum of the file
    #[serde(default, skip_serializing_if = "Option::is_none", borrow)]
    pub md5sum: Option<Cow<'a, str>>,
    /// Path components, one per directory plus the file name:
    /// "dir1/dir2/file.ext" -> ["dir1", "dir2", "file.ext"]
    #[serde(borrow)]
    pub path: Vec<Cow<'a, str>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawInfo<'a> {
    /// A list of files (Multi File Mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<RawFile<'a>>>,
    /// Length of the file in bytes (Single File Mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// MD5 sum of the file (Single File Mode)
    #[serde(default, skip_serializing_if = "Option::is_none", borrow)]
    pub md5sum: Option<Cow<'a, str>>,
    /// File name (Single File Mode) / name of the directory (Multi File Mode)
    #[serde(borrow)]
    pub name: Cow<'a, str>,
    /// Number of bytes in each piece
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// Concatenated 20-byte SHA1 piece hashes
    #[serde(with = "serde_bytes", borrow)]
    pub pieces: Cow<'a, [u8]>,
    /// Whether the torrent is restricted to its listed trackers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

impl<'a> RawInfo<'a> {
    /// SHA1 hash of bencoded self: the swarm identifier
    pub fn hash(&self) -> Result<[u8; 20]> {
        let encoded = serde_bencode::to_bytes(self)?;
        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }
}

#[derive(Debug, Deserialize)]
pub struct RawMetainfo<'a> {
    /// The announce URL of the tracker
    #[serde(borrow)]
    pub announce: Cow<'a, str>,
    /// Tiers of tracker URLs per the multitracker extension. Takes
    /// precedence over `announce` when present
    #[serde(default, rename = "announce-list", borrow)]
    pub announce_list: Option<Vec<Vec<Cow<'a, str>>>>,
    /// Free-form comment of the author
    #[serde(default, borrow)]
    pub comment: Option<Cow<'a, str>>,
    /// Name and version of the program that created the file
    #[serde(default, rename = "created by", borrow)]
    pub created_by: Option<Cow<'a, str>>,
    /// Creation time (UNIX epoch)
    #[serde(default, rename = "creation date")]
    pub creation_date: Option<u64>,
    /// Description of the payload
    #[serde(borrow)]
    pub info: RawInfo<'a>,
}

/// One payload file with its absolute offset into the logical payload.
///
/// `path` is relative to the chosen output directory and already includes
/// the torrent name prefix in multi-file mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Validated, owned projection of a torrent file.
///
/// The raw bencoded tree is converted exactly once; everything downstream
/// works with this strongly-typed view.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub announce_tiers: Vec<Vec<String>>,
    pub multi_file: bool,
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(bytes)?;
        Self::project(&raw)
    }

    fn project(raw: &RawMetainfo<'_>) -> Result<Self> {
        let info = &raw.info;

        if info.name.is_empty() {
            return Err(Error::InvalidMetainfo("the `name` field is empty"));
        }
        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("the `piece length` field is zero"));
        }
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "the `pieces` field is not a multiple of 20 bytes",
            ));
        }

        let name = sanitize_component(&info.name)?;

        let (files, multi_file) = match info.files.as_deref() {
            Some(raw_files) => {
                if raw_files.is_empty() {
                    return Err(Error::InvalidMetainfo("the `files` list is empty"));
                }

                let mut files = Vec::with_capacity(raw_files.len());
                let mut offset = 0u64;
                for file in raw_files {
                    let mut path = PathBuf::from(&name);
                    if file.path.is_empty() {
                        return Err(Error::InvalidMetainfo("a file has no path components"));
                    }
                    for component in &file.path {
                        path.push(sanitize_component(component)?);
                    }

                    files.push(FileEntry {
                        path,
                        offset,
                        length: file.length,
                    });
                    offset += file.length;
                }

                (files, true)
            }
            None => {
                let length = info.length.ok_or(Error::InvalidMetainfo(
                    "both the `files` and the `length` fields are missing",
                ))?;

                let entry = FileEntry {
                    path: PathBuf::from(&name),
                    offset: 0,
                    length,
                };

                (vec![entry], false)
            }
        };

        let total_length: u64 = files.iter().map(|file| file.length).sum();
        if total_length == 0 {
            return Err(Error::InvalidMetainfo("the payload is empty"));
        }

        let piece_count = total_length.div_ceil(info.piece_length) as usize;
        if piece_count != info.pieces.len() / 20 {
            return Err(Error::InvalidMetainfo(
                "the number of piece hashes does not match the payload length",
            ));
        }

        let piece_hashes = info
            .pieces
            .chunks(20)
            .map(|chunk| chunk.try_into().expect("20-byte chunk"))
            .collect();

        let announce_tiers = match raw.announce_list.as_deref() {
            Some(tiers) if !tiers.is_empty() => tiers
                .iter()
                .map(|tier| tier.iter().map(|url| url.to_string()).collect())
                .collect(),
            _ => vec![vec![raw.announce.to_string()]],
        };

        Ok(Metainfo {
            name,
            info_hash: info.hash()?,
            piece_length: info.piece_length,
            piece_hashes,
            total_length,
            files,
            announce_tiers,
            multi_file,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Actual byte length of a piece; only the last one may be shorter
    pub fn piece_size(&self, index: u32) -> u64 {
        util::piece_size_from_idx(self.piece_count(), self.total_length, self.piece_length, index)
    }
}

/// A single path component coming from an untrusted torrent file. Anything
/// that could escape the output directory is rejected.
fn sanitize_component(component: &str) -> Result<String> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(Error::InvalidMetainfo("a path component is empty or relative"));
    }
    if component.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidMetainfo("a path component contains a separator"));
    }

    Ok(component.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent(payload_len: u64, piece_length: u64) -> Vec<u8> {
        let piece_count = payload_len.div_ceil(piece_length);
        let raw = serde_bencode::to_bytes(&RawInfo {
            files: None,
            length: Some(payload_len),
            md5sum: None,
            name: Cow::Borrowed("artifact.bin"),
            piece_length,
            pieces: Cow::Owned(vec![0xab; piece_count as usize * 20]),
            private: None,
        })
        .expect("serializing info failed");

        let mut torrent = b"d8:announce20:http://localhost/ann4:info".to_vec();
        torrent.extend_from_slice(&raw);
        torrent.push(b'e');
        torrent
    }

    #[test]
    fn parses_single_file_mode() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent(100, 32)).expect("parsing failed");

        assert_eq!(metainfo.name, "artifact.bin");
        assert_eq!(metainfo.total_length, 100);
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.piece_size(0), 32);
        assert_eq!(metainfo.piece_size(3), 4);
        assert!(!metainfo.multi_file);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, PathBuf::from("artifact.bin"));
        assert_eq!(metainfo.announce_tiers, vec![vec!["http://localhost/ann".to_string()]]);
    }

    #[test]
    fn parses_multi_file_mode_with_prefix_sums() {
        let info = RawInfo {
            files: Some(vec![
                RawFile {
                    length: 40,
                    md5sum: None,
                    path: vec![Cow::Borrowed("a.txt")],
                },
                RawFile {
                    length: 25,
                    md5sum: None,
                    path: vec![Cow::Borrowed("sub"), Cow::Borrowed("b.txt")],
                },
            ]),
            length: None,
            md5sum: None,
            name: Cow::Borrowed("bundle"),
            piece_length: 32,
            pieces: Cow::Owned(vec![0; 3 * 20]),
            private: None,
        };
        let encoded_info = serde_bencode::to_bytes(&info).expect("serializing info failed");
        let mut torrent = b"d8:announce20:http://localhost/ann4:info".to_vec();
        torrent.extend_from_slice(&encoded_info);
        torrent.push(b'e');

        let metainfo = Metainfo::from_bytes(&torrent).expect("parsing failed");

        assert!(metainfo.multi_file);
        assert_eq!(metainfo.total_length, 65);
        assert_eq!(metainfo.files[0].path, PathBuf::from("bundle/a.txt"));
        assert_eq!(metainfo.files[0].offset, 0);
        assert_eq!(metainfo.files[1].path, PathBuf::from("bundle/sub/b.txt"));
        assert_eq!(metainfo.files[1].offset, 40);
    }

    #[test]
    fn info_hash_is_stable_across_decode_encode_cycles() {
        let torrent = single_file_torrent(64, 32);

        let first = Metainfo::from_bytes(&torrent).expect("parsing failed");
        let second = Metainfo::from_bytes(&torrent).expect("parsing failed");

        assert_eq!(first.info_hash, second.info_hash);
    }

    #[test]
    fn rejects_mismatched_piece_hash_count() {
        let mut torrent = single_file_torrent(100, 32);
        let piece_pos = torrent.windows(6).position(|w| w == b"pieces").expect("pieces key");
        // corrupt the declared byte-string length of `pieces` from 80 to 60
        let len_pos = piece_pos + 6;
        torrent[len_pos] = b'6';
        torrent.drain(len_pos + 3..len_pos + 23);

        assert!(Metainfo::from_bytes(&torrent).is_err());
    }

    #[test]
    fn rejects_path_traversal() {
        let info = RawInfo {
            files: Some(vec![RawFile {
                length: 10,
                md5sum: None,
                path: vec![Cow::Borrowed(".."), Cow::Borrowed("escape.txt")],
            }]),
            length: None,
            md5sum: None,
            name: Cow::Borrowed("bundle"),
            piece_length: 16,
            pieces: Cow::Owned(vec![0; 20]),
            private: None,
        };
        let encoded_info = serde_bencode::to_bytes(&info).expect("serializing info failed");
        let mut torrent = b"d8:announce20:http://localhost/ann4:info".to_vec();
        torrent.extend_from_slice(&encoded_info);
        torrent.push(b'e');

        assert!(matches!(
            Metainfo::from_bytes(&torrent),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
