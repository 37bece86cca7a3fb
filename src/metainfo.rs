use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;

/// One entry of a multi-file torrent.
#[derive(Debug, Deserialize, Serialize)]
pub struct FileDict {
    /// Path components relative to the torrent name directory.
    pub path: Vec<String>,
    /// The length of the file in bytes.
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// Concatenation of all 20-byte SHA-1 piece hashes, not urlencoded.
    pub pieces: ByteBuf,
    /// Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    /// Present for single-file torrents only.
    #[serde(default)]
    pub length: Option<i64>,
    /// Present for multi-file torrents only.
    #[serde(default)]
    pub files: Option<Vec<FileDict>>,
    #[serde(default)]
    pub private: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Metainfo {
    pub info: Info,
    /// The announce URL of the tracker.
    #[serde(default)]
    pub announce: Option<String>,
    /// Backwards-compatible tiered tracker list.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = from_bytes(bytes)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// Reject dictionaries that parsed but are not a usable torrent:
    /// a tracker URL, a name, sane piece hashes and exactly one of
    /// `length`/`files` are all required.
    fn validate(&self) -> Result<()> {
        if self.announce.is_none() && self.announce_list.is_none() {
            return Err(Error::InvalidMetainfo(
                "neither announce nor announce-list present".into(),
            ));
        }
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces is not a multiple of 20 bytes".into(),
            ));
        }
        if self.info.piece_length <= 0 {
            return Err(Error::InvalidMetainfo("piece length must be positive".into()));
        }
        match (&self.info.length, &self.info.files) {
            (Some(_), Some(_)) => Err(Error::InvalidMetainfo(
                "both length and files present".into(),
            )),
            (None, None) => Err(Error::InvalidMetainfo(
                "neither length nor files present".into(),
            )),
            (Some(len), None) if *len < 0 => {
                Err(Error::InvalidMetainfo("negative file length".into()))
            }
            (None, Some(files)) if files.is_empty() => {
                Err(Error::InvalidMetainfo("empty file list".into()))
            }
            (None, Some(files)) => {
                for file in files {
                    if file.length < 0 {
                        return Err(Error::InvalidMetainfo("negative file length".into()));
                    }
                    if file.path.is_empty() {
                        return Err(Error::InvalidMetainfo("file with empty path".into()));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// SHA-1 over the canonical re-encoding of the `info` dict; the
    /// torrent's identity everywhere (handshake, trackers).
    pub fn info_hash(&self) -> [u8; 20] {
        let bytes = to_bytes(&self.info).expect("info dict is always encodable");
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    /// Total payload length across all files.
    pub fn total_length(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(length), _) => *length as u64,
            (None, Some(files)) => files.iter().map(|f| f.length as u64).sum(),
            (None, None) => 0,
        }
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// Tracker URLs: the head of every announce-list tier, then `announce`
    /// itself if not already listed.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                if let Some(url) = tier.first() {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        if let Some(announce) = &self.announce {
            if !urls.contains(announce) {
                urls.push(announce.clone());
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, Value};
    use std::collections::BTreeMap;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn base_dict() -> BTreeMap<Vec<u8>, Value> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes("album"));
        info.insert(b"piece length".to_vec(), Value::Int(131072));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0xab; 40]));
        let mut file_a = BTreeMap::new();
        file_a.insert(b"path".to_vec(), Value::List(vec![bytes("01 - Intro.mp3")]));
        file_a.insert(b"length".to_vec(), Value::Int(10924032));
        let mut file_b = BTreeMap::new();
        file_b.insert(b"path".to_vec(), Value::List(vec![bytes("02 - Outro.mp3")]));
        file_b.insert(b"length".to_vec(), Value::Int(10006528));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![Value::Dict(file_a), Value::Dict(file_b)]),
        );
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), bytes("http://tracker.example/announce"));
        root.insert(
            b"announce-list".to_vec(),
            Value::List(vec![Value::List(vec![bytes(
                "http://tracker.example/announce",
            )])]),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        root
    }

    fn parse(root: BTreeMap<Vec<u8>, Value>) -> Result<Metainfo> {
        Metainfo::from_bytes(&encode(&Value::Dict(root)))
    }

    fn info_mut(root: &mut BTreeMap<Vec<u8>, Value>) -> &mut BTreeMap<Vec<u8>, Value> {
        match root.get_mut(&b"info"[..]).unwrap() {
            Value::Dict(info) => info,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_accepts_valid_multi_file() {
        let metainfo = parse(base_dict()).unwrap();
        assert_eq!(metainfo.info.name, "album");
        assert_eq!(metainfo.total_length(), 10924032 + 10006528);
        assert_eq!(metainfo.piece_hashes().len(), 2);
    }

    #[test]
    fn test_accepts_announce_list_only() {
        let mut root = base_dict();
        root.remove(&b"announce"[..]);
        assert!(parse(root).is_ok());
    }

    #[test]
    fn test_rejects_no_trackers() {
        let mut root = base_dict();
        root.remove(&b"announce"[..]);
        root.remove(&b"announce-list"[..]);
        assert!(matches!(parse(root), Err(Error::InvalidMetainfo(_))));
    }

    #[test]
    fn test_rejects_missing_info_fields() {
        for field in [&b"name"[..], b"piece length", b"pieces"] {
            let mut root = base_dict();
            info_mut(&mut root).remove(field);
            assert!(
                matches!(parse(root), Err(Error::InvalidMetainfo(_))),
                "accepted info without {:?}",
                String::from_utf8_lossy(field)
            );
        }
    }

    #[test]
    fn test_rejects_neither_length_nor_files() {
        let mut root = base_dict();
        info_mut(&mut root).remove(&b"files"[..]);
        assert!(matches!(parse(root), Err(Error::InvalidMetainfo(_))));
    }

    #[test]
    fn test_accepts_single_file() {
        let mut root = base_dict();
        let info = info_mut(&mut root);
        info.remove(&b"files"[..]);
        info.insert(b"length".to_vec(), Value::Int(20930560));
        let metainfo = parse(root).unwrap();
        assert_eq!(metainfo.total_length(), 20930560);
    }

    #[test]
    fn test_rejects_file_entry_without_length() {
        let mut root = base_dict();
        let info = info_mut(&mut root);
        if let Some(Value::List(files)) = info.get_mut(&b"files"[..]) {
            if let Some(Value::Dict(entry)) = files.first_mut() {
                entry.remove(&b"length"[..]);
            }
        }
        assert!(matches!(parse(root), Err(Error::InvalidMetainfo(_))));
    }

    #[test]
    fn test_info_hash_is_stable() {
        let a = parse(base_dict()).unwrap();
        let b = parse(base_dict()).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
    }

    #[test]
    fn test_tracker_urls_dedup() {
        let metainfo = parse(base_dict()).unwrap();
        assert_eq!(
            metainfo.tracker_urls(),
            vec!["http://tracker.example/announce".to_string()]
        );
    }
}
