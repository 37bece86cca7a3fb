use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use std::path::{Path, PathBuf};
use std::time::Instant;

const SHA_LEN: usize = 20;

/// Request bookkeeping for one piece. `Pending` becomes eligible again ten
/// seconds later; `Done` pieces are never rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Pending(Instant),
    Done,
}

impl RequestState {
    /// Whether the scheduler may hand this piece to a peer.
    pub fn is_eligible(&self, now: Instant, timeout_secs: u64) -> bool {
        match self {
            RequestState::Idle => true,
            RequestState::Pending(since) => {
                now.duration_since(*since).as_secs() > timeout_secs
            }
            RequestState::Done => false,
        }
    }
}

#[derive(Debug)]
pub struct Piece {
    pub hash: [u8; SHA_LEN],
    pub size: u32,
    pub offset: u64,
    pub have: bool,
    pub needed: bool,
    pub requested: RequestState,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub needed: bool,
}

/// Where (part of) a piece lands on disk: `length` bytes at `offset` within
/// `files[file]`.
#[derive(Debug, PartialEq, Eq)]
pub struct FileSpan {
    pub file: usize,
    pub offset: u64,
    pub length: u64,
    pub needed: bool,
}

/// Which files the user asked for.
#[derive(Debug, Clone)]
pub enum Selection {
    All,
    /// Zero-based file indices.
    Files(Vec<usize>),
}

/// Runtime record of one torrent: identity, tables, progress counters.
pub struct Torrent {
    pub name: String,
    pub info_hash: [u8; SHA_LEN],
    pub piece_length: u64,
    /// Length of every file in the torrent.
    pub total_length: u64,
    /// Length of the selected (needed) files; progress is measured against
    /// this.
    pub length: u64,
    pub files: Vec<FileEntry>,
    pub pieces: Vec<Piece>,
    /// The fixed 68-byte prologue sent to every peer.
    pub handshake: Vec<u8>,
    /// Needed bytes verified on disk.
    pub downloaded: u64,
    /// Verified piece bytes received this run; feeds the speed readout.
    pub got: u64,
    pub uploaded: u64,
}

impl Torrent {
    pub fn new(
        metainfo: &Metainfo,
        out_folder: Option<&Path>,
        selection: &Selection,
        peer_id: [u8; SHA_LEN],
    ) -> Result<Torrent> {
        let total_length = metainfo.total_length();
        let mut files = Self::file_table(metainfo, out_folder);
        match selection {
            Selection::All => {
                for file in files.iter_mut() {
                    file.needed = true;
                }
            }
            Selection::Files(indices) => {
                for (index, file) in files.iter_mut().enumerate() {
                    file.needed = indices.contains(&index);
                }
            }
        }
        let length = files.iter().filter(|f| f.needed).map(|f| f.length).sum();
        let info_hash = metainfo.info_hash();
        let piece_length = metainfo.info.piece_length as u64;

        let mut torrent = Torrent {
            name: metainfo.info.name.clone(),
            info_hash,
            piece_length,
            total_length,
            length,
            files,
            pieces: Self::piece_table(metainfo, total_length)?,
            handshake: build_handshake(&info_hash, &peer_id),
            downloaded: 0,
            got: 0,
            uploaded: 0,
        };
        for index in 0..torrent.pieces.len() {
            torrent.pieces[index].needed =
                torrent.map_piece(index).iter().any(|span| span.needed);
        }
        Ok(torrent)
    }

    /// Output paths: `<out>/<name>` for single-file torrents,
    /// `<out>/<name>/<path…>` per entry otherwise.
    fn file_table(metainfo: &Metainfo, out_folder: Option<&Path>) -> Vec<FileEntry> {
        let base = out_folder.map(Path::to_path_buf).unwrap_or_default();
        match &metainfo.info.files {
            Some(entries) => entries
                .iter()
                .map(|entry| {
                    let mut path = base.join(&metainfo.info.name);
                    for component in &entry.path {
                        path.push(component);
                    }
                    FileEntry {
                        path,
                        length: entry.length as u64,
                        needed: false,
                    }
                })
                .collect(),
            None => vec![FileEntry {
                path: base.join(&metainfo.info.name),
                length: metainfo.total_length(),
                needed: false,
            }],
        }
    }

    /// Piece geometry from the hash string: every piece is `piece length`
    /// bytes except the last, which gives back the over-count.
    fn piece_table(metainfo: &Metainfo, total_length: u64) -> Result<Vec<Piece>> {
        let piece_length = metainfo.info.piece_length as u64;
        let mut pieces: Vec<Piece> = metainfo
            .piece_hashes()
            .into_iter()
            .enumerate()
            .map(|(index, hash)| Piece {
                hash,
                size: piece_length as u32,
                offset: index as u64 * piece_length,
                have: false,
                needed: false,
                requested: RequestState::Idle,
            })
            .collect();
        let over = pieces.len() as u64 * piece_length;
        if over < total_length || over - total_length >= piece_length {
            return Err(Error::InvalidMetainfo(
                "piece count does not cover the torrent length".into(),
            ));
        }
        if let Some(last) = pieces.last_mut() {
            last.size -= (over - total_length) as u32;
        }
        Ok(pieces)
    }

    /// The ordered file spans piece `index` occupies. Spans are contiguous
    /// in file order and sum to the piece size.
    pub fn map_piece(&self, index: usize) -> Vec<FileSpan> {
        let mut spans = Vec::new();
        let mut start = self.pieces[index].offset;
        let mut file_index = 0;
        while file_index < self.files.len() && start >= self.files[file_index].length {
            start -= self.files[file_index].length;
            file_index += 1;
        }
        let mut not_mapped = self.pieces[index].size as u64;
        while not_mapped > 0 && file_index < self.files.len() {
            let file = &self.files[file_index];
            let length = not_mapped.min(file.length - start);
            spans.push(FileSpan {
                file: file_index,
                offset: start,
                length,
                needed: file.needed,
            });
            not_mapped -= length;
            file_index += 1;
            start = 0;
        }
        spans
    }

    /// What we tell peers we have.
    pub fn construct_bitfield(&self) -> BitField {
        let have: Vec<bool> = self.pieces.iter().map(|p| p.have).collect();
        BitField::from_bools(&have)
    }

    pub fn percent_done(&self) -> f64 {
        if self.length == 0 {
            return 100.0;
        }
        100.0 * self.downloaded as f64 / self.length as f64
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.length
    }

    pub fn left(&self) -> u64 {
        self.length.saturating_sub(self.downloaded)
    }
}

fn build_handshake(info_hash: &[u8; SHA_LEN], peer_id: &[u8; SHA_LEN]) -> Vec<u8> {
    let mut handshake = Vec::with_capacity(68);
    handshake.push(19);
    handshake.extend_from_slice(b"BitTorrent protocol");
    handshake.extend_from_slice(&[0u8; 8]);
    handshake.extend_from_slice(info_hash);
    handshake.extend_from_slice(peer_id);
    handshake
}
