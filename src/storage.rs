//! Disk layer: piece placement across the file table, startup hash
//! verification, and the verified write path. Files are opened per
//! operation; only `needed` spans ever touch the disk.

use crate::error::Result;
use crate::torrent::{Piece, RequestState, Torrent};
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Read `length` bytes at `offset`. A missing file reads as empty; a short
/// file yields whatever it holds.
fn read_file_with_offset(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; length as usize];
    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

/// Concatenation of the piece's spans as currently on disk.
pub fn read_piece(torrent: &Torrent, index: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(torrent.pieces[index].size as usize);
    for span in torrent.map_piece(index) {
        data.extend(read_file_with_offset(
            &torrent.files[span.file].path,
            span.offset,
            span.length,
        )?);
    }
    Ok(data)
}

pub fn validate_piece(piece: &Piece, data: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    piece.hash == <[u8; 20]>::from(hasher.finalize())
}

/// Create output directories and zero-length needed files. Returns true if
/// any needed file already existed, i.e. there may be data worth hashing.
pub fn prepare(torrent: &Torrent) -> Result<bool> {
    let mut found_data = false;
    for file in &torrent.files {
        if let Some(parent) = file.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    for file in torrent.files.iter().filter(|f| f.needed) {
        if file.path.exists() {
            found_data = true;
        } else {
            File::create(&file.path)?;
        }
    }
    Ok(found_data)
}

/// Hash whatever is already on disk and credit verified needed pieces to
/// the downloaded counter.
pub fn check_existing_data(torrent: &mut Torrent) -> Result<()> {
    if !prepare(torrent)? {
        return Ok(());
    }
    println!("Checking existing files...");
    let pieces_amount = torrent.pieces.len();
    for index in 0..pieces_amount {
        let data = read_piece(torrent, index)?;
        let have = validate_piece(&torrent.pieces[index], &data);
        torrent.pieces[index].have = have;
        if have && torrent.pieces[index].needed {
            let credit: u64 = torrent
                .map_piece(index)
                .iter()
                .filter(|span| span.needed)
                .map(|span| span.length)
                .sum();
            torrent.downloaded += credit;
        }
        let perc = 100.0 * (index + 1) as f64 / pieces_amount as f64;
        print!("\r{:.2}% checked.      ", perc);
        let _ = std::io::stdout().flush();
    }
    println!();
    Ok(())
}

/// Verify a completed piece and, when it checks out, write its needed spans
/// and mark it done. A hash mismatch resets the piece for a silent retry.
/// Returns whether the piece was accepted.
pub fn commit_piece(torrent: &mut Torrent, index: usize, data: &[u8]) -> Result<bool> {
    if !validate_piece(&torrent.pieces[index], data) || torrent.pieces[index].have {
        if !torrent.pieces[index].have {
            log::debug!("piece {} failed verification, retrying", index);
            torrent.pieces[index].requested = RequestState::Idle;
        }
        return Ok(false);
    }
    torrent.pieces[index].have = true;
    torrent.pieces[index].requested = RequestState::Done;
    let size = torrent.pieces[index].size as u64;
    torrent.got += size;
    let mut cursor = 0usize;
    for span in torrent.map_piece(index) {
        let slice = &data[cursor..cursor + span.length as usize];
        cursor += span.length as usize;
        if !span.needed {
            continue;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&torrent.files[span.file].path)?;
        file.seek(SeekFrom::Start(span.offset))?;
        file.write_all(slice)?;
        torrent.downloaded += span.length;
    }
    Ok(true)
}
