use std::io;

/// Errors that cross component boundaries. Per-peer failures stay local to
/// the session that produced them; only metainfo and disk errors reach the
/// user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("malformed peer frame")]
    MalformedPeerFrame,

    #[error("peer timed out")]
    PeerTimeout,

    #[error("tracker unreachable: {0}")]
    TrackerUnreachable(String),

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] io::Error),

    #[error("piece {0} failed hash verification")]
    HashMismatch(u32),

    #[error(transparent)]
    Bencode(#[from] crate::bencode::BencodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
