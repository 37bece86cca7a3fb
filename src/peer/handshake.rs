use crate::error::Error;

pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte TCP prologue:
/// `\x13 "BitTorrent protocol" <8 reserved zeros> <infohash> <peer-id>`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() < HANDSHAKE_LEN
            || bytes[0] != 19
            || &bytes[1..20] != b"BitTorrent protocol"
        {
            return Err(Error::MalformedPeerFrame);
        }
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LEN);
        bytes.push(19);
        bytes.extend_from_slice(b"BitTorrent protocol");
        bytes.extend_from_slice(&self.reserved);
        bytes.extend_from_slice(&self.info_hash);
        bytes.extend_from_slice(&self.peer_id);
        bytes
    }

    /// The only thing that matters about a remote handshake: it talks about
    /// the same torrent.
    pub fn check(&self, info_hash: &[u8; 20]) -> bool {
        &self.info_hash == info_hash
    }
}
