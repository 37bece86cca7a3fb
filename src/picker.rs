//! Piece selection. The scan is in ascending index order; a piece already
//! in flight becomes eligible again after `REQUEST_TIMEOUT_SECS`.

use crate::peer::session::PeerSession;
use crate::torrent::{RequestState, Torrent};
use std::time::Instant;

/// Seconds before an in-flight piece may be handed to another peer.
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Split a piece into request blocks: full `block`-sized chunks plus the
/// residual tail.
pub fn piece_blocks(size: u32, block: u32) -> Vec<(u32, u32)> {
    let tail = size % block;
    let mut blocks = Vec::with_capacity((size / block + 1) as usize);
    let mut offset = 0;
    while offset < size - tail {
        blocks.push((offset, block));
        offset += block;
    }
    if tail > 0 {
        blocks.push((size - tail, tail));
    }
    blocks
}

/// Queue requests on one peer. Normal mode walks pieces in order until the
/// peer saturates; endgame batches every missing needed piece the peer
/// advertises, once, ignoring in-flight marks.
pub fn make_requests(torrent: &mut Torrent, peer: &PeerSession, endgame: bool) {
    let now = Instant::now();
    if !endgame {
        for index in 0..torrent.pieces.len() {
            if !peer.can_request() {
                break;
            }
            let piece = &mut torrent.pieces[index];
            if piece.have
                || !piece.needed
                || !piece.requested.is_eligible(now, REQUEST_TIMEOUT_SECS)
                || !peer.has_piece(index as u32)
            {
                continue;
            }
            piece.requested = RequestState::Pending(now);
            peer.send_request(&[(index as u32, piece.size)]);
        }
        peer.set_endgame(false);
    } else if !peer.endgame() {
        let batch: Vec<(u32, u32)> = torrent
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                !piece.have && piece.needed && peer.has_piece(*index as u32)
            })
            .map(|(index, piece)| (index as u32, piece.size))
            .collect();
        peer.send_request(&batch);
        peer.set_endgame(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;
    use crate::peer::message::Message;
    use crate::peer::session::Direction;
    use crate::torrent::Selection;
    use std::time::Duration;

    fn test_torrent(piece_count: usize) -> Torrent {
        use crate::bencode::{encode, Value};
        use std::collections::BTreeMap;
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(b"demo".to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(32768));
        info.insert(
            b"pieces".to_vec(),
            Value::Bytes(vec![0x61; 20 * piece_count]),
        );
        info.insert(
            b"length".to_vec(),
            Value::Int(32768 * piece_count as i64),
        );
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::Bytes(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        let metainfo = Metainfo::from_bytes(&encode(&Value::Dict(root))).unwrap();
        Torrent::new(&metainfo, None, &Selection::All, [b'x'; 20]).unwrap()
    }

    fn test_peer(torrent: &Torrent, piece_count: usize) -> PeerSession {
        let peer = PeerSession::new(
            "127.0.0.1:6881".parse().unwrap(),
            Direction::Outbound,
            torrent.handshake.clone(),
            16384,
            30,
        );
        peer.handle_message(Message::Unchoke);
        let bytes = vec![0xff; (piece_count + 7) / 8];
        peer.handle_message(Message::Bitfield(bytes));
        peer
    }

    #[test]
    fn test_block_splitting() {
        assert_eq!(
            piece_blocks(40000, 16384),
            vec![(0, 16384), (16384, 16384), (32768, 7232)]
        );
        assert_eq!(piece_blocks(32768, 16384), vec![(0, 16384), (16384, 16384)]);
        assert_eq!(piece_blocks(17, 16384), vec![(0, 17)]);
    }

    #[test]
    fn test_normal_mode_in_order_until_saturated() {
        let mut torrent = test_torrent(4);
        let peer = test_peer(&torrent, 4);
        // a fresh peer allows a single in-flight piece's worth of blocks
        make_requests(&mut torrent, &peer, false);
        assert!(matches!(
            torrent.pieces[0].requested,
            RequestState::Pending(_)
        ));
        assert!(matches!(torrent.pieces[1].requested, RequestState::Idle));
    }

    #[test]
    fn test_normal_mode_skips_have_and_unneeded() {
        let mut torrent = test_torrent(4);
        torrent.pieces[0].have = true;
        torrent.pieces[1].needed = false;
        let peer = test_peer(&torrent, 4);
        make_requests(&mut torrent, &peer, false);
        assert!(matches!(torrent.pieces[0].requested, RequestState::Idle));
        assert!(matches!(torrent.pieces[1].requested, RequestState::Idle));
        assert!(matches!(
            torrent.pieces[2].requested,
            RequestState::Pending(_)
        ));
    }

    #[test]
    fn test_in_flight_piece_retried_after_timeout() {
        let mut torrent = test_torrent(1);
        let stale = Instant::now() - Duration::from_secs(REQUEST_TIMEOUT_SECS + 1);
        torrent.pieces[0].requested = RequestState::Pending(stale);
        let peer = test_peer(&torrent, 1);
        make_requests(&mut torrent, &peer, false);
        match torrent.pieces[0].requested {
            RequestState::Pending(at) => assert!(at > stale),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_in_flight_piece_not_retried_early() {
        let mut torrent = test_torrent(1);
        torrent.pieces[0].requested = RequestState::Pending(Instant::now());
        let peer = test_peer(&torrent, 1);
        make_requests(&mut torrent, &peer, false);
        assert_eq!(peer.downloaded_bytes(), 0);
        assert!(peer.can_request(), "nothing should have been charged");
    }

    #[test]
    fn test_endgame_batches_everything_once() {
        let mut torrent = test_torrent(3);
        torrent.pieces[0].have = true;
        torrent.pieces[1].requested = RequestState::Pending(Instant::now());
        let peer = test_peer(&torrent, 3);
        make_requests(&mut torrent, &peer, true);
        assert!(peer.endgame());
        // pieces 1 and 2 were batched despite piece 1 being in flight
        let queued = peer.with_write_buf(|buf| buf.to_vec());
        let expected: Vec<u8> = [
            Message::Request(1, 0, 16384).serialize(),
            Message::Request(1, 16384, 16384).serialize(),
            Message::Request(2, 0, 16384).serialize(),
            Message::Request(2, 16384, 16384).serialize(),
        ]
        .concat();
        assert!(queued.ends_with(&expected));
        // the second endgame pass is a no-op
        peer.with_write_buf(|buf| buf.clear());
        make_requests(&mut torrent, &peer, true);
        assert!(peer.with_write_buf(|buf| buf.is_empty()));
    }
}
