use crate::error::Error;
use crate::peer::handshake::{Handshake, HANDSHAKE_LEN};
use crate::peer::message::Message;
use crate::picker;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Frames larger than this cannot occur in this protocol; a bigger length
/// prefix means the stream is garbage.
const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// What the frame parser hands back to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseEvent {
    Handshake(Handshake),
    Frame { id: u8, payload: Vec<u8> },
}

/// Accumulates stream bytes across reads and splits them into the 68-byte
/// handshake followed by length-prefixed frames. Keep-alives are swallowed
/// here.
#[derive(Debug)]
pub struct StreamParser {
    buf: BytesMut,
    awaiting_handshake: bool,
}

impl StreamParser {
    pub fn new() -> StreamParser {
        StreamParser {
            buf: BytesMut::new(),
            awaiting_handshake: true,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ParseEvent>, Error> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        if self.awaiting_handshake {
            if self.buf.len() < HANDSHAKE_LEN {
                return Ok(events);
            }
            let handshake = Handshake::from_bytes(&self.buf[..HANDSHAKE_LEN])?;
            self.buf.advance(HANDSHAKE_LEN);
            self.awaiting_handshake = false;
            events.push(ParseEvent::Handshake(handshake));
        }
        loop {
            if self.buf.len() < 4 {
                return Ok(events);
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_FRAME_LEN {
                return Err(Error::MalformedPeerFrame);
            }
            if self.buf.len() < 4 + len {
                return Ok(events);
            }
            self.buf.advance(4);
            if len == 0 {
                continue; // keep-alive
            }
            let id = self.buf[0];
            let payload = self.buf[1..len].to_vec();
            self.buf.advance(len);
            events.push(ParseEvent::Frame { id, payload });
        }
    }
}

/// Blocks of one piece as they trickle in, keyed by offset.
#[derive(Debug)]
struct PieceAssembly {
    blocks_amount: usize,
    data: HashMap<u32, Vec<u8>>,
}

/// Everything both threads mutate, behind the one per-peer mutex. The
/// reactor appends parsed results and drains the write buffer; the
/// controller appends outgoing messages and swaps out the harvest maps.
#[derive(Debug, Default)]
struct SharedState {
    write_buf: BytesMut,
    bitfield: HashMap<u32, bool>,
    assembly: HashMap<u32, PieceAssembly>,
    completed: HashMap<u32, Vec<u8>>,
    pending_upload: HashMap<u32, Vec<(u32, u32)>>,
    first_byte: Option<Instant>,
}

/// Per-peer state shared between the reactor and the controller. The socket
/// and read-side parser live on the reactor in a `PeerIo`, not here.
pub struct PeerSession {
    pub addr: SocketAddr,
    pub direction: Direction,
    handshake: Vec<u8>,
    info_hash: [u8; 20],
    max_request: u32,
    peer_timeout: Duration,
    connect_time: Instant,
    alive: AtomicBool,
    connected: AtomicBool,
    handshaked: AtomicBool,
    unchoked: AtomicBool,
    frozen: AtomicBool,
    endgame: AtomicBool,
    need_bitfield: AtomicBool,
    outstanding: AtomicU32,
    max_requests: AtomicU32,
    downloaded: AtomicU64,
    state: Mutex<SharedState>,
}

impl PeerSession {
    /// `handshake` is the torrent's 68-byte prologue; the infohash to check
    /// remote handshakes against is embedded in it.
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        handshake: Vec<u8>,
        max_request: u32,
        peer_timeout: u64,
    ) -> PeerSession {
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&handshake[28..48]);
        PeerSession {
            addr,
            direction,
            handshake,
            info_hash,
            max_request,
            peer_timeout: Duration::from_secs(peer_timeout),
            connect_time: Instant::now(),
            alive: AtomicBool::new(true),
            // accepted sockets are connected by definition
            connected: AtomicBool::new(direction == Direction::Inbound),
            handshaked: AtomicBool::new(false),
            unchoked: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            endgame: AtomicBool::new(false),
            need_bitfield: AtomicBool::new(false),
            outstanding: AtomicU32::new(0),
            max_requests: AtomicU32::new(1),
            downloaded: AtomicU64::new(0),
            state: Mutex::new(SharedState::default()),
        }
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Liveness check run from the controller tick; a session that never
    /// completed its handshake in time is closed here.
    pub fn is_alive(&self) -> bool {
        if !self.handshaked.load(Ordering::SeqCst)
            && self.connect_time.elapsed() > self.peer_timeout
        {
            log::debug!("peer {} timed out before handshake", self.addr);
            self.close();
        }
        self.alive.load(Ordering::SeqCst)
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_upload(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Called by the reactor when the socket first turns writable with a
    /// clean SO_ERROR. Outbound sessions open with our handshake.
    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst)
            && self.direction == Direction::Outbound
        {
            self.queue_handshake();
        }
    }

    pub fn unchoked(&self) -> bool {
        self.unchoked.load(Ordering::SeqCst)
    }

    pub fn can_request(&self) -> bool {
        self.unchoked()
            && self.outstanding.load(Ordering::SeqCst) < self.max_requests.load(Ordering::SeqCst)
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    pub fn endgame(&self) -> bool {
        self.endgame.load(Ordering::SeqCst)
    }

    pub fn set_endgame(&self, endgame: bool) {
        self.endgame.store(endgame, Ordering::SeqCst);
    }

    pub fn needs_bitfield(&self) -> bool {
        self.need_bitfield.load(Ordering::SeqCst)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// KB/s since the first request went out.
    pub fn download_rate(&self) -> f64 {
        let first_byte = self.state.lock().unwrap().first_byte;
        match first_byte {
            Some(since) => {
                let elapsed = since.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.downloaded_bytes() as f64 / 1024.0 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Recomputed on every read burst: allow as many in-flight blocks as
    /// this peer delivers per second, at least one.
    pub fn update_max_requests(&self) {
        if self.frozen.load(Ordering::SeqCst) {
            return;
        }
        let downloaded = self.downloaded_bytes();
        let first_byte = self.state.lock().unwrap().first_byte;
        if let Some(since) = first_byte {
            let elapsed = since.elapsed().as_secs_f64();
            if elapsed > 0.0 && downloaded > 0 {
                let rate = downloaded as f64 / elapsed;
                let max = (rate / self.max_request as f64).round() as u32;
                self.max_requests.store(max.max(1), Ordering::SeqCst);
            }
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .bitfield
            .get(&index)
            .copied()
            .unwrap_or(false)
    }

    fn queue_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().write_buf.extend_from_slice(bytes);
    }

    fn queue_handshake(&self) {
        let handshake = self.handshake.clone();
        self.queue_bytes(&handshake);
    }

    pub fn send_message(&self, message: &Message) {
        self.queue_bytes(&message.serialize());
    }

    pub fn send_have(&self, index: u32) {
        self.send_message(&Message::Have(index));
    }

    pub fn send_bitfield(&self, bitfield: &crate::bitfield::BitField) {
        self.need_bitfield.store(false, Ordering::SeqCst);
        self.send_message(&Message::Bitfield(bitfield.as_bytes().to_vec()));
    }

    /// Queue block requests for a batch of `(index, size)` pieces, charging
    /// the outstanding counter and opening an assembly slot per piece.
    pub fn send_request(&self, pieces: &[(u32, u32)]) {
        let mut state = self.state.lock().unwrap();
        if state.first_byte.is_none() && !pieces.is_empty() {
            state.first_byte = Some(Instant::now());
        }
        for &(index, size) in pieces {
            let blocks = picker::piece_blocks(size, self.max_request);
            self.outstanding
                .fetch_add(blocks.len() as u32, Ordering::SeqCst);
            state.assembly.insert(
                index,
                PieceAssembly {
                    blocks_amount: blocks.len(),
                    data: HashMap::new(),
                },
            );
            for (offset, length) in blocks {
                state
                    .write_buf
                    .extend_from_slice(&Message::Request(index, offset, length).serialize());
            }
        }
    }

    /// Cancel every block of a piece; endgame only.
    pub fn send_cancel(&self, index: u32, size: u32) {
        let mut state = self.state.lock().unwrap();
        for (offset, length) in picker::piece_blocks(size, self.max_request) {
            state
                .write_buf
                .extend_from_slice(&Message::Cancel(index, offset, length).serialize());
        }
    }

    /// Swap out the fully assembled pieces.
    pub fn take_completed(&self) -> HashMap<u32, Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().completed)
    }

    /// Swap out the blocks the remote side asked us for.
    pub fn take_pending_uploads(&self) -> HashMap<u32, Vec<(u32, u32)>> {
        std::mem::take(&mut self.state.lock().unwrap().pending_upload)
    }

    /// Run `f` with the write buffer under the peer mutex; the reactor
    /// drains the socket through this.
    pub fn with_write_buf<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        f(&mut self.state.lock().unwrap().write_buf)
    }

    /// Dispatch one parsed event. Any protocol violation closes the session
    /// and stays local to it.
    pub fn handle_event(&self, event: ParseEvent) {
        match event {
            ParseEvent::Handshake(handshake) => {
                if !handshake.check(&self.info_hash) {
                    log::debug!("handshake infohash mismatch from {}", self.addr);
                    self.close();
                    return;
                }
                self.handshaked.store(true, Ordering::SeqCst);
                if self.is_upload() {
                    self.queue_handshake();
                }
                self.need_bitfield.store(true, Ordering::SeqCst);
            }
            ParseEvent::Frame { id, payload } => match Message::deserialize(id, &payload) {
                Ok(message) => self.handle_message(message),
                Err(_) => self.close(),
            },
        }
    }

    pub(crate) fn handle_message(&self, message: Message) {
        match message {
            // a choking peer is not worth waiting on
            Message::Choke => {
                self.unchoked.store(false, Ordering::SeqCst);
                self.close();
            }
            Message::Unchoke => {
                self.unchoked.store(true, Ordering::SeqCst);
            }
            Message::Interested => {
                if self.is_upload() {
                    self.send_message(&Message::Unchoke);
                }
            }
            Message::NotInterested | Message::Port(_) | Message::KeepAlive => {}
            Message::Have(index) => {
                self.state.lock().unwrap().bitfield.insert(index, true);
            }
            Message::Bitfield(bytes) => {
                self.fill_bitfield(&bytes);
                if !self.is_upload() {
                    self.send_message(&Message::Interested);
                }
            }
            Message::Request(index, offset, length) => {
                self.state
                    .lock()
                    .unwrap()
                    .pending_upload
                    .entry(index)
                    .or_default()
                    .push((offset, length));
            }
            Message::Piece(index, offset, block) => self.save_block(index, offset, block),
            Message::Cancel(index, offset, length) => {
                let mut state = self.state.lock().unwrap();
                if let Some(blocks) = state.pending_upload.get_mut(&index) {
                    blocks.retain(|&b| b != (offset, length));
                }
            }
        }
    }

    /// MSB-first: bit `j` of byte `i` is piece `8i + j`.
    fn fill_bitfield(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            for j in 0..8 {
                let bit = byte & (1 << (7 - j)) != 0;
                state.bitfield.insert((i * 8 + j) as u32, bit);
            }
        }
    }

    /// Stash a received block; a fully assembled piece moves to the
    /// completed queue and releases its outstanding charge. Blocks for
    /// pieces we never asked about are dropped.
    fn save_block(&self, index: u32, offset: u32, block: Vec<u8>) {
        self.downloaded
            .fetch_add(block.len() as u64, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let assembly = match state.assembly.get_mut(&index) {
            Some(assembly) => assembly,
            None => return,
        };
        assembly.data.insert(offset, block);
        if assembly.data.len() == assembly.blocks_amount {
            let assembly = state.assembly.remove(&index).unwrap();
            let mut offsets: Vec<u32> = assembly.data.keys().copied().collect();
            offsets.sort_unstable();
            let mut piece = Vec::new();
            for offset in offsets {
                piece.extend_from_slice(&assembly.data[&offset]);
            }
            let released = assembly.blocks_amount as u32;
            state.completed.insert(index, piece);
            drop(state);
            let _ = self
                .outstanding
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(released))
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(direction: Direction) -> PeerSession {
        let mut handshake = vec![19u8];
        handshake.extend_from_slice(b"BitTorrent protocol");
        handshake.extend_from_slice(&[0u8; 8]);
        handshake.extend_from_slice(&[0xab; 20]);
        handshake.extend_from_slice(b"-BF0010-AAAABBBBCCCC");
        PeerSession::new(
            "127.0.0.1:6881".parse().unwrap(),
            direction,
            handshake,
            16384,
            30,
        )
    }

    fn feed_all(parser: &mut StreamParser, bytes: &[u8]) -> Vec<ParseEvent> {
        parser.feed(bytes).unwrap()
    }

    fn write_buf(session: &PeerSession) -> Vec<u8> {
        session.with_write_buf(|buf| buf.to_vec())
    }

    #[test]
    fn test_parser_handshake_then_frames() {
        let session = test_session(Direction::Outbound);
        let mut parser = StreamParser::new();
        let mut stream = session.handshake.clone();
        stream.extend_from_slice(&Message::KeepAlive.serialize());
        stream.extend_from_slice(&Message::Have(4).serialize());
        stream.extend_from_slice(&Message::Interested.serialize());
        stream.extend_from_slice(&Message::Request(2, 2, 8).serialize());
        let events = feed_all(&mut parser, &stream);
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ParseEvent::Handshake(_)));
        assert_eq!(
            events[1],
            ParseEvent::Frame { id: 4, payload: vec![0, 0, 0, 4] }
        );
        assert_eq!(events[2], ParseEvent::Frame { id: 2, payload: vec![] });
        assert!(matches!(events[3], ParseEvent::Frame { id: 6, .. }));
    }

    #[test]
    fn test_parser_arbitrary_split_boundaries() {
        let session = test_session(Direction::Outbound);
        let mut stream = session.handshake.clone();
        stream.extend_from_slice(&Message::Have(4).serialize());
        stream.extend_from_slice(&Message::KeepAlive.serialize());
        stream.extend_from_slice(&Message::Bitfield(vec![0xaa, 0x21]).serialize());
        stream.extend_from_slice(&Message::Piece(1, 0, b"lalala".to_vec()).serialize());
        for split in 0..stream.len() {
            let mut parser = StreamParser::new();
            let mut events = feed_all(&mut parser, &stream[..split]);
            events.extend(feed_all(&mut parser, &stream[split..]));
            let ids: Vec<Option<u8>> = events
                .iter()
                .map(|e| match e {
                    ParseEvent::Handshake(_) => None,
                    ParseEvent::Frame { id, .. } => Some(*id),
                })
                .collect();
            assert_eq!(ids, vec![None, Some(4), Some(5), Some(7)], "split {}", split);
        }
    }

    #[test]
    fn test_parser_incomplete_frame_waits() {
        let mut parser = StreamParser {
            buf: BytesMut::new(),
            awaiting_handshake: false,
        };
        assert!(parser.feed(b"\x00\x00\x00").unwrap().is_empty());
        assert!(parser.feed(b"\x05\x04\x00").unwrap().is_empty());
        let events = parser.feed(b"\x00\x00\x04").unwrap();
        assert_eq!(
            events,
            vec![ParseEvent::Frame { id: 4, payload: vec![0, 0, 0, 4] }]
        );
    }

    #[test]
    fn test_parser_rejects_absurd_length() {
        let mut parser = StreamParser {
            buf: BytesMut::new(),
            awaiting_handshake: false,
        };
        assert!(parser.feed(b"\xff\xff\xff\xff").is_err());
    }

    #[test]
    fn test_handshake_mismatch_closes() {
        let session = test_session(Direction::Outbound);
        let wrong = Handshake::new([0xcd; 20], [1; 20]);
        session.handle_event(ParseEvent::Handshake(wrong));
        assert!(!session.alive());
    }

    #[test]
    fn test_inbound_replies_with_handshake() {
        let session = test_session(Direction::Inbound);
        let remote = Handshake::new([0xab; 20], [1; 20]);
        session.handle_event(ParseEvent::Handshake(remote));
        assert!(session.alive());
        assert!(session.needs_bitfield());
        assert_eq!(write_buf(&session), session.handshake);
    }

    #[test]
    fn test_choke_closes_session() {
        let session = test_session(Direction::Outbound);
        session.handle_message(Message::Unchoke);
        assert!(session.unchoked());
        session.handle_message(Message::Choke);
        assert!(!session.unchoked());
        assert!(!session.alive());
    }

    #[test]
    fn test_bitfield_fill_and_interested_reply() {
        let session = test_session(Direction::Outbound);
        session.handle_message(Message::Bitfield(vec![0x21]));
        for (index, expected) in [(0, false), (2, true), (7, true), (8, false)] {
            assert_eq!(session.has_piece(index), expected, "bit {}", index);
        }
        assert_eq!(write_buf(&session), Message::Interested.serialize());
    }

    #[test]
    fn test_have_sets_bit() {
        let session = test_session(Direction::Outbound);
        session.handle_message(Message::Have(255));
        assert!(session.has_piece(255));
    }

    #[test]
    fn test_interested_unchokes_uploader() {
        let session = test_session(Direction::Inbound);
        session.handle_message(Message::Interested);
        assert_eq!(write_buf(&session), Message::Unchoke.serialize());
    }

    #[test]
    fn test_request_queues_upload_block() {
        let session = test_session(Direction::Inbound);
        session.handle_message(Message::Request(1, 4, 0));
        assert_eq!(session.take_pending_uploads()[&1], vec![(4, 0)]);
        assert!(session.take_pending_uploads().is_empty());
    }

    #[test]
    fn test_cancel_removes_upload_block() {
        let session = test_session(Direction::Inbound);
        session.handle_message(Message::Request(1, 0, 16384));
        session.handle_message(Message::Request(1, 16384, 16384));
        session.handle_message(Message::Cancel(1, 0, 16384));
        assert_eq!(session.take_pending_uploads()[&1], vec![(16384, 16384)]);
    }

    #[test]
    fn test_request_batch_block_splitting() {
        let session = test_session(Direction::Outbound);
        session.send_request(&[(4, 40000)]);
        let mut expected = Vec::new();
        expected.extend_from_slice(&Message::Request(4, 0, 16384).serialize());
        expected.extend_from_slice(&Message::Request(4, 16384, 16384).serialize());
        expected.extend_from_slice(&Message::Request(4, 32768, 7232).serialize());
        assert_eq!(write_buf(&session), expected);
        assert_eq!(session.outstanding.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_block_assembly_to_completion() {
        let session = test_session(Direction::Outbound);
        session.send_request(&[(1, 16384 + 6)]);
        session.handle_message(Message::Piece(1, 0, vec![b'a'; 16384]));
        assert!(session.take_completed().is_empty());
        assert_eq!(session.downloaded_bytes(), 16384);
        session.handle_message(Message::Piece(1, 16384, b"lalala".to_vec()));
        let completed = session.take_completed();
        assert_eq!(completed[&1].len(), 16384 + 6);
        assert_eq!(&completed[&1][16384..], b"lalala");
        assert_eq!(session.outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsolicited_block_dropped() {
        let session = test_session(Direction::Outbound);
        session.handle_message(Message::Piece(9, 0, b"junk".to_vec()));
        assert!(session.take_completed().is_empty());
        // bytes still count toward the rate, as received traffic
        assert_eq!(session.downloaded_bytes(), 4);
    }

    #[test]
    fn test_can_request_gating() {
        let session = test_session(Direction::Outbound);
        assert!(!session.can_request());
        session.handle_message(Message::Unchoke);
        assert!(session.can_request());
        session.send_request(&[(0, 16384)]);
        assert!(!session.can_request());
    }

    #[test]
    fn test_adaptive_max_requests() {
        let session = test_session(Direction::Outbound);
        session.send_request(&[(0, 16384)]);
        session
            .state
            .lock()
            .unwrap()
            .first_byte
            .replace(Instant::now() - Duration::from_secs(1));
        session.downloaded.store(10 * 16384, Ordering::SeqCst);
        session.update_max_requests();
        let max = session.max_requests.load(Ordering::SeqCst);
        assert!((9..=11).contains(&max), "max_requests = {}", max);

        session.set_frozen(true);
        session.downloaded.store(100 * 16384, Ordering::SeqCst);
        session.update_max_requests();
        assert_eq!(session.max_requests.load(Ordering::SeqCst), max);
    }

    #[test]
    fn test_handshake_timeout() {
        let session = PeerSession {
            peer_timeout: Duration::from_secs(0),
            ..test_session(Direction::Outbound)
        };
        std::thread::sleep(Duration::from_millis(5));
        assert!(!session.is_alive());
    }
}
