use rand::Rng;

/// Hard cap on inbound (uploading) peers per torrent.
pub const UPLOAD_PEERS: usize = 20;

/// Margin, in KB/s, kept between the measured rate and a configured limit.
pub const SPEED_DELTA: f64 = 100.0;

/// The startup-set constants threaded into every component at construction.
/// Built once per process; the random key and peer-id suffix are generated
/// here and never change afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block size and per-read chunk size. The wire protocol caps request
    /// lengths at 2^14.
    pub max_request: u32,
    /// Seconds a peer may stay handshake-less before it is closed.
    pub peer_timeout: u64,
    /// Local bind port for UDP tracker exchanges.
    pub port: u16,
    /// Our 20-byte peer id: client prefix plus 12 random characters.
    pub peer_id: [u8; 20],
    /// Most peers a torrent will hold at once; overflow goes to backup.
    pub max_peers: usize,
    /// Percent downloaded at which the scheduler switches to endgame.
    pub endgame_percent: f64,
    /// Random key reported to trackers, constant for the process lifetime.
    pub key: u32,
}

impl Config {
    pub const PEER_ID_PREFIX: &'static [u8; 8] = b"-BF0010-";

    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            max_request: 16384,
            peer_timeout: 30,
            port: 6881,
            peer_id: generate_peer_id(&mut rng),
            max_peers: 50,
            endgame_percent: 95.0,
            key: rng.gen_range(1..10000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Client prefix followed by 12 random uppercase letters or digits.
fn generate_peer_id(rng: &mut impl Rng) -> [u8; 20] {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(Config::PEER_ID_PREFIX);
    for byte in peer_id[8..].iter_mut() {
        *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
    }
    peer_id
}
