use crate::error::{Error, Result};
use crate::tracker::{http, udp};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;
use url::Url;

/// Announce events; regular reannounces carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
        }
    }

    /// BEP 15 event codes.
    pub fn as_code(&self) -> u32 {
        match self {
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// The announce payload both wire protocols serialize.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub numwant: u32,
    pub key: u32,
    pub event: Option<Event>,
}

/// What a successful announce yields.
#[derive(Debug, Default)]
pub struct AnnounceOutcome {
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

/// 6-byte IPv4+port records, as served with `compact=1`.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

/// A wrapper for one tracker of a torrent. An unreachable tracker stays
/// disabled until another announce attempt elsewhere; the interval from its
/// last response throttles reannounces.
#[derive(Debug)]
pub struct Tracker {
    pub url: String,
    payload: Announce,
    pub reachable: bool,
    interval: u64,
    last_announce: Option<Instant>,
    /// Local bind port for UDP exchanges.
    udp_port: u16,
}

impl Tracker {
    pub fn new(url: String, payload: Announce, udp_port: u16) -> Tracker {
        Tracker {
            url,
            payload,
            reachable: true,
            interval: 0,
            last_announce: None,
            udp_port,
        }
    }

    /// Whether an announce is due: never before the tracker-provided
    /// interval has passed, never once unreachable.
    pub fn can_reannounce(&self) -> bool {
        let due = match (self.interval, self.last_announce) {
            (0, _) | (_, None) => true,
            (interval, Some(at)) => at.elapsed().as_secs() > interval,
        };
        due && self.reachable
    }

    /// Announce and return whatever peers came back. Errors mark the
    /// tracker unreachable and yield no peers.
    pub fn get_peers(&mut self) -> Vec<SocketAddr> {
        match self.announce() {
            Ok(outcome) => {
                self.interval = outcome.interval;
                self.last_announce = Some(Instant::now());
                self.payload.event = None;
                log::info!(
                    "tracker {} returned {} peers, interval {}s",
                    self.url,
                    outcome.peers.len(),
                    outcome.interval
                );
                outcome.peers
            }
            Err(err) => {
                log::warn!("tracker {} unreachable: {}", self.url, err);
                self.reachable = false;
                Vec::new()
            }
        }
    }

    fn announce(&self) -> Result<AnnounceOutcome> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => http::announce(&url, &self.payload),
            "udp" => udp::announce(&url, &self.payload, self.udp_port),
            other => Err(Error::TrackerUnreachable(format!(
                "unsupported tracker scheme '{}'",
                other
            ))),
        }
    }

    /// Refresh the counters sent with the next announce.
    pub fn update_progress(&mut self, uploaded: u64, downloaded: u64, left: u64) {
        self.payload.uploaded = uploaded;
        self.payload.downloaded = downloaded;
        self.payload.left = left;
    }

    /// Final announce; without it the tracker will not serve us a peer
    /// list next time. The response is ignored.
    pub fn send_stopped(&mut self) {
        self.payload.event = Some(Event::Stopped);
        self.payload.numwant = 0;
        let _ = self.announce();
    }
}
