pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod engine;
pub mod error;
pub mod metainfo;
pub mod picker;
pub mod reactor;
pub mod storage;
pub mod torrent;
pub mod utils;

pub mod tracker {
    pub mod client;
    pub mod http;
    pub mod udp;
}

pub mod peer {
    pub mod handshake;
    pub mod message;
    pub mod session;
}

pub use error::Error;
