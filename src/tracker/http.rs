//! HTTP tracker announce, BEP 3 with `compact=1`. The request is a
//! hand-built GET because the binary `info_hash`/`peer_id` fields must be
//! percent-encoded byte-wise, which URL form layers get wrong.

use crate::error::{Error, Result};
use crate::tracker::client::{parse_compact_peers, Announce, AnnounceOutcome};
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use url::Url;
use urlencoding::encode_binary;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Compact peer string wrapped so serde can decode it from raw bencode
/// bytes.
#[derive(Debug, Default)]
pub struct Peers(pub Vec<SocketAddr>);

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PeersVisitor;

        impl<'de> serde::de::Visitor<'de> for PeersVisitor {
            type Value = Peers;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("compact representation of peers")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Peers(parse_compact_peers(v)))
            }
        }

        deserializer.deserialize_bytes(PeersVisitor)
    }
}

#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    /// A 200 response can still refuse us at the protocol level.
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,
    #[serde(default, rename = "warning message")]
    pub warning_message: Option<String>,
    /// Seconds to wait between regular announces.
    #[serde(default)]
    pub interval: u64,
    #[serde(default, rename = "min interval")]
    pub min_interval: Option<u64>,
    /// Seeder count.
    #[serde(default)]
    pub complete: Option<u64>,
    /// Leecher count.
    #[serde(default)]
    pub incomplete: Option<u64>,
    #[serde(default)]
    pub peers: Peers,
}

pub fn announce(url: &Url, payload: &Announce) -> Result<AnnounceOutcome> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::TrackerUnreachable("announce URL without host".into()))?;
    let port = url.port_or_known_default().unwrap_or(6969);
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(unreachable_err)?
        .next()
        .ok_or_else(|| Error::TrackerUnreachable(format!("{} did not resolve", host)))?;

    let request = build_request(url, payload, host);
    let mut stream = TcpStream::connect_timeout(&addr, HTTP_TIMEOUT).map_err(unreachable_err)?;
    stream
        .set_read_timeout(Some(HTTP_TIMEOUT))
        .map_err(unreachable_err)?;
    stream
        .set_write_timeout(Some(HTTP_TIMEOUT))
        .map_err(unreachable_err)?;
    stream
        .write_all(request.as_bytes())
        .map_err(unreachable_err)?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).map_err(unreachable_err)?;

    parse_response(&raw)
}

fn build_request(url: &Url, payload: &Announce, host: &str) -> String {
    let mut query = String::new();
    if let Some(existing) = url.query() {
        query.push_str(existing);
        query.push('&');
    }
    query.push_str(&format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}\
         &numwant={}&no_peer_id=1&compact=1&key={}",
        encode_binary(&payload.info_hash),
        encode_binary(&payload.peer_id),
        payload.port,
        payload.uploaded,
        payload.downloaded,
        payload.left,
        payload.numwant,
        payload.key,
    ));
    if let Some(event) = payload.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    format!(
        "GET {}?{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        url.path(),
        query,
        host
    )
}

fn parse_response(raw: &[u8]) -> Result<AnnounceOutcome> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let body_start = match response
        .parse(raw)
        .map_err(|e| Error::TrackerUnreachable(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(Error::TrackerUnreachable("truncated tracker response".into()))
        }
    };
    if !matches!(response.code, Some(200)) {
        return Err(Error::TrackerUnreachable(format!(
            "tracker answered HTTP {}",
            response.code.unwrap_or(0)
        )));
    }
    let decoded: AnnounceResponse = serde_bencode::from_bytes(&raw[body_start..])
        .map_err(|e| Error::TrackerUnreachable(e.to_string()))?;
    if let Some(reason) = decoded.failure_reason {
        return Err(Error::TrackerUnreachable(reason));
    }
    if let Some(warning) = &decoded.warning_message {
        log::warn!("tracker warning: {}", warning);
    }
    Ok(AnnounceOutcome {
        interval: decoded.interval,
        peers: decoded.peers.0,
    })
}

fn unreachable_err(err: std::io::Error) -> Error {
    Error::TrackerUnreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::client::Event;

    fn test_payload() -> Announce {
        Announce {
            info_hash: *b"\x12\x34\xab\xcd\xef\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e",
            peer_id: *b"-BF0010-AAAABBBBCCCC",
            port: 32123,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            numwant: 500,
            key: 77,
            event: Some(Event::Started),
        }
    }

    #[test]
    fn test_build_request_query_fields() {
        let url = Url::parse("http://tracker.example:6969/announce").unwrap();
        let request = build_request(&url, &test_payload(), "tracker.example");
        assert!(request.starts_with("GET /announce?info_hash=%124%AB%CD%EF"));
        for field in [
            "&peer_id=-BF0010-AAAABBBBCCCC",
            "&port=32123",
            "&uploaded=10",
            "&downloaded=20",
            "&left=30",
            "&numwant=500",
            "&compact=1",
            "&key=77",
            "&event=started",
        ] {
            assert!(request.contains(field), "missing {} in {}", field, request);
        }
        assert!(request.ends_with("\r\nConnection: close\r\n\r\n"));
    }

    #[test]
    fn test_build_request_keeps_existing_query() {
        let url = Url::parse("http://tracker.example/ann?uk=tLc63KZ1Z1").unwrap();
        let request = build_request(&url, &test_payload(), "tracker.example");
        assert!(request.starts_with("GET /ann?uk=tLc63KZ1Z1&info_hash="));
    }

    #[test]
    fn test_parse_response_compact_peers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n\
            d8:intervali100e5:peers12:\x7f\x00\x00\x01\x02\x02\x9f\x00\xa0\x01\x04\x10e";
        let outcome = parse_response(raw).unwrap();
        assert_eq!(outcome.interval, 100);
        assert_eq!(
            outcome.peers,
            vec![
                "127.0.0.1:514".parse().unwrap(),
                "159.0.160.1:1040".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_response_empty_peers() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nd8:intervali100e5:peers0:e";
        let outcome = parse_response(raw).unwrap();
        assert!(outcome.peers.is_empty());
    }

    #[test]
    fn test_parse_response_failure_reason() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nd14:failure reason9:not foundE";
        assert!(parse_response(raw).is_err());
        let raw = b"HTTP/1.1 200 OK\r\n\r\nd14:failure reason9:not founde";
        match parse_response(raw) {
            Err(Error::TrackerUnreachable(reason)) => assert_eq!(reason, "not found"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_http_error() {
        assert!(parse_response(b"HTTP/1.1 404 Not Found\r\n\r\n").is_err());
        assert!(parse_response(b"garbage").is_err());
    }
}
