//! UDP tracker announce, BEP 15: a CONNECT exchange to obtain a connection
//! id, then the ANNOUNCE exchange proper. All integers big-endian.

use crate::error::{Error, Result};
use crate::tracker::client::{parse_compact_peers, Announce, AnnounceOutcome, Event};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;
use std::io::Cursor;
use std::net::UdpSocket;
use std::time::Duration;
use url::Url;

/// Magic constant identifying the UDP tracker protocol.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const UDP_TIMEOUT: Duration = Duration::from_secs(2);

pub fn announce(url: &Url, payload: &Announce, bind_port: u16) -> Result<AnnounceOutcome> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::TrackerUnreachable("announce URL without host".into()))?;
    let port = url
        .port()
        .ok_or_else(|| Error::TrackerUnreachable("udp tracker URL without port".into()))?;

    let socket = UdpSocket::bind(("0.0.0.0", bind_port)).map_err(unreachable_err)?;
    socket
        .set_read_timeout(Some(UDP_TIMEOUT))
        .map_err(unreachable_err)?;
    socket
        .set_write_timeout(Some(UDP_TIMEOUT))
        .map_err(unreachable_err)?;
    socket.connect((host, port)).map_err(unreachable_err)?;

    let mut rng = rand::thread_rng();
    let connection_id = exchange_connect(&socket, rng.gen())?;
    let transaction_id = rng.gen();
    socket
        .send(&build_announce_packet(connection_id, transaction_id, payload))
        .map_err(unreachable_err)?;
    if payload.event == Some(Event::Stopped) {
        // nobody waits on a goodbye
        return Ok(AnnounceOutcome::default());
    }
    let mut resp = [0u8; 1024];
    let len = socket.recv(&mut resp).map_err(unreachable_err)?;
    parse_announce_response(&resp[..len], transaction_id)
}

fn exchange_connect(socket: &UdpSocket, transaction_id: u32) -> Result<u64> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    socket.send(&packet).map_err(unreachable_err)?;

    let mut resp = [0u8; 16];
    let len = socket.recv(&mut resp).map_err(unreachable_err)?;
    if len < 16 {
        return Err(Error::TrackerUnreachable("short connect response".into()));
    }
    let mut cursor = Cursor::new(&resp[..len]);
    let action = cursor.read_u32::<BigEndian>().map_err(unreachable_err)?;
    let txn = cursor.read_u32::<BigEndian>().map_err(unreachable_err)?;
    if action != ACTION_CONNECT || txn != transaction_id {
        return Err(Error::TrackerUnreachable("bogus connect response".into()));
    }
    cursor.read_u64::<BigEndian>().map_err(unreachable_err)
}

/// The fixed 98-byte ANNOUNCE request.
fn build_announce_packet(connection_id: u64, transaction_id: u32, payload: &Announce) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&payload.info_hash);
    packet.extend_from_slice(&payload.peer_id);
    packet.extend_from_slice(&payload.downloaded.to_be_bytes());
    packet.extend_from_slice(&payload.left.to_be_bytes());
    packet.extend_from_slice(&payload.uploaded.to_be_bytes());
    let event = payload.event.map(|e| e.as_code()).unwrap_or(0);
    packet.extend_from_slice(&event.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // ip: let the tracker use the source
    packet.extend_from_slice(&payload.key.to_be_bytes());
    packet.extend_from_slice(&payload.numwant.to_be_bytes());
    packet.extend_from_slice(&payload.port.to_be_bytes());
    packet
}

fn parse_announce_response(resp: &[u8], transaction_id: u32) -> Result<AnnounceOutcome> {
    if resp.len() < 20 {
        return Err(Error::TrackerUnreachable("short announce response".into()));
    }
    let mut cursor = Cursor::new(resp);
    let action = cursor.read_u32::<BigEndian>().map_err(unreachable_err)?;
    let txn = cursor.read_u32::<BigEndian>().map_err(unreachable_err)?;
    if action == ACTION_ERROR {
        return Err(Error::TrackerUnreachable(
            String::from_utf8_lossy(&resp[8..]).into_owned(),
        ));
    }
    if action != ACTION_ANNOUNCE || txn != transaction_id {
        return Err(Error::TrackerUnreachable("bogus announce response".into()));
    }
    let interval = cursor.read_u32::<BigEndian>().map_err(unreachable_err)? as u64;
    // leechers and seeders counts, unused
    Ok(AnnounceOutcome {
        interval,
        peers: parse_compact_peers(&resp[20..]),
    })
}

fn unreachable_err(err: std::io::Error) -> Error {
    Error::TrackerUnreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_payload() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"-BF0010-AAAABBBBCCCC",
            port: 32123,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            numwant: 500,
            key: 77,
            event: Some(Event::Started),
        }
    }

    #[test]
    fn test_announce_packet_layout() {
        let packet = build_announce_packet(0xdead_beef_0000_0001, 0x0102_0304, &test_payload());
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[..8], &0xdead_beef_0000_0001u64.to_be_bytes());
        assert_eq!(&packet[8..12], &[0, 0, 0, 1]); // announce action
        assert_eq!(&packet[12..16], &[1, 2, 3, 4]);
        assert_eq!(&packet[16..36], &[0xab; 20]);
        assert_eq!(&packet[36..56], b"-BF0010-AAAABBBBCCCC");
        assert_eq!(&packet[56..64], &2u64.to_be_bytes()); // downloaded
        assert_eq!(&packet[64..72], &3u64.to_be_bytes()); // left
        assert_eq!(&packet[72..80], &1u64.to_be_bytes()); // uploaded
        assert_eq!(&packet[80..84], &2u32.to_be_bytes()); // started
        assert_eq!(&packet[84..88], &[0; 4]); // ip
        assert_eq!(&packet[88..92], &77u32.to_be_bytes());
        assert_eq!(&packet[92..96], &500u32.to_be_bytes());
        assert_eq!(&packet[96..98], &32123u16.to_be_bytes());
    }

    #[test]
    fn test_parse_announce_response() {
        let mut resp = Vec::new();
        resp.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        resp.extend_from_slice(&7u32.to_be_bytes()); // transaction id
        resp.extend_from_slice(&1800u32.to_be_bytes()); // interval
        resp.extend_from_slice(&3u32.to_be_bytes()); // leechers
        resp.extend_from_slice(&5u32.to_be_bytes()); // seeders
        resp.extend_from_slice(b"\x7f\x00\x00\x01\x02\x02");
        let outcome = parse_announce_response(&resp, 7).unwrap();
        assert_eq!(outcome.interval, 1800);
        assert_eq!(outcome.peers, vec!["127.0.0.1:514".parse().unwrap()]);
    }

    #[test]
    fn test_parse_announce_response_rejects() {
        let mut resp = Vec::new();
        resp.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        resp.extend_from_slice(&7u32.to_be_bytes());
        resp.extend_from_slice(&1800u32.to_be_bytes());
        resp.extend_from_slice(&[0u8; 8]);
        // wrong transaction id
        assert!(parse_announce_response(&resp, 8).is_err());
        // truncated
        assert!(parse_announce_response(&resp[..12], 7).is_err());
        // tracker error packet
        let mut err_resp = Vec::new();
        err_resp.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        err_resp.extend_from_slice(&7u32.to_be_bytes());
        err_resp.extend_from_slice(b"twenty bytes minimum");
        assert!(parse_announce_response(&err_resp, 7).is_err());
    }
}
