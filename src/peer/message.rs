use crate::error::Error;

/// One peer-wire message. Keep-alives are handled by the frame parser and
/// never reach dispatch.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    /// Serialize with the `<length:u32><id:u8><payload>` framing, all
    /// integers big-endian.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => framed(0, &[]),
            Message::Unchoke => framed(1, &[]),
            Message::Interested => framed(2, &[]),
            Message::NotInterested => framed(3, &[]),
            Message::Have(index) => framed(4, &index.to_be_bytes()),
            Message::Bitfield(bitfield) => framed(5, bitfield),
            Message::Request(index, begin, length) => framed(6, &triple(*index, *begin, *length)),
            Message::Piece(index, begin, block) => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                framed(7, &payload)
            }
            Message::Cancel(index, begin, length) => framed(8, &triple(*index, *begin, *length)),
            Message::Port(port) => framed(9, &port.to_be_bytes()),
        }
    }

    /// Decode one frame the parser already split out of the stream.
    pub fn deserialize(id: u8, payload: &[u8]) -> Result<Message, Error> {
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(read_u32(payload, 0)?),
            5 => Message::Bitfield(payload.to_vec()),
            6 => Message::Request(
                read_u32(payload, 0)?,
                read_u32(payload, 4)?,
                read_u32(payload, 8)?,
            ),
            7 => {
                if payload.len() < 8 {
                    return Err(Error::MalformedPeerFrame);
                }
                Message::Piece(
                    read_u32(payload, 0)?,
                    read_u32(payload, 4)?,
                    payload[8..].to_vec(),
                )
            }
            8 => Message::Cancel(
                read_u32(payload, 0)?,
                read_u32(payload, 4)?,
                read_u32(payload, 8)?,
            ),
            9 => {
                if payload.len() != 2 {
                    return Err(Error::MalformedPeerFrame);
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            _ => return Err(Error::MalformedPeerFrame),
        };
        Ok(msg)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(..) => Some(6),
            Message::Piece(..) => Some(7),
            Message::Cancel(..) => Some(8),
            Message::Port(_) => Some(9),
        }
    }
}

fn framed(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(5 + payload.len());
    msg.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    msg.push(id);
    msg.extend_from_slice(payload);
    msg
}

fn triple(a: u32, b: u32, c: u32) -> [u8; 12] {
    let mut payload = [0u8; 12];
    payload[0..4].copy_from_slice(&a.to_be_bytes());
    payload[4..8].copy_from_slice(&b.to_be_bytes());
    payload[8..12].copy_from_slice(&c.to_be_bytes());
    payload
}

fn read_u32(payload: &[u8], at: usize) -> Result<u32, Error> {
    payload
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(Error::MalformedPeerFrame)
}
