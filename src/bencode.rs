use std::collections::BTreeMap;

/// Errors produced by the bencoding codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("malformed bencoded input: {0}")]
    MalformedInput(&'static str),
    /// Kept for boundary APIs handing us foreign values; `Value` itself is
    /// closed over the encodable types.
    #[error("unsupported type for bencoding")]
    UnsupportedType,
}

type Result<T> = std::result::Result<T, BencodeError>;

/// A decoded bencode value. Strings are opaque byte sequences; nothing here
/// assumes UTF-8. `Tuple` is the `t…e` extension used by a sibling tool's
/// wire format; torrent metadata never contains one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Decode the first value in `input`. Trailing bytes are ignored.
pub fn decode(input: &[u8]) -> Result<Value> {
    decode_prefix(input).map(|(value, _)| value)
}

/// Decode the first value in `input` and report how many bytes it consumed.
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize)> {
    decode_at(input, 0)
}

fn decode_at(input: &[u8], pos: usize) -> Result<(Value, usize)> {
    match input.get(pos) {
        Some(b'i') => decode_int(input, pos),
        Some(b'l') => decode_seq(input, pos).map(|(items, end)| (Value::List(items), end)),
        Some(b't') => decode_seq(input, pos).map(|(items, end)| (Value::Tuple(items), end)),
        Some(b'd') => decode_dict(input, pos),
        Some(b'0'..=b'9') => decode_bytes(input, pos).map(|(b, end)| (Value::Bytes(b), end)),
        Some(_) => Err(BencodeError::MalformedInput("unknown type prefix")),
        None => Err(BencodeError::MalformedInput("unexpected end of input")),
    }
}

fn decode_bytes(input: &[u8], pos: usize) -> Result<(Vec<u8>, usize)> {
    let colon = input[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|i| pos + i)
        .ok_or(BencodeError::MalformedInput("string without ':' separator"))?;
    let len: usize = std::str::from_utf8(&input[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::MalformedInput("non-digit string length"))?;
    let end = colon + 1 + len;
    if end > input.len() {
        return Err(BencodeError::MalformedInput("string shorter than its length"));
    }
    Ok((input[colon + 1..end].to_vec(), end))
}

fn decode_int(input: &[u8], pos: usize) -> Result<(Value, usize)> {
    let end = input[pos..]
        .iter()
        .position(|&b| b == b'e')
        .map(|i| pos + i)
        .ok_or(BencodeError::MalformedInput("integer without terminator"))?;
    let number = std::str::from_utf8(&input[pos + 1..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::MalformedInput("invalid integer"))?;
    Ok((Value::Int(number), end + 1))
}

fn decode_seq(input: &[u8], pos: usize) -> Result<(Vec<Value>, usize)> {
    let mut items = Vec::new();
    let mut pos = pos + 1;
    loop {
        match input.get(pos) {
            Some(b'e') => return Ok((items, pos + 1)),
            Some(_) => {
                let (item, next) = decode_at(input, pos)?;
                items.push(item);
                pos = next;
            }
            None => return Err(BencodeError::MalformedInput("list without terminator")),
        }
    }
}

fn decode_dict(input: &[u8], pos: usize) -> Result<(Value, usize)> {
    let mut map = BTreeMap::new();
    let mut pos = pos + 1;
    loop {
        match input.get(pos) {
            Some(b'e') => return Ok((Value::Dict(map), pos + 1)),
            Some(b'0'..=b'9') => {
                let (key, after_key) = decode_bytes(input, pos)?;
                let (value, next) = decode_at(input, after_key)?;
                map.insert(key, value);
                pos = next;
            }
            Some(_) => return Err(BencodeError::MalformedInput("non-string dict key")),
            None => return Err(BencodeError::MalformedInput("dict without terminator")),
        }
    }
}

/// Encode a value canonically. Dict keys come out in lexicographic byte
/// order; `decode(encode(v)) == v` for every value.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::Int(number) => {
            out.push(b'i');
            out.extend_from_slice(number.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => encode_seq(b'l', items, out),
        Value::Tuple(items) => encode_seq(b't', items, out),
        Value::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_seq(prefix: u8, items: &[Value], out: &mut Vec<u8>) {
    out.push(prefix);
    for item in items {
        encode_into(item, out);
    }
    out.push(b'e');
}
