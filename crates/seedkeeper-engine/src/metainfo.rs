//! Descriptor parsing: bencoded descriptor files and magnet URIs.

use sha1::{Digest, Sha1};
use url::Url;

const MAX_DEPTH: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("descriptor truncated")]
    Truncated,
    #[error("unexpected byte {found:#04x} at offset {at}")]
    Unexpected { at: usize, found: u8 },
    #[error("malformed integer at offset {0}")]
    InvalidInteger(usize),
    #[error("trailing bytes after offset {0}")]
    TrailingBytes(usize),
    #[error("nesting deeper than 64 levels")]
    TooDeep,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
    #[error("unsafe path component in `{0}`")]
    UnsafePath(String),
    #[error("invalid magnet uri: {0}")]
    InvalidMagnet(String),
}

/// A decoded bencode value borrowing from the input buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value<'a> {
    Int(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(Vec<(&'a [u8], Value<'a>)>),
}

impl<'a> Value<'a> {
    pub fn get(&self, key: &str) -> Option<&Value<'a>> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| *k == key.as_bytes())
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Result<u8, MetainfoError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(MetainfoError::Truncated)
    }

    fn expect(&mut self, byte: u8) -> Result<(), MetainfoError> {
        let found = self.peek()?;
        if found != byte {
            return Err(MetainfoError::Unexpected {
                at: self.pos,
                found,
            });
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Value<'a>, MetainfoError> {
        if depth > MAX_DEPTH {
            return Err(MetainfoError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.int().map(Value::Int),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = Vec::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?;
                    let value = self.value(depth + 1)?;
                    entries.push((key, value));
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            found => Err(MetainfoError::Unexpected {
                at: self.pos,
                found,
            }),
        }
    }

    fn int(&mut self) -> Result<i64, MetainfoError> {
        let start = self.pos;
        self.expect(b'i')?;
        let end = self.input[self.pos..]
            .iter()
            .position(|b| *b == b'e')
            .map(|offset| self.pos + offset)
            .ok_or(MetainfoError::Truncated)?;
        let digits = std::str::from_utf8(&self.input[self.pos..end])
            .map_err(|_| MetainfoError::InvalidInteger(start))?;
        // i-0e and leading zeros are not canonical
        if digits.is_empty()
            || digits == "-0"
            || (digits.len() > 1 && digits.starts_with('0'))
            || digits.starts_with("-0")
        {
            return Err(MetainfoError::InvalidInteger(start));
        }
        let value = digits
            .parse::<i64>()
            .map_err(|_| MetainfoError::InvalidInteger(start))?;
        self.pos = end + 1;
        Ok(value)
    }

    fn bytes(&mut self) -> Result<&'a [u8], MetainfoError> {
        let start = self.pos;
        let colon = self.input[self.pos..]
            .iter()
            .position(|b| *b == b':')
            .map(|offset| self.pos + offset)
            .ok_or(MetainfoError::Truncated)?;
        let len = std::str::from_utf8(&self.input[self.pos..colon])
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(MetainfoError::InvalidInteger(start))?;
        let begin = colon + 1;
        let end = begin.checked_add(len).ok_or(MetainfoError::Truncated)?;
        if end > self.input.len() {
            return Err(MetainfoError::Truncated);
        }
        self.pos = end;
        Ok(&self.input[begin..end])
    }
}

/// Decode a complete bencoded buffer.
pub fn decode(input: &[u8]) -> Result<Value<'_>, MetainfoError> {
    let mut decoder = Decoder::new(input);
    let value = decoder.value(0)?;
    if decoder.pos != input.len() {
        return Err(MetainfoError::TrailingBytes(decoder.pos));
    }
    Ok(value)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save directory, `/`-separated.
    pub path: String,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metainfo {
    pub name: String,
    pub files: Vec<FileEntry>,
    /// v1 info hash: lowercase hex SHA-1 of the bencoded `info` dictionary,
    /// the same value a magnet link carries in `xt=urn:btih:`.
    pub info_hash: String,
    pub piece_length: u64,
    pub trackers: Vec<String>,
}

impl Metainfo {
    /// Parse the bytes of a descriptor file.
    pub fn from_bytes(input: &[u8]) -> Result<Self, MetainfoError> {
        let mut decoder = Decoder::new(input);
        decoder.expect(b'd')?;
        let mut info: Option<(Value<'_>, &[u8])> = None;
        let mut trackers = Vec::new();
        while decoder.peek()? != b'e' {
            let key = decoder.bytes()?;
            let start = decoder.pos;
            let value = decoder.value(1)?;
            let raw = &input[start..decoder.pos];
            match key {
                b"info" => info = Some((value, raw)),
                b"announce" => {
                    if let Some(url) = value.as_str() {
                        push_unique(&mut trackers, url);
                    }
                }
                b"announce-list" => {
                    for tier in value.as_list().unwrap_or_default() {
                        for url in tier.as_list().unwrap_or_default() {
                            if let Some(url) = url.as_str() {
                                push_unique(&mut trackers, url);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        decoder.pos += 1;
        if decoder.pos != input.len() {
            return Err(MetainfoError::TrailingBytes(decoder.pos));
        }

        let (info, raw_info) = info.ok_or(MetainfoError::MissingField("info"))?;
        let name = info
            .get("name.utf-8")
            .or_else(|| info.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(MetainfoError::MissingField("name"))?;
        check_component(&name)?;
        let piece_length = match info.get("piece length").and_then(Value::as_int) {
            Some(v) if v > 0 => v as u64,
            Some(_) => return Err(MetainfoError::InvalidField("piece length")),
            None => 0,
        };

        let files = match info.get("files") {
            Some(list) => {
                let list = list
                    .as_list()
                    .ok_or(MetainfoError::InvalidField("files"))?;
                let mut files = Vec::with_capacity(list.len());
                for entry in list {
                    files.push(multi_file_entry(&name, entry)?);
                }
                files
            }
            None => vec![FileEntry {
                path: name.clone(),
                length: length_of(&info)?,
            }],
        };

        Ok(Self {
            name,
            files,
            info_hash: hex::encode(Sha1::digest(raw_info)),
            piece_length,
            trackers,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.length))
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn length_of(dict: &Value<'_>) -> Result<u64, MetainfoError> {
    match dict.get("length").and_then(Value::as_int) {
        Some(v) if v >= 0 => Ok(v as u64),
        Some(_) => Err(MetainfoError::InvalidField("length")),
        None => Err(MetainfoError::MissingField("length")),
    }
}

fn multi_file_entry(root: &str, entry: &Value<'_>) -> Result<FileEntry, MetainfoError> {
    let length = length_of(entry)?;
    let parts = entry
        .get("path.utf-8")
        .or_else(|| entry.get("path"))
        .and_then(Value::as_list)
        .ok_or(MetainfoError::MissingField("path"))?;
    if parts.is_empty() {
        return Err(MetainfoError::InvalidField("path"));
    }
    let mut path = String::from(root);
    for part in parts {
        let part = part.as_str().ok_or(MetainfoError::InvalidField("path"))?;
        check_component(part)?;
        path.push('/');
        path.push_str(part);
    }
    Ok(FileEntry { path, length })
}

fn check_component(part: &str) -> Result<(), MetainfoError> {
    if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\', '\0']) {
        return Err(MetainfoError::UnsafePath(part.to_string()));
    }
    Ok(())
}

/// A parsed `magnet:` peer-discovery URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagnetLink {
    /// Lowercase hex info-hash.
    pub info_hash: String,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let url = Url::parse(uri.trim())
            .map_err(|err| MetainfoError::InvalidMagnet(err.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MetainfoError::InvalidMagnet(format!(
                "unexpected scheme `{}`",
                url.scheme()
            )));
        }
        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(normalize_btih(hash)?);
                    }
                }
                "dn" if !value.is_empty() => display_name = Some(value.into_owned()),
                "tr" => push_unique(&mut trackers, &value),
                _ => {}
            }
        }
        let info_hash = info_hash
            .ok_or_else(|| MetainfoError::InvalidMagnet("missing xt=urn:btih".into()))?;
        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    pub fn is_magnet(candidate: &str) -> bool {
        candidate.trim_start().starts_with("magnet:?")
    }
}

fn normalize_btih(hash: &str) -> Result<String, MetainfoError> {
    match hash.len() {
        40 if hash.bytes().all(|b| b.is_ascii_hexdigit()) => Ok(hash.to_ascii_lowercase()),
        32 => base32_decode(hash)
            .map(hex::encode)
            .ok_or_else(|| MetainfoError::InvalidMagnet(format!("bad base32 hash `{hash}`"))),
        _ => Err(MetainfoError::InvalidMagnet(format!(
            "bad info-hash `{hash}`"
        ))),
    }
}

// RFC 4648 alphabet, no padding; 32 chars decode to 20 bytes.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for ch in input.bytes() {
        let v = match ch.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u64::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

/// Encode a single-file or multi-file descriptor. Used by tests and the
/// simulated engine to fabricate content.
pub fn encode_descriptor(name: &str, files: &[(&str, u64)], piece_length: u64) -> Vec<u8> {
    fn bstr(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(s.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(s.as_bytes());
    }
    fn bint(out: &mut Vec<u8>, v: u64) {
        out.push(b'i');
        out.extend_from_slice(v.to_string().as_bytes());
        out.push(b'e');
    }

    let mut out = Vec::new();
    out.push(b'd');
    bstr(&mut out, "info");
    out.push(b'd');
    if let [(single, length)] = files {
        if *single == name {
            bstr(&mut out, "length");
            bint(&mut out, *length);
        }
    }
    if !(files.len() == 1 && files[0].0 == name) {
        bstr(&mut out, "files");
        out.push(b'l');
        for (path, length) in files {
            out.push(b'd');
            bstr(&mut out, "length");
            bint(&mut out, *length);
            bstr(&mut out, "path");
            out.push(b'l');
            for part in path.split('/') {
                bstr(&mut out, part);
            }
            out.push(b'e');
            out.push(b'e');
        }
        out.push(b'e');
    }
    bstr(&mut out, "name");
    bstr(&mut out, name);
    bstr(&mut out, "piece length");
    bint(&mut out, piece_length);
    out.push(b'e');
    out.push(b'e');
    out
}
