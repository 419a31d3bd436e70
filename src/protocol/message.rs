//! JPP-stream message parsing
//!
//! A JPP-stream is a sequence of messages, each a variable-length header
//! followed by a byte range of one data-bin. Header integers use the VBAS
//! encoding: seven payload bits per byte, high bit set on every byte except the
//! last. The first header byte additionally packs
//!
//! ```text
//!   bit 7     continuation
//!   bits 6-5  class/codestream indicator (1: neither, 2: class, 3: class and CSn)
//!   bit 4     message holds the last byte of its data-bin
//!   bits 3-0  first bits of the in-class identifier
//! ```
//!
//! Omitted class and codestream fields repeat the previous message's values. A
//! zero first byte introduces the end-of-response message instead.
//!
//! [`MessageParser`] is incremental: it is fed whatever body bytes have arrived
//! and reports how many it consumed once a whole message is available.

use std::fmt;

use crate::{Result, StreamError};

/// VBAS integers longer than this cannot represent a `u64`.
const MAX_VBAS_BYTES: usize = 9;

/// Data-bin class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinClass {
    Precinct,
    ExtendedPrecinct,
    TileHeader,
    Tile,
    ExtendedTile,
    MainHeader,
    Metadata,
    Other(u64),
}

impl BinClass {
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => BinClass::Precinct,
            1 => BinClass::ExtendedPrecinct,
            2 => BinClass::TileHeader,
            4 => BinClass::Tile,
            5 => BinClass::ExtendedTile,
            6 => BinClass::MainHeader,
            8 => BinClass::Metadata,
            other => BinClass::Other(other),
        }
    }

    pub fn code(&self) -> u64 {
        match *self {
            BinClass::Precinct => 0,
            BinClass::ExtendedPrecinct => 1,
            BinClass::TileHeader => 2,
            BinClass::Tile => 4,
            BinClass::ExtendedTile => 5,
            BinClass::MainHeader => 6,
            BinClass::Metadata => 8,
            BinClass::Other(code) => code,
        }
    }

    /// Extended classes carry an auxiliary VBAS after the length.
    pub fn has_aux(&self) -> bool {
        self.code() & 1 == 1
    }

    /// Index of this class in a `model=` descriptor (`Hm`, `H`, `P`, `T`, `M`).
    pub fn model_prefix(&self) -> Option<&'static str> {
        match self {
            BinClass::MainHeader => Some("Hm"),
            BinClass::TileHeader => Some("H"),
            BinClass::Precinct | BinClass::ExtendedPrecinct => Some("P"),
            BinClass::Tile | BinClass::ExtendedTile => Some("T"),
            BinClass::Metadata => Some("M"),
            BinClass::Other(_) => None,
        }
    }
}

/// Fully qualified data-bin identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataBinId {
    pub class: BinClass,
    /// Codestream index; in a movie each codestream is one frame.
    pub codestream: u64,
    pub in_class_id: u64,
}

impl DataBinId {
    pub fn new(class: BinClass, codestream: u64, in_class_id: u64) -> Self {
        Self { class, codestream, in_class_id }
    }
}

impl fmt::Display for DataBinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}:{}]", self.class.code(), self.codestream, self.in_class_id)
    }
}

/// Why the server ended a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EorReason {
    ImageDone,
    WindowDone,
    WindowChange,
    ByteLimit,
    QualityLimit,
    SessionLimit,
    ResponseLimit,
    Unspecified,
    Other(u8),
}

impl EorReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => EorReason::ImageDone,
            2 => EorReason::WindowDone,
            3 => EorReason::WindowChange,
            4 => EorReason::ByteLimit,
            5 => EorReason::QualityLimit,
            6 => EorReason::SessionLimit,
            7 => EorReason::ResponseLimit,
            0xFF => EorReason::Unspecified,
            other => EorReason::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match *self {
            EorReason::ImageDone => 1,
            EorReason::WindowDone => 2,
            EorReason::WindowChange => 3,
            EorReason::ByteLimit => 4,
            EorReason::QualityLimit => 5,
            EorReason::SessionLimit => 6,
            EorReason::ResponseLimit => 7,
            EorReason::Unspecified => 0xFF,
            EorReason::Other(code) => code,
        }
    }

    /// Whether the server delivered everything the request asked for.
    pub fn satisfies_request(&self) -> bool {
        matches!(self, EorReason::ImageDone | EorReason::WindowDone)
    }
}

/// Header of one parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentHeader {
    Data {
        bin: DataBinId,
        offset: u64,
        /// Payload ends at the last byte of the data-bin
        complete: bool,
        aux: Option<u64>,
    },
    End(EorReason),
}

/// A parsed message together with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub header: SegmentHeader,
    pub payload: Vec<u8>,
    /// Cumulative body bytes of the current response up to and including this message
    pub response_size: u64,
}

impl DataSegment {
    pub fn data(bin: DataBinId, offset: u64, payload: Vec<u8>, complete: bool) -> Self {
        Self {
            header: SegmentHeader::Data { bin, offset, complete, aux: None },
            response_size: payload.len() as u64,
            payload,
        }
    }

    pub fn end(reason: EorReason) -> Self {
        Self { header: SegmentHeader::End(reason), payload: Vec::new(), response_size: 0 }
    }

    pub fn with_response_size(mut self, response_size: u64) -> Self {
        self.response_size = response_size;
        self
    }

    pub fn is_end(&self) -> bool {
        matches!(self.header, SegmentHeader::End(_))
    }

    /// Frame the payload belongs to, for data messages.
    pub fn frame(&self) -> Option<u32> {
        match self.header {
            SegmentHeader::Data { bin, .. } => u32::try_from(bin.codestream).ok(),
            SegmentHeader::End(_) => None,
        }
    }
}

/// Byte cursor that reports "need more input" instead of failing.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn vbas(&mut self) -> Result<Option<u64>> {
        let mut value = 0u64;
        for _ in 0..MAX_VBAS_BYTES {
            let Some(b) = self.byte() else { return Ok(None) };
            value = (value << 7) | u64::from(b & 0x7F);
            if b & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Err(StreamError::protocol("jpp-stream", "VBAS integer too long"))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }
}

macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Incremental JPP-stream message parser.
///
/// Keeps the class and codestream of the last message so abbreviated headers
/// can be resolved. State only advances when a whole message was parsed.
#[derive(Debug, Default)]
pub struct MessageParser {
    last_class: u64,
    last_codestream: u64,
    response_size: u64,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new response; message header defaults carry over, the size does not.
    pub fn begin_response(&mut self) {
        self.response_size = 0;
    }

    pub fn response_size(&self) -> u64 {
        self.response_size
    }

    /// Parse one message from the front of `buf`.
    ///
    /// Returns the message and the number of bytes consumed, or `None` when
    /// `buf` does not yet hold a complete message.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Option<(DataSegment, usize)>> {
        let mut cur = Cursor { buf, pos: 0 };
        let first = need!(cur.byte());

        if first == 0 {
            let reason = EorReason::from_code(need!(cur.byte()));
            let len = need!(cur.vbas()?);
            let len = usize::try_from(len)
                .map_err(|_| StreamError::protocol("jpp-stream", "EOR body too large"))?;
            need!(cur.take(len));
            self.response_size += cur.pos as u64;
            let segment = DataSegment::end(reason).with_response_size(self.response_size);
            return Ok(Some((segment, cur.pos)));
        }

        let indicator = (first >> 5) & 0x03;
        let complete = first & 0x10 != 0;
        let mut in_class_id = u64::from(first & 0x0F);
        let mut continued = first & 0x80 != 0;
        let mut extra = 0;
        while continued {
            extra += 1;
            if extra >= MAX_VBAS_BYTES {
                return Err(StreamError::protocol("jpp-stream", "in-class identifier too long"));
            }
            let b = need!(cur.byte());
            in_class_id = (in_class_id << 7) | u64::from(b & 0x7F);
            continued = b & 0x80 != 0;
        }

        let (class, codestream) = match indicator {
            1 => (self.last_class, self.last_codestream),
            2 => (need!(cur.vbas()?), self.last_codestream),
            3 => {
                let class = need!(cur.vbas()?);
                (class, need!(cur.vbas()?))
            }
            _ => {
                return Err(StreamError::protocol(
                    "jpp-stream",
                    format!("reserved header indicator in byte {:#04x}", first),
                ));
            }
        };

        let offset = need!(cur.vbas()?);
        let len = need!(cur.vbas()?);
        let class = BinClass::from_code(class);
        let aux = if class.has_aux() { Some(need!(cur.vbas()?)) } else { None };
        let len = usize::try_from(len)
            .map_err(|_| StreamError::protocol("jpp-stream", "message length too large"))?;
        let payload = need!(cur.take(len)).to_vec();

        self.last_class = class.code();
        self.last_codestream = codestream;
        self.response_size += cur.pos as u64;

        let segment = DataSegment {
            header: SegmentHeader::Data {
                bin: DataBinId::new(class, codestream, in_class_id),
                offset,
                complete,
                aux,
            },
            payload,
            response_size: self.response_size,
        };
        Ok(Some((segment, cur.pos)))
    }
}

/// Append `value` as VBAS.
pub fn encode_vbas(value: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut v = value;
    loop {
        groups[n] = (v & 0x7F) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | cont);
    }
}

/// Encode a full-form data message (class and codestream always present).
///
/// Used by the fake servers in tests and benches.
pub fn encode_message(bin: DataBinId, offset: u64, payload: &[u8], complete: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    // Split the in-class id into the 4 bits of the first byte plus 7-bit groups.
    let mut tail = Vec::new();
    let mut id = bin.in_class_id;
    while id > 0x0F {
        tail.push((id & 0x7F) as u8);
        id >>= 7;
    }
    let mut first = 0x60 | (id as u8 & 0x0F);
    if complete {
        first |= 0x10;
    }
    if !tail.is_empty() {
        first |= 0x80;
    }
    out.push(first);
    for i in (0..tail.len()).rev() {
        let cont = if i > 0 { 0x80 } else { 0 };
        out.push(tail[i] | cont);
    }
    encode_vbas(bin.class.code(), &mut out);
    encode_vbas(bin.codestream, &mut out);
    encode_vbas(offset, &mut out);
    encode_vbas(payload.len() as u64, &mut out);
    if bin.class.has_aux() {
        encode_vbas(0, &mut out);
    }
    out.extend_from_slice(payload);
    out
}

/// Encode an end-of-response message without body.
pub fn encode_eor(reason: EorReason) -> Vec<u8> {
    vec![0x00, reason.code(), 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_full_form_header() {
        // indicator 3, complete, id 5; class 6 (main header), CSn 2, offset 0, len 3
        let bytes = [0x75, 0x06, 0x02, 0x00, 0x03, 0xAA, 0xBB, 0xCC];
        let mut parser = MessageParser::new();
        let (segment, used) = parser.parse(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(segment.payload, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(segment.frame(), Some(2));
        assert_eq!(
            segment.header,
            SegmentHeader::Data {
                bin: DataBinId::new(BinClass::MainHeader, 2, 5),
                offset: 0,
                complete: true,
                aux: None,
            }
        );
    }

    #[test]
    fn abbreviated_headers_reuse_previous_fields() {
        let mut stream = encode_message(DataBinId::new(BinClass::Precinct, 7, 1), 0, b"ab", false);
        // indicator 1: class and CSn from the previous message, id 2, offset 4, len 1
        stream.extend_from_slice(&[0x22, 0x04, 0x01, b'z']);
        // indicator 2: class 2 given, CSn still 7
        stream.extend_from_slice(&[0x40, 0x02, 0x00, 0x00]);

        let mut parser = MessageParser::new();
        let (first, n1) = parser.parse(&stream).unwrap().unwrap();
        let (second, n2) = parser.parse(&stream[n1..]).unwrap().unwrap();
        let (third, n3) = parser.parse(&stream[n1 + n2..]).unwrap().unwrap();
        assert_eq!(n1 + n2 + n3, stream.len());

        assert_eq!(first.frame(), Some(7));
        match second.header {
            SegmentHeader::Data { bin, offset, .. } => {
                assert_eq!(bin, DataBinId::new(BinClass::Precinct, 7, 2));
                assert_eq!(offset, 4);
            }
            other => panic!("unexpected header {:?}", other),
        }
        match third.header {
            SegmentHeader::Data { bin, .. } => assert_eq!(bin.class, BinClass::TileHeader),
            other => panic!("unexpected header {:?}", other),
        }
        assert_eq!(third.response_size, stream.len() as u64);
    }

    #[test]
    fn partial_input_consumes_nothing() {
        let bytes = encode_message(DataBinId::new(BinClass::Precinct, 1, 300), 10, &[1, 2, 3, 4], true);
        let mut parser = MessageParser::new();
        for cut in 0..bytes.len() {
            assert!(parser.parse(&bytes[..cut]).unwrap().is_none(), "cut at {}", cut);
        }
        let (segment, used) = parser.parse(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        match segment.header {
            SegmentHeader::Data { bin, offset, complete, .. } => {
                assert_eq!(bin.in_class_id, 300);
                assert_eq!(offset, 10);
                assert!(complete);
            }
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[test]
    fn extended_classes_carry_aux() {
        let bytes = encode_message(DataBinId::new(BinClass::ExtendedPrecinct, 0, 3), 0, b"x", false);
        let (segment, _) = MessageParser::new().parse(&bytes).unwrap().unwrap();
        assert!(matches!(segment.header, SegmentHeader::Data { aux: Some(0), .. }));
    }

    #[test]
    fn end_of_response_reasons() {
        let (segment, used) = MessageParser::new().parse(&encode_eor(EorReason::WindowDone)).unwrap().unwrap();
        assert_eq!(used, 3);
        assert_eq!(segment.header, SegmentHeader::End(EorReason::WindowDone));
        assert!(EorReason::WindowDone.satisfies_request());
        assert!(EorReason::ImageDone.satisfies_request());
        assert!(!EorReason::ByteLimit.satisfies_request());
        assert!(!EorReason::from_code(0xFF).satisfies_request());

        // EOR with a two byte body
        let bytes = [0x00, 0x03, 0x02, 0x10, 0x20];
        let (segment, used) = MessageParser::new().parse(&bytes).unwrap().unwrap();
        assert_eq!(used, 5);
        assert_eq!(segment.header, SegmentHeader::End(EorReason::WindowChange));
    }

    #[test]
    fn malformed_headers_are_protocol_errors() {
        let err = MessageParser::new().parse(&[0x10, 0x00]).unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));

        let long = [0x61, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(MessageParser::new().parse(&long).is_err());
    }

    proptest! {
        #[test]
        fn vbas_decodes_what_it_encodes(value in any::<u64>().prop_map(|v| v >> 1)) {
            let mut bytes = Vec::new();
            encode_vbas(value, &mut bytes);
            let mut cursor = Cursor { buf: &bytes, pos: 0 };
            prop_assert_eq!(cursor.vbas().unwrap(), Some(value));
            prop_assert_eq!(cursor.pos, bytes.len());
        }
    }
}
