use bytes::BytesMut;

use crate::error::{DnsError, Result};

/// Fixed size of a DNS message header.
pub const HEADER_SIZE: usize = 12;
/// Classic maximum UDP payload when EDNS is not in play (RFC 1035).
pub const MAX_UDP_SIZE: u16 = 512;
/// Default UDP payload size advertised in our OPT RR (RFC 6891 suggestion).
pub const DEFAULT_EDNS_SIZE: u16 = 1280;
/// Local upper bound for EDNS payload sizes we will advertise or buffer for.
pub const MAX_EDNS_SIZE: u16 = 4096;
/// Wire size of the OPT pseudo-RR we append: root name (1) + type (2) +
/// class (2) + ttl (4) + rdlength (2).
pub const EDNS_FIXED_SIZE: usize = 11;

const MAX_NAME_SIZE: usize = 255;
const MAX_LABEL_SIZE: usize = 63;
const MAX_POINTER_HOPS: usize = 128;

const TYPE_OPT: u16 = 41;

/// DNS record type as a raw 16-bit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: RecordType = RecordType(1);
    pub const NS: RecordType = RecordType(2);
    pub const CNAME: RecordType = RecordType(5);
    pub const SOA: RecordType = RecordType(6);
    pub const PTR: RecordType = RecordType(12);
    pub const MX: RecordType = RecordType(15);
    pub const TXT: RecordType = RecordType(16);
    pub const AAAA: RecordType = RecordType(28);
    pub const SRV: RecordType = RecordType(33);
    pub const OPT: RecordType = RecordType(TYPE_OPT);
    pub const ANY: RecordType = RecordType(255);
}

impl std::str::FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::NS),
            "CNAME" => Ok(RecordType::CNAME),
            "SOA" => Ok(RecordType::SOA),
            "PTR" => Ok(RecordType::PTR),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "AAAA" => Ok(RecordType::AAAA),
            "SRV" => Ok(RecordType::SRV),
            "ANY" => Ok(RecordType::ANY),
            other => other
                .parse::<u16>()
                .map(RecordType)
                .map_err(|_| DnsError::BadQuery),
        }
    }
}

/// DNS record class as a raw 16-bit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordClass(pub u16);

impl RecordClass {
    pub const IN: RecordClass = RecordClass(1);
    pub const CH: RecordClass = RecordClass(3);
    pub const ANY: RecordClass = RecordClass(255);
}

/// One entry of a question section, with the name already canonicalized to
/// lowercase dotted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
}

/// Encode `name` into wire label format, appending to `out`.
///
/// Rejects empty labels, labels over 63 octets, and names whose encoded form
/// exceeds 255 octets. A single trailing dot is accepted; `""` and `"."`
/// encode the root.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_SIZE {
                return Err(DnsError::BadName);
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    if out.len() - start > MAX_NAME_SIZE {
        return Err(DnsError::BadName);
    }
    Ok(())
}

/// Build an encoded request for a single question, in length-prefixed form:
/// the first two bytes are the big-endian message length, usable directly for
/// TCP transmission; the UDP payload is everything past them.
///
/// When `edns_size` is set, an OPT pseudo-RR advertising that payload size is
/// appended and ARCOUNT is set to 1.
pub fn build_query(
    id: u16,
    name: &str,
    rtype: RecordType,
    rclass: RecordClass,
    recursion_desired: bool,
    edns_size: Option<u16>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 + HEADER_SIZE + name.len() + 2 + 4 + EDNS_FIXED_SIZE);
    buf.extend_from_slice(&[0, 0]); // length prefix, patched below

    buf.extend_from_slice(&id.to_be_bytes());
    let flags: u16 = if recursion_desired { 0x0100 } else { 0 };
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    let arcount: u16 = if edns_size.is_some() { 1 } else { 0 };
    buf.extend_from_slice(&arcount.to_be_bytes());

    encode_name(name, &mut buf)?;
    buf.extend_from_slice(&rtype.0.to_be_bytes());
    buf.extend_from_slice(&rclass.0.to_be_bytes());

    if let Some(size) = edns_size {
        buf.push(0); // root name
        buf.extend_from_slice(&TYPE_OPT.to_be_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // extended rcode, version, flags
        buf.extend_from_slice(&0u16.to_be_bytes()); // rdlength
    }

    write_length_prefix(&mut buf)?;
    Ok(buf)
}

/// Wrap a raw DNS message in the two-byte length prefix used for TCP.
pub fn prefix_message(message: &[u8]) -> Result<Vec<u8>> {
    if message.len() < HEADER_SIZE {
        return Err(DnsError::BadQuery);
    }
    let mut buf = Vec::with_capacity(2 + message.len());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(message);
    write_length_prefix(&mut buf)?;
    Ok(buf)
}

fn write_length_prefix(buf: &mut Vec<u8>) -> Result<()> {
    let len = buf.len() - 2;
    if len > u16::MAX as usize {
        return Err(DnsError::BadQuery);
    }
    buf[0] = (len >> 8) as u8;
    buf[1] = (len & 0xff) as u8;
    Ok(())
}

/// Overwrite the transaction id of a length-prefixed request.
pub fn set_query_id(tcpbuf: &mut [u8], id: u16) {
    tcpbuf[2..4].copy_from_slice(&id.to_be_bytes());
}

/// Remove the trailing OPT pseudo-RR from a length-prefixed request, clearing
/// ARCOUNT and rewriting the length prefix. The caller must know the request
/// was built with EDNS.
pub fn strip_edns(tcpbuf: &mut Vec<u8>) {
    debug_assert!(tcpbuf.len() >= 2 + HEADER_SIZE + EDNS_FIXED_SIZE);
    tcpbuf.truncate(tcpbuf.len() - EDNS_FIXED_SIZE);
    let len = tcpbuf.len() - 2;
    tcpbuf[0] = (len >> 8) as u8;
    tcpbuf[1] = (len & 0xff) as u8;
    // ARCOUNT sits at message offset 10.
    tcpbuf[2 + 10] = 0;
    tcpbuf[2 + 11] = 0;
}

/// Split one length-prefixed DNS message off the front of a TCP receive
/// buffer, or return `None` if a complete frame has not accumulated yet.
/// The returned frame still carries its two-byte prefix.
pub fn take_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    if buf.len() < 2 {
        return None;
    }
    let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + frame_len {
        return None;
    }
    Some(buf.split_to(2 + frame_len))
}

/// Borrowed view over a raw DNS message; header fields are decoded on access
/// and the question section on demand.
#[derive(Debug, Clone, Copy)]
pub struct MessageView<'a> {
    msg: &'a [u8],
}

impl<'a> MessageView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<MessageView<'a>> {
        if msg.len() < HEADER_SIZE {
            return Err(DnsError::BadResp);
        }
        Ok(MessageView { msg })
    }

    fn be16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.msg[off], self.msg[off + 1]])
    }

    pub fn id(&self) -> u16 {
        self.be16(0)
    }

    fn flags(&self) -> u16 {
        self.be16(2)
    }

    pub fn is_response(&self) -> bool {
        self.flags() & 0x8000 != 0
    }

    pub fn truncated(&self) -> bool {
        self.flags() & 0x0200 != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags() & 0x000f) as u8
    }

    pub fn qdcount(&self) -> u16 {
        self.be16(4)
    }

    pub fn ancount(&self) -> u16 {
        self.be16(6)
    }

    pub fn nscount(&self) -> u16 {
        self.be16(8)
    }

    pub fn arcount(&self) -> u16 {
        self.be16(10)
    }

    /// Decode the question section.
    pub fn questions(&self) -> Result<Vec<Question>> {
        let mut out = Vec::with_capacity(self.qdcount() as usize);
        let mut off = HEADER_SIZE;
        for _ in 0..self.qdcount() {
            let (name, next) = read_name(self.msg, off)?;
            if next + 4 > self.msg.len() {
                return Err(DnsError::BadResp);
            }
            out.push(Question {
                name,
                rtype: self.be16(next),
                rclass: self.be16(next + 2),
            });
            off = next + 4;
        }
        Ok(out)
    }

    /// True when the additional section carries an OPT pseudo-RR.
    pub fn has_opt_rr(&self) -> bool {
        self.scan_for_opt().unwrap_or(false)
    }

    fn scan_for_opt(&self) -> Result<bool> {
        let mut off = HEADER_SIZE;
        for _ in 0..self.qdcount() {
            off = skip_name(self.msg, off)?;
            off = checked_advance(self.msg, off, 4)?;
        }
        let skipped = self.ancount() as usize + self.nscount() as usize;
        for i in 0..skipped + self.arcount() as usize {
            off = skip_name(self.msg, off)?;
            if off + 10 > self.msg.len() {
                return Err(DnsError::BadResp);
            }
            let rtype = self.be16(off);
            let rdlength = self.be16(off + 8) as usize;
            off = checked_advance(self.msg, off, 10 + rdlength)?;
            if i >= skipped && rtype == TYPE_OPT {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn checked_advance(msg: &[u8], off: usize, by: usize) -> Result<usize> {
    let next = off + by;
    if next > msg.len() {
        return Err(DnsError::BadResp);
    }
    Ok(next)
}

/// Decode a possibly-compressed name starting at `off`, returning it in
/// lowercase dotted form together with the offset just past the name at the
/// top level (pointers are not followed for the return offset).
pub fn read_name(msg: &[u8], mut off: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut end = None;
    let mut hops = 0;
    loop {
        let len = *msg.get(off).ok_or(DnsError::BadResp)? as usize;
        if len == 0 {
            let end = end.unwrap_or(off + 1);
            return Ok((name, end));
        }
        if len & 0xc0 == 0xc0 {
            if off + 1 >= msg.len() {
                return Err(DnsError::BadResp);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DnsError::BadResp);
            }
            let target = ((len & 0x3f) << 8) | msg[off + 1] as usize;
            end.get_or_insert(off + 2);
            off = target;
            continue;
        }
        if len > MAX_LABEL_SIZE || off + 1 + len > msg.len() {
            return Err(DnsError::BadResp);
        }
        if !name.is_empty() {
            name.push('.');
        }
        for &b in &msg[off + 1..off + 1 + len] {
            name.push(b.to_ascii_lowercase() as char);
        }
        if name.len() > MAX_NAME_SIZE {
            return Err(DnsError::BadResp);
        }
        off += 1 + len;
    }
}

fn skip_name(msg: &[u8], mut off: usize) -> Result<usize> {
    loop {
        let len = *msg.get(off).ok_or(DnsError::BadResp)? as usize;
        if len == 0 {
            return Ok(off + 1);
        }
        if len & 0xc0 == 0xc0 {
            return checked_advance(msg, off, 2);
        }
        off = checked_advance(msg, off, 1 + len)?;
    }
}

/// Compare the question sections of a submitted request (UDP payload form)
/// and a response. The question count must match and every entry must agree
/// on name (case-insensitively), type, and class.
pub fn same_questions(request: &[u8], response: &[u8]) -> bool {
    let (Ok(req), Ok(resp)) = (MessageView::parse(request), MessageView::parse(response)) else {
        return false;
    };
    let (Ok(req_q), Ok(resp_q)) = (req.questions(), resp.questions()) else {
        return false;
    };
    req_q == resp_q
}
