//! Generic-netlink framing for the taskstats family.
//!
//! Requests are encoded into a caller-owned buffer. Replies are decoded with
//! [`AttrCursor`], which checks every attribute's declared length against
//! the bytes actually remaining before advancing, so a truncated or corrupt
//! kernel reply yields a [`WireError`] instead of an out-of-bounds read.

/// `struct nlmsghdr` length.
pub const NLMSG_HDRLEN: usize = 16;
/// `struct genlmsghdr` length.
pub const GENL_HDRLEN: usize = 4;
/// `struct nlattr` length.
pub const NLA_HDRLEN: usize = 4;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLMSG_ERROR: u16 = 0x02;
pub const NLMSG_DONE: u16 = 0x03;

/// Generic netlink controller family.
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

pub const TASKSTATS_GENL_NAME: &str = "TASKSTATS";
pub const TASKSTATS_GENL_VERSION: u8 = 1;
pub const TASKSTATS_CMD_GET: u8 = 1;
pub const TASKSTATS_CMD_ATTR_PID: u16 = 1;

pub const TASKSTATS_TYPE_PID: u16 = 1;
pub const TASKSTATS_TYPE_TGID: u16 = 2;
pub const TASKSTATS_TYPE_STATS: u16 = 3;
pub const TASKSTATS_TYPE_AGGR_PID: u16 = 4;
pub const TASKSTATS_TYPE_AGGR_TGID: u16 = 5;

/// Strips the nested and byte-order flag bits from `nla_type`.
const NLA_TYPE_MASK: u16 = !((1 << 15) | (1 << 14));

// Offsets into `struct taskstats` (linux/taskstats.h); layout is append-only
// across versions so older fields never move.
pub(crate) const TS_VERSION: usize = 0;
pub(crate) const TS_CPU_COUNT: usize = 16;
pub(crate) const TS_CPU_DELAY_TOTAL: usize = 24;
pub(crate) const TS_BLKIO_COUNT: usize = 32;
pub(crate) const TS_BLKIO_DELAY_TOTAL: usize = 40;
pub(crate) const TS_SWAPIN_COUNT: usize = 48;
pub(crate) const TS_SWAPIN_DELAY_TOTAL: usize = 56;
pub(crate) const TS_AC_PID: usize = 128;
pub(crate) const TS_AC_UTIME: usize = 152;
pub(crate) const TS_AC_STIME: usize = 160;
pub(crate) const TS_READ_BYTES: usize = 248;
pub(crate) const TS_WRITE_BYTES: usize = 256;
pub(crate) const TS_CANCELLED_WRITE_BYTES: usize = 264;

/// Shortest stats payload we accept: everything up to `cancelled_write_bytes`.
pub const TASKSTATS_MIN_LEN: usize = TS_CANCELLED_WRITE_BYTES + 8;

/// Errors found while decoding a netlink frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {len} bytes is shorter than its {needed} byte header")]
    Truncated { len: usize, needed: usize },

    #[error("netlink message length {declared} does not fit the {available} bytes received")]
    BadMessageLength { declared: usize, available: usize },

    #[error("attribute length {declared} does not fit the {available} bytes remaining")]
    BadAttributeLength { declared: usize, available: usize },

    #[error("taskstats payload of {len} bytes is shorter than {min}")]
    ShortStats { len: usize, min: usize },

    #[error("attribute {attr} payload of {len} bytes is too short")]
    ShortAttribute { attr: u16, len: usize },
}

/// Rounds `len` up to the 4-byte netlink alignment.
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Some(u32::from_ne_bytes(raw))
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_ne_bytes(raw))
}

/// Encodes a single-attribute generic netlink request into `out`.
pub fn encode_request(
    out: &mut Vec<u8>,
    nlmsg_type: u16,
    seq: u32,
    genl_cmd: u8,
    nla_type: u16,
    nla_payload: &[u8],
) {
    let nla_len = NLA_HDRLEN + nla_payload.len();
    let total = NLMSG_HDRLEN + GENL_HDRLEN + align4(nla_len);

    out.clear();
    out.reserve(total);
    // struct nlmsghdr
    out.extend_from_slice(&(total as u32).to_ne_bytes());
    out.extend_from_slice(&nlmsg_type.to_ne_bytes());
    out.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    out.extend_from_slice(&seq.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    // struct genlmsghdr
    out.push(genl_cmd);
    out.push(TASKSTATS_GENL_VERSION);
    out.extend_from_slice(&0u16.to_ne_bytes());
    // struct nlattr + payload, padded
    out.extend_from_slice(&(nla_len as u16).to_ne_bytes());
    out.extend_from_slice(&nla_type.to_ne_bytes());
    out.extend_from_slice(nla_payload);
    out.resize(total, 0);
}

/// Encodes the controller query resolving the taskstats family id.
pub fn encode_family_request(out: &mut Vec<u8>, seq: u32) {
    let mut name = TASKSTATS_GENL_NAME.as_bytes().to_vec();
    name.push(0);
    encode_request(
        out,
        GENL_ID_CTRL,
        seq,
        CTRL_CMD_GETFAMILY,
        CTRL_ATTR_FAMILY_NAME,
        &name,
    );
}

/// Encodes a per-task statistics query.
pub fn encode_stats_request(out: &mut Vec<u8>, family_id: u16, seq: u32, tid: u32) {
    encode_request(
        out,
        family_id,
        seq,
        TASKSTATS_CMD_GET,
        TASKSTATS_CMD_ATTR_PID,
        &tid.to_ne_bytes(),
    );
}

/// Decoded `struct nlmsghdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

/// A validated netlink message: its header and the payload after the header.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub header: MessageHeader,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// Validates the first message of `frame` (the `NLMSG_OK` checks).
    pub fn parse(frame: &'a [u8]) -> Result<Self, WireError> {
        if frame.len() < NLMSG_HDRLEN {
            return Err(WireError::Truncated {
                len: frame.len(),
                needed: NLMSG_HDRLEN,
            });
        }
        let header = MessageHeader {
            len: read_u32(frame, 0).unwrap_or(0),
            msg_type: read_u16(frame, 4).unwrap_or(0),
            flags: read_u16(frame, 6).unwrap_or(0),
            seq: read_u32(frame, 8).unwrap_or(0),
            pid: read_u32(frame, 12).unwrap_or(0),
        };
        let declared = header.len as usize;
        if declared < NLMSG_HDRLEN || declared > frame.len() {
            return Err(WireError::BadMessageLength {
                declared,
                available: frame.len(),
            });
        }
        Ok(Self {
            header,
            payload: &frame[NLMSG_HDRLEN..declared],
        })
    }

    pub fn is_error(&self) -> bool {
        self.header.msg_type == NLMSG_ERROR
    }

    /// The (negative errno) code of an `NLMSG_ERROR` message.
    pub fn error_code(&self) -> Result<i32, WireError> {
        read_u32(self.payload, 0)
            .map(|v| v as i32)
            .ok_or(WireError::Truncated {
                len: self.payload.len(),
                needed: 4,
            })
    }

    /// Attributes following the generic netlink header.
    pub fn genl_attributes(&self) -> Result<AttrCursor<'a>, WireError> {
        if self.payload.len() < GENL_HDRLEN {
            return Err(WireError::Truncated {
                len: self.payload.len(),
                needed: GENL_HDRLEN,
            });
        }
        Ok(AttrCursor::new(&self.payload[GENL_HDRLEN..]))
    }
}

/// One netlink attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr<'a> {
    pub attr_type: u16,
    pub payload: &'a [u8],
}

impl<'a> Attr<'a> {
    /// Cursor over the attributes nested in this attribute's payload.
    pub fn nested(&self) -> AttrCursor<'a> {
        AttrCursor::new(self.payload)
    }

    pub fn as_u16(&self) -> Result<u16, WireError> {
        read_u16(self.payload, 0).ok_or(WireError::ShortAttribute {
            attr: self.attr_type,
            len: self.payload.len(),
        })
    }
}

/// Bounds-checked iterator over a run of netlink attributes.
///
/// Unknown attributes are skipped by their aligned length. After the first
/// error the cursor yields nothing more.
#[derive(Debug, Clone)]
pub struct AttrCursor<'a> {
    buf: &'a [u8],
}

impl<'a> AttrCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the first attribute of type `attr_type`, if any.
    pub fn find(self, attr_type: u16) -> Result<Option<Attr<'a>>, WireError> {
        for attr in self {
            let attr = attr?;
            if attr.attr_type == attr_type {
                return Ok(Some(attr));
            }
        }
        Ok(None)
    }
}

impl<'a> Iterator for AttrCursor<'a> {
    type Item = Result<Attr<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let available = self.buf.len();
        let declared = match read_u16(self.buf, 0) {
            Some(len) if available >= NLA_HDRLEN => len as usize,
            _ => {
                self.buf = &[];
                return Some(Err(WireError::Truncated {
                    len: available,
                    needed: NLA_HDRLEN,
                }));
            }
        };
        if declared < NLA_HDRLEN || declared > available {
            self.buf = &[];
            return Some(Err(WireError::BadAttributeLength {
                declared,
                available,
            }));
        }
        let attr_type = read_u16(self.buf, 2).unwrap_or(0) & NLA_TYPE_MASK;
        let payload = &self.buf[NLA_HDRLEN..declared];
        // The final attribute may omit its padding
        let advance = align4(declared).min(available);
        self.buf = &self.buf[advance..];
        Some(Ok(Attr { attr_type, payload }))
    }
}

/// The subset of `struct taskstats` this collector reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Taskstats {
    pub version: u16,
    pub ac_pid: u32,
    pub cpu_count: u64,
    pub cpu_delay_total: u64,
    pub blkio_count: u64,
    pub blkio_delay_total: u64,
    pub swapin_count: u64,
    pub swapin_delay_total: u64,
    pub ac_utime: u64,
    pub ac_stime: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cancelled_write_bytes: u64,
}

impl Taskstats {
    /// Decodes a `TASKSTATS_TYPE_STATS` payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < TASKSTATS_MIN_LEN {
            return Err(WireError::ShortStats {
                len: payload.len(),
                min: TASKSTATS_MIN_LEN,
            });
        }
        let u64_at = |offset| read_u64(payload, offset).unwrap_or(0);
        Ok(Self {
            version: read_u16(payload, TS_VERSION).unwrap_or(0),
            ac_pid: read_u32(payload, TS_AC_PID).unwrap_or(0),
            cpu_count: u64_at(TS_CPU_COUNT),
            cpu_delay_total: u64_at(TS_CPU_DELAY_TOTAL),
            blkio_count: u64_at(TS_BLKIO_COUNT),
            blkio_delay_total: u64_at(TS_BLKIO_DELAY_TOTAL),
            swapin_count: u64_at(TS_SWAPIN_COUNT),
            swapin_delay_total: u64_at(TS_SWAPIN_DELAY_TOTAL),
            ac_utime: u64_at(TS_AC_UTIME),
            ac_stime: u64_at(TS_AC_STIME),
            read_bytes: u64_at(TS_READ_BYTES),
            write_bytes: u64_at(TS_WRITE_BYTES),
            cancelled_write_bytes: u64_at(TS_CANCELLED_WRITE_BYTES),
        })
    }
}

/// Outcome of decoding a stats reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsReply {
    Stats(Taskstats),
    /// The kernel answered with an error (negative errno).
    Error(i32),
    /// A well-formed reply without a stats payload.
    Empty,
}

/// Walks a stats reply: top-level aggregate containers, then the stats
/// attribute nested in them.
pub fn parse_stats_reply(frame: &[u8]) -> Result<StatsReply, WireError> {
    let msg = Message::parse(frame)?;
    if msg.is_error() {
        return Ok(StatsReply::Error(msg.error_code()?));
    }
    if msg.header.msg_type == NLMSG_DONE {
        return Ok(StatsReply::Empty);
    }

    for attr in msg.genl_attributes()? {
        let attr = attr?;
        if attr.attr_type != TASKSTATS_TYPE_AGGR_PID && attr.attr_type != TASKSTATS_TYPE_AGGR_TGID
        {
            continue;
        }
        if let Some(stats) = attr.nested().find(TASKSTATS_TYPE_STATS)? {
            return Ok(StatsReply::Stats(Taskstats::decode(stats.payload)?));
        }
    }
    Ok(StatsReply::Empty)
}

/// Outcome of decoding the controller's family reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyReply {
    Id(u16),
    Error(i32),
    Missing,
}

/// Extracts `CTRL_ATTR_FAMILY_ID` from a controller reply.
pub fn parse_family_reply(frame: &[u8]) -> Result<FamilyReply, WireError> {
    let msg = Message::parse(frame)?;
    if msg.is_error() {
        return Ok(FamilyReply::Error(msg.error_code()?));
    }
    match msg.genl_attributes()?.find(CTRL_ATTR_FAMILY_ID)? {
        Some(attr) => Ok(FamilyReply::Id(attr.as_u16()?)),
        None => Ok(FamilyReply::Missing),
    }
}
