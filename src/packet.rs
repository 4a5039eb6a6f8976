use bytes::{Buf, BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::error::ScpError;

/// Destination of an SCP command: a chip in the fabric's 2D grid plus a core on
///  that chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoreAddr {
    pub x: u8,
    pub y: u8,
    pub cpu: u8,
}

/// Result code of an SCP response. The codec treats this as opaque envelope data;
///  only the bulk transfer machinery (and application code) interprets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    Ok = 0x80,
    BadLength = 0x81,
    BadChecksum = 0x82,
    BadCommand = 0x83,
    BadArgs = 0x84,
    BadPort = 0x85,
    PeerTimeout = 0x86,
    NoRoute = 0x87,
    BadCpu = 0x88,
    CpuDead = 0x89,
    #[num_enum(catch_all)]
    Other(u16),
}

/// An SCP request envelope before serialization. The codec imposes no validation
///  of command semantics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScpRequest<'a> {
    pub dest: CoreAddr,
    pub cmd: u16,
    pub args: &'a [u32],
    pub seq_num: u16,
    pub payload: &'a [u8],
}

/// Everything a response datagram carries above the raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScpResponse {
    pub rc: ResultCode,
    pub n_args: u8,
    pub args: [u32; Self::MAX_ARGS],
    pub payload: Vec<u8>,
}

impl ScpResponse {
    pub const MAX_ARGS: usize = 3;

    pub fn arg(&self, idx: usize) -> Option<u32> {
        if idx < self.n_args as usize {
            Some(self.args[idx])
        }
        else {
            None
        }
    }
}

/// fixed header: x, y, cpu, n_args (u8 each), cmd (u16), rc (u16), seq (u16)
pub const HEADER_LEN: usize = 10;
const SEQ_NUM_OFFSET: usize = 8;

impl<'a> ScpRequest<'a> {
    /// Serialize the request into a fresh buffer. Pure and allocation-local; the
    ///  payload follows the header unmodified.
    pub fn encode(&self) -> BytesMut {
        debug_assert!(self.args.len() <= ScpResponse::MAX_ARGS);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + 4 * self.args.len() + self.payload.len());
        buf.put_u8(self.dest.x);
        buf.put_u8(self.dest.y);
        buf.put_u8(self.dest.cpu);
        buf.put_u8(self.args.len() as u8);
        buf.put_u16(self.cmd);
        buf.put_u16(0); // rc, meaningful in responses only
        buf.put_u16(self.seq_num);
        for &arg in self.args {
            buf.put_u32(arg);
        }
        buf.put_slice(self.payload);
        buf
    }
}

impl ScpResponse {
    /// Deserialize a response datagram, header fields first, remainder as payload.
    ///  Fails iff the buffer cannot hold the fixed header and the argument words
    ///  the header announces.
    pub fn decode(mut buf: &[u8]) -> Result<ScpResponse, ScpError> {
        if buf.len() < HEADER_LEN {
            return Err(ScpError::MalformedPacket { len: buf.len() });
        }
        let full_len = buf.len();

        buf.advance(3); // x, y, cpu - echoed by the remote side, not needed for matching
        let n_args = buf.get_u8();
        let _cmd = buf.get_u16();
        let rc = ResultCode::from(buf.get_u16());
        let _seq_num = buf.get_u16();

        if n_args as usize > Self::MAX_ARGS || buf.remaining() < 4 * n_args as usize {
            return Err(ScpError::MalformedPacket { len: full_len });
        }

        let mut args = [0u32; Self::MAX_ARGS];
        for arg in args.iter_mut().take(n_args as usize) {
            *arg = buf.get_u32();
        }

        Ok(ScpResponse {
            rc,
            n_args,
            args,
            payload: buf.to_vec(),
        })
    }
}

/// Read the sequence number at its fixed header offset without parsing the rest.
///  `None` means the datagram is too short to be an SCP packet at all.
pub fn peek_seq_num(buf: &[u8]) -> Option<u16> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([buf[SEQ_NUM_OFFSET], buf[SEQ_NUM_OFFSET + 1]]))
}
