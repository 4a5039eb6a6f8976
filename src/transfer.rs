//! Bulk memory transfers: buffers bigger than the negotiated data-field length
//!  are split into chunk commands that travel through the regular admission
//!  pipeline, so up to the connection's concurrency bound is in flight at a time.
//!  Responses complete out of order; reassembly is keyed by buffer offset.

use std::cmp::min;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::ScpError;
use crate::packet::{CoreAddr, ResultCode};
use crate::slot::CmdResult;

/// SCP command codes used by the bulk transfer machinery.
pub const CMD_READ: u16 = 2;
pub const CMD_WRITE: u16 = 3;

struct PendingChunk {
    offset: usize,
    len: usize,
    result_rx: oneshot::Receiver<CmdResult>,
}

impl Connection {
    /// Read `len` bytes of remote memory starting at `base_addr`, chunked and
    ///  pipelined. The returned buffer is assembled in offset order regardless of
    ///  the order in which chunk responses arrive.
    ///
    /// The transfer fails as a whole if any chunk fails terminally; remaining
    ///  chunks are drained first, and the lowest-offset failure is reported.
    pub async fn read(&self, dest: CoreAddr, base_addr: u32, len: usize) -> Result<Vec<u8>, ScpError> {
        let pending = self.submit_chunks(dest, base_addr, len, |_, _| Vec::new(), CMD_READ)?;
        debug!("bulk read of {} bytes from {:#x} in {} chunks", len, base_addr, pending.len());

        let mut data = vec![0u8; len];
        let mut first_failure: Option<ScpError> = None;
        for chunk in pending {
            match Self::chunk_outcome(chunk.result_rx.await) {
                Ok(response) => {
                    if response.payload.len() != chunk.len {
                        first_failure.get_or_insert(ScpError::UnexpectedResponseLength {
                            expected: chunk.len,
                            got: response.payload.len(),
                        });
                        continue;
                    }
                    trace!("read chunk at offset {} complete", chunk.offset);
                    data[chunk.offset..chunk.offset + chunk.len].copy_from_slice(&response.payload);
                }
                Err(e) => {
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            None => Ok(data),
            Some(e) => Err(e),
        }
    }

    /// Write `data` to remote memory starting at `base_addr`, chunked and
    ///  pipelined. Same failure semantics as [Connection::read].
    pub async fn write(&self, dest: CoreAddr, base_addr: u32, data: &[u8]) -> Result<(), ScpError> {
        let pending = self.submit_chunks(
            dest,
            base_addr,
            data.len(),
            |offset, len| data[offset..offset + len].to_vec(),
            CMD_WRITE,
        )?;
        debug!("bulk write of {} bytes to {:#x} in {} chunks", data.len(), base_addr, pending.len());

        let mut first_failure: Option<ScpError> = None;
        for chunk in pending {
            match Self::chunk_outcome(chunk.result_rx.await) {
                Ok(_) => trace!("write chunk at offset {} complete", chunk.offset),
                Err(e) => {
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Enqueue one command per chunk, in offset order so admission stays
    ///  deterministic. Each chunk command carries the chunk's absolute address and
    ///  length as its argument words.
    fn submit_chunks(
        &self,
        dest: CoreAddr,
        base_addr: u32,
        len: usize,
        chunk_payload: impl Fn(usize, usize) -> Vec<u8>,
        cmd: u16,
    ) -> Result<Vec<PendingChunk>, ScpError> {
        // remote addresses are 32 bit; the transfer may end exactly at the top
        if u64::from(base_addr) + len as u64 > u64::from(u32::MAX) + 1 {
            return Err(ScpError::AddressOverflow { base: base_addr, len });
        }

        let chunk_size = self.config().scp_data_length;
        let mut pending = Vec::with_capacity(len.div_ceil(chunk_size));

        let mut offset = 0;
        while offset < len {
            let chunk_len = min(chunk_size, len - offset);
            let result_rx = self.shared().submit(
                dest,
                cmd,
                vec![base_addr + offset as u32, chunk_len as u32],
                chunk_payload(offset, chunk_len),
            )?;
            pending.push(PendingChunk {
                offset,
                len: chunk_len,
                result_rx,
            });
            offset += chunk_len;
        }
        Ok(pending)
    }

    /// A chunk fails on transport failure or on a non-Ok result code from the
    ///  remote side.
    fn chunk_outcome(
        raw: Result<CmdResult, oneshot::error::RecvError>,
    ) -> Result<crate::packet::ScpResponse, ScpError> {
        let response = raw.unwrap_or(Err(ScpError::ConnectionClosed))?;
        if response.rc != ResultCode::Ok {
            return Err(ScpError::Command(response.rc));
        }
        Ok(response)
    }
}
