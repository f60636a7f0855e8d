//! Length-prefixed packet framing.
//!
//! The real PLC bootloader's handshake/stager/dump opcodes aren't
//! published anywhere this crate could source them from, so this module
//! only fixes the framing contract that's actually guaranteed — one
//! packet per request/response, chunking for payloads above the protocol
//! maximum, and a raw byte-stream escape hatch for the memory dump. See
//! `plc::client` for the concrete opcode set this implementation chose.

use crate::error::{Error, Result};
use crate::plc::transport::PlcTransport;

/// Two magic bytes precede every chunk header so a desynchronized stream
/// is detected quickly instead of silently misreading garbage as a huge
/// length prefix.
const MAGIC: [u8; 2] = [0xA5, 0x5A];

/// The protocol maximum chunk payload size both sides agree on
/// statically.
pub const DEFAULT_MAX_CHUNK: usize = 4096;

/// `MAGIC(2) | chunk_len:u32 BE | is_final:u8 | chunk_len bytes`.
const HEADER_LEN: usize = 2 + 4 + 1;

/// Splits `payload` into chunks of at most `max_chunk` bytes and writes
/// each with its framing header.
pub async fn send_packet(
    transport: &mut PlcTransport,
    payload: &[u8],
    max_chunk: Option<usize>,
) -> Result<()> {
    let max_chunk = max_chunk.unwrap_or(DEFAULT_MAX_CHUNK).max(1);
    if payload.is_empty() {
        return send_chunk(transport, &[], true).await;
    }
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + max_chunk).min(payload.len());
        let is_final = end == payload.len();
        send_chunk(transport, &payload[offset..end], is_final).await?;
        offset = end;
    }
    Ok(())
}

async fn send_chunk(transport: &mut PlcTransport, chunk: &[u8], is_final: bool) -> Result<()> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
    header.push(is_final as u8);
    transport.write_all(&header).await?;
    if !chunk.is_empty() {
        transport.write_all(chunk).await?;
    }
    Ok(())
}

/// Reads the next complete frame, assembling multi-chunk packets until
/// the final flag is observed.
pub async fn receive_packet(transport: &mut PlcTransport) -> Result<Vec<u8>> {
    let mut assembled = Vec::new();
    loop {
        let mut header = [0u8; HEADER_LEN];
        transport.read_exact(&mut header).await?;
        if header[0..2] != MAGIC {
            return Err(Error::protocol("frame desynchronized: bad magic bytes"));
        }
        let chunk_len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let is_final = header[6] != 0;

        if chunk_len > 0 {
            let mut chunk = vec![0u8; chunk_len];
            transport.read_exact(&mut chunk).await?;
            assembled.extend_from_slice(&chunk);
        }
        if is_final {
            return Ok(assembled);
        }
    }
}

/// Bypasses framing for the bulk memory-dump stream.
pub async fn raw_read(transport: &mut PlcTransport, buf: &mut [u8]) -> Result<()> {
    transport.read_exact(buf).await
}

pub async fn raw_write(transport: &mut PlcTransport, buf: &[u8]) -> Result<()> {
    transport.write_all(buf).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_chunk_is_never_zero() {
        // A caller passing Some(0) must not hang the protocol layer in
        // an infinite zero-length-chunk loop.
        assert_eq!(DEFAULT_MAX_CHUNK.max(1), DEFAULT_MAX_CHUNK);
    }
}
