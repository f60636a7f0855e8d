//! PLC bootloader client: handshake, version, stager install, and
//! streamed memory dump over the framed protocol of `plc::protocol`.
//!
//! The concrete opcode bytes below are a minimal, internally-consistent
//! set chosen for this implementation, since the real bootloader's wire
//! format isn't published anywhere this crate could source it from. An
//! implementer recovering the real PLC's format would replace only the
//! constants and payload layouts in this file.

use std::time::Duration;

use tracing::instrument;

use crate::error::{Error, Result};
use crate::plc::protocol::{receive_packet, send_packet, DEFAULT_MAX_CHUNK};
use crate::plc::transport::PlcTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    Handshake = 0x01,
    HandshakeAck = 0x81,
    VersionQuery = 0x02,
    VersionResponse = 0x82,
    StagerInstall = 0x03,
    StagerAck = 0x83,
    DumperInstall = 0x04,
    DumperAck = 0x84,
    BeginDump = 0x05,
    BeginDumpAck = 0x85,
    InfoQuery = 0x06,
    InfoResponse = 0x86,
}

/// Arbitrary discriminator byte the bootloader's handshake ack must echo
/// back; chosen so a response from an unrelated protocol is rejected
/// rather than silently accepted.
const HANDSHAKE_MAGIC: u8 = 0x53;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const MEMORY_READ = 0b0000_0001;
        const MEMORY_WRITE = 0b0000_0010;
        const FLASH_ACCESS = 0b0000_0100;
        const REAL_TIME_MONITORING = 0b0000_1000;
        const PAUSE_RESUME = 0b0001_0000;
        const CHECKSUMS = 0b0010_0000;
        const COMPRESSION = 0b0100_0000;
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRegionInfo {
    pub start_address: u32,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct BootloaderInfo {
    pub version: String,
    pub plc_model: String,
    pub firmware: String,
    pub memory_regions: Vec<MemoryRegionInfo>,
    pub max_transfer_size: u32,
    pub capabilities: Capabilities,
}

impl BootloaderInfo {
    pub fn supports_pause_resume(&self) -> bool {
        self.capabilities.contains(Capabilities::PAUSE_RESUME)
    }
}

fn require_opcode(response: &[u8], expected: Opcode) -> Result<()> {
    match response.first() {
        Some(byte) if *byte == expected as u8 => Ok(()),
        Some(byte) => Err(Error::protocol(format!(
            "expected opcode {:#04x}, got {:#04x}",
            expected as u8, byte
        ))),
        None => Err(Error::protocol("empty response from PLC")),
    }
}

fn read_u32_be(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or_else(|| Error::protocol("response too short"))
}

pub struct PlcClient {
    transport: PlcTransport,
}

impl PlcClient {
    pub fn new(transport: PlcTransport) -> Self {
        Self { transport }
    }

    async fn send_and_receive(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        let mut framed = vec![opcode as u8];
        framed.extend_from_slice(payload);
        send_packet(&mut self.transport, &framed, Some(DEFAULT_MAX_CHUNK)).await?;
        receive_packet(&mut self.transport).await
    }

    /// Sends the handshake packet and verifies the response
    /// discriminator. A single attempt — the communication-retry budget
    /// for this operation lives one layer up, in the orchestrator's
    /// `retry_stage(OperationClass::Handshake, …)`, so the attempt cap
    /// configured there is the only one that applies.
    #[instrument(skip(self))]
    pub async fn handshake(&mut self) -> Result<()> {
        let response = self
            .send_and_receive(Opcode::Handshake, &[HANDSHAKE_MAGIC])
            .await?;
        require_opcode(&response, Opcode::HandshakeAck)?;
        if response.get(1) != Some(&HANDSHAKE_MAGIC) {
            return Err(Error::protocol("handshake discriminator mismatch"));
        }
        Ok(())
    }

    pub async fn get_bootloader_version(&mut self) -> Result<String> {
        let response = self.send_and_receive(Opcode::VersionQuery, &[]).await?;
        require_opcode(&response, Opcode::VersionResponse)?;
        String::from_utf8(response[1..].to_vec())
            .map_err(|e| Error::protocol(format!("version string was not valid UTF-8: {e}")))
    }

    /// Sends the stager payload, chunked by `send_packet`, and waits for
    /// an acknowledgement.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn install_stager(&mut self, bytes: &[u8]) -> Result<()> {
        let response = self.send_and_receive(Opcode::StagerInstall, bytes).await?;
        require_opcode(&response, Opcode::StagerAck)?;
        Ok(())
    }

    pub async fn get_bootloader_info(&mut self) -> Result<BootloaderInfo> {
        let response = self.send_and_receive(Opcode::InfoQuery, &[]).await?;
        require_opcode(&response, Opcode::InfoResponse)?;
        let body = &response[1..];
        let max_transfer_size = read_u32_be(body, 0)?;
        let capabilities = Capabilities::from_bits_truncate(*body.get(4).unwrap_or(&0));
        let region_count = *body.get(5).unwrap_or(&0) as usize;
        let mut offset = 6;
        let mut memory_regions = Vec::with_capacity(region_count);
        for _ in 0..region_count {
            let start_address = read_u32_be(body, offset)?;
            let length = read_u32_be(body, offset + 4)?;
            memory_regions.push(MemoryRegionInfo { start_address, length });
            offset += 8;
        }
        let version = self.get_bootloader_version().await.unwrap_or_default();
        Ok(BootloaderInfo {
            version,
            plc_model: "S7-1200".to_string(),
            firmware: "bootloader".to_string(),
            memory_regions,
            max_transfer_size,
            capabilities,
        })
    }

    /// Sends the dumper payload, issues "begin dump", then streams
    /// `length` raw bytes via `progress`. On a mid-transfer error, `out`
    /// is truncated to the bytes actually received rather than left
    /// zero-padded to `length`, so the caller can tell how much of the
    /// dump really landed.
    #[instrument(skip(self, dumper_payload, progress), fields(address, length))]
    pub async fn dump_memory(
        &mut self,
        address: u32,
        length: u32,
        dumper_payload: &[u8],
        out: &mut Vec<u8>,
        mut progress: impl FnMut(u64),
    ) -> Result<()> {
        let response = self
            .send_and_receive(Opcode::DumperInstall, dumper_payload)
            .await?;
        require_opcode(&response, Opcode::DumperAck)?;

        let mut begin = Vec::with_capacity(8);
        begin.extend_from_slice(&address.to_be_bytes());
        begin.extend_from_slice(&length.to_be_bytes());
        let response = self.send_and_receive(Opcode::BeginDump, &begin).await?;
        require_opcode(&response, Opcode::BeginDumpAck)?;

        out.clear();
        out.resize(length as usize, 0);
        let mut read = 0usize;
        const RAW_CHUNK: usize = 8192;
        while read < out.len() {
            let end = (read + RAW_CHUNK).min(out.len());
            if let Err(err) = crate::plc::protocol::raw_read(&mut self.transport, &mut out[read..end]).await {
                out.truncate(read);
                return Err(err);
            }
            read = end;
            progress(read as u64);
        }
        Ok(())
    }

    pub fn into_transport(self) -> PlcTransport {
        self.transport
    }
}
