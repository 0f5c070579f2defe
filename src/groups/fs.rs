// src/groups/fs.rs
//
// Filesystem management group: chunked file transfer in both directions,
// file status, hash/checksum and supported hash/checksum types.

use minicbor::data::Type;
use minicbor::Decoder;
use tracing::warn;

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_FILE: u8 = 0;
pub const COMMAND_STAT: u8 = 1;
pub const COMMAND_HASH_CHECKSUM: u8 = 2;
pub const COMMAND_SUPPORTED: u8 = 3;

/// Consecutive download rounds without new bytes before the transfer is
/// declared stuck.
const STUCK_ROUND_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FsMode {
    #[default]
    Idle,
    UploadFile,
    DownloadFile,
    Stat,
    HashChecksum,
    Supported,
}

/// Output of a hash/checksum command: checksums arrive as integers,
/// hashes as byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashChecksumOutput {
    Number(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct HashChecksum {
    pub kind: String,
    pub length: u64,
    pub output: HashChecksumOutput,
}

#[derive(Default)]
pub struct FsGroup {
    mode: FsMode,
}

impl FsGroup {
    pub fn new() -> Self {
        FsGroup::default()
    }

    fn enter(&mut self, mode: FsMode) -> Result<()> {
        if self.mode != FsMode::Idle {
            return Err(Error::Busy);
        }
        self.mode = mode;
        Ok(())
    }

    /// Download a whole file, chunk by chunk. The total size comes from
    /// the `len` field of the first reply.
    pub async fn download<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
    ) -> Result<Vec<u8>> {
        self.enter(FsMode::DownloadFile)?;
        let result = async {
            let mut file = Vec::new();
            let mut total: Option<u64> = None;
            let mut stuck_rounds = 0u32;

            loop {
                let mut msg = processor.start_request(SmpOp::Read, group_id::FS, COMMAND_FILE);
                msg.add_u64("off", file.len() as u64);
                msg.add_str("name", name);
                msg.finalize();
                let rsp = processor.transceive(&msg).await?;

                let mut chunk: Option<Vec<u8>> = None;
                let mut offset: Option<u64> = None;
                let mut d = Decoder::new(rsp.body());
                cbor::decode_map(&mut d, |d, key| {
                    match key {
                        "off" => offset = Some(d.u64()?),
                        "data" => chunk = Some(d.bytes()?.to_vec()),
                        "len" => total = Some(d.u64()?),
                        _ => d.skip()?,
                    }
                    Ok(())
                })?;

                let offset = offset.ok_or_else(|| {
                    Error::UnexpectedResponse("file download reply without offset".into())
                })?;
                if offset != file.len() as u64 {
                    return Err(Error::UnexpectedResponse(format!(
                        "file download offset jumped to {offset}"
                    )));
                }
                match chunk {
                    Some(chunk) if !chunk.is_empty() => {
                        file.extend_from_slice(&chunk);
                        stuck_rounds = 0;
                    }
                    _ => {
                        stuck_rounds += 1;
                        warn!(
                            offset,
                            round = stuck_rounds,
                            "file download round delivered no data"
                        );
                        if stuck_rounds >= STUCK_ROUND_LIMIT {
                            return Err(Error::StuckTransferLoop);
                        }
                    }
                }

                let total = total.ok_or_else(|| {
                    Error::UnexpectedResponse("file download reply without length".into())
                })?;
                if file.len() as u64 >= total {
                    return Ok(file);
                }
            }
        }
        .await;
        self.mode = FsMode::Idle;
        result
    }

    /// Upload a file, chunked to the transport budget like a firmware
    /// upload.
    pub async fn upload<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
        data: &[u8],
    ) -> Result<()> {
        self.enter(FsMode::UploadFile)?;
        let result = async {
            let mut offset = 0usize;
            loop {
                let mut msg = processor.start_request(SmpOp::Write, group_id::FS, COMMAND_FILE);
                msg.add_str("name", name);
                msg.add_u64("off", offset as u64);
                if offset == 0 {
                    msg.add_u64("len", data.len() as u64);
                }

                let budget = processor.max_message_size();
                let fixed = msg.len() + 1 + 4 + 1;
                let mut chunk = budget.saturating_sub(fixed);
                chunk = chunk.saturating_sub(cbor::bytes_header_overhead(chunk));
                chunk = chunk.min(data.len() - offset);
                if chunk == 0 && offset < data.len() {
                    return Err(Error::InvalidConfiguration(
                        "transport MTU leaves no room for file data".into(),
                    ));
                }
                msg.add_bytes("data", &data[offset..offset + chunk]);
                msg.finalize();
                let rsp = processor.transceive(&msg).await?;

                let mut next = None;
                let mut d = Decoder::new(rsp.body());
                cbor::decode_map(&mut d, |d, key| {
                    match key {
                        "off" => next = Some(d.u64()?),
                        _ => d.skip()?,
                    }
                    Ok(())
                })?;
                offset = next.ok_or_else(|| {
                    Error::UnexpectedResponse("file upload reply without offset".into())
                })? as usize;

                if offset >= data.len() {
                    return Ok(());
                }
            }
        }
        .await;
        self.mode = FsMode::Idle;
        result
    }

    /// File size in bytes.
    pub async fn status<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
    ) -> Result<u64> {
        self.enter(FsMode::Stat)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::FS, COMMAND_STAT);
            msg.add_str("name", name);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut len = None;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "len" => len = Some(d.u64()?),
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            len.ok_or_else(|| Error::UnexpectedResponse("file status reply without length".into()))
        }
        .await;
        self.mode = FsMode::Idle;
        result
    }

    /// Hash or checksum a file region on the device. `kind` is a type
    /// name from `supported()`, e.g. `crc32` or `sha256`; `None` uses
    /// the device default.
    pub async fn hash_checksum<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
        kind: Option<&str>,
        off: Option<u64>,
        len: Option<u64>,
    ) -> Result<HashChecksum> {
        self.enter(FsMode::HashChecksum)?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::FS, COMMAND_HASH_CHECKSUM);
            msg.add_str("name", name);
            if let Some(kind) = kind {
                msg.add_str("type", kind);
            }
            if let Some(off) = off {
                msg.add_u64("off", off);
            }
            if let Some(len) = len {
                msg.add_u64("len", len);
            }
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut out_kind = kind.unwrap_or_default().to_string();
            let mut length = 0u64;
            let mut output = None;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "type" => out_kind = d.str()?.to_string(),
                    "len" => length = d.u64()?,
                    "output" => {
                        output = Some(match d.datatype()? {
                            Type::Bytes | Type::BytesIndef => {
                                HashChecksumOutput::Bytes(d.bytes()?.to_vec())
                            }
                            _ => HashChecksumOutput::Number(d.u64()?),
                        })
                    }
                    _ => d.skip()?,
                }
                Ok(())
            })?;

            Ok(HashChecksum {
                kind: out_kind,
                length,
                output: output.ok_or_else(|| {
                    Error::UnexpectedResponse("hash/checksum reply without output".into())
                })?,
            })
        }
        .await;
        self.mode = FsMode::Idle;
        result
    }

    /// Hash/checksum type names this device supports.
    pub async fn supported<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<Vec<String>> {
        self.enter(FsMode::Supported)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::FS, COMMAND_SUPPORTED);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut types = Vec::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "types" => cbor::decode_array(d, |d| {
                        types.push(d.str()?.to_string());
                        Ok(())
                    })?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(types)
        }
        .await;
        self.mode = FsMode::Idle;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SmpMessage;
    use crate::transport::mock::MockTransport;
    use std::sync::{Arc, Mutex};

    fn response_for(req: &SmpMessage, build: impl FnOnce(&mut SmpMessage)) -> SmpMessage {
        let header = req.header().unwrap();
        let mut rsp = SmpMessage::start(
            header.op.response(),
            header.version,
            header.group,
            header.sequence,
            header.command,
        );
        build(&mut rsp);
        rsp.finalize();
        rsp
    }

    /// Device with one file served in fixed 64-byte chunks.
    fn file_device(contents: Vec<u8>) -> MockTransport {
        MockTransport::new(move |req| {
            let mut off = 0u64;
            let mut d = Decoder::new(req.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "off" => off = d.u64()?,
                    _ => d.skip()?,
                }
                Ok(())
            })
            .unwrap();
            let start = off as usize;
            let end = (start + 64).min(contents.len());
            let chunk = contents[start..end].to_vec();
            let total = contents.len() as u64;
            vec![response_for(req, |rsp| {
                rsp.add_u64("off", start as u64);
                rsp.add_bytes("data", &chunk);
                rsp.add_u64("len", total);
            })]
        })
    }

    #[tokio::test]
    async fn test_download_reassembles_file() {
        let contents: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let mut processor = SmpProcessor::new(file_device(contents.clone()));

        let mut group = FsGroup::new();
        let file = group.download(&mut processor, "/lfs/config.txt").await.unwrap();
        assert_eq!(file, contents);
    }

    #[tokio::test]
    async fn test_download_stalled_device_aborts() {
        // Device keeps acknowledging the offset but never sends bytes.
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_u64("off", 0);
                rsp.add_bytes("data", &[]);
                rsp.add_u64("len", 200);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = FsGroup::new();
        let result = group.download(&mut processor, "/lfs/config.txt").await;
        assert!(matches!(result, Err(Error::StuckTransferLoop)));
        assert_eq!(processor.transport().sent.len(), STUCK_ROUND_LIMIT as usize);
    }

    #[tokio::test]
    async fn test_upload_chunks_follow_offsets() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport::new({
            let received = Arc::clone(&received);
            move |req| {
                let mut off = 0u64;
                let mut data = Vec::new();
                let mut d = Decoder::new(req.body());
                cbor::decode_map(&mut d, |d, key| {
                    match key {
                        "off" => off = d.u64()?,
                        "data" => data = d.bytes()?.to_vec(),
                        _ => d.skip()?,
                    }
                    Ok(())
                })
                .unwrap();
                let mut stored = received.lock().unwrap();
                assert_eq!(off as usize, stored.len());
                stored.extend_from_slice(&data);
                let new_off = stored.len() as u64;
                vec![response_for(req, |rsp| {
                    rsp.add_u64("off", new_off);
                })]
            }
        });
        let mut transport = transport;
        transport.mtu = 128;
        let mut processor = SmpProcessor::new(transport);

        let data: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let mut group = FsGroup::new();
        group.upload(&mut processor, "/lfs/blob.bin", &data).await.unwrap();
        assert_eq!(*received.lock().unwrap(), data);
        assert!(processor.transport().sent.len() > 1);
    }

    #[tokio::test]
    async fn test_hash_checksum_outputs() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_str("type", "crc32");
                rsp.add_u64("len", 512);
                rsp.add_u64("output", 0xDEADBEEF);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = FsGroup::new();
        let result = group
            .hash_checksum(&mut processor, "/lfs/blob.bin", Some("crc32"), None, None)
            .await
            .unwrap();
        assert_eq!(result.kind, "crc32");
        assert_eq!(result.length, 512);
        assert_eq!(result.output, HashChecksumOutput::Number(0xDEADBEEF));
    }

    #[tokio::test]
    async fn test_supported_types() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.begin_array("types");
                rsp.push_str("crc32");
                rsp.push_str("sha256");
                rsp.end_container();
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = FsGroup::new();
        let types = group.supported(&mut processor).await.unwrap();
        assert_eq!(types, ["crc32", "sha256"]);
    }
}
