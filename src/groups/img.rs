// src/groups/img.rs
//
// Image management group: image state list/set, firmware upload, slot
// erase and slot info. The upload pipeline chunks the image to the
// transport's message budget, follows the device's reported offset,
// detects stuck transfers and reports progress through a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use minicbor::Decoder;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_STATE: u8 = 0;
pub const COMMAND_UPLOAD: u8 = 1;
pub const COMMAND_ERASE: u8 = 5;
pub const COMMAND_SLOT_INFO: u8 = 6;

/// Consecutive rounds without forward progress before the upload is
/// declared stuck.
const STUCK_ROUND_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ImgMode {
    #[default]
    Idle,
    ListImages,
    SetImage,
    UploadFirmware,
    EraseImage,
    SlotInfo,
}

/// One slot entry from an image state response.
#[derive(Debug, Clone, Default)]
pub struct ImageSlot {
    pub image: u32,
    pub slot: u32,
    pub version: String,
    pub hash: Vec<u8>,
    pub bootable: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
    pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ImageState {
    pub images: Vec<ImageSlot>,
    pub split_status: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SlotInfoSlot {
    pub slot: u32,
    pub size: Option<u64>,
    pub upload_image_id: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct SlotInfoImage {
    pub image: u32,
    pub slots: Vec<SlotInfoSlot>,
    pub max_image_size: Option<u64>,
}

/// Per-round progress report from an active upload.
#[derive(Debug, Clone, Copy)]
pub struct UploadProgress {
    pub offset: u64,
    pub total: u64,
    pub percent: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl UploadStats {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub data: &'a [u8],
    /// Destination image number; only written when non-zero.
    pub image: u32,
    /// Ask the device to reject downgrades.
    pub upgrade: bool,
    pub progress: Option<mpsc::UnboundedSender<UploadProgress>>,
}

/// Cooperative cancellation for a running upload. Checked once per
/// round; bytes already in flight are not retracted.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Outcome of `upload_and_activate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    /// Image uploaded and marked in the device image state.
    Activated,
    /// Image uploaded but the device does not implement the state
    /// command (bootloader recovery mode).
    StateUnsupported,
}

/// Working state of an upload in flight.
struct ImageUploadContext<'a> {
    data: &'a [u8],
    session_hash: [u8; 32],
    offset: usize,
    stuck_rounds: u32,
    started: Instant,
}

#[derive(Default)]
pub struct ImgGroup {
    mode: ImgMode,
    cancel: CancelHandle,
}

impl ImgGroup {
    pub fn new() -> Self {
        ImgGroup::default()
    }

    /// Handle for cancelling a running upload from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn enter(&mut self, mode: ImgMode) -> Result<()> {
        if self.mode != ImgMode::Idle {
            return Err(Error::Busy);
        }
        self.mode = mode;
        Ok(())
    }

    /// Read the image state list.
    pub async fn list_images<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<ImageState> {
        self.enter(ImgMode::ListImages)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::IMG, COMMAND_STATE);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;
            parse_image_state(rsp.body())
        }
        .await;
        self.mode = ImgMode::Idle;
        result
    }

    /// Mark an image for test or confirm it. `hash` selects the image;
    /// omitting it applies to the currently running image.
    pub async fn set_state<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        hash: Option<&[u8]>,
        confirm: bool,
    ) -> Result<ImageState> {
        self.enter(ImgMode::SetImage)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Write, group_id::IMG, COMMAND_STATE);
            if let Some(hash) = hash {
                msg.add_bytes("hash", hash);
            }
            if confirm {
                msg.add_bool("confirm", true);
            }
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;
            parse_image_state(rsp.body())
        }
        .await;
        self.mode = ImgMode::Idle;
        result
    }

    /// Erase the image in a slot.
    pub async fn erase<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        slot: u32,
    ) -> Result<()> {
        self.enter(ImgMode::EraseImage)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Write, group_id::IMG, COMMAND_ERASE);
            msg.add_u64("slot", slot as u64);
            msg.finalize();
            processor.transceive(&msg).await?;
            Ok(())
        }
        .await;
        self.mode = ImgMode::Idle;
        result
    }

    /// Query per-image slot sizes and the maximum image size.
    pub async fn slot_info<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<Vec<SlotInfoImage>> {
        self.enter(ImgMode::SlotInfo)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::IMG, COMMAND_SLOT_INFO);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;
            parse_slot_info(rsp.body())
        }
        .await;
        self.mode = ImgMode::Idle;
        result
    }

    /// Upload a firmware image, following the device's reported offset
    /// each round.
    pub async fn upload<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        request: UploadRequest<'_>,
    ) -> Result<UploadStats> {
        self.enter(ImgMode::UploadFirmware)?;
        self.cancel.clear();
        let result = run_upload(processor, &request, &self.cancel).await;
        self.mode = ImgMode::Idle;
        result
    }

    /// Upload, then mark the image for test or confirm it. A device that
    /// does not implement the state command (recovery-mode bootloader)
    /// is tolerated; callers should still reset to boot the new image.
    pub async fn upload_and_activate<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        request: UploadRequest<'_>,
        confirm: bool,
    ) -> Result<ActivateOutcome> {
        let hash = crate::mcuboot::extract_hash(request.data)?;
        self.upload(processor, request).await?;

        match self.set_state(processor, Some(&hash), confirm).await {
            Ok(_) => Ok(ActivateOutcome::Activated),
            Err(Error::Protocol(e)) if e.is_unsupported() => {
                warn!("device does not support image state, skipping test/confirm");
                Ok(ActivateOutcome::StateUnsupported)
            }
            Err(e) => Err(e),
        }
    }
}

async fn run_upload<T: SmpTransport>(
    processor: &mut SmpProcessor<T>,
    request: &UploadRequest<'_>,
    cancel: &CancelHandle,
) -> Result<UploadStats> {
    let mut ctx = ImageUploadContext {
        data: request.data,
        session_hash: Sha256::digest(request.data).into(),
        offset: 0,
        stuck_rounds: 0,
        started: Instant::now(),
    };
    let total = ctx.data.len() as u64;
    info!(bytes = total, image = request.image, "starting firmware upload");

    while ctx.offset < ctx.data.len() {
        if cancel.is_cancelled() {
            debug!(offset = ctx.offset, "upload cancelled");
            return Err(Error::Cancelled);
        }

        let mut msg = processor.start_request(SmpOp::Write, group_id::IMG, COMMAND_UPLOAD);
        if ctx.offset == 0 {
            if request.image != 0 {
                msg.add_u64("image", request.image as u64);
            }
            msg.add_u64("len", total);
            msg.add_bytes("sha", &ctx.session_hash);
            if request.upgrade {
                msg.add_bool("upgrade", true);
            }
        }
        msg.add_u64("off", ctx.offset as u64);

        let chunk = chunk_budget(processor.max_message_size(), msg.len(), ctx.data.len() - ctx.offset);
        if chunk == 0 {
            let detail = if ctx.offset == 0 {
                "transport MTU cannot fit the first-round upload metadata"
            } else {
                "transport MTU leaves no room for image data"
            };
            return Err(Error::InvalidConfiguration(detail.into()));
        }
        msg.add_bytes("data", &ctx.data[ctx.offset..ctx.offset + chunk]);
        msg.finalize();

        let rsp = processor.transceive(&msg).await?;
        let next_offset = parse_upload_offset(rsp.body())?;

        if next_offset <= ctx.offset as u64 {
            ctx.stuck_rounds += 1;
            warn!(
                offset = ctx.offset,
                reported = next_offset,
                round = ctx.stuck_rounds,
                "device reported no upload progress"
            );
            if ctx.stuck_rounds >= STUCK_ROUND_LIMIT {
                return Err(Error::StuckTransferLoop);
            }
        } else {
            ctx.stuck_rounds = 0;
        }
        ctx.offset = next_offset as usize;

        if let Some(progress) = &request.progress {
            let _ = progress.send(UploadProgress {
                offset: next_offset,
                total,
                percent: (next_offset * 100 / total.max(1)) as u8,
            });
        }
    }

    let stats = UploadStats {
        bytes: total,
        elapsed: ctx.started.elapsed(),
    };
    info!(
        bytes = stats.bytes,
        throughput = format!("{:.0} B/s", stats.bytes_per_second()),
        "firmware upload complete"
    );
    Ok(stats)
}

/// Image bytes that fit in this round's message: the transport budget
/// minus what the message already holds, the `data` key, the byte-string
/// header and the closing map break.
fn chunk_budget(budget: usize, used: usize, remaining: usize) -> usize {
    let fixed = used + 1 + 4 + 1;
    let mut chunk = budget.saturating_sub(fixed);
    chunk = chunk.saturating_sub(cbor::bytes_header_overhead(chunk));
    chunk.min(remaining)
}

fn parse_upload_offset(body: &[u8]) -> Result<u64> {
    let mut offset = None;
    let mut d = Decoder::new(body);
    cbor::decode_map(&mut d, |d, key| {
        match key {
            "off" => offset = Some(d.u64()?),
            _ => d.skip()?,
        }
        Ok(())
    })?;
    offset.ok_or_else(|| Error::UnexpectedResponse("upload response without an offset".into()))
}

fn parse_image_state(body: &[u8]) -> Result<ImageState> {
    let mut state = ImageState::default();
    let mut d = Decoder::new(body);
    cbor::decode_map(&mut d, |d, key| {
        match key {
            "images" => cbor::decode_array(d, |d| {
                let mut slot = ImageSlot::default();
                cbor::decode_map(d, |d, key| {
                    match key {
                        "image" => slot.image = d.u64()? as u32,
                        "slot" => slot.slot = d.u64()? as u32,
                        "version" => slot.version = d.str()?.to_string(),
                        "hash" => slot.hash = d.bytes()?.to_vec(),
                        "bootable" => slot.bootable = d.bool()?,
                        "pending" => slot.pending = d.bool()?,
                        "confirmed" => slot.confirmed = d.bool()?,
                        "active" => slot.active = d.bool()?,
                        "permanent" => slot.permanent = d.bool()?,
                        _ => d.skip()?,
                    }
                    Ok(())
                })?;
                state.images.push(slot);
                Ok(())
            })?,
            "splitStatus" => state.split_status = Some(d.i64()?),
            _ => d.skip()?,
        }
        Ok(())
    })?;
    Ok(state)
}

fn parse_slot_info(body: &[u8]) -> Result<Vec<SlotInfoImage>> {
    let mut images = Vec::new();
    let mut d = Decoder::new(body);
    cbor::decode_map(&mut d, |d, key| {
        match key {
            "images" => cbor::decode_array(d, |d| {
                let mut image = SlotInfoImage::default();
                cbor::decode_map(d, |d, key| {
                    match key {
                        "image" => image.image = d.u64()? as u32,
                        "max_image_size" => image.max_image_size = Some(d.u64()?),
                        "slots" => cbor::decode_array(d, |d| {
                            let mut slot = SlotInfoSlot::default();
                            cbor::decode_map(d, |d, key| {
                                match key {
                                    "slot" => slot.slot = d.u64()? as u32,
                                    "size" => slot.size = Some(d.u64()?),
                                    "upload_image_id" => {
                                        slot.upload_image_id = Some(d.u64()? as u32)
                                    }
                                    _ => d.skip()?,
                                }
                                Ok(())
                            })?;
                            image.slots.push(slot);
                            Ok(())
                        })?,
                        _ => d.skip()?,
                    }
                    Ok(())
                })?;
                images.push(image);
                Ok(())
            })?,
            _ => d.skip()?,
        }
        Ok(())
    })?;
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::base_code;
    use crate::mcuboot;
    use crate::message::{SmpMessage, SmpVersion};
    use crate::transport::mock::MockTransport;
    use std::sync::Mutex;

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

    fn decode_upload_request(req: &SmpMessage) -> (u64, Vec<u8>) {
        let mut off = 0;
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
        (off, data)
    }

    /// Build a signed test image: header + payload + SHA-256 TLV.
    fn test_image(payload_len: usize) -> Vec<u8> {
        let mut image = vec![0u8; 0x20];
        image[0..4].copy_from_slice(&mcuboot::IMAGE_MAGIC.to_le_bytes());
        image[0x08..0x0a].copy_from_slice(&0x20u16.to_le_bytes());
        image[0x0c..0x10].copy_from_slice(&(payload_len as u32).to_le_bytes());
        image.extend(std::iter::repeat(0x5A).take(payload_len));

        let hash: [u8; 32] = Sha256::digest(&image).into();
        let total = (4 + 4 + 32) as u16;
        image.extend_from_slice(&mcuboot::TLV_INFO_MAGIC.to_le_bytes());
        image.extend_from_slice(&total.to_le_bytes());
        image.push(mcuboot::TLV_TAG_SHA256);
        image.push(0);
        image.extend_from_slice(&32u16.to_le_bytes());
        image.extend_from_slice(&hash);
        image
    }

    /// A scripted device that stores uploaded bytes and reports back the
    /// new offset.
    fn upload_device(store: Arc<Mutex<Vec<u8>>>) -> MockTransport {
        MockTransport::new(move |req| {
            let header = req.header().unwrap();
            if header.command != COMMAND_UPLOAD {
                return vec![response_for(req, |_| {})];
            }
            let (off, data) = decode_upload_request(req);
            let mut stored = store.lock().unwrap();
            assert_eq!(off as usize, stored.len());
            stored.extend_from_slice(&data);
            let new_off = stored.len() as u64;
            vec![response_for(req, |rsp| {
                rsp.add_u64("off", new_off);
            })]
        })
    }

    #[tokio::test]
    async fn test_upload_end_to_end() {
        let image = test_image(300 - 0x20);
        let store = Arc::new(Mutex::new(Vec::new()));
        let mut transport = upload_device(Arc::clone(&store));
        transport.mtu = 128;
        let mut processor = SmpProcessor::new(transport);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut group = ImgGroup::new();
        let stats = group
            .upload(
                &mut processor,
                UploadRequest {
                    data: &image,
                    image: 0,
                    upgrade: false,
                    progress: Some(progress_tx),
                },
            )
            .await
            .unwrap();

        assert_eq!(stats.bytes as usize, image.len());
        assert_eq!(*store.lock().unwrap(), image);
        // More than one round at this MTU, finishing at 100%.
        assert!(processor.transport().sent.len() > 1);
        let mut last = None;
        while let Ok(p) = progress_rx.try_recv() {
            last = Some(p);
        }
        assert_eq!(last.unwrap().percent, 100);
    }

    #[tokio::test]
    async fn test_upload_first_round_metadata() {
        let image = test_image(64);
        let store = Arc::new(Mutex::new(Vec::new()));
        let mut processor = SmpProcessor::new(upload_device(Arc::clone(&store)));

        let mut group = ImgGroup::new();
        group
            .upload(
                &mut processor,
                UploadRequest {
                    data: &image,
                    image: 1,
                    upgrade: true,
                    progress: None,
                },
            )
            .await
            .unwrap();

        let first = &processor.transport().sent[0];
        let mut keys = Vec::new();
        let mut d = Decoder::new(first.body());
        cbor::decode_map(&mut d, |d, key| {
            keys.push(key.to_string());
            d.skip()?;
            Ok(())
        })
        .unwrap();
        for expected in ["image", "len", "sha", "upgrade", "off", "data"] {
            assert!(keys.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_upload_stuck_loop() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_u64("off", 0);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        let result = group
            .upload(
                &mut processor,
                UploadRequest {
                    data: &[0xAA; 256],
                    image: 0,
                    upgrade: false,
                    progress: None,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::StuckTransferLoop)));
        assert_eq!(processor.transport().sent.len(), STUCK_ROUND_LIMIT as usize);
        // The group is usable again.
        assert_eq!(group.mode, ImgMode::Idle);
    }

    #[tokio::test]
    async fn test_upload_cancelled_mid_transfer() {
        let mut group = ImgGroup::new();
        let handle = group.cancel_handle();

        // The device cancels the upload after answering the first round.
        let transport = MockTransport::new(move |req| {
            let (off, data) = decode_upload_request(req);
            handle.cancel();
            vec![response_for(req, |rsp| {
                rsp.add_u64("off", off + data.len() as u64);
            })]
        });
        let mut transport = transport;
        transport.mtu = 128;
        let mut processor = SmpProcessor::new(transport);

        let result = group
            .upload(
                &mut processor,
                UploadRequest {
                    data: &[0xAA; 1024],
                    image: 0,
                    upgrade: false,
                    progress: None,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        // Only the first round went out, and the group is idle again.
        assert_eq!(processor.transport().sent.len(), 1);
        assert_eq!(group.mode, ImgMode::Idle);
    }

    #[tokio::test]
    async fn test_upload_mtu_too_small_for_metadata() {
        // 64 bytes cannot hold the first round's len + sha + off keys.
        let mut transport = MockTransport::new(|_| Vec::new());
        transport.mtu = 64;
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        let result = group
            .upload(
                &mut processor,
                UploadRequest {
                    data: &[0xAA; 1024],
                    image: 0,
                    upgrade: false,
                    progress: None,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
        assert!(processor.transport().sent.is_empty());
        assert_eq!(group.mode, ImgMode::Idle);
    }

    #[tokio::test]
    async fn test_busy_rejection() {
        let transport = MockTransport::new(|_| Vec::new());
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        group.mode = ImgMode::UploadFirmware;
        let result = group.list_images(&mut processor).await;
        assert!(matches!(result, Err(Error::Busy)));
        // The active mode is untouched.
        assert_eq!(group.mode, ImgMode::UploadFirmware);
    }

    #[tokio::test]
    async fn test_list_images() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.begin_array("images");
                rsp.push_map();
                rsp.add_u64("image", 0);
                rsp.add_u64("slot", 0);
                rsp.add_str("version", "1.2.3");
                rsp.add_bytes("hash", &[0xAB; 32]);
                rsp.add_bool("active", true);
                rsp.add_bool("confirmed", true);
                rsp.end_container();
                rsp.end_container();
                rsp.add_i64("splitStatus", 0);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        let state = group.list_images(&mut processor).await.unwrap();
        assert_eq!(state.images.len(), 1);
        assert_eq!(state.images[0].version, "1.2.3");
        assert!(state.images[0].active);
        assert_eq!(state.split_status, Some(0));
    }

    #[tokio::test]
    async fn test_upload_and_activate_state_unsupported() {
        let image = test_image(64);
        let store = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport::new({
            let store = Arc::clone(&store);
            move |req| {
                let header = req.header().unwrap();
                match header.command {
                    COMMAND_UPLOAD => {
                        let (_, data) = decode_upload_request(req);
                        store.lock().unwrap().extend_from_slice(&data);
                        let off = store.lock().unwrap().len() as u64;
                        vec![response_for(req, |rsp| {
                            rsp.add_u64("off", off);
                        })]
                    }
                    COMMAND_STATE => vec![response_for(req, |rsp| {
                        rsp.add_i64("rc", base_code::NOTSUP as i64);
                    })],
                    _ => Vec::new(),
                }
            }
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        let outcome = group
            .upload_and_activate(
                &mut processor,
                UploadRequest {
                    data: &image,
                    image: 0,
                    upgrade: false,
                    progress: None,
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ActivateOutcome::StateUnsupported);
        assert_eq!(*store.lock().unwrap(), image);
    }

    #[tokio::test]
    async fn test_erase_sends_slot() {
        let transport = MockTransport::new(|req| vec![response_for(req, |_| {})]);
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        group.erase(&mut processor, 1).await.unwrap();

        let sent = &processor.transport().sent[0];
        assert_eq!(sent.header().unwrap().command, COMMAND_ERASE);
        let mut slot = None;
        let mut d = Decoder::new(sent.body());
        cbor::decode_map(&mut d, |d, key| {
            match key {
                "slot" => slot = Some(d.u64()?),
                _ => d.skip()?,
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(slot, Some(1));
    }

    #[test]
    fn test_chunk_budget_fits() {
        for budget in [96usize, 127, 256, 484] {
            for used in [16usize, 40] {
                let chunk = chunk_budget(budget, used, 100_000);
                assert!(chunk > 0);
                let total = used + 1 + 4 + cbor::bytes_header_overhead(chunk) + chunk + 1;
                assert!(total <= budget, "budget {budget} used {used}: {total}");
            }
        }
    }

    #[tokio::test]
    async fn test_version_fallback_during_upload() {
        // Device answers v1; later rounds must be sent as v1.
        let store = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport::new({
            let store = Arc::clone(&store);
            move |req| {
                let header = req.header().unwrap();
                let (off, data) = decode_upload_request(req);
                assert_eq!(off as usize, store.lock().unwrap().len());
                store.lock().unwrap().extend_from_slice(&data);
                let new_off = store.lock().unwrap().len() as u64;
                let mut rsp = SmpMessage::start(
                    header.op.response(),
                    SmpVersion::V1,
                    header.group,
                    header.sequence,
                    header.command,
                );
                rsp.add_u64("off", new_off);
                rsp.finalize();
                vec![rsp]
            }
        });
        let mut transport = transport;
        transport.mtu = 96;
        let mut processor = SmpProcessor::new(transport);

        let mut group = ImgGroup::new();
        group
            .upload(
                &mut processor,
                UploadRequest {
                    data: &[0x11; 256],
                    image: 0,
                    upgrade: false,
                    progress: None,
                },
            )
            .await
            .unwrap();

        assert!(processor.version_downgraded());
        let last = processor.transport().sent.last().unwrap();
        assert_eq!(last.header().unwrap().version, SmpVersion::V1);
    }
}
