// src/groups/os.rs
//
// OS management group: echo, reset, task and memory pool statistics,
// datetime, mcumgr parameters, application and bootloader info.

use std::collections::BTreeMap;

use minicbor::Decoder;
use tracing::debug;

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_ECHO: u8 = 0;
pub const COMMAND_TASK_STATS: u8 = 2;
pub const COMMAND_MEMORY_POOL: u8 = 3;
pub const COMMAND_DATE_TIME: u8 = 4;
pub const COMMAND_RESET: u8 = 5;
pub const COMMAND_MCUMGR_PARAMETERS: u8 = 6;
pub const COMMAND_OS_APPLICATION_INFO: u8 = 7;
pub const COMMAND_BOOTLOADER_INFO: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum OsMode {
    #[default]
    Idle,
    Echo,
    TaskStats,
    MemoryPool,
    DateTime,
    Reset,
    McumgrParameters,
    OsApplicationInfo,
    BootloaderInfo,
}

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub priority: u64,
    pub task_id: u64,
    pub state: u64,
    pub stack_size: u64,
    pub stack_used: u64,
    pub context_switches: u64,
    pub runtime: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPoolStats {
    pub block_size: u64,
    pub blocks: u64,
    pub free_blocks: u64,
    pub min_free_blocks: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct McumgrParameters {
    pub buffer_size: u64,
    pub buffer_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BootloaderInfo {
    pub bootloader: Option<String>,
    /// MCUboot operating mode, present for the `bootloader` query on
    /// MCUboot devices.
    pub mode: Option<i64>,
    pub no_downgrade: bool,
}

#[derive(Default)]
pub struct OsGroup {
    mode: OsMode,
}

impl OsGroup {
    pub fn new() -> Self {
        OsGroup::default()
    }

    fn enter(&mut self, mode: OsMode) -> Result<()> {
        if self.mode != OsMode::Idle {
            return Err(Error::Busy);
        }
        self.mode = mode;
        Ok(())
    }

    /// Round-trip a string through the device.
    pub async fn echo<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        text: &str,
    ) -> Result<String> {
        self.enter(OsMode::Echo)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Write, group_id::OS, COMMAND_ECHO);
            msg.add_str("d", text);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut reply = None;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "r" => reply = Some(d.str()?.to_string()),
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            reply.ok_or_else(|| Error::UnexpectedResponse("echo response without r".into()))
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    /// Reboot the device. Devices commonly reset before the response
    /// makes it out, so a missing reply counts as success.
    pub async fn reset<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        force: bool,
    ) -> Result<()> {
        self.enter(OsMode::Reset)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Write, group_id::OS, COMMAND_RESET);
            if force {
                msg.add_bool("force", true);
            }
            msg.finalize();
            match processor.transceive(&msg).await {
                Ok(_) => Ok(()),
                Err(Error::Timeout) => {
                    debug!("no reset response, assuming the device rebooted");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    /// Per-task statistics, keyed by task name.
    pub async fn task_stats<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<BTreeMap<String, TaskStats>> {
        self.enter(OsMode::TaskStats)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::OS, COMMAND_TASK_STATS);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut tasks = BTreeMap::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "tasks" => cbor::decode_map(d, |d, name| {
                        let mut stats = TaskStats::default();
                        cbor::decode_map(d, |d, key| {
                            match key {
                                "prio" => stats.priority = d.u64()?,
                                "tid" => stats.task_id = d.u64()?,
                                "state" => stats.state = d.u64()?,
                                "stksiz" => stats.stack_size = d.u64()?,
                                "stkuse" => stats.stack_used = d.u64()?,
                                "cswcnt" => stats.context_switches = d.u64()?,
                                "runtime" => stats.runtime = d.u64()?,
                                _ => d.skip()?,
                            }
                            Ok(())
                        })?;
                        tasks.insert(name.to_string(), stats);
                        Ok(())
                    })?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(tasks)
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    /// Memory pool statistics, keyed by pool name.
    pub async fn memory_pool_stats<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<BTreeMap<String, MemoryPoolStats>> {
        self.enter(OsMode::MemoryPool)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::OS, COMMAND_MEMORY_POOL);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut pools = BTreeMap::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, name| {
                let mut stats = MemoryPoolStats::default();
                cbor::decode_map(d, |d, key| {
                    match key {
                        "blksiz" => stats.block_size = d.u64()?,
                        "nblks" => stats.blocks = d.u64()?,
                        "nfree" => stats.free_blocks = d.u64()?,
                        "min" => stats.min_free_blocks = d.u64()?,
                        _ => d.skip()?,
                    }
                    Ok(())
                })?;
                pools.insert(name.to_string(), stats);
                Ok(())
            })?;
            Ok(pools)
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    pub async fn datetime_get<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<String> {
        self.enter(OsMode::DateTime)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::OS, COMMAND_DATE_TIME);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut datetime = None;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "datetime" => datetime = Some(d.str()?.to_string()),
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            datetime
                .ok_or_else(|| Error::UnexpectedResponse("datetime response without value".into()))
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    /// Set the device clock; `datetime` is RFC 3339 formatted.
    pub async fn datetime_set<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        datetime: &str,
    ) -> Result<()> {
        self.enter(OsMode::DateTime)?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Write, group_id::OS, COMMAND_DATE_TIME);
            msg.add_str("datetime", datetime);
            msg.finalize();
            processor.transceive(&msg).await?;
            Ok(())
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    /// Device SMP buffer parameters; `buffer_size` bounds the usable
    /// message size regardless of the transport MTU.
    pub async fn mcumgr_parameters<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<McumgrParameters> {
        self.enter(OsMode::McumgrParameters)?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::OS, COMMAND_MCUMGR_PARAMETERS);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut params = McumgrParameters::default();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "buf_size" => params.buffer_size = d.u64()?,
                    "buf_count" => params.buffer_count = d.u64()?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(params)
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    /// Application info; `format` uses the `uname`-style field letters,
    /// empty for the default.
    pub async fn application_info<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        format: &str,
    ) -> Result<String> {
        self.enter(OsMode::OsApplicationInfo)?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::OS, COMMAND_OS_APPLICATION_INFO);
            if !format.is_empty() {
                msg.add_str("format", format);
            }
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut output = None;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "output" => output = Some(d.str()?.to_string()),
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            output.ok_or_else(|| Error::UnexpectedResponse("info response without output".into()))
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }

    pub async fn bootloader_info<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        query: Option<&str>,
    ) -> Result<BootloaderInfo> {
        self.enter(OsMode::BootloaderInfo)?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::OS, COMMAND_BOOTLOADER_INFO);
            if let Some(query) = query {
                msg.add_str("query", query);
            }
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut info = BootloaderInfo::default();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "bootloader" => info.bootloader = Some(d.str()?.to_string()),
                    "mode" => info.mode = Some(d.i64()?),
                    "no-downgrade" => info.no_downgrade = d.bool()?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(info)
        }
        .await;
        self.mode = OsMode::Idle;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SmpMessage;
    use crate::transport::mock::MockTransport;

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

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let transport = MockTransport::new(|req| {
            let mut sent = None;
            let mut d = Decoder::new(req.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "d" => sent = Some(d.str()?.to_string()),
                    _ => d.skip()?,
                }
                Ok(())
            })
            .unwrap();
            let sent = sent.unwrap();
            vec![response_for(req, |rsp| {
                rsp.add_str("r", &sent);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = OsGroup::new();
        let reply = group.echo(&mut processor, "hello device").await.unwrap();
        assert_eq!(reply, "hello device");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_tolerates_missing_reply() {
        let transport = MockTransport::new(|_| Vec::new());
        let mut processor = SmpProcessor::new(transport);

        let mut group = OsGroup::new();
        group.reset(&mut processor, true).await.unwrap();

        let sent = &processor.transport().sent[0];
        assert_eq!(sent.header().unwrap().command, COMMAND_RESET);
        let mut force = false;
        let mut d = Decoder::new(sent.body());
        cbor::decode_map(&mut d, |d, key| {
            match key {
                "force" => force = d.bool()?,
                _ => d.skip()?,
            }
            Ok(())
        })
        .unwrap();
        assert!(force);
    }

    #[tokio::test]
    async fn test_mcumgr_parameters() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_u64("buf_size", 2475);
                rsp.add_u64("buf_count", 4);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = OsGroup::new();
        let params = group.mcumgr_parameters(&mut processor).await.unwrap();
        assert_eq!(params.buffer_size, 2475);
        assert_eq!(params.buffer_count, 4);
    }

    #[tokio::test]
    async fn test_task_stats_parse() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.begin_map("tasks");
                rsp.begin_map("main");
                rsp.add_u64("prio", 8);
                rsp.add_u64("tid", 1);
                rsp.add_u64("stksiz", 4096);
                rsp.add_u64("stkuse", 1234);
                rsp.end_container();
                rsp.end_container();
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut group = OsGroup::new();
        let tasks = group.task_stats(&mut processor).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks["main"].stack_used, 1234);
    }
}
