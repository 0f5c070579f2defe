// src/groups/enum_mgmt.rs
//
// Enumeration management group: discover which command groups a device
// exposes.

use minicbor::Decoder;

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_COUNT: u8 = 0;
pub const COMMAND_LIST: u8 = 1;
pub const COMMAND_SINGLE: u8 = 2;
pub const COMMAND_DETAILS: u8 = 3;

/// Detail record for one supported group.
#[derive(Debug, Clone, Default)]
pub struct GroupDetails {
    pub group: u16,
    pub name: Option<String>,
    pub handlers: Option<u64>,
}

#[derive(Default)]
pub struct EnumGroup {
    active: bool,
}

impl EnumGroup {
    pub fn new() -> Self {
        EnumGroup::default()
    }

    fn enter(&mut self) -> Result<()> {
        if self.active {
            return Err(Error::Busy);
        }
        self.active = true;
        Ok(())
    }

    /// Number of supported command groups.
    pub async fn count<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<u64> {
        self.enter()?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::ENUM, COMMAND_COUNT);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut count = None;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "count" => count = Some(d.u64()?),
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            count.ok_or_else(|| Error::UnexpectedResponse("count reply without count".into()))
        }
        .await;
        self.active = false;
        result
    }

    /// All supported group ids in one reply.
    pub async fn list<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<Vec<u16>> {
        self.enter()?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::ENUM, COMMAND_LIST);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut groups = Vec::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "groups" => cbor::decode_array(d, |d| {
                        groups.push(d.u64()? as u16);
                        Ok(())
                    })?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(groups)
        }
        .await;
        self.active = false;
        result
    }

    /// One supported group id by index. Returns `(group, end)` where
    /// `end` marks the last index.
    pub async fn single<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        index: u64,
    ) -> Result<(u16, bool)> {
        self.enter()?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::ENUM, COMMAND_SINGLE);
            msg.add_u64("index", index);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut group = None;
            let mut end = false;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "group" => group = Some(d.u64()? as u16),
                    "end" => end = d.bool()?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            let group = group
                .ok_or_else(|| Error::UnexpectedResponse("single reply without group".into()))?;
            Ok((group, end))
        }
        .await;
        self.active = false;
        result
    }

    /// Details for the given groups, or every group when empty.
    pub async fn details<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        groups: &[u16],
    ) -> Result<Vec<GroupDetails>> {
        self.enter()?;
        let result = async {
            let mut msg = processor.start_request(SmpOp::Read, group_id::ENUM, COMMAND_DETAILS);
            if !groups.is_empty() {
                msg.begin_array("groups");
                for group in groups {
                    msg.push_u64(*group as u64);
                }
                msg.end_container();
            }
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut details = Vec::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "groups" => cbor::decode_array(d, |d| {
                        let mut entry = GroupDetails::default();
                        cbor::decode_map(d, |d, key| {
                            match key {
                                "group" => entry.group = d.u64()? as u16,
                                "name" => entry.name = Some(d.str()?.to_string()),
                                "handlers" => entry.handlers = Some(d.u64()?),
                                _ => d.skip()?,
                            }
                            Ok(())
                        })?;
                        details.push(entry);
                        Ok(())
                    })?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(details)
        }
        .await;
        self.active = false;
        result
    }
}
