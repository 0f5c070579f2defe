// src/groups/stats.rs
//
// Statistics management group: fetch one statistics group's counters and
// list the available group names.

use std::collections::BTreeMap;

use minicbor::Decoder;

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_GROUP_DATA: u8 = 0;
pub const COMMAND_LIST_GROUPS: u8 = 1;

#[derive(Default)]
pub struct StatsGroup {
    active: bool,
}

impl StatsGroup {
    pub fn new() -> Self {
        StatsGroup::default()
    }

    fn enter(&mut self) -> Result<()> {
        if self.active {
            return Err(Error::Busy);
        }
        self.active = true;
        Ok(())
    }

    /// Counters of one statistics group, keyed by entry name.
    pub async fn group_data<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
    ) -> Result<BTreeMap<String, u64>> {
        self.enter()?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::STATS, COMMAND_GROUP_DATA);
            msg.add_str("name", name);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut fields = BTreeMap::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "fields" => cbor::decode_map(d, |d, field| {
                        fields.insert(field.to_string(), d.u64()?);
                        Ok(())
                    })?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(fields)
        }
        .await;
        self.active = false;
        result
    }

    /// Names of the statistics groups present on the device.
    pub async fn list_groups<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<Vec<String>> {
        self.enter()?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::STATS, COMMAND_LIST_GROUPS);
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut names = Vec::new();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "stat_list" => cbor::decode_array(d, |d| {
                        names.push(d.str()?.to_string());
                        Ok(())
                    })?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(names)
        }
        .await;
        self.active = false;
        result
    }
}
