// src/groups/zephyr.rs
//
// Zephyr basic management group: storage erase.

use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_STORAGE_ERASE: u8 = 0;

#[derive(Default)]
pub struct ZephyrGroup {
    active: bool,
}

impl ZephyrGroup {
    pub fn new() -> Self {
        ZephyrGroup::default()
    }

    /// Erase the storage partition. Destroys all stored settings and
    /// filesystem data on the device.
    pub async fn storage_erase<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<()> {
        if self.active {
            return Err(Error::Busy);
        }
        self.active = true;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Write, group_id::ZEPHYR, COMMAND_STORAGE_ERASE);
            msg.finalize();
            processor.transceive(&msg).await?;
            Ok(())
        }
        .await;
        self.active = false;
        result
    }
}
