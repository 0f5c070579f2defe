// src/groups/settings.rs
//
// Settings management group: read/write/delete individual keys, plus
// commit, load and save of the settings store.

use minicbor::Decoder;

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_READ_WRITE: u8 = 0;
pub const COMMAND_DELETE: u8 = 1;
pub const COMMAND_COMMIT: u8 = 2;
pub const COMMAND_LOAD_SAVE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SettingsMode {
    #[default]
    Idle,
    Read,
    Write,
    Delete,
    Commit,
    Load,
    Save,
}

/// A read settings value. `max_size` is reported when the device's
/// response buffer truncated the value.
#[derive(Debug, Clone, Default)]
pub struct SettingsValue {
    pub value: Vec<u8>,
    pub max_size: Option<u64>,
}

#[derive(Default)]
pub struct SettingsGroup {
    mode: SettingsMode,
}

impl SettingsGroup {
    pub fn new() -> Self {
        SettingsGroup::default()
    }

    fn enter(&mut self, mode: SettingsMode) -> Result<()> {
        if self.mode != SettingsMode::Idle {
            return Err(Error::Busy);
        }
        self.mode = mode;
        Ok(())
    }

    /// Read a settings value. `max_size` hints how many bytes the caller
    /// can take.
    pub async fn read<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
        max_size: Option<u64>,
    ) -> Result<SettingsValue> {
        self.enter(SettingsMode::Read)?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::SETTINGS, COMMAND_READ_WRITE);
            msg.add_str("name", name);
            if let Some(max_size) = max_size {
                msg.add_u64("max_size", max_size);
            }
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut value = SettingsValue::default();
            let mut found = false;
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "val" => {
                        value.value = d.bytes()?.to_vec();
                        found = true;
                    }
                    "max_size" => value.max_size = Some(d.u64()?),
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            if !found {
                return Err(Error::UnexpectedResponse(
                    "settings read reply without val".into(),
                ));
            }
            Ok(value)
        }
        .await;
        self.mode = SettingsMode::Idle;
        result
    }

    pub async fn write<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
        value: &[u8],
    ) -> Result<()> {
        self.enter(SettingsMode::Write)?;
        let result = self
            .simple_write(processor, COMMAND_READ_WRITE, |msg| {
                msg.add_str("name", name);
                msg.add_bytes("val", value);
            })
            .await;
        self.mode = SettingsMode::Idle;
        result
    }

    pub async fn delete<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        name: &str,
    ) -> Result<()> {
        self.enter(SettingsMode::Delete)?;
        let result = self
            .simple_write(processor, COMMAND_DELETE, |msg| {
                msg.add_str("name", name);
            })
            .await;
        self.mode = SettingsMode::Idle;
        result
    }

    /// Apply pending settings on the device.
    pub async fn commit<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
    ) -> Result<()> {
        self.enter(SettingsMode::Commit)?;
        let result = self.simple_write(processor, COMMAND_COMMIT, |_| {}).await;
        self.mode = SettingsMode::Idle;
        result
    }

    /// Reload settings from persistent storage.
    pub async fn load<T: SmpTransport>(&mut self, processor: &mut SmpProcessor<T>) -> Result<()> {
        self.enter(SettingsMode::Load)?;
        let result = async {
            let mut msg =
                processor.start_request(SmpOp::Read, group_id::SETTINGS, COMMAND_LOAD_SAVE);
            msg.finalize();
            processor.transceive(&msg).await?;
            Ok(())
        }
        .await;
        self.mode = SettingsMode::Idle;
        result
    }

    /// Persist current settings.
    pub async fn save<T: SmpTransport>(&mut self, processor: &mut SmpProcessor<T>) -> Result<()> {
        self.enter(SettingsMode::Save)?;
        let result = self.simple_write(processor, COMMAND_LOAD_SAVE, |_| {}).await;
        self.mode = SettingsMode::Idle;
        result
    }

    async fn simple_write<T: SmpTransport>(
        &self,
        processor: &mut SmpProcessor<T>,
        command: u8,
        build: impl FnOnce(&mut crate::message::SmpMessage),
    ) -> Result<()> {
        let mut msg = processor.start_request(SmpOp::Write, group_id::SETTINGS, command);
        build(&mut msg);
        msg.finalize();
        processor.transceive(&msg).await?;
        Ok(())
    }
}
