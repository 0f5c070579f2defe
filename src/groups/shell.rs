// src/groups/shell.rs
//
// Shell management group: execute a command line on the device shell.

use minicbor::Decoder;

use crate::cbor;
use crate::error::{Error, Result};
use crate::groups::group_id;
use crate::message::SmpOp;
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

pub const COMMAND_EXECUTE: u8 = 0;

/// Output and return code of an executed shell command.
#[derive(Debug, Clone, Default)]
pub struct ShellResult {
    pub output: String,
    pub return_code: i64,
}

#[derive(Default)]
pub struct ShellGroup {
    active: bool,
}

impl ShellGroup {
    pub fn new() -> Self {
        ShellGroup::default()
    }

    /// Run `argv` on the device shell and collect its output.
    pub async fn execute<T: SmpTransport>(
        &mut self,
        processor: &mut SmpProcessor<T>,
        argv: &[&str],
    ) -> Result<ShellResult> {
        if self.active {
            return Err(Error::Busy);
        }
        if argv.is_empty() {
            return Err(Error::InvalidConfiguration("empty shell command".into()));
        }
        self.active = true;

        let result = async {
            let mut msg = processor.start_request(SmpOp::Write, group_id::SHELL, COMMAND_EXECUTE);
            msg.begin_array("argv");
            for arg in argv {
                msg.push_str(arg);
            }
            msg.end_container();
            msg.finalize();
            let rsp = processor.transceive(&msg).await?;

            let mut shell = ShellResult::default();
            let mut d = Decoder::new(rsp.body());
            cbor::decode_map(&mut d, |d, key| {
                match key {
                    "o" => shell.output = d.str()?.to_string(),
                    "ret" => shell.return_code = d.i64()?,
                    _ => d.skip()?,
                }
                Ok(())
            })?;
            Ok(shell)
        }
        .await;
        self.active = false;
        result
    }
}
