// src/groups/custom.rs
//
// Escape hatch for vendor-specific management groups: build the request
// body yourself, get the raw response message back. Error decoding and
// response matching still run in the processor.

use crate::error::Result;
use crate::message::{SmpMessage, SmpOp};
use crate::processor::SmpProcessor;
use crate::transport::SmpTransport;

/// Execute one command against an arbitrary group. `build` fills the
/// request body with the message writer.
pub async fn execute<T: SmpTransport>(
    processor: &mut SmpProcessor<T>,
    op: SmpOp,
    group: u16,
    command: u8,
    build: impl FnOnce(&mut SmpMessage),
) -> Result<SmpMessage> {
    let mut msg = processor.start_request(op, group, command);
    build(&mut msg);
    msg.finalize();
    processor.transceive(&msg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor;
    use crate::transport::mock::MockTransport;
    use minicbor::Decoder;

    #[tokio::test]
    async fn test_custom_group_roundtrip() {
        let transport = MockTransport::new(|req| {
            let header = req.header().unwrap();
            assert_eq!(header.group, 64);
            assert_eq!(header.command, 7);
            let mut rsp = SmpMessage::start(
                header.op.response(),
                header.version,
                header.group,
                header.sequence,
                header.command,
            );
            rsp.add_u64("status", 1);
            rsp.finalize();
            vec![rsp]
        });
        let mut processor = SmpProcessor::new(transport);

        let rsp = execute(&mut processor, SmpOp::Write, 64, 7, |msg| {
            msg.add_str("mode", "fast");
        })
        .await
        .unwrap();

        let mut status = None;
        let mut d = Decoder::new(rsp.body());
        cbor::decode_map(&mut d, |d, key| {
            match key {
                "status" => status = Some(d.u64()?),
                _ => d.skip()?,
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(status, Some(1));
    }
}
