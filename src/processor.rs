// src/processor.rs
//
// Request/response engine on top of a transport: sequence numbering,
// response matching, resend on timeout, protocol version fallback and
// device error decoding. Group implementations build requests through
// `start_request` and drive exchanges through `transceive`; one exchange
// runs at a time per processor, enforced by the exclusive borrow.

use minicbor::data::Type;
use minicbor::Decoder;
use tracing::{debug, warn};

use crate::cbor;
use crate::error::{Error, Result, SmpError, SmpErrorKind};
use crate::message::{SmpHeader, SmpMessage, SmpOp, SmpVersion};
use crate::transport::SmpTransport;

pub struct SmpProcessor<T: SmpTransport> {
    transport: T,
    version: SmpVersion,
    sequence: u8,
    version_downgraded: bool,
}

impl<T: SmpTransport> SmpProcessor<T> {
    pub fn new(transport: T) -> Self {
        SmpProcessor {
            transport,
            version: SmpVersion::default(),
            sequence: 0,
            version_downgraded: false,
        }
    }

    pub fn with_version(transport: T, version: SmpVersion) -> Self {
        SmpProcessor {
            transport,
            version,
            sequence: 0,
            version_downgraded: false,
        }
    }

    /// Protocol version used for new requests. Starts at v2 and drops to
    /// what the device answers with.
    pub fn version(&self) -> SmpVersion {
        self.version
    }

    /// Whether the device ever answered with an older protocol version
    /// than requested.
    pub fn version_downgraded(&self) -> bool {
        self.version_downgraded
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Largest message (header plus body) the transport can carry at its
    /// current MTU.
    pub fn max_message_size(&self) -> usize {
        self.transport.max_message_data_size(self.transport.mtu())
    }

    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    /// Begin a request message with the current version and a fresh
    /// sequence number.
    pub fn start_request(&mut self, op: SmpOp, group: u16, command: u8) -> SmpMessage {
        let sequence = self.next_sequence();
        SmpMessage::start(op, self.version, group, sequence, command)
    }

    /// Send a finalized request and wait for its matching response,
    /// resending on timeout up to the transport's retry budget. Device
    /// reported errors surface as `Error::Protocol`.
    pub async fn transceive(&mut self, msg: &SmpMessage) -> Result<SmpMessage> {
        let request = msg.header()?;
        let expected_op = request.op.response();
        let attempts = self.transport.retries() + 1;
        let timeout = self.transport.timeout();

        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(attempt, sequence = request.sequence, "no response, resending request");
            }
            self.transport.send(msg).await?;

            match tokio::time::timeout(timeout, receive_matching(&mut self.transport, &request, expected_op)).await
            {
                Ok(received) => {
                    let response = received?;
                    return self.accept(&request, response);
                }
                Err(_) => continue,
            }
        }
        Err(Error::Timeout)
    }

    fn accept(&mut self, request: &SmpHeader, response: SmpMessage) -> Result<SmpMessage> {
        let header = response.header()?;
        if header.version != request.version {
            if header.version == SmpVersion::V1 {
                if !self.version_downgraded {
                    warn!("device answered with SMP v1, downgrading future requests");
                }
                self.version_downgraded = true;
            }
            self.version = header.version;
        }
        check_error(response.body(), header.group)?;
        Ok(response)
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }
}

async fn receive_matching<T: SmpTransport>(
    transport: &mut T,
    request: &SmpHeader,
    expected_op: SmpOp,
) -> Result<SmpMessage> {
    loop {
        let response = transport.receive().await?;
        let header = match response.header() {
            Ok(header) => header,
            Err(_) => {
                debug!("discarding runt message");
                continue;
            }
        };
        if header.sequence != request.sequence
            || header.group != request.group
            || header.command != request.command
            || header.op != expected_op
        {
            debug!(
                sequence = header.sequence,
                group = header.group,
                command = header.command,
                "discarding message not matching the active request"
            );
            continue;
        }
        return Ok(response);
    }
}

/// Scan the response body for a device error: v1 top-level `rc`, v2
/// `ret` map with group-scoped code. A present-but-zero code is success.
/// A `ret` key that is not a map is payload, not an error; the shell
/// group returns the command exit status under that name.
fn check_error(body: &[u8], group: u16) -> Result<()> {
    if body.is_empty() {
        return Ok(());
    }

    let mut error: Option<SmpError> = None;
    let mut d = Decoder::new(body);
    cbor::decode_map(&mut d, |d, key| {
        match key {
            "rc" => {
                let rc = d.i64()? as i32;
                if rc != 0 {
                    error = Some(SmpError {
                        kind: SmpErrorKind::Rc,
                        group,
                        rc,
                    });
                }
            }
            "ret" if matches!(d.datatype()?, Type::Map | Type::MapIndef) => {
                let mut ret_group = group;
                let mut rc = 0i32;
                cbor::decode_map(d, |d, key| {
                    match key {
                        "group" => ret_group = d.u64()? as u16,
                        "rc" => rc = d.i64()? as i32,
                        _ => d.skip()?,
                    }
                    Ok(())
                })?;
                if rc != 0 {
                    error = Some(SmpError {
                        kind: SmpErrorKind::Ret,
                        group: ret_group,
                        rc,
                    });
                }
            }
            _ => d.skip()?,
        }
        Ok(())
    })?;

    match error {
        Some(error) => Err(Error::Protocol(error)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::base_code;
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
    async fn test_transceive_matches_response() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_str("r", "hello");
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut req = processor.start_request(SmpOp::Write, 0, 0);
        req.add_str("d", "hello");
        req.finalize();

        let rsp = processor.transceive(&req).await.unwrap();
        assert_eq!(rsp.header().unwrap().op, SmpOp::WriteResponse);
    }

    #[tokio::test]
    async fn test_mismatched_sequence_is_discarded() {
        let transport = MockTransport::new(|req| {
            let header = req.header().unwrap();
            let mut stale = SmpMessage::start(
                header.op.response(),
                header.version,
                header.group,
                header.sequence.wrapping_add(100),
                header.command,
            );
            stale.finalize();
            vec![stale, response_for(req, |_| {})]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut req = processor.start_request(SmpOp::Read, 0, 0);
        req.finalize();
        let rsp = processor.transceive(&req).await.unwrap();
        assert_eq!(rsp.header().unwrap().sequence, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_after_resends() {
        let transport = MockTransport::new(|_| Vec::new());
        let mut processor = SmpProcessor::new(transport);

        let mut req = processor.start_request(SmpOp::Read, 0, 0);
        req.finalize();
        let result = processor.transceive(&req).await;
        assert!(matches!(result, Err(Error::Timeout)));
        // First send plus the retry budget.
        let retries = processor.transport().retries() as usize;
        assert_eq!(processor.transport().sent.len(), retries + 1);
    }

    #[tokio::test]
    async fn test_v1_error_rc() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_i64("rc", base_code::INVAL as i64);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut req = processor.start_request(SmpOp::Read, 1, 0);
        req.finalize();
        match processor.transceive(&req).await {
            Err(Error::Protocol(e)) => {
                assert_eq!(e.kind, SmpErrorKind::Rc);
                assert_eq!(e.rc, base_code::INVAL);
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_v2_error_ret() {
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.begin_map("ret");
                rsp.add_u64("group", 1);
                rsp.add_i64("rc", 5);
                rsp.end_container();
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut req = processor.start_request(SmpOp::Read, 1, 0);
        req.finalize();
        match processor.transceive(&req).await {
            Err(Error::Protocol(e)) => {
                assert_eq!(e.kind, SmpErrorKind::Ret);
                assert_eq!(e.group, 1);
                assert_eq!(e.rc, 5);
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_integer_ret_is_payload_not_error() {
        // Shell responses carry the exit status as a bare integer under
        // "ret"; only a map there is the v2 error form.
        let transport = MockTransport::new(|req| {
            vec![response_for(req, |rsp| {
                rsp.add_str("o", "done\n");
                rsp.add_i64("ret", 1);
            })]
        });
        let mut processor = SmpProcessor::new(transport);

        let mut req = processor.start_request(SmpOp::Write, 9, 0);
        req.finalize();
        let rsp = processor.transceive(&req).await.unwrap();
        assert!(!rsp.body().is_empty());
    }

    #[tokio::test]
    async fn test_version_downgrade_is_adopted() {
        let transport = MockTransport::new(|req| {
            let header = req.header().unwrap();
            let mut rsp = SmpMessage::start(
                header.op.response(),
                SmpVersion::V1,
                header.group,
                header.sequence,
                header.command,
            );
            rsp.finalize();
            vec![rsp]
        });
        let mut processor = SmpProcessor::new(transport);
        assert_eq!(processor.version(), SmpVersion::V2);

        let mut req = processor.start_request(SmpOp::Read, 0, 0);
        req.finalize();
        processor.transceive(&req).await.unwrap();

        assert!(processor.version_downgraded());
        assert_eq!(processor.version(), SmpVersion::V1);

        let req = processor.start_request(SmpOp::Read, 0, 0);
        assert_eq!(req.header().unwrap().version, SmpVersion::V1);
    }

    #[tokio::test]
    async fn test_sequence_wraps() {
        let transport = MockTransport::new(|_| Vec::new());
        let mut processor = SmpProcessor::new(transport);
        processor.sequence = 255;

        let req = processor.start_request(SmpOp::Read, 0, 0);
        assert_eq!(req.header().unwrap().sequence, 255);
        let req = processor.start_request(SmpOp::Read, 0, 0);
        assert_eq!(req.header().unwrap().sequence, 0);
    }
}
