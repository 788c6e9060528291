//! MTU-bounded characteristic writes
//!
//! A write that fits in one ATT PDU goes out as a single write request (or write
//! command). Anything larger is queued on the server with prepare-write requests and
//! committed with one execute-write request.

use crate::ble::AttBearer;
use crate::error::{ProxyError, Result};
use crate::gatt::Handle;
use log::{debug, error, trace, warn};
use std::sync::Arc;

pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub const ATT_WRITE_CMD: u8 = 0x52;

pub const ATT_ECODE_INVALID_HANDLE: u8 = 0x01;
pub const ATT_ECODE_INVALID_OFFSET: u8 = 0x07;
pub const ATT_ECODE_REQ_NOT_SUPPORTED: u8 = 0x06;
pub const ATT_ECODE_UNLIKELY: u8 = 0x0e;

/// Opcode (1) + handle (2).
const WRITE_HEADER: usize = 3;
/// Opcode (1) + handle (2) + offset (2).
const PREPARE_HEADER: usize = 5;

const EXECUTE_COMMIT: u8 = 0x01;
const EXECUTE_CANCEL: u8 = 0x00;

/// Builds an ATT error response.
pub fn error_response(request: u8, handle: Handle, code: u8) -> Vec<u8> {
    let [lo, hi] = handle.to_le_bytes();
    vec![ATT_ERROR_RSP, request, lo, hi, code]
}

fn write_pdu(opcode: u8, handle: Handle, data: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(WRITE_HEADER + data.len());
    pdu.push(opcode);
    pdu.extend_from_slice(&handle.to_le_bytes());
    pdu.extend_from_slice(data);
    pdu
}

fn prepare_pdu(handle: Handle, offset: u16, chunk: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(PREPARE_HEADER + chunk.len());
    pdu.push(ATT_PREPARE_WRITE_REQ);
    pdu.extend_from_slice(&handle.to_le_bytes());
    pdu.extend_from_slice(&offset.to_le_bytes());
    pdu.extend_from_slice(chunk);
    pdu
}

fn describe(response: &[u8]) -> String {
    match response {
        [ATT_ERROR_RSP, request, _, _, code, ..] => {
            format!("error response 0x{code:02x} to opcode 0x{request:02x}")
        }
        [opcode, ..] => format!("opcode 0x{opcode:02x} ({} bytes)", response.len()),
        [] => "empty response".to_string(),
    }
}

pub struct LongWriteCoordinator {
    bearer: Arc<dyn AttBearer>,
}

impl LongWriteCoordinator {
    pub fn new(bearer: Arc<dyn AttBearer>) -> Self {
        Self { bearer }
    }

    /// Writes `data` to the characteristic value at `handle`.
    pub async fn write(&self, handle: Handle, data: &[u8], without_response: bool) -> Result<()> {
        let mtu = usize::from(self.bearer.mtu());

        if without_response {
            trace!("Write command to 0x{:04x} ({} bytes)", handle, data.len());
            return self
                .bearer
                .command(write_pdu(ATT_WRITE_CMD, handle, data))
                .await;
        }

        if data.len() + WRITE_HEADER <= mtu {
            trace!("Write request to 0x{:04x} ({} bytes)", handle, data.len());
            let response = self
                .bearer
                .request(write_pdu(ATT_WRITE_REQ, handle, data))
                .await?;
            return match response.first() {
                Some(&ATT_WRITE_RSP) => Ok(()),
                _ => Err(self.fail(handle, &response)),
            };
        }

        self.long_write(handle, data, mtu).await
    }

    async fn long_write(&self, handle: Handle, data: &[u8], mtu: usize) -> Result<()> {
        let chunk_size = mtu.saturating_sub(PREPARE_HEADER).max(1);
        debug!(
            "Long write to 0x{:04x}: {} bytes in {} chunk(s) of at most {}",
            handle,
            data.len(),
            data.len().div_ceil(chunk_size),
            chunk_size
        );

        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let offset = u16::try_from(index * chunk_size).map_err(|_| {
                ProxyError::WriteProtocol(format!("{} bytes exceed the ATT offset range", data.len()))
            })?;
            let response = self
                .bearer
                .request(prepare_pdu(handle, offset, chunk))
                .await?;

            let echoed = response.first() == Some(&ATT_PREPARE_WRITE_RSP)
                && response.len() == chunk.len() + PREPARE_HEADER;
            if !echoed {
                self.cancel(handle).await;
                return Err(self.fail(handle, &response));
            }
        }

        let response = self
            .bearer
            .request(vec![ATT_EXECUTE_WRITE_REQ, EXECUTE_COMMIT])
            .await?;
        match response.first() {
            Some(&ATT_EXECUTE_WRITE_RSP) => Ok(()),
            _ => Err(self.fail(handle, &response)),
        }
    }

    /// Drops whatever the server has queued so far.
    async fn cancel(&self, handle: Handle) {
        if let Err(e) = self
            .bearer
            .request(vec![ATT_EXECUTE_WRITE_REQ, EXECUTE_CANCEL])
            .await
        {
            warn!("Failed to cancel queued writes on 0x{:04x}: {}", handle, e);
        }
    }

    fn fail(&self, handle: Handle, response: &[u8]) -> ProxyError {
        let reason = format!("unexpected {} on handle 0x{:04x}", describe(response), handle);
        error!("Write failed: {}", reason);
        ProxyError::WriteProtocol(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every PDU and answers like a well-behaved server.
    struct RecordingBearer {
        mtu: u16,
        sent: Mutex<Vec<Vec<u8>>>,
        short_prepare_at: Option<usize>,
    }

    impl RecordingBearer {
        fn new(mtu: u16) -> Arc<Self> {
            Arc::new(Self {
                mtu,
                sent: Mutex::new(Vec::new()),
                short_prepare_at: None,
            })
        }

        fn opcodes(&self) -> Vec<u8> {
            self.sent.lock().unwrap().iter().map(|pdu| pdu[0]).collect()
        }
    }

    #[async_trait]
    impl AttBearer for RecordingBearer {
        fn mtu(&self) -> u16 {
            self.mtu
        }

        async fn request(&self, pdu: Vec<u8>) -> Result<Vec<u8>> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(pdu.clone());
            let prepares = sent.iter().filter(|p| p[0] == ATT_PREPARE_WRITE_REQ).count();
            Ok(match pdu[0] {
                ATT_WRITE_REQ => vec![ATT_WRITE_RSP],
                ATT_PREPARE_WRITE_REQ => {
                    let mut rsp = pdu.clone();
                    rsp[0] = ATT_PREPARE_WRITE_RSP;
                    if self.short_prepare_at == Some(prepares) {
                        rsp.pop();
                    }
                    rsp
                }
                ATT_EXECUTE_WRITE_REQ => vec![ATT_EXECUTE_WRITE_RSP],
                other => error_response(other, 0, ATT_ECODE_REQ_NOT_SUPPORTED),
            })
        }

        async fn command(&self, pdu: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap().push(pdu);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_long_write_chunks_at_mtu_23() {
        let bearer = RecordingBearer::new(23);
        let coordinator = LongWriteCoordinator::new(bearer.clone());

        coordinator.write(0x0e, &[0xaa; 40], false).await.unwrap();

        assert_eq!(
            bearer.opcodes(),
            vec![
                ATT_PREPARE_WRITE_REQ,
                ATT_PREPARE_WRITE_REQ,
                ATT_PREPARE_WRITE_REQ,
                ATT_EXECUTE_WRITE_REQ
            ]
        );
        let sent = bearer.sent.lock().unwrap();
        // offsets 0, 18, 36
        assert_eq!(&sent[1][3..5], &18u16.to_le_bytes());
        assert_eq!(&sent[2][3..5], &36u16.to_le_bytes());
        assert_eq!(sent[2].len(), PREPARE_HEADER + 4);
        assert_eq!(sent[3], vec![ATT_EXECUTE_WRITE_REQ, EXECUTE_COMMIT]);
    }

    #[tokio::test]
    async fn test_short_write_is_single_request() {
        let bearer = RecordingBearer::new(23);
        let coordinator = LongWriteCoordinator::new(bearer.clone());

        coordinator.write(0x0e, &[0x01; 10], false).await.unwrap();

        assert_eq!(bearer.opcodes(), vec![ATT_WRITE_REQ]);
        assert_eq!(bearer.sent.lock().unwrap()[0][1..3], [0x0e, 0x00]);
    }

    #[tokio::test]
    async fn test_exact_fit_is_single_request() {
        let bearer = RecordingBearer::new(23);
        let coordinator = LongWriteCoordinator::new(bearer.clone());

        coordinator.write(0x0e, &[0x01; 20], false).await.unwrap();
        assert_eq!(bearer.opcodes(), vec![ATT_WRITE_REQ]);
    }

    #[tokio::test]
    async fn test_without_response_is_single_command() {
        let bearer = RecordingBearer::new(23);
        let coordinator = LongWriteCoordinator::new(bearer.clone());

        coordinator.write(0x0e, &[0x01; 40], true).await.unwrap();
        assert_eq!(bearer.opcodes(), vec![ATT_WRITE_CMD]);
    }

    #[tokio::test]
    async fn test_length_mismatch_is_write_error() {
        let bearer = Arc::new(RecordingBearer {
            mtu: 23,
            sent: Mutex::new(Vec::new()),
            short_prepare_at: Some(2),
        });
        let coordinator = LongWriteCoordinator::new(bearer.clone());

        let result = coordinator.write(0x0e, &[0xaa; 40], false).await;
        assert!(matches!(result, Err(ProxyError::WriteProtocol(_))));
        // two prepares, then the queue is cancelled
        assert_eq!(
            bearer.opcodes(),
            vec![ATT_PREPARE_WRITE_REQ, ATT_PREPARE_WRITE_REQ, ATT_EXECUTE_WRITE_REQ]
        );
        assert_eq!(
            bearer.sent.lock().unwrap().last().unwrap(),
            &vec![ATT_EXECUTE_WRITE_REQ, EXECUTE_CANCEL]
        );
    }
}
