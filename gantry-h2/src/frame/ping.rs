use std::fmt;

use bytes::BufMut;

use super::{Error, Head, Kind, StreamId};

/// A PING frame: eight opaque octets echoed back with the ACK flag.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Ping {
    ack: bool,
    payload: [u8; 8],
}

const ACK: u8 = 0x1;

impl Ping {
    #[must_use]
    pub fn new(payload: [u8; 8]) -> Self {
        Self {
            ack: false,
            payload,
        }
    }

    /// The ACK reply echoing `payload`.
    #[must_use]
    pub fn pong(payload: [u8; 8]) -> Self {
        Self { ack: true, payload }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.ack
    }

    #[must_use]
    pub fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Ping);
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(payload);
        Ok(Self {
            ack: head.flag() & ACK != 0,
            payload: bytes,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.ack { ACK } else { 0 };
        let head = Head::new(Kind::Ping, flags, StreamId::ZERO);
        head.encode(8, dst);
        dst.put_slice(&self.payload);
    }
}

impl fmt::Debug for Ping {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Ping")
            .field("ack", &self.ack)
            .field("payload", &self.payload)
            .finish()
    }
}
