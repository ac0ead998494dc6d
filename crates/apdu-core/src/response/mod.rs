//! APDU response definitions
//!
//! Types for working with response APDUs according to ISO/IEC 7816-4: a
//! payload of zero or more bytes followed by the two status bytes.

pub mod status;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::Error;
use status::StatusWord;

/// A parsed response APDU: payload plus status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload (may be empty)
    payload: Bytes,
    /// Status word
    status: StatusWord,
}

impl Response {
    /// Create a new response from payload and status
    pub fn new(payload: impl Into<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            payload: payload.into(),
            status: status.into(),
        }
    }

    /// Create a success (0x9000) response
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, StatusWord::new(0x90, 0x00))
    }

    /// Create a response with no payload from a status word
    pub fn status_only(status: impl Into<StatusWord>) -> Self {
        Self::new(Bytes::new(), status)
    }

    /// Parse a raw response APDU (payload followed by SW1-SW2)
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 2 {
            return Err(Error::IncompleteResponse);
        }
        let (payload, trailer) = data.split_at(data.len() - 2);
        let status = StatusWord::new(trailer[0], trailer[1]);

        trace!(
            status = %status,
            payload_len = payload.len(),
            "Parsed response APDU"
        );

        Ok(Self {
            payload: Bytes::copy_from_slice(payload),
            status,
        })
    }

    /// Get the response payload
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Check if the status word is 0x9000
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Return the payload if the status is success, the status as an error
    /// otherwise
    pub fn into_payload(self) -> Result<Bytes, Error> {
        if self.is_success() {
            Ok(self.payload)
        } else {
            Err(Error::from(self.status))
        }
    }

    /// Serialize back to raw bytes (payload followed by SW1-SW2)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 2);
        buf.put_slice(&self.payload);
        buf.put_u8(self.status.sw1);
        buf.put_u8(self.status.sw2);
        buf.freeze()
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(data)
    }
}

impl TryFrom<Bytes> for Response {
    type Error = Error;

    fn try_from(data: Bytes) -> Result<Self, Error> {
        Self::from_bytes(&data)
    }
}

impl From<Response> for Bytes {
    fn from(response: Response) -> Self {
        response.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_with_payload() {
        let resp = Response::from_bytes(&[0x01, 0x02, 0x03, 0x90, 0x00]).unwrap();
        assert_eq!(resp.payload().as_ref(), &[0x01, 0x02, 0x03]);
        assert_eq!(resp.status(), StatusWord::new(0x90, 0x00));
        assert!(resp.is_success());
    }

    #[test]
    fn test_from_bytes_status_only() {
        let resp = Response::from_bytes(&[0x6A, 0x82]).unwrap();
        assert!(resp.payload().is_empty());
        assert!(!resp.is_success());
    }

    #[test]
    fn test_from_bytes_too_short() {
        assert!(matches!(
            Response::from_bytes(&[0x90]),
            Err(Error::IncompleteResponse)
        ));
    }

    #[test]
    fn test_into_payload() {
        let ok = Response::success(Bytes::from_static(&[0xAA]));
        assert_eq!(ok.into_payload().unwrap().as_ref(), &[0xAA]);

        let err = Response::status_only((0x69, 0x82)).into_payload().unwrap_err();
        assert_eq!(err.status_word().map(StatusWord::to_u16), Some(0x6982));
    }

    #[test]
    fn test_roundtrip() {
        let raw = [0xDE, 0xAD, 0x61, 0x10];
        let resp = Response::from_bytes(&raw).unwrap();
        assert_eq!(resp.to_bytes().as_ref(), &raw);
    }
}
