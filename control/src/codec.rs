use bytes::{Buf, BufMut};

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
const HEADER_LEN: usize = 3;

/// Control message type tag.
///
/// Tags outside the known vocabulary are kept as [`MessageType::Other`] so that any byte
/// survives a decode/encode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    CommFailure,
    QueueStatus,
    Login,
    TestPrepare,
    TestStart,
    TestMsg,
    TestFinalize,
    Error,
    Results,
    Logout,
    Waiting,
    ExtendedLogin,
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => MessageType::CommFailure,
            1 => MessageType::QueueStatus,
            2 => MessageType::Login,
            3 => MessageType::TestPrepare,
            4 => MessageType::TestStart,
            5 => MessageType::TestMsg,
            6 => MessageType::TestFinalize,
            7 => MessageType::Error,
            8 => MessageType::Results,
            9 => MessageType::Logout,
            10 => MessageType::Waiting,
            11 => MessageType::ExtendedLogin,
            other => MessageType::Other(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::CommFailure => 0,
            MessageType::QueueStatus => 1,
            MessageType::Login => 2,
            MessageType::TestPrepare => 3,
            MessageType::TestStart => 4,
            MessageType::TestMsg => 5,
            MessageType::TestFinalize => 6,
            MessageType::Error => 7,
            MessageType::Results => 8,
            MessageType::Logout => 9,
            MessageType::Waiting => 10,
            MessageType::ExtendedLogin => 11,
            MessageType::Other(tag) => tag,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::CommFailure => write!(f, "COMM_FAILURE"),
            MessageType::QueueStatus => write!(f, "SRV_QUEUE"),
            MessageType::Login => write!(f, "MSG_LOGIN"),
            MessageType::TestPrepare => write!(f, "TEST_PREPARE"),
            MessageType::TestStart => write!(f, "TEST_START"),
            MessageType::TestMsg => write!(f, "TEST_MSG"),
            MessageType::TestFinalize => write!(f, "TEST_FINALIZE"),
            MessageType::Error => write!(f, "MSG_ERROR"),
            MessageType::Results => write!(f, "MSG_RESULTS"),
            MessageType::Logout => write!(f, "MSG_LOGOUT"),
            MessageType::Waiting => write!(f, "MSG_WAITING"),
            MessageType::ExtendedLogin => write!(f, "MSG_EXTENDED_LOGIN"),
            MessageType::Other(tag) => write!(f, "UNKNOWN({tag})"),
        }
    }
}

/// One framed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub payload: bytes::Bytes,
}

impl Message {
    pub fn new(kind: MessageType, payload: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, bytes::Bytes::new())
    }

    /// Payload as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Control channel failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message of {len} bytes exceeds receive capacity of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },
    #[error("payload of {0} bytes exceeds the 65535 byte frame limit")]
    PayloadTooLarge(usize),
    #[error("expected {expected} message, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("no message received within {0:?}")]
    Timeout(std::time::Duration),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("send failed after {0} interrupted attempts")]
    RetriesExhausted(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Position of this failure in the shared error taxonomy.
    pub fn kind(&self) -> common::error::ErrorKind {
        use common::error::ErrorKind;
        match self {
            Error::TooLarge { .. }
            | Error::PayloadTooLarge(_)
            | Error::UnexpectedType { .. }
            | Error::InvalidPayload(_) => ErrorKind::ProtocolViolation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::PeerClosed | Error::RetriesExhausted(_) => ErrorKind::PeerFault,
            Error::Io(err) => match err.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::PeerFault,
            },
        }
    }

    /// Whether the framed reader is finished after this error.
    ///
    /// A decode error ends the frame stream, so an oversized frame leaves the rest of
    /// the connection unreadable.
    pub fn ends_stream(&self) -> bool {
        matches!(self, Error::TooLarge { .. } | Error::PeerClosed | Error::Io(_))
    }
}

/// Errors on the control connection; data connections classify their own failures.
impl From<Error> for common::error::SessionError {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        let lost = err.ends_stream();
        let err = common::error::SessionError::control(err.into(), kind);
        if lost {
            err.with_stream_lost()
        } else {
            err
        }
    }
}

/// Encoder/decoder for the 3-byte-header framing.
///
/// `capacity` bounds the payload accepted by the decoder; larger frames are a protocol
/// violation rather than a reason to buffer more.
#[derive(Debug, Clone, Copy)]
pub struct NdtCodec {
    capacity: usize,
}

impl Default for NdtCodec {
    fn default() -> Self {
        Self {
            capacity: MAX_PAYLOAD,
        }
    }
}

impl NdtCodec {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(MAX_PAYLOAD),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.min(MAX_PAYLOAD);
    }
}

impl tokio_util::codec::Decoder for NdtCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Message>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        if len > self.capacity {
            return Err(Error::TooLarge {
                len,
                capacity: self.capacity,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let kind = MessageType::from(src.get_u8());
        src.advance(2);
        let payload = src.split_to(len).freeze();
        Ok(Some(Message { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Message>, Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            // a partial frame at EOF means the peer went away mid-message
            None if !src.is_empty() => Err(Error::PeerClosed),
            None => Ok(None),
        }
    }
}

impl tokio_util::codec::Encoder<Message> for NdtCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut bytes::BytesMut) -> Result<(), Error> {
        let len = item.payload.len();
        let Ok(wire_len) = u16::try_from(len) else {
            return Err(Error::PayloadTooLarge(len));
        };
        dst.reserve(HEADER_LEN + len);
        dst.put_u8(item.kind.into());
        dst.put_u16(wire_len);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn header_is_byte_exact() {
        let mut codec = NdtCodec::default();
        let mut buf = bytes::BytesMut::new();
        codec
            .encode(Message::new(MessageType::QueueStatus, "9988"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"\x01\x00\x049988");
    }

    #[test]
    fn control_failures_keep_their_kind() {
        let err: common::error::SessionError = Error::PeerClosed.into();
        assert_eq!(err.point, common::error::FailurePoint::Control);
        assert!(err.ends_session());
        let err: common::error::SessionError =
            Error::Timeout(std::time::Duration::from_secs(1)).into();
        assert_eq!(err.kind, common::error::ErrorKind::Timeout);
        assert!(!err.ends_session());
        let err: common::error::SessionError = Error::UnexpectedType {
            expected: MessageType::TestMsg,
            actual: MessageType::Logout,
        }
        .into();
        assert!(!err.ends_session());
    }

    #[test]
    fn oversized_control_frame_ends_the_session() {
        let mut codec = NdtCodec::default();
        codec.set_capacity(4);
        let mut buf = bytes::BytesMut::from(&b"\x05\x00\x08too long"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.ends_stream());
        let err: common::error::SessionError = err.into();
        assert_eq!(err.kind, common::error::ErrorKind::ProtocolViolation);
        assert!(err.ends_session());
        assert_eq!(err.exit_code(), common::error::ExitCode::ProtocolViolation);
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = NdtCodec::default();
        let mut buf = bytes::BytesMut::from(&b"\x05\x00"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x03ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"c\x09\x00\x00");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Message::new(MessageType::TestMsg, "abc"));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, Message::empty(MessageType::Logout));
    }

    #[test]
    fn oversized_frame_is_rejected_on_header() {
        let mut codec = NdtCodec::new(1);
        let mut buf = bytes::BytesMut::from(&b"\x02\x00\x02"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::TooLarge { len: 2, capacity: 1 }));
        assert_eq!(err.kind(), common::error::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn truncated_frame_at_eof_is_peer_closed() {
        let mut codec = NdtCodec::default();
        let mut buf = bytes::BytesMut::from(&b"\x05\x00\x05ab"[..]);
        assert!(matches!(codec.decode_eof(&mut buf), Err(Error::PeerClosed)));
        let mut empty = bytes::BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn every_tag_maps_back() {
        for tag in 0..=u8::MAX {
            assert_eq!(u8::from(MessageType::from(tag)), tag);
        }
    }

    #[test]
    fn payload_over_limit_fails_at_encode() {
        let mut codec = NdtCodec::default();
        let mut buf = bytes::BytesMut::new();
        let err = codec
            .encode(
                Message::new(MessageType::Results, vec![b'x'; MAX_PAYLOAD + 1]),
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(65536)));
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn encode_decode_reproduces_message(
            tag in any::<u8>(),
            len in 0usize..=MAX_PAYLOAD,
            fill in any::<u8>(),
        ) {
            let mut codec = NdtCodec::default();
            let message = Message::new(MessageType::from(tag), vec![fill; len]);
            let mut buf = bytes::BytesMut::new();
            codec.encode(message.clone(), &mut buf).unwrap();
            prop_assert_eq!(buf.len(), HEADER_LEN + len);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, message);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn oversized_payloads_always_fail(extra in 1usize..1024) {
            let mut codec = NdtCodec::default();
            let mut buf = bytes::BytesMut::new();
            let message = Message::new(MessageType::TestMsg, vec![0u8; MAX_PAYLOAD + extra]);
            prop_assert!(codec.encode(message, &mut buf).is_err());
        }
    }
}
