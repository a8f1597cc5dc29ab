//! Control-plane framing between agent and controller.
//!
//! Every protocol message rides in a single ZeroMQ frame: a fixed
//! 12-byte prefix followed by a JSON body. ZeroMQ preserves frame
//! boundaries, so no length field is carried; the body is whatever
//! remains after the prefix.
//!
//! ```text
//! offset  0       2     3    4              12
//!         [MAGIC ][REV ][OP ][SEQ, u64 BE  ][JSON body ...]
//! ```
//!
//! The magic bytes reject cross-protocol traffic before any parsing
//! happens, the revision byte gates incompatible peers, and the
//! sequence number correlates request/reply pairs (it is zero on the
//! publish stream).

pub mod defaults;
pub mod envelope;
pub mod error;
pub mod jid;
pub mod ledger;
pub mod paths;

pub use envelope::{
    CommandEnvelope, EventLoad, FunTarget, JobResult, PubPayload, ReturnLoad, SignInAck,
    SignInPayload, ENC_VERIFIED,
};
pub use error::{AgentError, ProtocolError};
pub use ledger::JobRecord;

/// Frame prefix magic.
pub const FRAME_MAGIC: [u8; 2] = *b"OR";

/// Protocol revision.
pub const PROTOCOL_REVISION: u8 = 1;

/// Fixed prefix length: magic + revision + opcode + sequence.
pub const FRAME_PREFIX: usize = 12;

/// Ceiling on an encoded frame. Anything larger is refused before it
/// reaches a socket; command loads and returns are far smaller.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Control-plane opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Agent -> controller: "I am agent <id>, give me a session token."
    SignIn = 1,
    /// Controller -> agent: the token.
    SignInAck = 2,
    /// Controller -> agent, publish stream: an `{enc, load}` command
    /// publication.
    Publish = 3,
    /// Agent -> controller, request channel: a load with a `cmd` field
    /// (`_return`, `_syndic_return`, `_minion_event`, ...).
    Request = 4,
    /// Controller -> agent: request accepted.
    Ack = 5,
    /// Either direction: something went wrong.
    Err = 6,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, ProtocolError> {
        Ok(match raw {
            1 => OpCode::SignIn,
            2 => OpCode::SignInAck,
            3 => OpCode::Publish,
            4 => OpCode::Request,
            5 => OpCode::Ack,
            6 => OpCode::Err,
            other => return Err(ProtocolError::UnknownOpCode(other)),
        })
    }
}

/// One framed message: opcode, sequence number and JSON body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub opcode: OpCode,
    pub seq: u64,
    pub body: Vec<u8>,
}

impl Frame {
    /// Refuses bodies that would push the frame past [`MAX_FRAME_SIZE`].
    pub fn new(opcode: OpCode, seq: u64, body: Vec<u8>) -> Result<Self, ProtocolError> {
        if body.len() > MAX_FRAME_SIZE - FRAME_PREFIX {
            return Err(ProtocolError::FrameTooLarge {
                size: FRAME_PREFIX + body.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Self { opcode, seq, body })
    }

    /// Frame up the JSON encoding of `value`.
    pub fn from_json<T: serde::Serialize>(
        opcode: OpCode,
        seq: u64,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Self::new(opcode, seq, serde_json::to_vec(value)?)
    }

    /// Decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Encode into one wire buffer: prefix, then body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_PREFIX + self.body.len());
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.push(PROTOCOL_REVISION);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode one wire buffer, validating magic, revision and opcode.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_PREFIX {
            return Err(ProtocolError::Truncated {
                needed: FRAME_PREFIX,
                got: buf.len(),
            });
        }
        if buf[..2] != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic([buf[0], buf[1]]));
        }
        if buf[2] != PROTOCOL_REVISION {
            return Err(ProtocolError::RevisionMismatch {
                ours: PROTOCOL_REVISION,
                theirs: buf[2],
            });
        }
        let opcode = OpCode::try_from(buf[3])?;
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&buf[4..FRAME_PREFIX]);
        Ok(Self {
            opcode,
            seq: u64::from_be_bytes(seq_bytes),
            body: buf[FRAME_PREFIX..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_survive_the_wire() {
        for opcode in [
            OpCode::SignIn,
            OpCode::SignInAck,
            OpCode::Publish,
            OpCode::Request,
            OpCode::Ack,
            OpCode::Err,
        ] {
            let frame =
                Frame::from_json(opcode, 77, &json!({"enc": "aes", "load": {}})).unwrap();
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(frame, decoded);
            assert_eq!(decoded.json::<serde_json::Value>().unwrap()["enc"], "aes");
        }
    }

    #[test]
    fn publish_stream_frames_carry_seq_zero() {
        let frame = Frame::new(OpCode::Publish, 0, b"{}".to_vec()).unwrap();
        let wire = frame.encode();
        assert_eq!(&wire[..2], b"OR");
        assert_eq!(wire[2], PROTOCOL_REVISION);
        assert_eq!(wire.len(), FRAME_PREFIX + 2);
        assert_eq!(Frame::decode(&wire).unwrap().seq, 0);
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut wire = Frame::new(OpCode::Ack, 1, Vec::new()).unwrap().encode();
        wire[0] = b'X';
        assert!(matches!(
            Frame::decode(&wire),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn future_revision_is_rejected() {
        let mut wire = Frame::new(OpCode::Ack, 1, Vec::new()).unwrap().encode();
        wire[2] = PROTOCOL_REVISION + 1;
        assert!(matches!(
            Frame::decode(&wire),
            Err(ProtocolError::RevisionMismatch { theirs, .. }) if theirs == PROTOCOL_REVISION + 1
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut wire = Frame::new(OpCode::Ack, 1, Vec::new()).unwrap().encode();
        wire[3] = 0xEE;
        assert!(matches!(
            Frame::decode(&wire),
            Err(ProtocolError::UnknownOpCode(0xEE))
        ));
    }

    #[test]
    fn truncated_prefix_is_rejected() {
        let wire = Frame::new(OpCode::Request, 9, b"{}".to_vec()).unwrap().encode();
        for cut in 0..FRAME_PREFIX {
            assert!(
                matches!(
                    Frame::decode(&wire[..cut]),
                    Err(ProtocolError::Truncated { .. })
                ),
                "cut at {cut}"
            );
        }
        // exactly the prefix is a valid empty-body frame
        assert!(Frame::decode(&wire[..FRAME_PREFIX]).is_ok());
    }

    #[test]
    fn oversized_body_is_refused() {
        let body = vec![0u8; MAX_FRAME_SIZE - FRAME_PREFIX + 1];
        assert!(matches!(
            Frame::new(OpCode::Request, 1, body),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
