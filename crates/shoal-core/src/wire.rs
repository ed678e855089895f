use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    ids::{Fingerprint, NodeId},
};

/// Mode byte announcing a length-prefixed control message.
pub const INCOMING_MESSAGE: u8 = 0x1;
/// Mode byte announcing a length-prefixed raw byte stream.
pub const INCOMING_STREAM: u8 = 0x2;

/// Upper bound on an encoded control message. Bulk payloads never travel
/// in control frames, so this stays small.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// The control-message tagged union. Every variant carries the
/// originator's node identity and the fingerprint it concerns; CBOR's
/// externally-tagged enum encoding keeps the frame self-describing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    StoreFile {
        origin: NodeId,
        fingerprint: Fingerprint,
        size: u64,
    },
    GetFile {
        origin: NodeId,
        fingerprint: Fingerprint,
    },
    GetFileNotFound {
        origin: NodeId,
        fingerprint: Fingerprint,
    },
    StoreAck {
        origin: NodeId,
        fingerprint: Fingerprint,
        ok: bool,
    },
    DeleteFile {
        origin: NodeId,
        fingerprint: Fingerprint,
    },
    DeleteAck {
        origin: NodeId,
        fingerprint: Fingerprint,
        ok: bool,
    },
    DuplicateCheck {
        origin: NodeId,
        fingerprint: Fingerprint,
    },
    DuplicateResponse {
        origin: NodeId,
        fingerprint: Fingerprint,
        held: bool,
    },
}

impl Command {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Command::StoreFile { fingerprint, .. }
            | Command::GetFile { fingerprint, .. }
            | Command::GetFileNotFound { fingerprint, .. }
            | Command::StoreAck { fingerprint, .. }
            | Command::DeleteFile { fingerprint, .. }
            | Command::DeleteAck { fingerprint, .. }
            | Command::DuplicateCheck { fingerprint, .. }
            | Command::DuplicateResponse { fingerprint, .. } => fingerprint,
        }
    }

    pub fn origin(&self) -> &NodeId {
        match self {
            Command::StoreFile { origin, .. }
            | Command::GetFile { origin, .. }
            | Command::GetFileNotFound { origin, .. }
            | Command::StoreAck { origin, .. }
            | Command::DeleteFile { origin, .. }
            | Command::DeleteAck { origin, .. }
            | Command::DuplicateCheck { origin, .. }
            | Command::DuplicateResponse { origin, .. } => origin,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Command::StoreFile { .. } => "StoreFile",
            Command::GetFile { .. } => "GetFile",
            Command::GetFileNotFound { .. } => "GetFileNotFound",
            Command::StoreAck { .. } => "StoreAck",
            Command::DeleteFile { .. } => "DeleteFile",
            Command::DeleteAck { .. } => "DeleteAck",
            Command::DuplicateCheck { .. } => "DuplicateCheck",
            Command::DuplicateResponse { .. } => "DuplicateResponse",
        }
    }
}

/// One decoded wire interaction.
///
/// `Stream` deliberately carries only the declared length: the payload
/// bytes stay on the socket for the application to consume directly,
/// which is what the per-peer gate protects.
#[derive(Debug)]
pub enum Frame {
    Control(Command),
    Stream { len: u64 },
}

/// Write a control frame: mode byte, u32 big-endian length, CBOR payload.
pub async fn write_command<W>(io: &mut W, command: &Command) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = crate::cbor::to_vec(command)?;
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(Error::protocol("control message exceeds max size"));
    }
    io.write_u8(INCOMING_MESSAGE).await?;
    io.write_u32(payload.len() as u32).await?;
    io.write_all(&payload).await?;
    io.flush().await?;
    Ok(())
}

/// Write a bulk-stream header: mode byte, u64 big-endian length. The
/// caller follows up with exactly `len` raw bytes.
pub async fn write_stream_header<W>(io: &mut W, len: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    io.write_u8(INCOMING_STREAM).await?;
    io.write_u64(len).await?;
    io.flush().await?;
    Ok(())
}

/// Read exactly one frame header.
///
/// For control frames the full message is consumed and decoded; for bulk
/// streams only the 9 header bytes are consumed and the declared payload
/// is left on the socket.
pub async fn read_frame<R>(io: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mode = io.read_u8().await?;
    match mode {
        INCOMING_MESSAGE => {
            let len = io.read_u32().await? as usize;
            if len > MAX_MESSAGE_BYTES {
                return Err(Error::protocol("control frame exceeds max size"));
            }
            let mut payload = vec![0u8; len];
            io.read_exact(&mut payload).await?;
            Ok(Frame::Control(crate::cbor::from_slice(&payload)?))
        }
        INCOMING_STREAM => {
            let len = io.read_u64().await?;
            Ok(Frame::Stream { len })
        }
        other => Err(Error::Protocol(format!("unknown frame mode byte {other:#04x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commands() -> Vec<Command> {
        let origin = NodeId::generate();
        let fingerprint = Fingerprint::of("wire-test");
        vec![
            Command::StoreFile {
                origin,
                fingerprint,
                size: 43,
            },
            Command::GetFile {
                origin,
                fingerprint,
            },
            Command::GetFileNotFound {
                origin,
                fingerprint,
            },
            Command::StoreAck {
                origin,
                fingerprint,
                ok: true,
            },
            Command::DeleteFile {
                origin,
                fingerprint,
            },
            Command::DeleteAck {
                origin,
                fingerprint,
                ok: false,
            },
            Command::DuplicateCheck {
                origin,
                fingerprint,
            },
            Command::DuplicateResponse {
                origin,
                fingerprint,
                held: true,
            },
        ]
    }

    #[tokio::test]
    async fn every_variant_roundtrips_through_a_frame() {
        for command in sample_commands() {
            let (mut a, mut b) = tokio::io::duplex(4096);
            write_command(&mut a, &command).await.expect("write");
            match read_frame(&mut b).await.expect("read") {
                Frame::Control(decoded) => assert_eq!(decoded, command),
                Frame::Stream { .. } => panic!("control frame decoded as stream"),
            }
        }
    }

    #[test]
    fn accessors_agree_across_every_variant() {
        let commands = sample_commands();
        let origin = *commands[0].origin();
        for command in &commands {
            assert_eq!(command.origin(), &origin);
            assert_eq!(command.fingerprint(), &Fingerprint::of("wire-test"));
            assert!(!command.label().is_empty());
        }
    }

    #[tokio::test]
    async fn decoder_consumes_exactly_one_message() {
        let origin = NodeId::generate();
        let first = Command::GetFile {
            origin,
            fingerprint: Fingerprint::of("first"),
        };
        let second = Command::DeleteFile {
            origin,
            fingerprint: Fingerprint::of("second"),
        };

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_command(&mut a, &first).await.expect("write first");
        write_command(&mut a, &second).await.expect("write second");

        let Frame::Control(got_first) = read_frame(&mut b).await.expect("read first") else {
            panic!("expected control frame");
        };
        let Frame::Control(got_second) = read_frame(&mut b).await.expect("read second") else {
            panic!("expected control frame");
        };
        assert_eq!(got_first, first);
        assert_eq!(got_second, second);
    }

    #[tokio::test]
    async fn stream_frame_leaves_payload_unconsumed() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_stream_header(&mut a, 5).await.expect("header");
        a.write_all(b"hello").await.expect("payload");

        let Frame::Stream { len } = read_frame(&mut b).await.expect("read header") else {
            panic!("expected stream frame");
        };
        assert_eq!(len, 5);

        let mut payload = [0u8; 5];
        b.read_exact(&mut payload).await.expect("payload intact");
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn unknown_mode_byte_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u8(0x7).await.expect("mode");

        let err = read_frame(&mut b).await.expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_control_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u8(INCOMING_MESSAGE).await.expect("mode");
        a.write_u32(MAX_MESSAGE_BYTES as u32 + 1).await.expect("len");

        let err = read_frame(&mut b).await.expect_err("must reject");
        assert!(matches!(err, Error::Protocol(_)));
    }

    /// A control frame whose declared length covers more than the one
    /// encoded message must not be silently accepted.
    #[tokio::test]
    async fn trailing_bytes_inside_a_control_frame_are_rejected() {
        let command = Command::GetFile {
            origin: NodeId::generate(),
            fingerprint: Fingerprint::of("padded"),
        };
        let mut payload = crate::cbor::to_vec(&command).expect("encode");
        payload.extend_from_slice(&[0u8; 3]);

        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_u8(INCOMING_MESSAGE).await.expect("mode");
        a.write_u32(payload.len() as u32).await.expect("len");
        a.write_all(&payload).await.expect("payload");

        let err = read_frame(&mut b).await.expect_err("must reject padding");
        assert!(matches!(err, Error::Protocol(_)));
    }
}
