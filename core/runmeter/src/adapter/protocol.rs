//! Adapter protocol: defines the messages exchanged by the hub and the adapters.
//!
//! Each message is a frame made of a 4-bytes big-endian header, which contains
//! the length of the body, followed by the body, serialized with `postcard`.
//!
//! A session goes like this:
//! 1. the hub connects to the adapter and sends [`Subscribe`]
//! 2. the adapter answers with [`Welcome`], accepting or rejecting the subscription
//! 3. the adapter streams [`WireReading`]s, and [`MessageEnum::Heartbeat`]s when it is idle.

use std::{io, time::Duration};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::error::Elapsed,
};

use crate::measurement::{PowerKind, Stamp};

/// Version number of the current protocol.
///
/// IMPORTANT: you must increase this number when the protocol changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size (in bytes) of a message body.
///
/// Larger messages are rejected and the connection is closed.
pub const MAX_MESSAGE_BODY_SIZE: u32 = 1_048_576; // 1 MiB

/// Capacity (in bytes) of the serialization/deserialization buffer.
const BUFFER_CAPACITY: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error.
    #[error("tcp i/o error")]
    Io(#[from] std::io::Error),

    /// A serde error. When reading, the frame has been skipped and the stream can still be used.
    #[error("(de)serialization error")]
    Serde(#[from] postcard::Error),

    /// EOF at message boundary.
    #[error("peer disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// The name of the hub or adapter that sends the message.
    pub sender: String,

    /// The content of the message.
    pub content: MessageEnum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageEnum {
    Subscribe(Subscribe),
    Welcome(Welcome),
    Reading(WireReading),
    Heartbeat,
}

/// Sent by the hub at the beginning of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub client: String,
    pub protocol_version: u32,
}

/// Sent by the adapter in response to [`Subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub accept: bool,
    pub protocol_version: u32,
    /// The power sources that the adapter reports.
    pub sources: Vec<String>,
}

/// A power reading, as sent on the wire.
///
/// It is validated by the hub before being used, see [`crate::adapter::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReading {
    pub source_id: String,
    pub stamp: Stamp,
    pub value: f64,
    pub kind: PowerKind,
}

/// Allows to read/write protocol messages from/to an asynchronous IO stream.
pub struct MessageStream<S: AsyncRead + AsyncWrite + Unpin> {
    stream: S,
    serializer: postcard::Serializer<OpenVecFlavor>,
    deserialization_buffer: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageStream<S> {
    pub fn new(underlying: S) -> Self {
        Self {
            stream: underlying,
            serializer: postcard::Serializer {
                output: OpenVecFlavor::new(Vec::with_capacity(BUFFER_CAPACITY)),
            },
            deserialization_buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
        }
    }

    pub async fn write_message(&mut self, msg: &MessageBody) -> Result<(), Error> {
        // reserve 4 bytes for the msg length
        self.serializer.output.bytes.clear();
        self.serializer.output.bytes.resize(4, 0);

        // serialize the message
        if let Err(e) = msg.serialize(&mut self.serializer) {
            self.serializer.output.bytes.clear();
            return Err(e.into());
        }

        // prepend the actual length
        let len = self.serializer.output.bytes.len() - 4;
        let len_bytes = (len as u32).to_be_bytes();
        log::trace!("body length: {len}");
        log::trace!("body to serialize: {msg:?}");

        let header = &mut self.serializer.output.bytes[0..4];
        header.copy_from_slice(&len_bytes);

        // write to the socket
        self.stream.write_all(&self.serializer.output.bytes).await?;
        self.serializer.output.bytes.clear();
        Ok(())
    }

    /// Writes a frame with an arbitrary body.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(body.len()).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(body).await?;
        Ok(())
    }

    pub async fn read_timeout(&mut self, timeout: Duration) -> Result<Result<MessageBody, Error>, Elapsed> {
        tokio::time::timeout(timeout, self.read_message()).await
    }

    /// Reads the next message.
    ///
    /// Cancel-safe: the bytes that have already been received stay in the buffer.
    pub async fn read_message(&mut self) -> Result<MessageBody, Error> {
        // Read from the socket until we get the 4 bytes of the header.
        while self.deserialization_buffer.len() < 4 {
            let n = self.stream.read_buf(&mut self.deserialization_buffer).await?;
            if n == 0 {
                if self.deserialization_buffer.is_empty() {
                    return Err(Error::Disconnected);
                } else {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            }
        }
        // Parse the header: it's just the length of the message body
        let mut body_len_bytes = [0u8; 4];
        body_len_bytes.copy_from_slice(&self.deserialization_buffer[0..4]);
        let body_len = u32::from_be_bytes(body_len_bytes);
        log::trace!(
            "body length: {body_len}; already in the buffer: {}",
            self.deserialization_buffer.len()
        );

        // Prevent DOS attack or invalid length.
        if body_len > MAX_MESSAGE_BODY_SIZE {
            let msg = format!("message too big: body length is {body_len}, the maximum is {MAX_MESSAGE_BODY_SIZE}");
            return Err(io::Error::new(io::ErrorKind::InvalidData, msg).into());
        }

        // Ensure that we have enough capacity for the entire message, then read it.
        let message_len = (body_len as usize) + 4;
        if let Some(additional) = message_len.checked_sub(self.deserialization_buffer.len()) {
            self.deserialization_buffer.reserve(additional);
        }
        while self.deserialization_buffer.len() < message_len {
            let n = self.stream.read_buf(&mut self.deserialization_buffer).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }

        // Take the frame (header and body), leave the remaining bytes in the buffer.
        let message_bytes = self.deserialization_buffer.split_to(message_len);
        let body_bytes = &message_bytes[4..];

        // The frame has been consumed: on error, the next read starts at the next frame.
        let (body_msg, unused_bytes): (MessageBody, &[u8]) = postcard::take_from_bytes(body_bytes)?;
        if !unused_bytes.is_empty() {
            log::warn!(
                "{} unused bytes after decoded message body {:?}",
                unused_bytes.len(),
                body_msg
            );
        }
        log::trace!("deserialized body: {body_msg:?}");
        Ok(body_msg)
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        self.stream.shutdown().await
    }
}

impl MessageStream<TcpStream> {
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr, std::io::Error> {
        self.stream.peer_addr()
    }
}

struct OpenVecFlavor {
    bytes: Vec<u8>,
}

impl OpenVecFlavor {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl postcard::ser_flavors::Flavor for OpenVecFlavor {
    type Output = Vec<u8>;

    #[inline(always)]
    fn try_push(&mut self, data: u8) -> postcard::Result<()> {
        self.bytes.push(data);
        Ok(())
    }

    #[inline(always)]
    fn try_extend(&mut self, data: &[u8]) -> postcard::Result<()> {
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    fn finalize(self) -> postcard::Result<Self::Output> {
        Ok(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn reading(seq: u64) -> MessageBody {
        MessageBody {
            sender: String::from("adapter"),
            content: MessageEnum::Reading(WireReading {
                source_id: String::from("gpu0"),
                stamp: Stamp::Sequence(seq),
                value: 42.5,
                kind: PowerKind::Watts,
            }),
        }
    }

    #[tokio::test]
    async fn message_rw() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = MessageStream::new(a);
        let mut reader = MessageStream::new(b);

        let greet = MessageBody {
            sender: String::from("hub"),
            content: MessageEnum::Subscribe(Subscribe {
                client: String::from("hub-test"),
                protocol_version: PROTOCOL_VERSION,
            }),
        };
        let task = tokio::spawn(async move {
            writer.write_message(&greet).await?;
            writer.write_message(&reading(1)).await?;
            writer.write_message(&reading(2)).await?;
            Ok::<_, Error>((writer, greet))
        });
        let first = reader.read_message().await?;
        let second = reader.read_message().await?;
        let third = reader.read_message().await?;
        let (writer, greet) = task.await??;
        assert_eq!(first, greet);
        assert_eq!(second, reading(1));
        assert_eq!(third, reading(2));

        drop(writer);
        assert!(matches!(reader.read_message().await, Err(Error::Disconnected)));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = MessageStream::new(a);
        let mut reader = MessageStream::new(b);

        writer.write_frame(&[0xff, 0xff, 0xff, 0x13]).await?;
        writer.write_message(&reading(7)).await?;

        assert!(matches!(reader.read_message().await, Err(Error::Serde(_))));
        assert_eq!(reader.read_message().await?, reading(7));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() -> anyhow::Result<()> {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = MessageStream::new(b);
        a.write_all(&(MAX_MESSAGE_BODY_SIZE + 1).to_be_bytes()).await?;
        assert!(matches!(reader.read_message().await, Err(Error::Io(_))));
        Ok(())
    }

    #[tokio::test]
    async fn truncated_frame() -> anyhow::Result<()> {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = MessageStream::new(b);
        a.write_all(&10u32.to_be_bytes()).await?;
        a.write_all(&[1, 2, 3]).await?;
        drop(a);
        assert!(matches!(reader.read_message().await, Err(Error::Io(_))));
        Ok(())
    }
}
