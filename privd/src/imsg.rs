//! Internal message framing on the local channel and the worker channel.
//!
//! Every frame is a fixed header followed by a `bincode` payload.

use bytes::BytesMut;
use nix::unistd::getpid;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    convert::TryFrom,
    io::{self, Read, Result, Write},
    mem,
    os::unix::net as std_net,
    path::Path,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use zerocopy::{AsBytes, FromBytes};

/// Async `imsg` handler for one connection.
#[derive(Debug)]
pub struct Handler {
    /// Async UNIX socket.
    socket: UnixStream,
    /// Read buffer.
    read_buffer: BytesMut,
    /// Longest frame accepted from the remote end.
    max_length: usize,
}

impl From<UnixStream> for Handler {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            read_buffer: BytesMut::with_capacity(Self::BUFFER_LENGTH),
            max_length: Message::MAX_LENGTH,
        }
    }
}

impl Handler {
    pub const BUFFER_LENGTH: usize = 0xffff;

    /// Create new handler pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Connect to a listening channel.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        UnixStream::connect(path).await.map(Into::into)
    }

    /// Limit the length of received frames, up to `Message::MAX_LENGTH`.
    pub fn set_max_length(&mut self, length: usize) {
        self.max_length = length.min(Message::MAX_LENGTH);
    }

    /// Send message to remote end.
    pub async fn send_message<T: Serialize>(&mut self, message: Message, data: &T) -> Result<()> {
        if message.id < Message::RESERVED {
            return Err(io::Error::new(io::ErrorKind::Other, "Reserved message ID"));
        }
        self.send_message_internal(message, data).await
    }

    /// Send message to the remote end.
    pub(crate) async fn send_message_internal<T: Serialize>(
        &mut self,
        message: Message,
        data: &T,
    ) -> Result<()> {
        let frame = message.frame(data)?;
        self.socket.write_all(&frame).await
    }

    /// Receive message from the remote end.
    ///
    /// Returns `None` if the remote end closed the connection
    /// between two messages.
    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> Result<Option<(Message, T)>> {
        loop {
            if let Some(message) = Message::peek(&self.read_buffer)? {
                let length = message.length as usize;
                if length > self.max_length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("message length {} exceeds {}", length, self.max_length),
                    ));
                }

                // We have a complete message.
                if self.read_buffer.len() >= length {
                    let frame = self.read_buffer.split_to(length);
                    let data = decode(&frame[Message::HEADER_LENGTH..])?;
                    return Ok(Some((message, data)));
                }
            }

            self.read_buffer.reserve(Self::BUFFER_LENGTH);

            // Read more data.  This is also our yield point in the loop.
            if self.socket.read_buf(&mut self.read_buffer).await? == 0 {
                return if self.read_buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::ErrorKind::UnexpectedEof.into())
                };
            }
        }
    }

    /// Receive a message and require the expected ID.
    pub(crate) async fn expect_message<T: DeserializeOwned>(&mut self, id: u32) -> Result<T> {
        match self.recv_message().await? {
            Some((message, data)) if message.id == id => Ok(data),
            Some((message, _)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected message {}, expected {}", message.id, id),
            )),
            None => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.socket.shutdown().await
    }
}

/// Send one message over a blocking stream.
pub fn send_sync<T: Serialize>(
    stream: &mut std_net::UnixStream,
    message: Message,
    data: &T,
) -> Result<()> {
    let frame = message.frame(data)?;
    stream.write_all(&frame)
}

/// Receive one message from a blocking stream.
pub fn recv_sync<T: DeserializeOwned>(stream: &mut std_net::UnixStream) -> Result<(Message, T)> {
    let mut header = [0u8; Message::HEADER_LENGTH];
    stream.read_exact(&mut header)?;
    let message = Message::peek(&header)?.ok_or(io::ErrorKind::UnexpectedEof)?;

    let mut payload = vec![0u8; message.length as usize - Message::HEADER_LENGTH];
    stream.read_exact(&mut payload)?;

    Ok((message, decode(&payload)?))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Internal message header.
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, Default)]
#[repr(C)]
pub struct Message {
    /// Request type.
    pub id: u32,
    /// Total message length (header + payload).
    pub length: u32,
    /// Optional flags.
    pub flags: u16,
    /// Reserved, must be zero.
    pub reserved: u16,
    /// Optional peer ID.
    pub peer_id: u32,
    /// Local PID.
    pub pid: libc::pid_t,
}

impl Message {
    /// Reserved IDs 0-10
    pub const RESERVED: u32 = 10;

    /// Server challenges the client.
    pub const CHALLENGE: u32 = 1;
    /// Answer to a challenge.
    pub const ANSWER: u32 = 2;
    /// The answer was accepted.
    pub const WELCOME: u32 = 3;
    /// The answer was rejected.
    pub const FAILURE: u32 = 4;

    /// Operation request.
    pub const REQUEST: u32 = 11;
    /// Operation reply.
    pub const REPLY: u32 = 12;
    /// Outcome of a worker.
    pub const OUTCOME: u32 = 13;
    /// Acknowledgement of an outcome.
    pub const ACK: u32 = 14;

    /// Message header length.
    pub const HEADER_LENGTH: usize = mem::size_of::<Self>();

    /// Maximum total message length.
    pub const MAX_LENGTH: usize = 16 * 1024 * 1024;

    /// Maximum length of handshake messages.
    pub const HANDSHAKE_LENGTH: usize = 1024;

    /// Create new message header.
    pub fn new<T: Into<u32>>(id: T) -> Self {
        Message {
            id: id.into(),
            pid: getpid().as_raw(),
            length: Self::HEADER_LENGTH as u32,
            ..Default::default()
        }
    }

    /// Serialize the header and the payload into one frame.
    pub fn frame<T: Serialize>(mut self, data: &T) -> Result<Vec<u8>> {
        let data = bincode::serialize(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let length = Self::HEADER_LENGTH + data.len();
        if length > Self::MAX_LENGTH {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message too long"));
        }
        self.length = u32::try_from(length)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut frame = Vec::with_capacity(length);
        frame.extend_from_slice(self.as_bytes());
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    /// Parse the header at the start of the buffer, if it is complete.
    pub fn peek(chunk: &[u8]) -> Result<Option<Self>> {
        if chunk.len() < Self::HEADER_LENGTH {
            return Ok(None);
        }

        let mut message = Self::default();
        message
            .as_bytes_mut()
            .copy_from_slice(&chunk[..Self::HEADER_LENGTH]);

        let length = message.length as usize;
        if length < Self::HEADER_LENGTH || length > Self::MAX_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid message length {}", length),
            ));
        }

        Ok(Some(message))
    }
}

impl<T: Into<u32>> From<T> for Message {
    fn from(id: T) -> Self {
        Message::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Handler, Message};
    use zerocopy::AsBytes;

    #[test]
    fn test_empty_data() {
        let data = bincode::serialize(&()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_header_length() {
        assert_eq!(Message::HEADER_LENGTH, 20);
    }

    #[test]
    fn test_frame() {
        let frame = Message::new(Message::REPLY).frame(&"hello").unwrap();
        let message = Message::peek(&frame).unwrap().unwrap();
        assert_eq!(message.id, Message::REPLY);
        assert_eq!(message.length as usize, frame.len());
    }

    #[test]
    fn test_incomplete_header() {
        let frame = Message::new(Message::REQUEST).frame(&()).unwrap();
        assert!(Message::peek(&frame[..10]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_length() {
        let mut message = Message::new(Message::REQUEST);
        message.length = 3;
        assert!(Message::peek(message.as_bytes()).is_err());

        message.length = u32::MAX;
        assert!(Message::peek(message.as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_max_length() {
        let (mut sender, mut receiver) = Handler::pair().unwrap();
        receiver.set_max_length(Message::HANDSHAKE_LENGTH);

        sender
            .send_message(Message::new(Message::REQUEST), &"x".repeat(4096))
            .await
            .unwrap();
        let err = receiver.recv_message::<String>().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        // The limit never exceeds the protocol maximum.
        receiver.set_max_length(usize::MAX);
        assert_eq!(receiver.max_length, Message::MAX_LENGTH);
    }
}
