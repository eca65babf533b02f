use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bincode::config::{Configuration, Fixint, Limit, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::network::{Message, Rank, TransferError};

pub(crate) const HEADER_SIZE: usize = 12; // std::mem::size_of::<MessageHeader>();
/// Configuration of the header serializer: the integers must have a fixed length encoding.
pub(crate) static BINCODE_HEADER: Configuration<LittleEndian, Fixint, Limit<HEADER_SIZE>> =
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<HEADER_SIZE>();

pub(crate) static BINCODE_MESSAGE: Configuration = bincode::config::standard();

/// Header of a message sent before the actual message.
#[derive(Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub(crate) struct MessageHeader {
    /// The size of the actual message
    pub(crate) size: u32,
    /// The rank that is sending the message.
    pub(crate) sender: u64,
}

/// A TCP connection to another rank.
pub(crate) struct RemoteLink {
    stream: TcpStream,
    address: String,
    scratch: Vec<u8>,
}

impl RemoteLink {
    /// Wrap a connected stream. Reads from the stream fail after `timeout`.
    pub(crate) fn new(stream: TcpStream, timeout: Duration) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            stream,
            address,
            scratch: Vec::new(),
        })
    }

    pub(crate) fn send(
        &mut self,
        sender: Rank,
        peer: Rank,
        message: &Message,
    ) -> Result<(), TransferError> {
        remote_send(message, sender, peer, &mut self.stream, &mut self.scratch, &self.address)
    }

    /// Receive the next message, returning it together with the rank written in its header.
    ///
    /// `peer` is the rank expected on the other side, used for the diagnostics.
    pub(crate) fn recv_any(&mut self, peer: Rank) -> Result<(Rank, Message), TransferError> {
        let read_timeout = self.stream.read_timeout().ok().flatten();
        remote_recv(peer, &mut self.stream, &mut self.scratch, &self.address).map_err(|e| match e {
            TransferError::Io { source, .. }
                if matches!(source.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                TransferError::Timeout {
                    peer,
                    timeout: read_timeout.unwrap_or_default(),
                }
            }
            TransferError::Io { source, .. } if source.kind() == ErrorKind::UnexpectedEof => {
                TransferError::Disconnected { peer }
            }
            e => e,
        })
    }

    pub(crate) fn recv(&mut self, peer: Rank) -> Result<Message, TransferError> {
        let (sender, message) = self.recv_any(peer)?;
        if sender != peer {
            return Err(TransferError::RankMismatch {
                expected: peer,
                found: sender,
            });
        }
        Ok(message)
    }
}

impl Drop for RemoteLink {
    fn drop(&mut self) {
        let _ = self.stream.flush();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Serialize and send a message to a remote socket.
///
/// The network protocol works as follow:
/// - send a `MessageHeader` serialized with bincode with `FixintEncoding`
/// - send the message
pub(crate) fn remote_send<W: Write>(
    msg: &Message,
    sender: Rank,
    peer: Rank,
    writer: &mut W,
    scratch: &mut Vec<u8>,
    address: &str,
) -> Result<(), TransferError> {
    scratch.clear();
    scratch.resize(HEADER_SIZE, 0);

    let serialized_len = bincode::serde::encode_into_std_write(msg, scratch, BINCODE_MESSAGE)
        .map_err(|source| TransferError::Encode { peer, source })?;

    let size = u32::try_from(serialized_len).map_err(|_| TransferError::Io {
        peer,
        address: address.to_string(),
        source: std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("message of {serialized_len} bytes is too large"),
        ),
    })?;
    let header = MessageHeader {
        size,
        sender: sender as u64,
    };
    bincode::serde::encode_into_slice(header, &mut scratch[0..HEADER_SIZE], BINCODE_HEADER)
        .map_err(|source| TransferError::Encode { peer, source })?;

    debug_assert_eq!(scratch.len(), HEADER_SIZE + serialized_len);

    writer
        .write_all(scratch)
        .and_then(|_| writer.flush())
        .map_err(|source| TransferError::Io {
            peer,
            address: address.to_string(),
            source,
        })?;

    if scratch.len() < scratch.capacity() / 3 {
        scratch.shrink_to(scratch.capacity() / 2);
    }
    Ok(())
}

/// Receive a message from the remote socket, returning the rank of the sender written in the
/// header together with the message.
pub(crate) fn remote_recv<R: Read>(
    peer: Rank,
    reader: &mut R,
    scratch: &mut Vec<u8>,
    address: &str,
) -> Result<(Rank, Message), TransferError> {
    let io_error = |source| TransferError::Io {
        peer,
        address: address.to_string(),
        source,
    };

    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).map_err(io_error)?;

    let (header, header_len): (MessageHeader, _) =
        bincode::serde::decode_from_slice(&header, BINCODE_HEADER)
            .map_err(|source| TransferError::Decode { peer, source })?;
    debug_assert_eq!(HEADER_SIZE, header_len);

    scratch.resize(header.size as usize, 0);
    reader.read_exact(&mut scratch[..]).map_err(io_error)?;

    let (msg, msg_len): (Message, _) = bincode::serde::decode_from_slice(scratch, BINCODE_MESSAGE)
        .map_err(|source| TransferError::Decode { peer, source })?;
    debug_assert_eq!(header.size as usize, msg_len);

    Ok((header.sender as Rank, msg))
}
