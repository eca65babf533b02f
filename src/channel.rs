//! Wrapper to in-memory channels.
//!
//! This module exists to ease the transition between channel libraries.

use std::time::Duration;

use flume::{
    bounded as bounded_ext, Receiver as ReceiverExt, RecvTimeoutError as ExtRecvTimeoutError,
    SendError as SendErrorExt, Sender as SenderExt,
};

pub trait ChannelItem: Send + 'static {}
impl<T: Send + 'static> ChannelItem for T {}

pub type SendError<T> = SendErrorExt<T>;
pub type RecvTimeoutError = ExtRecvTimeoutError;

/// Crate a new pair sender/receiver with limited capacity.
pub(crate) fn bounded<T: ChannelItem>(size: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = bounded_ext(size);
    (Sender(tx), Receiver(rx))
}

/// A wrapper on a bounded channel sender.
#[derive(Debug, Clone)]
pub(crate) struct Sender<T: ChannelItem>(SenderExt<T>);
/// A wrapper on a bounded channel receiver.
#[derive(Debug)]
pub(crate) struct Receiver<T: ChannelItem>(ReceiverExt<T>);

impl<T: ChannelItem> Sender<T> {
    /// Send a message in the channel, blocking if it's full.
    #[inline]
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        self.0.send(item)
    }
}

impl<T: ChannelItem> Receiver<T> {
    /// Block until a message is present in the channel and return it when ready.
    ///
    /// If the timeout expires an error is returned.
    #[inline]
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.0.recv_timeout(timeout)
    }
}
