//! Transport bounds and helpers.
//!
//! A transport is any bidirectional byte stream; sessions split it into
//! read and write halves internally. Stateless sessions go through a
//! [`ChannelFactory`] that opens a fresh channel per call.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// A bidirectional byte stream a stateful session can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Object-safe channel handle produced by a [`ChannelFactory`].
pub trait DynChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DynChannel for T {}

/// Opens a fresh bidirectional channel for each stateless call.
pub trait ChannelFactory: Send + Sync + 'static {
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn DynChannel>>> + Send>>;
}

impl<F, Fut, C> ChannelFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<C>> + Send + 'static,
    C: DynChannel + 'static,
{
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn DynChannel>>> + Send>> {
        let fut = (self)();
        Box::pin(async move { fut.await.map(|c| Box::new(c) as Box<dyn DynChannel>) })
    }
}

/// An in-process transport pair, mostly for tests and examples.
pub fn memory_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(65536)
}
