//! Connection bridge
//!
//! Joins an accepted client leg to an upstream leg. Each direction is a pull
//! loop: one item is read, every item the interceptor produces for it is
//! written and flushed, and only then is the next item read. A peer that
//! stops reading therefore stops its producer from being read as well.

use std::future::Future;
use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};

use crate::common::{ProxyError, Result};

/// Turns one item read from a leg into what is written to the other
pub trait Interceptor<I, O>: Send {
    fn intercept(&mut self, item: I) -> impl Future<Output = Result<Vec<O>>> + Send;
}

/// Forwards every item unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl<T: Send> Interceptor<T, T> for Passthrough {
    async fn intercept(&mut self, item: T) -> Result<Vec<T>> {
        Ok(vec![item])
    }
}

/// Writing half of one side of a connection
pub struct Leg<K, T> {
    name: &'static str,
    sink: Option<K>,
    _item: PhantomData<fn(T)>,
}

impl<K, T> Leg<K, T>
where
    K: Sink<T, Error = ProxyError> + Unpin,
{
    pub fn new(name: &'static str, sink: K) -> Self {
        Self { name, sink: Some(sink), _item: PhantomData }
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Write and flush one item
    pub async fn send(&mut self, item: T) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.send(item).await,
            None => Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} leg is closed", self.name),
            ))),
        }
    }

    /// Flush and close; later calls do nothing
    pub async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!("Closing {} leg: {}", self.name, e);
            }
        }
    }
}

async fn relay<I, O, S, K, F>(
    label: &str,
    direction: &str,
    mut source: S,
    sink: &mut Leg<K, O>,
    interceptor: &mut F,
) -> Result<()>
where
    S: Stream<Item = Result<I>> + Unpin,
    K: Sink<O, Error = ProxyError> + Unpin,
    F: Interceptor<I, O>,
{
    let mut items = 0u64;
    while let Some(item) = source.next().await {
        let item = item?;
        items += 1;
        for output in interceptor.intercept(item).await? {
            sink.send(output).await?;
        }
    }
    trace!("{} {} reached end of stream after {} items", label, direction, items);
    Ok(())
}

/// Two interceptors, one per direction
pub struct Bridge<C, S> {
    label: String,
    client_to_server: C,
    server_to_client: S,
}

impl<C, S> Bridge<C, S> {
    pub fn new(label: impl Into<String>, client_to_server: C, server_to_client: S) -> Self {
        Self { label: label.into(), client_to_server, server_to_client }
    }

    /// Relay between the client leg and the leg produced by `connect`
    ///
    /// The upstream leg is opened only now that the client leg exists. If it
    /// cannot be opened the client leg is closed and the error returned.
    /// When either direction ends both legs are closed.
    pub async fn run<CI, CO, UI, UO, CS, CK, US, UK, Fut>(
        self,
        client_source: CS,
        client_sink: CK,
        connect: Fut,
    ) -> Result<()>
    where
        CS: Stream<Item = Result<CI>> + Unpin,
        CK: Sink<CO, Error = ProxyError> + Unpin,
        US: Stream<Item = Result<UI>> + Unpin,
        UK: Sink<UO, Error = ProxyError> + Unpin,
        Fut: Future<Output = Result<(US, UK)>>,
        C: Interceptor<CI, UO>,
        S: Interceptor<UI, CO>,
    {
        let Bridge { label, mut client_to_server, mut server_to_client } = self;
        let mut client = Leg::new("client", client_sink);

        let (upstream_source, upstream_sink) = match connect.await {
            Ok(upstream) => upstream,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };
        let mut upstream = Leg::new("upstream", upstream_sink);

        let result = {
            let outbound = relay(&label, "client->server", client_source, &mut upstream, &mut client_to_server);
            let inbound = relay(&label, "server->client", upstream_source, &mut client, &mut server_to_client);
            tokio::select! {
                result = outbound => {
                    debug!("{} client side finished", label);
                    result
                }
                result = inbound => {
                    debug!("{} server side finished", label);
                    result
                }
            }
        };

        upstream.close().await;
        client.close().await;
        result
    }
}

/// Chunks read from `reader`, at most `capacity` bytes at a time
pub fn byte_source<R>(reader: R, capacity: usize) -> impl Stream<Item = Result<Bytes>> + Unpin + Send
where
    R: AsyncRead + Unpin + Send,
{
    FramedRead::with_capacity(reader, BytesCodec::new(), capacity)
        .map(|chunk| chunk.map(BytesMut::freeze).map_err(ProxyError::Io))
}

pub fn byte_sink<W>(writer: W) -> impl Sink<Bytes, Error = ProxyError> + Unpin + Send
where
    W: AsyncWrite + Unpin + Send,
{
    // BytesCodec encodes both Bytes and BytesMut
    SinkExt::<Bytes>::sink_map_err(FramedWrite::new(writer, BytesCodec::new()), ProxyError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A peer that never accepts another item
    struct StalledSink;

    impl Sink<Bytes> for StalledSink {
        type Error = ProxyError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Bytes) -> Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn drain() -> impl Sink<Bytes, Error = ProxyError> + Unpin {
        futures::sink::drain().sink_map_err(|never: Infallible| -> ProxyError { match never {} })
    }

    #[tokio::test]
    async fn test_stalled_sink_stops_reads() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        let source = futures::stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"x"))
        });
        let connect = async { Ok((futures::stream::pending::<Result<Bytes>>(), StalledSink)) };

        let bridge = Bridge::new("test", Passthrough, Passthrough);
        let outcome = tokio::time::timeout(Duration::from_millis(100), bridge.run(source, drain(), connect)).await;

        assert!(outcome.is_err());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_closes_client() {
        let (client, proxy_side) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(proxy_side);
        let connect = async {
            Err::<(futures::stream::Pending<Result<Bytes>>, StalledSink), _>(ProxyError::Timeout(
                "connect".to_string(),
            ))
        };

        let bridge = Bridge::new("test", Passthrough, Passthrough);
        let result = bridge.run(byte_source(reader, 64), byte_sink(writer), connect).await;
        assert!(matches!(result, Err(ProxyError::Timeout(_))));

        let (mut client_reader, _client_writer) = tokio::io::split(client);
        let mut buf = [0u8; 8];
        assert_eq!(client_reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bytes_relay_both_ways() {
        let (mut client, proxy_client) = tokio::io::duplex(1024);
        let (proxy_server, mut server) = tokio::io::duplex(1024);
        let (client_reader, client_writer) = tokio::io::split(proxy_client);

        let bridge = tokio::spawn(async move {
            let connect = async move {
                let (reader, writer) = tokio::io::split(proxy_server);
                Ok((byte_source(reader, 16), byte_sink(writer)))
            };
            Bridge::new("test", Passthrough, Passthrough)
                .run(byte_source(client_reader, 16), byte_sink(client_writer), connect)
                .await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // one side closing closes the other
        drop(server);
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        bridge.await.unwrap().unwrap();
    }

    struct Doubler;

    impl Interceptor<Bytes, Bytes> for Doubler {
        async fn intercept(&mut self, item: Bytes) -> Result<Vec<Bytes>> {
            Ok(vec![item.clone(), item])
        }
    }

    #[tokio::test]
    async fn test_interceptor_may_expand() {
        let source = futures::stream::iter(vec![Ok(Bytes::from_static(b"a"))]);
        let (tx, rx) = futures::channel::mpsc::unbounded::<Bytes>();
        let upstream_sink = tx.sink_map_err(|e| ProxyError::Other(e.to_string()));
        let connect = async move { Ok((futures::stream::pending::<Result<Bytes>>(), upstream_sink)) };

        Bridge::new("test", Doubler, Passthrough)
            .run(source, drain(), connect)
            .await
            .unwrap();
        let written: Vec<Bytes> = rx.collect().await;
        assert_eq!(written, vec![Bytes::from_static(b"a"), Bytes::from_static(b"a")]);
    }
}
