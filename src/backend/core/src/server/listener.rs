//! Listeners whose connections can be closed from outside.
//!
//! Graceful shutdown only stops accepting and lets in-flight requests finish.
//! Once the drain window is over the remaining connections are closed here:
//! HTTP connections live in a [`JoinSet`] owned by the accept loop, gRPC
//! connections read and write through a [`ClosableStream`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;
use tracing::{debug, info, warn};

/// A connection that fails every read and write once its token is canceled.
pub(crate) struct ClosableStream<S> {
    inner: S,
    token: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> ClosableStream<S> {
    pub(crate) fn new(inner: S, token: &CancellationToken) -> Self {
        Self {
            inner,
            token: token.clone(),
            closed: Box::pin(token.clone().cancelled_owned()),
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.closed.as_mut().poll(cx).is_ready()
    }
}

fn force_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection force-closed")
}

impl<S: AsyncRead + Unpin> AsyncRead for ClosableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.poll_closed(cx) {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ClosableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.poll_closed(cx) {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.poll_closed(cx) {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: Connected> Connected for ClosableStream<S> {
    type ConnectInfo = S::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Accepted connections, each closed when `kill` is canceled.
pub(crate) fn closable_incoming(
    listener: TcpListener,
    kill: CancellationToken,
) -> impl Stream<Item = io::Result<ClosableStream<tokio::net::TcpStream>>> {
    TcpListenerStream::new(listener)
        .map(move |accepted| accepted.map(|stream| ClosableStream::new(stream, &kill)))
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Serve `router` until `stop`, then drain connections until they finish
/// or `kill` is canceled, whichever comes first.
pub(crate) async fn serve_router(
    listener: TcpListener,
    router: Router,
    stop: CancellationToken,
    kill: CancellationToken,
) {
    let service = TowerToHyperService::new(router);
    let mut connections = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };
        connections.spawn(serve_connection(stream, peer, service.clone(), stop.clone()));
    }
    drop(listener);

    if connections.is_empty() {
        return;
    }
    info!(connections = connections.len(), "Draining connections");
    tokio::select! {
        _ = async { while connections.join_next().await.is_some() {} } => {}
        _ = kill.cancelled() => {
            warn!(connections = connections.len(), "Force-closing connections");
            connections.shutdown().await;
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    service: TowerToHyperService<Router>,
    stop: CancellationToken,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let served = tokio::select! {
        served = conn.as_mut() => served,
        _ = stop.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = served {
        debug!(%peer, error = %e, "Connection closed with error");
    }
}
