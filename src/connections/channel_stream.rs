// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Poll, Waker},
};

use russh::CryptoVec;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

use super::io::{BoxedTunnelStream, ReadBuffer};

/// AsyncRead/AsyncWrite for converting channels of the outer session into
/// byte streams. Incoming data is routed in by the session's handler;
/// outgoing data is written through the session handle.
pub(crate) struct AsyncRWChannel<H: russh::client::Handler> {
    id: russh::ChannelId,
    session: Arc<russh::client::Handle<H>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,

    readbuf: ReadBuffer,

    is_write_fut_valid: bool,
    write_fut: tokio_util::sync::ReusableBoxFuture<'static, Result<(), russh::CryptoVec>>,
}

impl<H: russh::client::Handler + 'static> AsyncRWChannel<H> {
    pub fn new(
        id: russh::ChannelId,
        session: Arc<russh::client::Handle<H>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        AsyncRWChannel {
            id,
            session,
            incoming,
            readbuf: ReadBuffer::default(),
            is_write_fut_valid: false,
            write_fut: tokio_util::sync::ReusableBoxFuture::new(make_client_write_fut::<H>(None)),
        }
    }
}

/// Makes a future that writes to the russh handle. This general approach was
/// taken from https://docs.rs/tokio-util/0.7.3/tokio_util/sync/struct.PollSender.html
/// This is just like make_server_write_fut, but for clients (they don't share a trait...)
async fn make_client_write_fut<H: russh::client::Handler>(
    data: Option<(
        Arc<russh::client::Handle<H>>,
        russh::ChannelId,
        Vec<u8>,
    )>,
) -> Result<(), russh::CryptoVec> {
    match data {
        Some((client, id, data)) => client.data(id, CryptoVec::from(data)).await,
        None => unreachable!("this future should not be pollable in this state"),
    }
}

impl<H: russh::client::Handler + 'static> AsyncWrite for AsyncRWChannel<H> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if !self.is_write_fut_valid {
            let session = self.session.clone();
            let id = self.id;
            self.write_fut
                .set(make_client_write_fut(Some((session, id, buf.to_vec()))));
            self.is_write_fut_valid = true;
        }

        self.poll_flush(cx).map(|r| r.map(|_| buf.len()))
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        if !self.is_write_fut_valid {
            return Poll::Ready(Ok(()));
        }

        match self.write_fut.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(_)) => {
                self.is_write_fut_valid = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.is_write_fut_valid = false;
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "EOF")))
            }
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl<H: russh::client::Handler + 'static> AsyncRead for AsyncRWChannel<H> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.readbuf.drain(buf) {
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(msg)) if msg.is_empty() => {}
                Poll::Ready(Some(msg)) => return self.readbuf.deliver(buf, &msg),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Server-session counterpart of `AsyncRWChannel`: reads data routed in by
/// the server handler, writes through the server session handle.
pub(crate) struct ServerChannelStream {
    channel: russh::ChannelId,
    handle: russh::server::Handle,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,

    readbuf: ReadBuffer,

    is_write_fut_valid: bool,
    write_fut: tokio_util::sync::ReusableBoxFuture<'static, Result<(), russh::CryptoVec>>,
}

impl ServerChannelStream {
    pub fn new(
        channel: russh::ChannelId,
        handle: russh::server::Handle,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        ServerChannelStream {
            channel,
            handle,
            incoming,
            readbuf: ReadBuffer::default(),
            is_write_fut_valid: false,
            write_fut: tokio_util::sync::ReusableBoxFuture::new(make_server_write_fut(None)),
        }
    }
}

/// Makes a future that writes to the russh handle. This general approach was
/// taken from https://docs.rs/tokio-util/0.7.3/tokio_util/sync/struct.PollSender.html
/// This is just like make_client_write_fut, but for servers (they don't share a trait...)
async fn make_server_write_fut(
    data: Option<(russh::server::Handle, russh::ChannelId, Vec<u8>)>,
) -> Result<(), russh::CryptoVec> {
    match data {
        Some((handle, id, data)) => handle.data(id, CryptoVec::from(data)).await,
        None => unreachable!("this future should not be pollable in this state"),
    }
}

impl AsyncWrite for ServerChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if !self.is_write_fut_valid {
            let handle = self.handle.clone();
            let id = self.channel;
            self.write_fut
                .set(make_server_write_fut(Some((handle, id, buf.to_vec()))));
            self.is_write_fut_valid = true;
        }

        self.poll_flush(cx).map(|r| r.map(|_| buf.len()))
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        if !self.is_write_fut_valid {
            return Poll::Ready(Ok(()));
        }

        match self.write_fut.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(_)) => {
                self.is_write_fut_valid = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.is_write_fut_valid = false;
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "EOF")))
            }
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ServerChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.readbuf.drain(buf) {
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(msg)) if msg.is_empty() => {}
                Poll::Ready(Some(msg)) => return self.readbuf.deliver(buf, &msg),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Byte stream over a channel object opened by this side of the session.
/// A pump task owns the channel; the stream half exchanges owned buffers
/// with it over queues.
pub(crate) struct ChannelStream {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: PollSender<Vec<u8>>,
    readbuf: ReadBuffer,
}

impl ChannelStream {
    /// Wraps the channel, spawning its pump task.
    pub fn new(channel: russh::Channel<russh::client::Msg>) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(16);
        tokio::spawn(pump_channel(channel, in_tx, out_rx));
        ChannelStream {
            incoming: in_rx,
            outgoing: PollSender::new(out_tx),
            readbuf: ReadBuffer::default(),
        }
    }
}

enum PumpOp {
    Incoming(Option<russh::ChannelMsg>),
    Outgoing(Option<Vec<u8>>),
}

async fn pump_channel(
    mut channel: russh::Channel<russh::client::Msg>,
    in_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let op = tokio::select! {
            msg = channel.wait() => PumpOp::Incoming(msg),
            buf = out_rx.recv() => PumpOp::Outgoing(buf),
        };
        match op {
            PumpOp::Incoming(Some(russh::ChannelMsg::Data { data })) => {
                if in_tx.send(data.to_vec()).is_err() {
                    break;
                }
            }
            PumpOp::Incoming(Some(russh::ChannelMsg::Eof))
            | PumpOp::Incoming(Some(russh::ChannelMsg::Close))
            | PumpOp::Incoming(None) => break,
            PumpOp::Incoming(Some(_)) => {}
            PumpOp::Outgoing(Some(buf)) => {
                if channel.data(&buf[..]).await.is_err() {
                    break;
                }
            }
            PumpOp::Outgoing(None) => {
                channel.eof().await.ok();
                break;
            }
        }
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.readbuf.drain(buf) {
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(msg)) if msg.is_empty() => {}
                Poll::Ready(Some(msg)) => return self.readbuf.deliver(buf, &msg),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.outgoing.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if self.outgoing.send_item(buf.to_vec()).is_err() {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "EOF")));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "EOF")))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        self.outgoing.close();
        Poll::Ready(Ok(()))
    }
}

/// Map of end-to-end encrypted streams that lost their channel and are
/// parked until the host advertises their port again.
pub(crate) type DisconnectedStreamsMap = Arc<Mutex<HashMap<u16, Vec<Arc<ReconnectableShared>>>>>;

/// A forwarded-port stream that survives channel loss. While disconnected,
/// reads and writes park; when the connection layer splices in a fresh
/// channel, they resume. If reconnection fails, the stream closes.
pub(crate) struct ReconnectableStream {
    shared: Arc<ReconnectableShared>,
}

pub(crate) struct ReconnectableShared {
    port: u16,
    disconnected: DisconnectedStreamsMap,
    state: Mutex<StreamState>,
}

enum StreamState {
    Active(BoxedTunnelStream),
    Waiting {
        read_waker: Option<Waker>,
        write_waker: Option<Waker>,
    },
    Closed,
}

impl ReconnectableStream {
    pub fn new(
        port: u16,
        inner: BoxedTunnelStream,
        disconnected: DisconnectedStreamsMap,
    ) -> Self {
        ReconnectableStream {
            shared: Arc::new(ReconnectableShared {
                port,
                disconnected,
                state: Mutex::new(StreamState::Active(inner)),
            }),
        }
    }
}

impl ReconnectableShared {
    /// Splices a fresh inner stream in, resuming parked reads and writes.
    pub fn reconnect(&self, inner: BoxedTunnelStream) {
        if let Ok(mut state) = self.state.lock() {
            if matches!(*state, StreamState::Closed) {
                return;
            }
            let previous = std::mem::replace(&mut *state, StreamState::Active(inner));
            wake_parked(previous);
        }
    }

    /// Permanently closes the stream; parked reads see EOF and parked writes
    /// fail.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            let previous = std::mem::replace(&mut *state, StreamState::Closed);
            wake_parked(previous);
        }
    }

    fn park(&self, self_arc: &Arc<ReconnectableShared>) {
        if let Ok(mut queue) = self.disconnected.lock() {
            queue
                .entry(self.port)
                .or_default()
                .push(self_arc.clone());
        }
        log::debug!(
            "encrypted stream for port {} disconnected, awaiting reconnect",
            self.port
        );
    }
}

fn wake_parked(state: StreamState) {
    if let StreamState::Waiting {
        read_waker,
        write_waker,
    } = state
    {
        if let Some(w) = read_waker {
            w.wake();
        }
        if let Some(w) = write_waker {
            w.wake();
        }
    }
}

impl AsyncRead for ReconnectableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = self.shared.clone();
        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(_) => return Poll::Ready(Ok(())),
        };
        match &mut *state {
            StreamState::Active(inner) => {
                let before = buf.filled().len();
                match Pin::new(inner).poll_read(cx, buf) {
                    Poll::Ready(Ok(())) if buf.filled().len() == before => {
                        *state = StreamState::Waiting {
                            read_waker: Some(cx.waker().clone()),
                            write_waker: None,
                        };
                        drop(state);
                        shared.park(&self.shared);
                        Poll::Pending
                    }
                    Poll::Ready(Err(_)) => {
                        *state = StreamState::Waiting {
                            read_waker: Some(cx.waker().clone()),
                            write_waker: None,
                        };
                        drop(state);
                        shared.park(&self.shared);
                        Poll::Pending
                    }
                    other => other,
                }
            }
            StreamState::Waiting { read_waker, .. } => {
                *read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            StreamState::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ReconnectableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let shared = self.shared.clone();
        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(_) => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "EOF")))
            }
        };
        match &mut *state {
            StreamState::Active(inner) => match Pin::new(inner).poll_write(cx, buf) {
                Poll::Ready(Err(_)) => {
                    *state = StreamState::Waiting {
                        read_waker: None,
                        write_waker: Some(cx.waker().clone()),
                    };
                    drop(state);
                    shared.park(&self.shared);
                    Poll::Pending
                }
                other => other,
            },
            StreamState::Waiting { write_waker, .. } => {
                *write_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            StreamState::Closed => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "EOF")))
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(_) => return Poll::Ready(Ok(())),
        };
        match &mut *state {
            StreamState::Active(inner) => Pin::new(inner).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(_) => return Poll::Ready(Ok(())),
        };
        match &mut *state {
            StreamState::Active(inner) => Pin::new(inner).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{DisconnectedStreamsMap, ReconnectableStream};

    #[tokio::test]
    async fn reconnectable_stream_resumes_after_reconnect() {
        let disconnected: DisconnectedStreamsMap = Arc::new(Mutex::new(Default::default()));

        let (near, far) = tokio::io::duplex(64);
        let mut stream =
            ReconnectableStream::new(5000, Box::new(near), disconnected.clone());
        let shared = stream.shared.clone();

        // Close the far end; the next read parks instead of returning EOF.
        drop(far);
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = stream.read(&mut buf).await.unwrap();
            (n, buf)
        });

        // Wait for the stream to register itself as disconnected.
        loop {
            if !disconnected.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let (near2, mut far2) = tokio::io::duplex(64);
        shared.reconnect(Box::new(near2));
        far2.write_all(b"back").await.unwrap();

        let (n, buf) = read_task.await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn closed_stream_reports_eof() {
        let disconnected: DisconnectedStreamsMap = Arc::new(Mutex::new(Default::default()));
        let (near, far) = tokio::io::duplex(64);
        let mut stream = ReconnectableStream::new(5001, Box::new(near), disconnected);
        let shared = stream.shared.clone();
        drop(far);

        shared.close();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.write_all(b"x").await.is_err());
    }
}
