/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tonic::{async_trait, Code, Status};
use tracing::{debug, trace};

use crate::client::name_resolution::{Address, TCP_IP_NETWORK_TYPE};
use crate::client::transport::{
    ConnectContext, ConnectResult, DisconnectNotifier, Transport, TransportBuilder,
    TransportOptions, TransportStatus,
};

/// Upper bound on bytes the health ping may drain off a socket before the
/// connection is treated as broken.
const PRE_READ_LIMIT: usize = 16 * 1024;

pub struct SocketTransportBuilder {}

impl TransportBuilder for SocketTransportBuilder {
    fn build(
        &self,
        addresses: Vec<Address>,
        options: TransportOptions,
        on_disconnect: DisconnectNotifier,
    ) -> Arc<dyn Transport> {
        SocketTransport::new(addresses, options, on_disconnect)
    }

    fn network_type(&self) -> &'static str {
        TCP_IP_NETWORK_TYPE
    }
}

/// A socket cached between a successful connectivity probe and the first
/// stream handed to the HTTP stack.
struct InitialSocket {
    stream: TcpStream,
    address: Address,
    created_at: Instant,
    /// Bytes drained by the health ping, served to the wrapped stream ahead
    /// of the socket.
    pre_read: Vec<u8>,
}

struct ActiveStream {
    id: u64,
    address: Address,
}

struct SocketInner {
    addresses: Vec<Address>,
    /// Where the next connect pass starts, advanced to the last address
    /// that connected.
    last_index: usize,
    status: TransportStatus,
    current_address: Option<Address>,
    initial_socket: Option<InitialSocket>,
    active_streams: Vec<ActiveStream>,
    next_stream_id: u64,
    /// Bumped on every connect and disconnect so stale ping ticks and
    /// stream-dispose callbacks from a previous connection are ignored.
    generation: u64,
    ping_task: Option<tokio::task::JoinHandle<()>>,
}

/// The socket-supervising transport: walks its address list to establish a
/// TCP connection, keeps the successful socket for reuse by the first
/// stream, and health-checks it periodically until it is consumed.
///
/// All socket, stream-list, timer and index mutation happens under the one
/// inner lock.
pub(crate) struct SocketTransport {
    options: TransportOptions,
    on_disconnect: DisconnectNotifier,
    weak_self: Weak<SocketTransport>,
    inner: Mutex<SocketInner>,
}

impl SocketTransport {
    pub(crate) fn new(
        addresses: Vec<Address>,
        options: TransportOptions,
        on_disconnect: DisconnectNotifier,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            options,
            on_disconnect,
            weak_self: weak_self.clone(),
            inner: Mutex::new(SocketInner {
                addresses,
                last_index: 0,
                status: TransportStatus::NotConnected,
                current_address: None,
                initial_socket: None,
                active_streams: Vec::new(),
                next_stream_id: 0,
                generation: 0,
                ping_task: None,
            }),
        })
    }

    fn apply_socket_options(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.options.tcp_nodelay)?;
        if let Some(interval) = self.options.tcp_keepalive {
            let sock = socket2::SockRef::from(stream);
            sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(interval))?;
        }
        Ok(())
    }

    fn spawn_ping(&self, generation: u64) -> tokio::task::JoinHandle<()> {
        let weak = self.weak_self.clone();
        let interval = self.options.health_ping_interval;
        // Single-shot sleeps that re-arm after each healthy tick, so a slow
        // tick never overlaps the next one.
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if !transport.ping_once(generation) {
                    return;
                }
            }
        })
    }

    /// One health ping: a zero-byte send followed by a non-blocking drain of
    /// anything the server already wrote.  Returns false when the timer
    /// should stop re-arming.
    fn ping_once(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return false;
        }
        let Some(socket) = inner.initial_socket.as_mut() else {
            // Consumed by get_stream; the HTTP stack supervises it now.
            return false;
        };

        let mut healthy = socket.stream.try_write(&[]).map_or_else(
            |e| e.kind() == io::ErrorKind::WouldBlock,
            |_| true,
        );
        while healthy {
            let mut buf = [0u8; 1024];
            match socket.stream.try_read(&mut buf) {
                Ok(0) => healthy = false,
                Ok(n) => {
                    socket.pre_read.extend_from_slice(&buf[..n]);
                    if socket.pre_read.len() > PRE_READ_LIMIT {
                        debug!("closing socket with over-full pre-read buffer");
                        healthy = false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => healthy = false,
            }
        }
        if healthy {
            trace!("socket health ping ok");
            return true;
        }

        inner.initial_socket = None;
        inner.status = TransportStatus::NotConnected;
        inner.current_address = None;
        inner.generation += 1;
        drop(inner);
        (self.on_disconnect)(Status::unavailable("Lost connection to socket"));
        false
    }

    fn on_stream_disposed(&self, generation: u64, id: u64) {
        let last_closed = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                return;
            }
            inner.active_streams.retain(|s| s.id != id);
            inner.active_streams.is_empty() && inner.initial_socket.is_none()
        };
        if last_closed {
            self.disconnect();
            (self.on_disconnect)(Status::new(Code::Ok, "connection closed"));
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn try_connect(&self, ctx: &ConnectContext, attempt: usize) -> ConnectResult {
        let (addresses, start) = {
            let inner = self.inner.lock().unwrap();
            (inner.addresses.clone(), inner.last_index)
        };
        if addresses.is_empty() {
            return ConnectResult::Failure(Status::unavailable("no addresses to connect to"));
        }

        let mut first_error: Option<Status> = None;
        for i in 0..addresses.len() {
            let idx = (start + i) % addresses.len();
            let address = &addresses[idx];
            trace!(%address, attempt, "connecting");

            let connected = tokio::select! {
                _ = ctx.cancelled() => {
                    return if ctx.is_caller_cancelled() {
                        ConnectResult::Failure(Status::cancelled("connect cancelled"))
                    } else {
                        ConnectResult::Timeout
                    };
                }
                connected = TcpStream::connect(address.address.as_str()) => connected,
            };

            match connected {
                Ok(stream) => {
                    if let Err(e) = self.apply_socket_options(&stream) {
                        first_error.get_or_insert_with(|| {
                            Status::unavailable(format!("{}: {}", address, e))
                        });
                        continue;
                    }
                    let mut inner = self.inner.lock().unwrap();
                    inner.generation += 1;
                    let generation = inner.generation;
                    inner.initial_socket = Some(InitialSocket {
                        stream,
                        address: address.clone(),
                        created_at: Instant::now(),
                        pre_read: Vec::new(),
                    });
                    inner.status = TransportStatus::InitialSocket;
                    inner.current_address = Some(address.clone());
                    inner.last_index = idx;
                    if let Some(task) = inner.ping_task.take() {
                        task.abort();
                    }
                    inner.ping_task = Some(self.spawn_ping(generation));
                    return ConnectResult::Success;
                }
                Err(e) => {
                    debug!(%address, error = %e, "connect failed");
                    first_error.get_or_insert_with(|| {
                        Status::unavailable(format!("{}: {}", address, e))
                    });
                }
            }
        }
        ConnectResult::Failure(first_error.unwrap())
    }

    async fn get_stream(&self, address: &Address) -> Result<TransportStream, Status> {
        let reused = {
            let mut inner = self.inner.lock().unwrap();
            let fresh_enough = inner.initial_socket.as_ref().is_some_and(|s| {
                s.address == *address
                    && s.created_at.elapsed() <= self.options.socket_idle_timeout
            });
            if fresh_enough {
                inner.initial_socket.take().map(|s| (s.stream, s.pre_read))
            } else {
                None
            }
        };

        let (stream, pre_read) = match reused {
            Some(reused) => reused,
            None => {
                let stream = TcpStream::connect(address.address.as_str())
                    .await
                    .map_err(|e| Status::unavailable(format!("{}: {}", address, e)))?;
                self.apply_socket_options(&stream)
                    .map_err(|e| Status::unavailable(format!("{}: {}", address, e)))?;
                (stream, Vec::new())
            }
        };

        let (generation, id) = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_stream_id += 1;
            let id = inner.next_stream_id;
            inner.active_streams.push(ActiveStream {
                id,
                address: address.clone(),
            });
            inner.status = TransportStatus::ActiveStream;
            inner.current_address = Some(address.clone());
            (inner.generation, id)
        };

        let weak = self.weak_self.clone();
        Ok(TransportStream::new(
            stream,
            pre_read,
            Box::new(move || {
                if let Some(transport) = weak.upgrade() {
                    transport.on_stream_disposed(generation, id);
                }
            }),
        ))
    }

    fn update_addresses(&self, addresses: Vec<Address>) {
        let mut inner = self.inner.lock().unwrap();
        inner.addresses = addresses;
        inner.last_index = 0;
    }

    fn disconnect(&self) {
        let ping_task = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.initial_socket = None;
            inner.active_streams.clear();
            inner.status = TransportStatus::NotConnected;
            inner.current_address = None;
            inner.ping_task.take()
        };
        if let Some(task) = ping_task {
            task.abort();
        }
    }

    fn current_address(&self) -> Option<Address> {
        self.inner.lock().unwrap().current_address.clone()
    }

    fn connect_timeout(&self) -> Option<std::time::Duration> {
        self.options.connect_timeout
    }

    fn status(&self) -> TransportStatus {
        self.inner.lock().unwrap().status
    }
}

pin_project! {
    /// A ready duplex byte stream handed to the HTTP/2 stack.  Bytes drained
    /// by the health ping are served ahead of the socket; the dispose hook
    /// runs exactly once when the stream is dropped.
    pub struct TransportStream {
        #[pin]
        inner: TcpStream,
        pre_read: Vec<u8>,
        pre_read_pos: usize,
        on_dispose: Option<Box<dyn FnOnce() + Send>>,
    }

    impl PinnedDrop for TransportStream {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(on_dispose) = this.on_dispose.take() {
                on_dispose();
            }
        }
    }
}

impl TransportStream {
    fn new(inner: TcpStream, pre_read: Vec<u8>, on_dispose: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            inner,
            pre_read,
            pre_read_pos: 0,
            on_dispose: Some(on_dispose),
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.pre_read_pos < this.pre_read.len() {
            let available = &this.pre_read[*this.pre_read_pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            *this.pre_read_pos += n;
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
