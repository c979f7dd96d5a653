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

use std::pin::Pin;

use bytes::Bytes;
use tokio_stream::Stream;
use tonic::{async_trait, Request as TonicRequest, Response as TonicResponse, Status};

/// An outgoing stream of serialized request messages.  Serialization happens
/// above this crate; the channel only sees opaque bytes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Bytes> + Send + Sync>>;

/// An incoming stream of serialized response messages, each of which may
/// instead carry the call's terminal status.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send + Sync>>;

pub type Request = TonicRequest<MessageStream>;
pub type Response = TonicResponse<ResponseStream>;

/// The call seam between the channel and whatever produces HTTP/2 streams for
/// it.  A connected transport yields an implementation of this trait; the
/// channel routes each picked request through it.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, method: String, request: Request) -> Response;
}
