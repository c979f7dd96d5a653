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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::{async_trait, Status};

use crate::client::name_resolution::Address;
use crate::client::transport::{
    ConnectContext, ConnectResult, Transport, TransportStatus, TransportStream,
};

/// A transport for callers whose HTTP stack manages its own sockets.  It
/// models connectivity for the single address it was built with and never
/// opens a socket itself: try_connect flips straight to connected, and
/// get_stream is unsupported.
pub(crate) struct PassiveTransport {
    address: Address,
    inner: Mutex<PassiveInner>,
}

struct PassiveInner {
    status: TransportStatus,
    current_address: Option<Address>,
}

impl PassiveTransport {
    pub(crate) fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            inner: Mutex::new(PassiveInner {
                status: TransportStatus::NotConnected,
                current_address: None,
            }),
        })
    }
}

#[async_trait]
impl Transport for PassiveTransport {
    async fn try_connect(&self, ctx: &ConnectContext, _attempt: usize) -> ConnectResult {
        if ctx.is_cancelled() {
            return if ctx.is_caller_cancelled() {
                ConnectResult::Failure(Status::cancelled("connect cancelled"))
            } else {
                ConnectResult::Timeout
            };
        }
        let mut inner = self.inner.lock().unwrap();
        inner.status = TransportStatus::Passive;
        inner.current_address = Some(self.address.clone());
        ConnectResult::Success
    }

    async fn get_stream(&self, _address: &Address) -> Result<TransportStream, Status> {
        Err(Status::internal(
            "the passive transport does not hand out streams",
        ))
    }

    fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = TransportStatus::NotConnected;
        inner.current_address = None;
    }

    fn current_address(&self) -> Option<Address> {
        self.inner.lock().unwrap().current_address.clone()
    }

    fn connect_timeout(&self) -> Option<Duration> {
        None
    }

    fn status(&self) -> TransportStatus {
        self.inner.lock().unwrap().status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[tokio::test]
    async fn passive_transport_flips_synchronously() {
        let address = Address::tcp("10.0.0.1:50051");
        let transport = PassiveTransport::new(address.clone());
        assert_eq!(transport.status(), TransportStatus::NotConnected);

        let ctx = ConnectContext::new();
        assert!(matches!(
            transport.try_connect(&ctx, 1).await,
            ConnectResult::Success
        ));
        assert_eq!(transport.status(), TransportStatus::Passive);
        assert_eq!(transport.current_address(), Some(address.clone()));

        assert_eq!(
            transport.get_stream(&address).await.err().unwrap().code(),
            Code::Internal
        );

        transport.disconnect();
        assert_eq!(transport.status(), TransportStatus::NotConnected);
        assert_eq!(transport.current_address(), None);
    }
}
