//! Request id allocation and response correlation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use jsonlink_protocol::{Request, RequestId, Response};

use crate::connection::Internal;
use crate::error::{RpcError, RpcResult};

/// Where the outcome of a call goes.
#[derive(Debug)]
pub(crate) enum Reply {
    /// A caller is awaiting a [`PendingResponse`].
    Waiter(oneshot::Sender<RpcResult<Value>>),
    /// Nobody is waiting; failures surface as connection error events.
    Detached,
}

impl Reply {
    /// Delivers the outcome. Returns the error back if nobody received it.
    pub(crate) fn deliver(self, outcome: RpcResult<Value>) -> Option<RpcError> {
        match self {
            Reply::Waiter(tx) => match tx.send(outcome) {
                Ok(()) => None,
                Err(outcome) => outcome.err(),
            },
            Reply::Detached => outcome.err(),
        }
    }
}

/// The outcome of an issued call.
///
/// Resolves once, with the remote result or an [`RpcError`].
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<RpcResult<Value>>,
}

impl PendingResponse {
    pub(crate) fn new(rx: oneshot::Receiver<RpcResult<Value>>) -> Self {
        Self { rx }
    }
}

impl Future for PendingResponse {
    type Output = RpcResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::Closed)))
    }
}

/// A call that has not been sent yet.
#[derive(Debug)]
pub(crate) struct DeferredCall {
    pub method: String,
    pub params: Vec<Value>,
    pub reply: Reply,
    pub issued_at: Instant,
}

impl DeferredCall {
    pub(crate) fn new(method: String, params: Vec<Value>, reply: Reply) -> Self {
        Self {
            method,
            params,
            reply,
            issued_at: Instant::now(),
        }
    }
}

/// A sent call awaiting its response.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub method: String,
    pub params: Vec<Value>,
    pub reply: Reply,
    pub issued_at: Instant,
    timer: AbortHandle,
}

impl PendingCall {
    /// Turns the call back into a queueable one, keeping its reply and issue
    /// time.
    pub(crate) fn into_deferred(self) -> DeferredCall {
        self.timer.abort();
        DeferredCall {
            method: self.method,
            params: self.params,
            reply: self.reply,
            issued_at: self.issued_at,
        }
    }

    /// Time since the call was first issued.
    pub(crate) fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

/// Pending-call table for one connection.
#[derive(Debug)]
pub(crate) struct CallCorrelator {
    next_id: RequestId,
    pending: HashMap<RequestId, PendingCall>,
    call_timeout: Duration,
}

impl CallCorrelator {
    pub(crate) fn new(call_timeout: Duration) -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            call_timeout,
        }
    }

    /// Allocates an id, records the call and arms its timer.
    ///
    /// The returned request still has to be written by the caller.
    pub(crate) fn issue(
        &mut self,
        call: DeferredCall,
        timers: &mpsc::UnboundedSender<Internal>,
    ) -> Request {
        let id = self.next_id;
        self.next_id += 1;

        let timeout = self.call_timeout;
        let tx = timers.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::CallTimeout { id });
        })
        .abort_handle();

        let request = Request::new(id, call.method.clone(), call.params.clone());
        self.pending.insert(
            id,
            PendingCall {
                method: call.method,
                params: call.params,
                reply: call.reply,
                issued_at: call.issued_at,
                timer,
            },
        );
        request
    }

    /// Matches a response to its pending call.
    ///
    /// Returns `None` for unknown or already resolved ids. The outcome carries
    /// the method and params of the original request on failure.
    pub(crate) fn resolve(&mut self, response: Response) -> Option<(PendingCall, RpcResult<Value>)> {
        let call = self.pending.remove(&response.id)?;
        call.timer.abort();

        let outcome = match response.error {
            Some(message) => Err(RpcError::remote(
                message,
                call.method.clone(),
                call.params.clone(),
            )),
            None => Ok(response.result),
        };
        Some((call, outcome))
    }

    /// Looks at a pending call without removing it.
    pub(crate) fn get(&self, id: RequestId) -> Option<&PendingCall> {
        self.pending.get(&id)
    }

    /// Removes a pending call, cancelling its timer.
    pub(crate) fn remove(&mut self, id: RequestId) -> Option<PendingCall> {
        let call = self.pending.remove(&id)?;
        call.timer.abort();
        Some(call)
    }

    /// Number of calls awaiting a response.
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Cancels every timer. Used when the connection task exits.
    pub(crate) fn abort_timers(&self) {
        for call in self.pending.values() {
            call.timer.abort();
        }
    }
}
