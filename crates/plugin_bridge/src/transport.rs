//! Request/response multiplexing over one duplex byte stream.
//!
//! [`Session`] is the host half. Every call gets a fresh numeric id and a
//! oneshot slot in the pending table; a background reader routes each
//! response to its slot by id, so responses may come back in any order.
//! When the stream dies every slot is dropped and its caller sees
//! [`TransportError::ConnectionClosed`].
//!
//! [`serve`] is the plugin half. It reads requests, dispatches each one on
//! its own task and funnels responses through a single writer.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::capability::Dispatch;
use crate::error::{BridgeError, TransportError};
use crate::jsonrpc::{INTERNAL_ERROR, Id, Message, PARSE_ERROR, Request, Response};

struct Shared {
    id: Uuid,
    label: String,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Response>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    /// Marks the session dead and drops every waiter.
    fn fail_all(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(
                session = %self.id,
                plugin = %self.label,
                in_flight = self.pending.len(),
                reason,
                "transport session closed"
            );
        }
        self.shutdown.cancel();
        self.pending.clear();
    }

    /// Delivers one envelope from the plugin to its waiter.
    ///
    /// An envelope that does not parse, or a response that cannot be matched
    /// to a call, means the stream can no longer be trusted: the error is
    /// returned and the caller tears the session down.
    fn route(&self, line: &str) -> Result<(), TransportError> {
        match Message::parse(line)? {
            Message::Response(rsp) => {
                let Id::Number(id) = rsp.id else {
                    warn!(session = %self.id, id = ?rsp.id, error = ?rsp.error, "response with unroutable id");
                    return Err(TransportError::MalformedEnvelope(format!(
                        "response id {:?} is not a request id",
                        rsp.id
                    )));
                };
                match self.pending.remove(&id) {
                    Some((_, waiter)) => {
                        // The caller may have given up already; that's fine.
                        let _ = waiter.send(rsp);
                    }
                    None => debug!(session = %self.id, id, "late response for abandoned call"),
                }
            }
            Message::Request(req) => {
                debug!(session = %self.id, method = %req.method, "ignoring request from plugin");
            }
        }
        Ok(())
    }
}

/// One live RPC channel to one plugin.
///
/// Cheap to clone. The reader and writer tasks stop when [`Session::close`]
/// is called, when the stream ends, or when the last clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("plugin", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Takes exclusive ownership of both stream halves and starts the I/O tasks.
    pub fn spawn<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Shared {
            id: Uuid::new_v4(),
            label: label.into(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound: tx,
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(write_loop(Arc::clone(&inner), writer, rx));
        tokio::spawn(read_loop(Arc::clone(&inner), reader));

        Self {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of calls still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Closes the stream. Pending calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.fail_all("closed by host");
    }

    /// Resolves once the session is closed for any reason.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Calls `method` and waits for its response or for the connection to die.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.call_until(method, params, std::future::pending()).await
    }

    /// Like [`Session::call`] but gives up after `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let expired = async move {
            tokio::time::sleep(timeout).await;
            TransportError::Timeout {
                method: method.to_owned(),
                timeout,
            }
        };
        self.call_until(method, params, expired).await
    }

    /// Like [`Session::call`] but gives up when `token` is cancelled.
    ///
    /// Work the plugin already started is not interrupted.
    pub async fn call_cancellable(
        &self,
        method: &str,
        params: Value,
        token: &CancellationToken,
    ) -> Result<Value, BridgeError> {
        let cancelled = async move {
            token.cancelled().await;
            TransportError::Cancelled {
                method: method.to_owned(),
            }
        };
        self.call_until(method, params, cancelled).await
    }

    async fn call_until<F>(&self, method: &str, params: Value, abort: F) -> Result<Value, BridgeError>
    where
        F: Future<Output = TransportError>,
    {
        let (id, waiter) = self.start(method, params)?;
        tokio::select! {
            rsp = waiter => match rsp {
                Ok(rsp) => rsp.into_result(),
                Err(_) => Err(TransportError::ConnectionClosed.into()),
            },
            err = abort => {
                self.inner.pending.remove(&id);
                debug!(session = %self.inner.id, id, method, %err, "call abandoned");
                Err(err.into())
            }
        }
    }

    fn start(&self, method: &str, params: Value) -> Result<(u64, oneshot::Receiver<Response>), TransportError> {
        let shared = &self.inner;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id, tx);
        // fail_all sets the flag before clearing, so one of us sees the other.
        if shared.closed.load(Ordering::SeqCst) {
            shared.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }

        let line = match serde_json::to_string(&Request::call(Id::Number(id), method, Some(params))) {
            Ok(line) => line,
            Err(err) => {
                shared.pending.remove(&id);
                return Err(err.into());
            }
        };
        trace!(session = %shared.id, id, method, "sending request");
        if shared.outbound.send(line).is_err() {
            shared.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }
        Ok((id, rx))
    }
}

async fn write_loop<W>(shared: Arc<Shared>, writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = BufWriter::new(writer);
    loop {
        let line = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            line = rx.recv() => line,
        };
        let Some(line) = line else { break };
        if let Err(err) = write_line(&mut writer, &line).await {
            warn!(session = %shared.id, %err, "write to plugin failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.fail_all("writer stopped");
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if let Err(err) = shared.route(&line) {
                    warn!(session = %shared.id, %err, "malformed envelope from plugin, closing session");
                    shared.fail_all("malformed envelope");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(session = %shared.id, %err, "read from plugin failed");
                break;
            }
        }
    }
    shared.fail_all("stream ended");
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Serves requests from `reader` until EOF or `shutdown`, answering on `writer`.
///
/// Each request runs on its own task so a slow capability does not hold up
/// the others. A panicking capability yields an internal-error response
/// instead of taking the loop down.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<dyn Dispatch>,
    shutdown: CancellationToken,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(line) = rx.recv().await {
            write_line(&mut w, &line).await?;
        }
        w.shutdown().await
    });

    let mut lines = BufReader::new(reader).lines();
    let mut tasks = JoinSet::new();

    let result = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            next = lines.next_line() => next,
        };
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(err) => break Err(TransportError::from(err)),
        };
        if line.trim().is_empty() {
            continue;
        }

        match Message::parse(&line) {
            Ok(Message::Request(req)) => {
                tasks.spawn(handle_request(Arc::clone(&dispatcher), req, tx.clone()));
            }
            Ok(Message::Response(rsp)) => debug!(id = ?rsp.id, "ignoring stray response"),
            Err(err) => {
                warn!(%err, "unparseable request");
                enqueue(
                    &tx,
                    Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(err.to_string()))),
                );
            }
        }
        while tasks.try_join_next().is_some() {}
    };

    debug!(in_flight = tasks.len(), "serve loop finished");
    tasks.shutdown().await;
    drop(tx);
    match writer_task.await {
        Ok(Err(err)) => debug!(%err, "response writer stopped early"),
        Err(err) => warn!(%err, "response writer task failed"),
        Ok(Ok(())) => {}
    }
    result
}

async fn handle_request(dispatcher: Arc<dyn Dispatch>, req: Request, tx: mpsc::UnboundedSender<String>) {
    let notification = req.is_notification();
    let Request { method, params, id, .. } = req;
    trace!(%method, ?id, notification, "dispatching");

    let task_method = method.clone();
    let job = tokio::spawn(async move {
        dispatcher
            .dispatch(&task_method, params.unwrap_or(Value::Null))
            .await
    });
    let joined = job.await;

    if notification {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(%method, %err, "notification failed"),
            Err(err) => warn!(%method, %err, "capability task failed"),
        }
        return;
    }

    let id = id.unwrap_or(Id::Null);
    let response = match joined {
        Ok(outcome) => Response::from_outcome(id, outcome),
        Err(err) => {
            warn!(%method, %err, "capability task failed");
            Response::fail(id, INTERNAL_ERROR, "capability panicked", Some(json!(method)))
        }
    };
    enqueue(&tx, response);
}

fn enqueue(tx: &mpsc::UnboundedSender<String>, rsp: Response) {
    match serde_json::to_string(&rsp) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(err) => warn!(%err, "could not encode response"),
    }
}
