/*!
Protocol codec for the worker byte stream.

The codec owns two background tasks: a reader that splits the inbound stream
into lines and dispatches them, and a writer that serializes outbound
commands. Callers use [`Codec::call`], which tags the command with a fresh
correlation id and suspends until the matching response arrives.

The reader keeps draining whether or not any call is pending. Malformed lines
and responses for unknown ids are logged and dropped. When the stream closes
every pending call is rejected and the codec refuses new calls.
[`Codec::close_input`] ends the outbound side so the worker sees end of input.
*/

use crate::listeners::{EventRegistry, Subscription};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::limits::{DEFAULT_REQUEST_TIMEOUT_MS, MAX_LINE_BYTES};
use shared::protocol::{Command, Inbound, Request, Response, WorkerEvent};
use shared::{Result, ScannerError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Splits newline-delimited messages out of a byte buffer
pub struct LineFramer {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no newline
    scanned: usize,
    max_line: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete, non-blank line with the line terminator removed
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let newline = match self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
                Some(offset) => self.scanned + offset,
                None => {
                    self.scanned = self.buffer.len();
                    if self.buffer.len() > self.max_line {
                        warn!(
                            "Discarding oversized protocol line ({} bytes buffered, limit {})",
                            self.buffer.len(),
                            self.max_line
                        );
                        self.buffer.clear();
                        self.scanned = 0;
                        self.discarding = true;
                    }
                    return None;
                }
            };

            let line = self.buffer.split_to(newline);
            self.buffer.advance(1);
            self.scanned = 0;

            if self.discarding {
                // Tail of a line that was already dropped
                self.discarding = false;
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches('\r').trim();
            if text.is_empty() {
                continue;
            }
            return Some(text.to_string());
        }
    }
}

struct Pending {
    command: &'static str,
    reply: oneshot::Sender<Result<Value>>,
}

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: AtomicBool,
    events: EventRegistry<WorkerEvent>,
    timeout: Duration,
    malformed: AtomicU64,
    reader_task: Mutex<Option<AbortHandle>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_line(&self, line: &str) {
        match Inbound::parse(line) {
            Ok(Inbound::Response(response)) => self.resolve(response),
            Ok(Inbound::Event(event)) => {
                debug!("Worker event: {:?}", event);
                self.events.emit(&event);
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding malformed worker message: {}", e);
            }
        }
    }

    fn resolve(&self, response: Response) {
        let pending = self.pending().remove(&response.id);
        let Some(pending) = pending else {
            debug!("Discarding response for unknown correlation id {}", response.id);
            return;
        };

        let result = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "worker reported failure without a message".to_string());
            Err(ScannerError::device(pending.command, message))
        };
        // The caller may have given up already
        let _ = pending.reply.send(result);
    }

    /// Mark the stream dead and reject everything in flight
    fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            warn!("Rejecting {} pending worker call(s): {}", drained.len(), reason);
        }
        for pending in drained {
            let _ = pending.reply.send(Err(ScannerError::process(format!(
                "{} failed: {}",
                pending.command, reason
            ))));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Removes a correlation id when its call finishes or is cancelled
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.id);
    }
}

/// Request/response multiplexer over a worker byte stream
#[derive(Clone)]
pub struct Codec {
    inner: Arc<Inner>,
}

impl Codec {
    /// Start the codec with the default response timeout.
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_timeout(reader, writer, Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    pub fn with_timeout<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound)),
            closed: AtomicBool::new(false),
            events: EventRegistry::new(),
            timeout,
            malformed: AtomicU64::new(0),
            reader_task: Mutex::new(None),
        });

        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&inner)));
        *inner
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader_task.abort_handle());
        tokio::spawn(write_loop(writer, outbound_rx, Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Send a command and wait for its response data
    pub async fn call(&self, command: Command) -> Result<Value> {
        let name = command.name();
        if self.is_closed() {
            return Err(ScannerError::process(format!("{} failed: worker stream is closed", name)));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Request { id, command }.to_line()?;

        let (reply, response) = oneshot::channel();
        self.inner.pending().insert(id, Pending { command: name, reply });
        let _guard = PendingGuard { inner: &self.inner, id };

        // The stream may have closed between the check above and the insert
        if self.is_closed() {
            return Err(ScannerError::process(format!("{} failed: worker stream is closed", name)));
        }
        let sent = match self.inner.outbound().as_ref() {
            Some(outbound) => outbound.send(line).is_ok(),
            None => false,
        };
        if !sent {
            return Err(ScannerError::process(format!("{} failed: worker writer has stopped", name)));
        }
        debug!("Sent {} (id {})", name, id);

        match tokio::time::timeout(self.inner.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScannerError::process(format!("{} was abandoned", name))),
            Err(_) => {
                warn!("No response to {} (id {}) within {:?}", name, id, self.inner.timeout);
                Err(ScannerError::Timeout {
                    command: name.to_string(),
                    millis: self.inner.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a command and decode its response data
    pub async fn call_as<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        let name = command.name();
        let data = self.call(command).await?;
        serde_json::from_value(data)
            .map_err(|e| ScannerError::protocol(format!("unexpected {} reply: {}", name, e)))
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(callback)
    }

    /// Stop sending. Queued lines are still written, then the writer is shut
    /// down; later calls fail immediately. Responses keep being read.
    pub fn close_input(&self) {
        if self.inner.outbound().take().is_some() {
            debug!("Closing worker input");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Calls currently awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending().len()
    }

    /// Lines dropped because they failed to parse
    pub fn malformed_count(&self) -> u64 {
        self.inner.malformed.load(Ordering::Relaxed)
    }
}

async fn read_loop<R>(mut reader: R, inner: Weak<Inner>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new(MAX_LINE_BYTES);
    let mut chunk = vec![0u8; 64 * 1024];

    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "worker stream closed".to_string(),
            Ok(n) => {
                framer.extend(&chunk[..n]);
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                while let Some(line) = framer.next_line() {
                    inner.handle_line(&line);
                }
            }
            Err(e) => break format!("worker stream read error: {}", e),
        }
    };

    info!("Worker reader stopped: {}", reason);
    if let Some(inner) = inner.upgrade() {
        inner.close(&reason);
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>, inner: Weak<Inner>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = outbound.recv().await {
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            let reason = format!("worker stream write error: {}", e);
            warn!("{}", reason);
            if let Some(inner) = inner.upgrade() {
                inner.close(&reason);
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::protocol::{PositionReply, RotateParams};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct FakeWorker {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> Request {
            let line = self.lines.next_line().await.unwrap().expect("request line");
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn reply(&mut self, response: Response) {
            let line = serde_json::to_string(&response).unwrap();
            self.send_raw(&line).await;
        }
    }

    fn pair(timeout: Duration) -> (Codec, FakeWorker) {
        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let codec = Codec::with_timeout(host_read, host_write, timeout);
        let worker = FakeWorker {
            lines: BufReader::new(worker_read).lines(),
            writer: worker_write,
        };
        (codec, worker)
    }

    fn rotate(degrees: f64) -> Command {
        Command::Rotate(RotateParams { degrees })
    }

    #[test]
    fn test_framer_splits_across_chunks() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"{\"a\":1}\n{\"b\"");
        assert_eq!(framer.next_line().as_deref(), Some("{\"a\":1}"));
        assert_eq!(framer.next_line(), None);

        framer.extend(b":2}\r\n\n   \n");
        assert_eq!(framer.next_line().as_deref(), Some("{\"b\":2}"));
        assert_eq!(framer.next_line(), None);
    }

    #[test]
    fn test_framer_large_line_scans_each_byte_once() {
        let mut framer = LineFramer::new(MAX_LINE_BYTES);
        let chunk = vec![b'A'; 64 * 1024];

        // 8 MiB line delivered in read-sized chunks
        for _ in 0..128 {
            framer.extend(&chunk);
            assert_eq!(framer.next_line(), None);
            assert_eq!(framer.scanned, framer.buffer.len());
        }
        framer.extend(b"\nnext\n");

        let line = framer.next_line().unwrap();
        assert_eq!(line.len(), 128 * 64 * 1024);
        assert_eq!(framer.scanned, 0);
        assert_eq!(framer.next_line().as_deref(), Some("next"));
    }

    #[test]
    fn test_framer_discards_oversized_line() {
        let mut framer = LineFramer::new(8);
        framer.extend(b"0123456789");
        assert_eq!(framer.next_line(), None);
        framer.extend(b"abc\nok\n");
        assert_eq!(framer.next_line().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let (codec, mut worker) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call_as::<PositionReply>(rotate(90.0)).await }
        });

        let request = worker.next_request().await;
        assert_eq!(request.command, rotate(90.0));
        worker.reply(Response::ok(request.id, json!({"position": 90.0}))).await;

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.position, 90.0);
        assert_eq!(codec.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (codec, mut worker) = pair(Duration::from_secs(5));

        let first = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call_as::<PositionReply>(rotate(10.0)).await }
        });
        let a = worker.next_request().await;
        let second = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call_as::<PositionReply>(rotate(20.0)).await }
        });
        let b = worker.next_request().await;
        assert!(b.id > a.id);

        worker.reply(Response::ok(b.id, json!({"position": 20.0}))).await;
        worker.reply(Response::ok(a.id, json!({"position": 10.0}))).await;

        assert_eq!(first.await.unwrap().unwrap().position, 10.0);
        assert_eq!(second.await.unwrap().unwrap().position, 20.0);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_dropped() {
        let (codec, mut worker) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call(Command::Home).await }
        });
        let request = worker.next_request().await;

        worker.send_raw("this is not json").await;
        worker.send_raw(r#"{"unexpected":true}"#).await;
        worker.reply(Response::ok(request.id + 1000, json!({"position": 1.0}))).await;
        worker.reply(Response::ok(request.id, json!({"position": 0.0}))).await;

        let data = call.await.unwrap().unwrap();
        assert_eq!(data, json!({"position": 0.0}));
        assert_eq!(codec.malformed_count(), 2);
        assert!(!codec.is_closed());
    }

    #[tokio::test]
    async fn test_failure_response_becomes_device_error() {
        let (codec, mut worker) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call(Command::Capture).await }
        });
        let request = worker.next_request().await;
        worker.reply(Response::err(request.id, "Camera is not open")).await;

        match call.await.unwrap() {
            Err(ScannerError::Device { command, message }) => {
                assert_eq!(command, "capture");
                assert_eq!(message, "Camera is not open");
            }
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_bypass_pending_calls() {
        let (codec, mut worker) = pair(Duration::from_secs(5));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = codec.on_event(move |event| {
            if matches!(event, WorkerEvent::Progress(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call(Command::Home).await }
        });
        let request = worker.next_request().await;
        worker.send_raw(r#"{"event":"progress","payload":{"message":"homing"}}"#).await;
        worker.send_raw(r#"{"event":"progress","payload":{"message":"homed"}}"#).await;
        worker.reply(Response::ok(request.id, json!({"position": 0.0}))).await;

        call.await.unwrap().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_reader() {
        let (codec, mut worker) = pair(Duration::from_secs(5));
        let _faulty = codec.on_event(|_| panic!("listener failure"));

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call(Command::Home).await }
        });
        let request = worker.next_request().await;
        worker.send_raw(r#"{"event":"progress","payload":{"message":"homing"}}"#).await;
        worker.reply(Response::ok(request.id, json!({"position": 0.0}))).await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"position": 0.0}));
        assert!(!codec.is_closed());
    }

    #[tokio::test]
    async fn test_close_input_ends_worker_stdin() {
        let (codec, mut worker) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call(Command::Home).await }
        });
        let request = worker.next_request().await;
        codec.close_input();

        // The worker reads end of input but can still answer
        assert!(worker.lines.next_line().await.unwrap().is_none());
        worker.reply(Response::ok(request.id, json!({"position": 0.0}))).await;
        call.await.unwrap().unwrap();

        match codec.call(Command::Home).await {
            Err(e @ ScannerError::Process(_)) => assert!(e.to_string().contains("writer has stopped")),
            other => panic!("expected process error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_close_rejects_pending_calls() {
        let (codec, mut worker) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call(Command::Capture).await }
        });
        worker.next_request().await;
        drop(worker);

        match call.await.unwrap() {
            Err(e @ ScannerError::Process(_)) => assert!(e.to_string().contains("capture")),
            other => panic!("expected process error, got {:?}", other),
        }
        assert!(codec.is_closed());
        assert!(matches!(
            codec.call(Command::Home).await,
            Err(ScannerError::Process(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_forgets_correlation_id() {
        let (codec, mut worker) = pair(Duration::from_millis(200));

        let result = codec.call(Command::Home).await;
        assert!(matches!(result, Err(ScannerError::Timeout { .. })));
        assert_eq!(codec.pending_calls(), 0);

        // A late reply is an unknown id and must not disturb the next call
        let late = worker.next_request().await;
        worker.reply(Response::ok(late.id, json!({"position": 0.0}))).await;

        let call = tokio::spawn({
            let codec = codec.clone();
            async move { codec.call_as::<PositionReply>(rotate(5.0)).await }
        });
        let request = worker.next_request().await;
        worker.reply(Response::ok(request.id, json!({"position": 5.0}))).await;
        assert_eq!(call.await.unwrap().unwrap().position, 5.0);
    }
}
