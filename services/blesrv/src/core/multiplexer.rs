//! Serial Transport Multiplexer
//!
//! One serial line carries three kinds of traffic: command/response pairs,
//! unsolicited `+COMMAND:` reports and raw peripheral data. The multiplexer
//! owns the byte stream and keeps them apart.
//!
//! ```text
//!  enqueue() ──► bounded queue ──► writer task ──► serial TX
//!                                      │
//!                                      │ handoff (written requests)
//!                                      ▼
//!  serial RX ──► reader task ──► FIFO head ◄── terminal line
//!                    │
//!                    ├──► command sink (one task, ordered)
//!                    └──► raw sink     (one task, ordered)
//! ```
//!
//! Only the reader task touches the FIFO. Responses are matched strictly in
//! write order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use voltage_ble::response::module_error_code;
use voltage_ble::{classify_line, BleError, LineKind, TerminalStatus};

use super::config::MuxSettings;
use super::transport::ByteStream;
use crate::error::{BleSrvError, Result};

/// Admission attempts before `QueueFull`
pub const QUEUE_ADMISSION_ATTEMPTS: usize = 3;

/// Back-off after end-of-stream or a read error
const READ_BACKOFF: Duration = Duration::from_millis(10);

/// How long a terminal line waits for a just-written request to be handed off
const HANDOFF_GRACE: Duration = Duration::from_millis(20);

/// Consumer of lines routed out of the reader task
#[async_trait]
pub trait LineSink: Send + Sync {
    async fn handle_line(&self, line: String);
}

/// Sink that drops every line
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl LineSink for NullSink {
    async fn handle_line(&self, line: String) {
        trace!("[Serial Mux] dropped line: {}", line);
    }
}

/// Sink forwarding lines into a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl LineSink for ChannelSink {
    async fn handle_line(&self, line: String) {
        if self.tx.send(line).is_err() {
            debug!("[Serial Mux] channel sink receiver dropped");
        }
    }
}

/// A command waiting for its terminal line
#[derive(Debug)]
struct PendingRequest {
    command: Bytes,
    timeout: Duration,
    read_delay: Duration,
    responder: oneshot::Sender<Result<String>>,
    enqueued_at: Instant,
    /// Set by the writer just before the command goes out
    written_at: Instant,
}

impl PendingRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.enqueued_at) > self.timeout + self.read_delay
    }

    /// A line read before the command went out cannot answer it
    fn predates(&self, line_read_at: Instant) -> bool {
        line_read_at < self.written_at
    }

    fn resolve(self, result: Result<String>) {
        // the caller may have stopped waiting already
        let _ = self.responder.send(result);
    }
}

/// Multiplexer counters
#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    responses: AtomicU64,
    timeouts: AtomicU64,
    command_reports: AtomicU64,
    raw_lines: AtomicU64,
}

/// Snapshot of multiplexer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub written: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub command_reports: u64,
    pub raw_lines: u64,
}

/// Serial transport multiplexer
pub struct SerialMultiplexer {
    request_tx: mpsc::Sender<PendingRequest>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SerialMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialMultiplexer")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl SerialMultiplexer {
    /// Take ownership of `stream` and start the reader and writer tasks
    pub fn new<S: ByteStream>(
        stream: S,
        settings: &MuxSettings,
        command_sink: Arc<dyn LineSink>,
        raw_sink: Arc<dyn LineSink>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (request_tx, request_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let writer_task = tokio::spawn(writer_loop(
            writer,
            request_rx,
            handoff_tx,
            cancel.clone(),
            Arc::clone(&counters),
        ));

        let router = LineRouter {
            ignore_prefixes: settings.ignore_prefixes.clone(),
            marker: settings.command_report_marker.clone(),
            command_tx: spawn_dispatcher("command", command_sink),
            raw_tx: spawn_dispatcher("raw", raw_sink),
            counters: Arc::clone(&counters),
        };
        let reader_task = tokio::spawn(reader_loop(reader, handoff_rx, router, cancel.clone()));

        info!(
            "[Serial Mux] started (queue capacity {})",
            settings.queue_capacity
        );

        Self {
            request_tx,
            cancel,
            tasks: Mutex::new(vec![writer_task, reader_task]),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    /// Issue `command` and wait for its complete response.
    ///
    /// Admission retries up to three times, each bounded by `queue_wait`.
    /// Once admitted, the call waits at most `read_delay + timeout`.
    pub async fn enqueue(
        &self,
        command: impl Into<Bytes>,
        timeout: Duration,
        read_delay: Duration,
        queue_wait: Duration,
    ) -> Result<String> {
        let command = command.into();
        if command.is_empty() {
            return Err(BleSrvError::validation("command must not be empty"));
        }
        if self.is_closed() {
            return Err(BleSrvError::closed("serial multiplexer is closed"));
        }

        let permit = self.admit(queue_wait).await?;
        let (responder, response) = oneshot::channel();
        let now = Instant::now();
        permit.send(PendingRequest {
            command,
            timeout,
            read_delay,
            responder,
            enqueued_at: now,
            written_at: now,
        });

        match tokio::time::timeout(read_delay + timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BleSrvError::closed(
                "serial multiplexer closed before the response",
            )),
            Err(_) => Err(BleSrvError::timeout(format!(
                "no response within {:?}",
                read_delay + timeout
            ))),
        }
    }

    async fn admit(&self, queue_wait: Duration) -> Result<mpsc::Permit<'_, PendingRequest>> {
        for attempt in 1..=QUEUE_ADMISSION_ATTEMPTS {
            match tokio::time::timeout(queue_wait, self.request_tx.reserve()).await {
                Ok(Ok(permit)) => return Ok(permit),
                Ok(Err(_)) => return Err(BleSrvError::closed("serial multiplexer is closed")),
                Err(_) => debug!(
                    "[Serial Mux] queue full, attempt {}/{}",
                    attempt, QUEUE_ADMISSION_ATTEMPTS
                ),
            }
        }
        warn!(
            "[Serial Mux] request rejected after {} admission attempts",
            QUEUE_ADMISSION_ATTEMPTS
        );
        Err(BleSrvError::queue_full(format!(
            "request queue still full after {} attempts",
            QUEUE_ADMISSION_ATTEMPTS
        )))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MuxStats {
        MuxStats {
            written: self.counters.written.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            command_reports: self.counters.command_reports.load(Ordering::Relaxed),
            raw_lines: self.counters.raw_lines.load(Ordering::Relaxed),
        }
    }

    /// Stop both tasks, release the stream and fail every pending request.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[Serial Mux] task ended abnormally: {}", e);
            }
        }
        info!("[Serial Mux] closed");
    }
}

impl Drop for SerialMultiplexer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_dispatcher(kind: &'static str, sink: Arc<dyn LineSink>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            sink.handle_line(line).await;
        }
        debug!("[Serial Mux] {} dispatcher stopped", kind);
    });
    tx
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut request_rx: mpsc::Receiver<PendingRequest>,
    handoff_tx: mpsc::UnboundedSender<PendingRequest>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let mut request = tokio::select! {
            _ = cancel.cancelled() => break,
            next = request_rx.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let command = request.command.clone();
        request.written_at = Instant::now();
        let write = async {
            writer.write_all(&command).await?;
            writer.flush().await
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => {
                request.resolve(Err(BleSrvError::closed("serial multiplexer closed during write")));
                break;
            },
            written = write => written,
        };

        match written {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[Serial Mux] wrote {} bytes: {:?}",
                    command.len(),
                    String::from_utf8_lossy(&command).trim_end()
                );
                if let Err(mpsc::error::SendError(request)) = handoff_tx.send(request) {
                    request.resolve(Err(BleSrvError::closed("serial reader stopped")));
                }
            },
            Err(e) => {
                error!("[Serial Mux] write failed: {}", e);
                request.resolve(Err(BleSrvError::write(e.to_string())));
            },
        }
    }

    request_rx.close();
    while let Ok(request) = request_rx.try_recv() {
        request.resolve(Err(BleSrvError::closed("serial multiplexer closed")));
    }
    debug!("[Serial Mux] writer stopped");
}

/// Reader-side routing state
struct LineRouter {
    ignore_prefixes: Vec<String>,
    marker: String,
    command_tx: mpsc::UnboundedSender<String>,
    raw_tx: mpsc::UnboundedSender<String>,
    counters: Arc<Counters>,
}

impl LineRouter {
    fn is_ignored(&self, line: &str) -> bool {
        self.ignore_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && line.starts_with(prefix.as_str()))
    }

    fn dispatch_reports(&self, segments: Vec<&str>) {
        for segment in segments {
            self.counters.command_reports.fetch_add(1, Ordering::Relaxed);
            let _ = self.command_tx.send(segment.to_string());
        }
    }

    fn dispatch_raw(&self, line: &str) {
        self.counters.raw_lines.fetch_add(1, Ordering::Relaxed);
        let _ = self.raw_tx.send(line.to_string());
    }
}

/// Requests awaiting a terminal line, owned by the reader task
#[derive(Default)]
struct ResponseQueue {
    fifo: VecDeque<PendingRequest>,
    head_lines: Vec<String>,
}

impl ResponseQueue {
    fn absorb(&mut self, handoff_rx: &mut mpsc::UnboundedReceiver<PendingRequest>) {
        while let Ok(request) = handoff_rx.try_recv() {
            self.fifo.push_back(request);
        }
    }

    /// Drop stale heads until the head is fresh or the FIFO is empty
    fn sweep(&mut self, now: Instant, counters: &Counters) {
        while self.fifo.front().is_some_and(|r| r.is_expired(now)) {
            if let Some(request) = self.fifo.pop_front() {
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[Serial Mux] request {:?} expired without a terminal line",
                    String::from_utf8_lossy(&request.command).trim_end()
                );
                self.head_lines.clear();
                request.resolve(Err(BleSrvError::timeout(
                    "no terminal line before the deadline",
                )));
            }
        }
    }

    fn fail_all(&mut self, handoff_rx: &mut mpsc::UnboundedReceiver<PendingRequest>) {
        handoff_rx.close();
        self.absorb(handoff_rx);
        for request in self.fifo.drain(..) {
            request.resolve(Err(BleSrvError::closed("serial multiplexer closed")));
        }
        self.head_lines.clear();
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    reader: R,
    mut handoff_rx: mpsc::UnboundedReceiver<PendingRequest>,
    router: LineRouter,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    let mut queue = ResponseQueue::default();
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_BACKOFF) => continue,
                }
            },
            Ok(_) => {},
            Err(e) => {
                warn!("[Serial Mux] read error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_BACKOFF) => continue,
                }
            },
        }

        let line_read_at = Instant::now();
        queue.absorb(&mut handoff_rx);
        queue.sweep(line_read_at, &router.counters);

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() || router.is_ignored(line) {
            continue;
        }
        trace!("[Serial Mux] line: {:?}", line);

        match classify_line(line, &router.marker) {
            LineKind::CommandReport(segments) => router.dispatch_reports(segments),
            LineKind::RawData => {
                router.dispatch_raw(line);
                if queue
                    .fifo
                    .front()
                    .is_some_and(|head| !head.predates(line_read_at))
                {
                    queue.head_lines.push(line.to_string());
                }
            },
            LineKind::Terminal(status) => {
                if queue.fifo.is_empty() {
                    if let Ok(Some(request)) =
                        tokio::time::timeout(HANDOFF_GRACE, handoff_rx.recv()).await
                    {
                        queue.fifo.push_back(request);
                    }
                }
                let Some(request) = queue.fifo.pop_front() else {
                    debug!("[Serial Mux] terminal line with no pending request: {}", line);
                    continue;
                };
                if request.predates(line_read_at) {
                    debug!(
                        "[Serial Mux] terminal line read before the pending write: {}",
                        line
                    );
                    queue.fifo.push_front(request);
                    continue;
                }

                queue.head_lines.push(line.to_string());
                let response = std::mem::take(&mut queue.head_lines).join("\n");
                if !request.read_delay.is_zero() {
                    tokio::time::sleep(request.read_delay).await;
                }
                router.counters.responses.fetch_add(1, Ordering::Relaxed);
                request.resolve(terminal_result(status, response));
            },
        }
    }

    queue.fail_all(&mut handoff_rx);
    debug!("[Serial Mux] reader stopped");
}

fn terminal_result(status: TerminalStatus, response: String) -> Result<String> {
    match status {
        TerminalStatus::Success => Ok(response),
        TerminalStatus::Failure => Err(BleError::CommandFailed { response }.into()),
        TerminalStatus::ModuleError => Err(BleError::ModuleError {
            code: module_error_code(&response).unwrap_or_default(),
            response,
        }
        .into()),
    }
}
