//! Scripted BLE peripheral for testing
//!
//! Sits on the far end of a `tokio::io::duplex` pipe, records every
//! `\r\n`-terminated command the multiplexer writes and answers from a
//! script. Unscripted commands are answered with `OK`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Script {
    /// (command prefix, reply lines); first match wins
    rules: Vec<(String, Vec<String>)>,
}

impl Script {
    fn reply_for(&self, command: &str) -> Vec<String> {
        self.rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, lines)| lines.clone())
            .unwrap_or_else(|| vec!["OK".to_string()])
    }
}

/// Simulated peripheral attached to the device end of a duplex pipe
#[derive(Debug)]
pub struct MockPeripheral {
    script: Arc<Mutex<Script>>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    received_notify: Arc<Notify>,
    inject_tx: mpsc::UnboundedSender<String>,
    handle: JoinHandle<()>,
}

impl MockPeripheral {
    /// Create a pipe; returns the host end and the running peripheral
    pub fn spawn() -> (DuplexStream, Self) {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let script = Arc::new(Mutex::new(Script::default()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_notify = Arc::new(Notify::new());
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(run_device(
            device,
            Arc::clone(&script),
            Arc::clone(&received),
            Arc::clone(&received_notify),
            inject_rx,
        ));

        (
            host,
            Self {
                script,
                received,
                received_notify,
                inject_tx,
                handle,
            },
        )
    }

    /// Reply to commands starting with `prefix` with `lines`
    pub fn respond(&self, prefix: &str, lines: &[&str]) {
        self.script.lock().rules.push((
            prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
    }

    /// Never answer commands starting with `prefix`
    pub fn silence(&self, prefix: &str) {
        self.respond(prefix, &[]);
    }

    /// Emit an unsolicited line
    pub fn inject(&self, line: &str) {
        let _ = self.inject_tx.send(line.to_string());
    }

    /// Raw command frames received so far, without the trailing `\r\n`
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    /// Commands received so far, lossily decoded
    pub fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    /// Wait until at least `count` commands arrived or `limit` elapses
    pub async fn wait_for_commands(&self, count: usize, limit: Duration) -> Vec<String> {
        let _ = tokio::time::timeout(limit, async {
            loop {
                let notified = self.received_notify.notified();
                if self.received.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.commands()
    }

    /// Stop the peripheral; the host end then sees end-of-stream
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for MockPeripheral {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_device(
    device: DuplexStream,
    script: Arc<Mutex<Script>>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    received_notify: Arc<Notify>,
    mut inject_rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut reader, mut writer) = tokio::io::split(device);
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&chunk[..n]);

                while let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
                    let command: Vec<u8> = pending.drain(..pos + 2).take(pos).collect();
                    let text = String::from_utf8_lossy(&command).into_owned();
                    debug!("[MockPeripheral] received {:?}", text);

                    let reply = script.lock().reply_for(&text);
                    received.lock().push(command);
                    received_notify.notify_waiters();

                    for line in reply {
                        if writer.write_all(format!("{line}\r\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    let _ = writer.flush().await;
                }
            },
            Some(line) = inject_rx.recv() => {
                if writer.write_all(format!("{line}\r\n").as_bytes()).await.is_err() {
                    return;
                }
                let _ = writer.flush().await;
            },
        }
    }
}
