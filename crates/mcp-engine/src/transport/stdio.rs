//! Stdio transport: spawn a child process and speak line-delimited
//! JSON-RPC over its pipes.
//!
//! One reader task per stdout/stderr pipe. The child signals readiness
//! implicitly — the first line observed on either stream flips the
//! transport ready, at which point messages queued before readiness are
//! flushed in order. There is no reconnection: a dead child stays dead.

use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionState, Transport, TransportError, TransportEventHandler};
use crate::model::JsonRpcMessage;

#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

struct StdioInner {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
}

pub struct StdioTransport {
    config: StdioConfig,
    state: Arc<ConnectionState>,
    inner: tokio::sync::Mutex<Option<StdioInner>>,
    /// Messages accepted before the child signalled readiness.
    queued: Arc<Mutex<Vec<JsonRpcMessage>>>,
    writer_tx: RwLock<Option<mpsc::Sender<String>>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            state: Arc::new(ConnectionState::default()),
            inner: tokio::sync::Mutex::new(None),
            queued: Arc::new(Mutex::new(Vec::new())),
            writer_tx: RwLock::new(None),
        }
    }

    fn writer(&self) -> Option<mpsc::Sender<String>> {
        self.writer_tx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Flip readiness on the first observed line and flush the queue.
    async fn mark_ready(
        state: &ConnectionState,
        queued: &Mutex<Vec<JsonRpcMessage>>,
        writer_tx: &mpsc::Sender<String>,
    ) {
        if !state.set_ready() {
            return;
        }
        state.emit_connect().await;
        let backlog: Vec<JsonRpcMessage> = {
            let mut queued = queued.lock().unwrap_or_else(|e| e.into_inner());
            queued.drain(..).collect()
        };
        for message in backlog {
            if writer_tx
                .send(crate::model::serialize(&message))
                .await
                .is_err()
            {
                tracing::warn!("child stdin closed while flushing queued messages");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(true);
        }
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(self.config.envs.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::other("child stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::other("child stdout unavailable")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::other("child stderr unavailable")))?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
        let mut tasks = Vec::new();

        // Writer task owns stdin; both readers and send() feed it.
        let writer_state = self.state.clone();
        tasks.push(tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = writer_rx.recv().await {
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = write.await {
                    tracing::warn!("stdio write failed: {e}");
                    writer_state.emit_error(TransportError::Io(e)).await;
                    break;
                }
            }
        }));

        let stdout_state = self.state.clone();
        let stdout_queued = self.queued.clone();
        let stdout_writer = writer_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        Self::mark_ready(&stdout_state, &stdout_queued, &stdout_writer).await;
                        match crate::model::parse(&line) {
                            Ok(message) => stdout_state.emit_message(message).await,
                            Err(e) => {
                                // Protocol error: drop the line, keep reading.
                                tracing::warn!("dropping malformed stdout line: {e}");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        stdout_state.emit_error(TransportError::Io(e)).await;
                        break;
                    }
                }
            }
            stdout_state.set_connected(false);
            stdout_state.emit_disconnect().await;
            tracing::debug!("child stdout closed");
        }));

        let stderr_state = self.state.clone();
        let stderr_queued = self.queued.clone();
        let stderr_writer = writer_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // Startup banners land here; any output means the child is
                // alive enough to receive.
                Self::mark_ready(&stderr_state, &stderr_queued, &stderr_writer).await;
                tracing::debug!(target: "mcp_engine::child", "{line}");
            }
        }));

        *self.writer_tx.write().unwrap_or_else(|e| e.into_inner()) = Some(writer_tx);
        *inner = Some(StdioInner { child, tasks });
        self.state.set_connected(true);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock().await;
        let Some(mut stdio) = inner.take() else {
            return Ok(false);
        };
        *self.writer_tx.write().unwrap_or_else(|e| e.into_inner()) = None;
        if let Err(e) = stdio.child.kill().await {
            tracing::debug!("child already gone: {e}");
        }
        for task in stdio.tasks {
            task.abort();
        }
        self.state.set_connected(false);
        self.state.emit_disconnect().await;
        Ok(true)
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<bool, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if !self.state.is_ready() {
            // Held until the child's first line of output.
            self.queued
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message);
            return Ok(true);
        }
        let Some(writer) = self.writer() else {
            return Err(TransportError::NotConnected);
        };
        writer
            .send(crate::model::serialize(&message))
            .await
            .map_err(|_| TransportError::NotConnected)?;
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn set_handler(&self, handler: Arc<dyn TransportEventHandler>) {
        self.state.set_handler(handler);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::model::{JsonRpcMessage, RequestId};

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<JsonRpcMessage>,
    }

    #[async_trait]
    impl TransportEventHandler for ChannelHandler {
        async fn on_message(&self, message: JsonRpcMessage) {
            let _ = self.tx.send(message);
        }
    }

    /// `cat` echoes whatever we write, which makes it a loopback server:
    /// messages queued before readiness must come back verbatim.
    #[tokio::test]
    async fn test_cat_loopback_flushes_queue_on_first_line() {
        let transport = StdioTransport::new(StdioConfig::new("cat"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_handler(Arc::new(ChannelHandler { tx }));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert!(!transport.is_ready());

        let ping = JsonRpcMessage::request("ping", 1.into(), None);
        // Accepted but queued: cat has produced no output yet.
        transport.send(ping.clone()).await.unwrap();

        // cat only speaks when spoken to, so write one line straight to
        // the writer channel to provoke the first stdout line.
        {
            let writer = transport.writer().unwrap();
            writer
                .send(crate::model::serialize(&ping))
                .await
                .unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id(), Some(&RequestId::Number(1)));
        assert!(transport.is_ready());

        // The queued message flushes after readiness and echoes back too.
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, ping);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_refused() {
        let transport = StdioTransport::new(StdioConfig::new("cat"));
        let err = transport
            .send(JsonRpcMessage::request("ping", 1.into(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_missing_binary_fails() {
        let transport = StdioTransport::new(StdioConfig::new("definitely-not-a-real-binary"));
        assert!(transport.connect().await.is_err());
    }
}
