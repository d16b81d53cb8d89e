//! Boundary contract exposed to the orchestration layer.
//!
//! [`Remote`] is the transport-agnostic surface: place blobs in the
//! remote content cache, open listening sockets, start processes, tear
//! the whole thing down. [`TunneledRemote`] implements it over a
//! [`SessionClient`] by bridging its callback handlers into awaitable
//! futures. Non-tunneled implementations (direct login, local) live with
//! their transports, not here.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::client::{ExecHandler, FilePushHandler, SessionClient, SocketHandler};
use crate::error::RemoteError;
use crate::mux::{ChannelReader, ChannelWriter};
use crate::protocol::{EnvEntry, ExitStatus};

/// Operations the orchestration layer drives, independent of how the
/// remote side is reached.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Place `content` in the remote cache under `name`, returning the
    /// remote path. Content already present is not transferred again.
    async fn cache_file(&self, name: &str, content: Bytes) -> Result<String, RemoteError>;

    /// Cache several blobs, returning their remote paths in order.
    async fn cache_files(&self, blobs: Vec<(String, Bytes)>) -> Result<Vec<String>, RemoteError>;

    /// Open a remote listening socket on an ephemeral loopback port.
    async fn open_socket(&self) -> Result<SocketHandle, RemoteError>;

    /// Start a remote process and wait until it is actually running.
    async fn start_process(
        &self,
        work_dir: &str,
        command: Vec<String>,
        env: Vec<EnvEntry>,
    ) -> Result<ProcessHandle, RemoteError>;

    /// Close the whole transport. Operations still in flight observe no
    /// further events.
    async fn terminate(&self);
}

/// One proxied client connection delivered by a [`SocketHandle`].
pub struct AcceptedConnection {
    pub remote_host: String,
    pub remote_port: i32,
    pub incoming: ChannelReader,
    pub outgoing: ChannelWriter,
}

/// A live remote listening socket.
pub struct SocketHandle {
    sock_id: i64,
    host: String,
    port: i32,
    connections: mpsc::Receiver<AcceptedConnection>,
    client: Arc<SessionClient>,
}

impl SocketHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    /// Next proxied connection, or `None` once the socket is destroyed
    /// or the connection is gone.
    pub async fn next_connection(&mut self) -> Option<AcceptedConnection> {
        self.connections.recv().await
    }

    /// Stop accepting. The remote listener itself lives until the
    /// connection ends; no further connections are delivered here.
    pub fn destroy(&self) {
        self.client.close_socket(self.sock_id);
    }
}

/// A live remote process.
pub struct ProcessHandle {
    proc_id: i64,
    stdin: Option<ChannelWriter>,
    stdout: Option<ChannelReader>,
    stderr: Option<ChannelReader>,
    exit: oneshot::Receiver<ExitStatus>,
    client: Arc<SessionClient>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("proc_id", &self.proc_id)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn proc_id(&self) -> i64 {
        self.proc_id
    }

    /// Take the stdin channel. Closing it sends EOF to the process.
    pub fn take_stdin(&mut self) -> Option<ChannelWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChannelReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChannelReader> {
        self.stderr.take()
    }

    /// Ask the executor to terminate the process. Best effort; the exit
    /// status still arrives through [`ProcessHandle::wait`].
    pub async fn destroy(&self) {
        let _ = self.client.kill(self.proc_id).await;
    }

    /// Wait for the process to end.
    pub async fn wait(self) -> Result<ExitStatus, RemoteError> {
        let closed = self.client.closed();
        tokio::select! {
            biased;
            status = self.exit => status.map_err(|_| RemoteError::ConnectionLost),
            _ = closed.cancelled() => Err(RemoteError::ConnectionLost),
        }
    }
}

/// [`Remote`] over a multiplexed tunnel.
pub struct TunneledRemote {
    client: Arc<SessionClient>,
    cache_dir: String,
}

impl TunneledRemote {
    /// Wrap a session client; pushed blobs land under `cache_dir` on the
    /// remote side.
    pub fn new(client: SessionClient, cache_dir: impl Into<String>) -> Self {
        Self {
            client: Arc::new(client),
            cache_dir: cache_dir.into(),
        }
    }

    fn cache_path(&self, name: &str) -> String {
        format!("{}/{}", self.cache_dir.trim_end_matches('/'), name)
    }
}

#[async_trait]
impl Remote for TunneledRemote {
    async fn cache_file(&self, name: &str, content: Bytes) -> Result<String, RemoteError> {
        let path = self.cache_path(name);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        self.client
            .push_file(&path, Arc::new(PushBridge { events: events_tx }))
            .await?;

        let closed = self.client.closed();
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event.ok_or(RemoteError::ConnectionLost)?,
                _ = closed.cancelled() => return Err(RemoteError::ConnectionLost),
            };
            match event {
                PushEvent::Accepted(writer) => {
                    writer
                        .write(&content)
                        .await
                        .map_err(|_| RemoteError::ConnectionLost)?;
                    writer.close();
                }
                PushEvent::Confirmed { path, .. } => return Ok(path),
                PushEvent::Failed { path, error } => {
                    return Err(RemoteError::Push {
                        path,
                        message: error,
                    });
                }
            }
        }
    }

    async fn cache_files(&self, blobs: Vec<(String, Bytes)>) -> Result<Vec<String>, RemoteError> {
        let mut paths = Vec::with_capacity(blobs.len());
        for (name, content) in blobs {
            paths.push(self.cache_file(&name, content).await?);
        }
        Ok(paths)
    }

    async fn open_socket(&self) -> Result<SocketHandle, RemoteError> {
        let (bound_tx, bound_rx) = oneshot::channel();
        let (conn_tx, connections) = mpsc::channel(16);
        let sock_id = self
            .client
            .new_socket(Arc::new(SocketBridge {
                bound: Mutex::new(Some(bound_tx)),
                connections: conn_tx,
            }))
            .await?;

        let closed = self.client.closed();
        let (host, port) = tokio::select! {
            biased;
            bound = bound_rx => bound.map_err(|_| RemoteError::ConnectionLost)?,
            _ = closed.cancelled() => return Err(RemoteError::ConnectionLost),
        };
        Ok(SocketHandle {
            sock_id,
            host,
            port,
            connections,
            client: Arc::clone(&self.client),
        })
    }

    async fn start_process(
        &self,
        work_dir: &str,
        command: Vec<String>,
        env: Vec<EnvEntry>,
    ) -> Result<ProcessHandle, RemoteError> {
        let (started_tx, mut started_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let proc_id = self
            .client
            .exec(
                work_dir,
                command,
                env,
                Arc::new(ProcessBridge {
                    started: Mutex::new(Some(started_tx)),
                    exit: Mutex::new(Some(exit_tx)),
                }),
            )
            .await?;

        let closed = self.client.closed();
        let started = tokio::select! {
            biased;
            started = &mut started_rx => started,
            _ = closed.cancelled() => return Err(RemoteError::ConnectionLost),
        };
        match started {
            Ok((stdin, stdout, stderr)) => Ok(ProcessHandle {
                proc_id,
                stdin: Some(stdin),
                stdout: Some(stdout),
                stderr: Some(stderr),
                exit: exit_rx,
                client: Arc::clone(&self.client),
            }),
            Err(_) => {
                // The process never started; the spawn failure came back
                // as its exit status instead.
                let status = tokio::select! {
                    biased;
                    status = exit_rx => status.ok(),
                    _ = closed.cancelled() => None,
                };
                match status {
                    Some(_) => Err(RemoteError::SpawnFailed),
                    None => Err(RemoteError::ConnectionLost),
                }
            }
        }
    }

    async fn terminate(&self) {
        self.client.terminate().await;
    }
}

enum PushEvent {
    Accepted(ChannelWriter),
    Confirmed { path: String, size: i64 },
    Failed { path: String, error: String },
}

struct PushBridge {
    events: mpsc::UnboundedSender<PushEvent>,
}

#[async_trait]
impl FilePushHandler for PushBridge {
    async fn accepted(&self, content: ChannelWriter) {
        let _ = self.events.send(PushEvent::Accepted(content));
    }

    async fn confirmed(&self, path: String, size: i64) {
        let _ = self.events.send(PushEvent::Confirmed { path, size });
    }

    async fn failed(&self, path: String, error: String) {
        let _ = self.events.send(PushEvent::Failed { path, error });
    }
}

struct SocketBridge {
    bound: Mutex<Option<oneshot::Sender<(String, i32)>>>,
    connections: mpsc::Sender<AcceptedConnection>,
}

#[async_trait]
impl SocketHandler for SocketBridge {
    async fn bound(&self, host: String, port: i32) {
        let sender = match self.bound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send((host, port));
        }
    }

    async fn accepted(
        &self,
        remote_host: String,
        remote_port: i32,
        incoming: ChannelReader,
        outgoing: ChannelWriter,
    ) {
        let connection = AcceptedConnection {
            remote_host,
            remote_port,
            incoming,
            outgoing,
        };
        if self.connections.send(connection).await.is_err() {
            tracing::trace!("socket handle dropped, discarding connection");
        }
    }
}

struct ProcessBridge {
    started: Mutex<Option<oneshot::Sender<(ChannelWriter, ChannelReader, ChannelReader)>>>,
    exit: Mutex<Option<oneshot::Sender<ExitStatus>>>,
}

#[async_trait]
impl ExecHandler for ProcessBridge {
    async fn started(&self, stdin: ChannelWriter, stdout: ChannelReader, stderr: ChannelReader) {
        let sender = match self.started.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send((stdin, stdout, stderr));
        }
    }

    async fn finished(&self, status: ExitStatus) {
        let sender = match self.exit.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(status);
        }
    }
}
