//! Issuing role: sends commands and routes responses to caller handlers.
//!
//! Every operation pre-registers the channels its command names, then
//! files a context under the command's correlation id. A dedicated reader
//! task owns the control-reply channel and joins each response to its
//! context by that id alone; frame order across channels means nothing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::mux::{
    CONTROL_REPLY_ID, CONTROL_REQUEST_ID, ChannelReader, ChannelWriter, IdPool, MuxShared,
    Transport,
};
use crate::protocol::{ControlMessage, ControlStream, EnvEntry, ExitStatus, PushStatus};

/// Callbacks for one executed process.
#[async_trait]
pub trait ExecHandler: Send + Sync + 'static {
    /// The process is running; these are its stdio channels.
    async fn started(&self, stdin: ChannelWriter, stdout: ChannelReader, stderr: ChannelReader);

    /// The process is gone. Exactly one call per proc id, last.
    async fn finished(&self, status: ExitStatus);
}

/// Callbacks for one remote listening socket.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    async fn bound(&self, host: String, port: i32);

    /// A connection arrived; one call per accepted connection.
    async fn accepted(
        &self,
        remote_host: String,
        remote_port: i32,
        incoming: ChannelReader,
        outgoing: ChannelWriter,
    );
}

/// Callbacks for one file push.
#[async_trait]
pub trait FilePushHandler: Send + Sync + 'static {
    /// The remote side wants the content; stream it and close the writer.
    /// Never called when the file is already cached.
    async fn accepted(&self, content: ChannelWriter);

    async fn confirmed(&self, path: String, size: i64);

    async fn failed(&self, path: String, error: String);
}

struct ExecContext {
    handler: Arc<dyn ExecHandler>,
    io: Option<(ChannelWriter, ChannelReader, ChannelReader)>,
}

struct SocketContext {
    handler: Arc<dyn SocketHandler>,
}

struct AcceptContext {
    sock_id: i64,
    handler: Arc<dyn SocketHandler>,
    io: Option<(ChannelReader, ChannelWriter)>,
}

struct FileContext {
    handler: Arc<dyn FilePushHandler>,
    content: Option<ChannelWriter>,
}

struct ClientInner {
    mux: Arc<MuxShared>,
    /// Whole commands are written under this lock so concurrent callers
    /// cannot interleave their bytes on the request channel.
    requests: tokio::sync::Mutex<ChannelWriter>,
    execs: DashMap<i64, ExecContext>,
    sockets: DashMap<i64, SocketContext>,
    accepts: DashMap<i64, AcceptContext>,
    files: DashMap<i64, FileContext>,
}

impl ClientInner {
    async fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        message.encode(&mut buf)?;
        let writer = self.requests.lock().await;
        writer
            .write(&buf)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// The command-issuing side of one connection.
pub struct SessionClient {
    transport: Transport,
    inner: Arc<ClientInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SessionClient {
    pub fn new(transport: Transport) -> Result<Self, TransportError> {
        let mux = transport.shared();
        let requests = mux
            .open_to_wire(CONTROL_REQUEST_ID)
            .map_err(|e| TransportError::Desync(e.to_string()))?;
        let replies = mux
            .open_from_wire(CONTROL_REPLY_ID)
            .map_err(|e| TransportError::Desync(e.to_string()))?;

        let inner = Arc::new(ClientInner {
            mux: Arc::clone(&mux),
            requests: tokio::sync::Mutex::new(requests),
            execs: DashMap::new(),
            sockets: DashMap::new(),
            accepts: DashMap::new(),
            files: DashMap::new(),
        });

        let reader = tokio::spawn(reply_loop(
            Arc::clone(&inner),
            ControlStream::new(replies),
            mux,
        ));

        // The control channels exist; frames may flow now.
        transport.start();

        Ok(Self {
            transport,
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Launch a process remotely. The handler sees `started` with the
    /// stdio channels once it is running, then exactly one `finished`.
    pub async fn exec(
        &self,
        work_dir: &str,
        command: Vec<String>,
        env: Vec<EnvEntry>,
        handler: Arc<dyn ExecHandler>,
    ) -> Result<i64, TransportError> {
        let mux = &self.inner.mux;
        let proc_id = mux.next_id(IdPool::Process);
        let stdin_id = mux.next_id(IdPool::Data);
        let stdout_id = mux.next_id(IdPool::Data);
        let stderr_id = mux.next_id(IdPool::Data);

        let stdin = mux
            .open_to_wire(stdin_id)
            .map_err(|e| TransportError::Desync(e.to_string()))?;
        let stdout = mux
            .open_from_wire(stdout_id)
            .map_err(|e| TransportError::Desync(e.to_string()))?;
        let stderr = mux
            .open_from_wire(stderr_id)
            .map_err(|e| TransportError::Desync(e.to_string()))?;

        self.inner.execs.insert(
            proc_id,
            ExecContext {
                handler,
                io: Some((stdin, stdout, stderr)),
            },
        );

        tracing::debug!(%proc_id, ?command, "issuing exec");
        let sent = self
            .inner
            .send(ControlMessage::Exec {
                proc_id,
                stdin_id,
                stdout_id,
                stderr_id,
                work_dir: work_dir.to_string(),
                command,
                env,
            })
            .await;
        if let Err(e) = sent {
            self.inner.execs.remove(&proc_id);
            return Err(e);
        }
        Ok(proc_id)
    }

    /// Ask the executor to terminate a process. Best effort: no reply is
    /// awaited, and a proc id with no live context is a no-op.
    pub async fn kill(&self, proc_id: i64) -> Result<(), TransportError> {
        if !self.inner.execs.contains_key(&proc_id) {
            return Ok(());
        }
        tracing::debug!(%proc_id, "issuing kill");
        self.inner.send(ControlMessage::Kill { proc_id }).await
    }

    /// Open a remote listening socket. The handler sees `bound` with the
    /// address, then one `accepted` per connection; one acceptance is
    /// kept outstanding for as long as the socket lives.
    pub async fn new_socket(
        &self,
        handler: Arc<dyn SocketHandler>,
    ) -> Result<i64, TransportError> {
        let sock_id = self.inner.mux.next_id(IdPool::Socket);
        self.inner
            .sockets
            .insert(sock_id, SocketContext { handler });

        tracing::debug!(%sock_id, "issuing bind");
        let sent = self.inner.send(ControlMessage::Bind { sock_id }).await;
        if let Err(e) = sent {
            self.inner.sockets.remove(&sock_id);
            return Err(e);
        }
        Ok(sock_id)
    }

    /// Stop accepting on a socket and drop its contexts. The wire has no
    /// unbind command; the remote listener lives until the connection ends.
    pub fn close_socket(&self, sock_id: i64) {
        self.inner.sockets.remove(&sock_id);
        self.inner.accepts.retain(|_, ctx| ctx.sock_id != sock_id);
    }

    /// Push a file into the remote cache. If the path is already present
    /// the handler sees `confirmed` directly; otherwise `accepted` hands
    /// it the content channel and `confirmed`/`failed` ends the push.
    pub async fn push_file(
        &self,
        path: &str,
        handler: Arc<dyn FilePushHandler>,
    ) -> Result<i64, TransportError> {
        let mux = &self.inner.mux;
        let file_id = mux.next_id(IdPool::File);
        let in_id = mux.next_id(IdPool::Data);
        let content = mux
            .open_to_wire(in_id)
            .map_err(|e| TransportError::Desync(e.to_string()))?;

        self.inner.files.insert(
            file_id,
            FileContext {
                handler,
                content: Some(content),
            },
        );

        tracing::debug!(%file_id, %path, "issuing file push");
        let sent = self
            .inner
            .send(ControlMessage::FilePush {
                file_id,
                path: path.to_string(),
                in_id,
            })
            .await;
        if let Err(e) = sent {
            self.inner.files.remove(&file_id);
            return Err(e);
        }
        Ok(file_id)
    }

    /// Token cancelled when the connection dies, however it dies.
    pub fn closed(&self) -> CancellationToken {
        self.transport.closed()
    }

    /// Tear the connection down. Pending contexts are not failed; their
    /// handlers simply see no further calls.
    pub async fn terminate(&self) {
        self.transport.terminate().await;
        let reader = {
            let mut guard = match self.reader.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }
}

async fn reply_loop(inner: Arc<ClientInner>, mut replies: ControlStream, mux: Arc<MuxShared>) {
    loop {
        match replies.next().await {
            Ok(Some(message)) => {
                if let Err(e) = dispatch_reply(&inner, message).await {
                    tracing::error!(error = %e, "fatal reply error, shutting down");
                    mux.teardown();
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("control reply channel ended");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "undecodable control reply, shutting down");
                mux.teardown();
                break;
            }
        }
    }
}

async fn dispatch_reply(
    inner: &Arc<ClientInner>,
    message: ControlMessage,
) -> Result<(), TransportError> {
    match message {
        ControlMessage::Started { proc_id } => {
            let (handler, io) = {
                let mut entry = inner
                    .execs
                    .get_mut(&proc_id)
                    .ok_or_else(|| TransportError::Desync(format!("started for {proc_id}")))?;
                (Arc::clone(&entry.handler), entry.io.take())
            };
            match io {
                Some((stdin, stdout, stderr)) => handler.started(stdin, stdout, stderr).await,
                None => tracing::warn!(%proc_id, "duplicate started, ignoring"),
            }
        }
        ControlMessage::ExitCode { proc_id, status } => {
            let (_, ctx) = inner
                .execs
                .remove(&proc_id)
                .ok_or_else(|| TransportError::Desync(format!("exit code for {proc_id}")))?;
            tracing::debug!(%proc_id, ?status, "process finished");
            ctx.handler.finished(status).await;
        }
        ControlMessage::Bound {
            sock_id,
            host,
            port,
        } => {
            let handler = inner
                .sockets
                .get(&sock_id)
                .map(|entry| Arc::clone(&entry.handler))
                .ok_or_else(|| TransportError::Desync(format!("bound for {sock_id}")))?;
            // Two armed acceptances: the second connection can land while
            // the first is still being handed to the caller.
            arm_accept(inner, sock_id, Arc::clone(&handler)).await?;
            arm_accept(inner, sock_id, Arc::clone(&handler)).await?;
            handler.bound(host, port).await;
        }
        ControlMessage::Accepted {
            cmd_id,
            remote_host,
            remote_port,
        } => {
            let (_, mut ctx) = inner
                .accepts
                .remove(&cmd_id)
                .ok_or_else(|| TransportError::Desync(format!("accepted for {cmd_id}")))?;
            // Keep exactly one acceptance outstanding while the socket
            // context lives.
            if inner.sockets.contains_key(&ctx.sock_id) {
                arm_accept(inner, ctx.sock_id, Arc::clone(&ctx.handler)).await?;
            }
            match ctx.io.take() {
                Some((incoming, outgoing)) => {
                    ctx.handler
                        .accepted(remote_host, remote_port, incoming, outgoing)
                        .await;
                }
                None => tracing::warn!(%cmd_id, "accepted context had no channels"),
            }
        }
        ControlMessage::FilePushResponse {
            file_id,
            path,
            status,
        } => match status {
            PushStatus::Ready => {
                let (handler, content) = {
                    let mut entry = inner
                        .files
                        .get_mut(&file_id)
                        .ok_or_else(|| TransportError::Desync(format!("push reply for {file_id}")))?;
                    (Arc::clone(&entry.handler), entry.content.take())
                };
                match content {
                    Some(content) => handler.accepted(content).await,
                    None => tracing::warn!(%file_id, "duplicate ready reply, ignoring"),
                }
            }
            PushStatus::Done { size } => {
                let (_, ctx) = inner
                    .files
                    .remove(&file_id)
                    .ok_or_else(|| TransportError::Desync(format!("push reply for {file_id}")))?;
                tracing::debug!(%file_id, %path, size, "file push confirmed");
                // A cache hit never handed the content channel out; the
                // drop here closes it unused.
                drop(ctx.content);
                ctx.handler.confirmed(path, size).await;
            }
            PushStatus::Failed { error } => {
                let (_, ctx) = inner
                    .files
                    .remove(&file_id)
                    .ok_or_else(|| TransportError::Desync(format!("push reply for {file_id}")))?;
                tracing::warn!(%file_id, %path, %error, "file push failed");
                drop(ctx.content);
                ctx.handler.failed(path, error).await;
            }
        },
        other => {
            return Err(TransportError::Desync(format!(
                "request message on the reply channel: {other:?}"
            )));
        }
    }
    Ok(())
}

/// Register a fresh channel pair and arm one acceptance for `sock_id`.
async fn arm_accept(
    inner: &Arc<ClientInner>,
    sock_id: i64,
    handler: Arc<dyn SocketHandler>,
) -> Result<(), TransportError> {
    let mux = &inner.mux;
    let cmd_id = mux.next_id(IdPool::Accept);
    let in_id = mux.next_id(IdPool::Data);
    let out_id = mux.next_id(IdPool::Data);

    let outgoing = mux
        .open_to_wire(in_id)
        .map_err(|e| TransportError::Desync(e.to_string()))?;
    let incoming = mux
        .open_from_wire(out_id)
        .map_err(|e| TransportError::Desync(e.to_string()))?;

    inner.accepts.insert(
        cmd_id,
        AcceptContext {
            sock_id,
            handler,
            io: Some((incoming, outgoing)),
        },
    );

    tracing::trace!(%sock_id, %cmd_id, "arming accept");
    let sent = inner
        .send(ControlMessage::Accept {
            sock_id,
            cmd_id,
            in_id,
            out_id,
        })
        .await;
    if let Err(e) = sent {
        inner.accepts.remove(&cmd_id);
        return Err(e);
    }
    Ok(())
}
