//! Executing role: performs the operations the issuing side requests.
//!
//! One task reads commands off the control-request channel; each Exec,
//! Accept, and FilePush runs in its own task so a slow operation never
//! holds up the command loop. Kill and Bind are handled inline.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::mux::{
    CONTROL_REPLY_ID, CONTROL_REQUEST_ID, ChannelReader, ChannelWriter, MuxShared, Transport,
};
use crate::protocol::{ControlMessage, ControlStream, EnvEntry, ExitStatus, PushStatus};

const IO_CHUNK: usize = 8192;

struct ExecutorShared {
    mux: Arc<MuxShared>,
    /// Whole replies are written under this lock so concurrent operation
    /// tasks cannot interleave their bytes on the reply channel.
    reply: tokio::sync::Mutex<ChannelWriter>,
    /// Live children by proc id; cancelling an entry kills the child.
    processes: DashMap<i64, CancellationToken>,
    listeners: DashMap<i64, Arc<TcpListener>>,
}

impl ExecutorShared {
    async fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        message.encode(&mut buf)?;
        let writer = self.reply.lock().await;
        writer
            .write(&buf)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// The command-executing side of one connection.
pub struct Executor;

impl Executor {
    /// Serve commands over `transport` until the pipe ends or a fatal
    /// protocol error occurs. Live children are killed on the way out.
    pub async fn run(transport: Transport) -> Result<(), TransportError> {
        let mux = transport.shared();
        let requests = mux
            .open_from_wire(CONTROL_REQUEST_ID)
            .map_err(|e| TransportError::Desync(e.to_string()))?;
        let reply = mux
            .open_to_wire(CONTROL_REPLY_ID)
            .map_err(|e| TransportError::Desync(e.to_string()))?;

        let shared = Arc::new(ExecutorShared {
            mux: Arc::clone(&mux),
            reply: tokio::sync::Mutex::new(reply),
            processes: DashMap::new(),
            listeners: DashMap::new(),
        });

        // The control channels exist; frames may flow now.
        transport.start();

        let mut commands = ControlStream::new(requests);
        let closed = transport.closed();
        let result = loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break Ok(()),
                next = commands.next() => next,
            };
            match next {
                Ok(Some(message)) => {
                    if let Err(e) = dispatch(&shared, message) {
                        tracing::error!(error = %e, "fatal command error");
                        break Err(e);
                    }
                }
                Ok(None) => {
                    tracing::debug!("control request channel ended");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "undecodable control request");
                    break Err(e.into());
                }
            }
        };

        // Never leak children past the connection.
        for entry in shared.processes.iter() {
            entry.value().cancel();
        }
        transport.terminate().await;
        result
    }
}

fn dispatch(shared: &Arc<ExecutorShared>, message: ControlMessage) -> Result<(), TransportError> {
    match message {
        ControlMessage::Exec {
            proc_id,
            stdin_id,
            stdout_id,
            stderr_id,
            work_dir,
            command,
            env,
        } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                handle_exec(
                    shared, proc_id, stdin_id, stdout_id, stderr_id, work_dir, command, env,
                )
                .await;
            });
            Ok(())
        }
        ControlMessage::Kill { proc_id } => {
            // Best effort: an already-exited process is a no-op.
            match shared.processes.get(&proc_id) {
                Some(entry) => {
                    tracing::debug!(%proc_id, "kill requested");
                    entry.value().cancel();
                }
                None => tracing::debug!(%proc_id, "kill for unknown process, ignoring"),
            }
            Ok(())
        }
        ControlMessage::Bind { sock_id } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { handle_bind(shared, sock_id).await });
            Ok(())
        }
        ControlMessage::Accept {
            sock_id,
            cmd_id,
            in_id,
            out_id,
        } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { handle_accept(shared, sock_id, cmd_id, in_id, out_id).await });
            Ok(())
        }
        ControlMessage::FilePush {
            file_id,
            path,
            in_id,
        } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move { handle_file_push(shared, file_id, path, in_id).await });
            Ok(())
        }
        other => Err(TransportError::Desync(format!(
            "response message on the request channel: {other:?}"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_exec(
    shared: Arc<ExecutorShared>,
    proc_id: i64,
    stdin_id: i64,
    stdout_id: i64,
    stderr_id: i64,
    work_dir: String,
    command: Vec<String>,
    env: Vec<EnvEntry>,
) {
    let stdin = match shared.mux.open_from_wire(stdin_id) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::error!(%proc_id, error = %e, "stdin channel registration failed");
            return;
        }
    };
    let stdout = match shared.mux.open_to_wire(stdout_id) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(%proc_id, error = %e, "stdout channel registration failed");
            return;
        }
    };
    let stderr = match shared.mux.open_to_wire(stderr_id) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(%proc_id, error = %e, "stderr channel registration failed");
            return;
        }
    };

    let spawned = if command.is_empty() {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command line",
        ))
    } else {
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &env {
            match value {
                Some(value) => cmd.env(name, value),
                None => cmd.env_remove(name),
            };
        }
        cmd.spawn()
    };

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(%proc_id, command = ?command, error = %e, "spawn failed");
            let _ = stderr.write(e.to_string().as_bytes()).await;
            stdout.close();
            stderr.close();
            drain_channel(stdin);
            if let Err(e) = shared
                .send(ControlMessage::ExitCode {
                    proc_id,
                    status: ExitStatus::SpawnFailed,
                })
                .await
            {
                tracing::warn!(%proc_id, error = %e, "could not report spawn failure");
            }
            return;
        }
    };

    tracing::debug!(%proc_id, command = ?command, "process started");
    let kill = CancellationToken::new();
    shared.processes.insert(proc_id, kill.clone());
    if let Err(e) = shared.send(ControlMessage::Started { proc_id }).await {
        tracing::warn!(%proc_id, error = %e, "could not report process start");
    }

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let stdin_pump = tokio::spawn(async move {
        if let Some(dst) = child_stdin {
            pump_channel_into(stdin, dst).await;
        }
    });
    let stdout_pump = tokio::spawn(async move {
        if let Some(src) = child_stdout {
            pump_into_channel(src, stdout).await;
        }
    });
    let stderr_pump = tokio::spawn(async move {
        if let Some(src) = child_stderr {
            pump_into_channel(src, stderr).await;
        }
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            tracing::debug!(%proc_id, "terminating process");
            let _ = child.start_kill();
            child.wait().await
        }
    };

    // Final drain: the stdio pumps end once the exited child's pipes hit
    // EOF, closing the channels behind them.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;
    stdin_pump.abort();
    shared.processes.remove(&proc_id);

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(%proc_id, error = %e, "wait on child failed");
            -1
        }
    };
    tracing::debug!(%proc_id, code, "process exited");
    if let Err(e) = shared
        .send(ControlMessage::ExitCode {
            proc_id,
            status: ExitStatus::Exited(code),
        })
        .await
    {
        tracing::warn!(%proc_id, error = %e, "could not report exit");
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn handle_bind(shared: Arc<ExecutorShared>, sock_id: i64) {
    match TcpListener::bind(("127.0.0.1", 0)).await {
        Ok(listener) => {
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::error!(%sock_id, error = %e, "bound socket has no address");
                    return;
                }
            };
            tracing::debug!(%sock_id, %addr, "listening socket bound");
            shared.listeners.insert(sock_id, Arc::new(listener));
            if let Err(e) = shared
                .send(ControlMessage::Bound {
                    sock_id,
                    host: addr.ip().to_string(),
                    port: i32::from(addr.port()),
                })
                .await
            {
                tracing::warn!(%sock_id, error = %e, "could not report bind");
            }
        }
        Err(e) => {
            // No failure variant exists on the wire; the issuer's handler
            // is simply never called again for this socket.
            tracing::error!(%sock_id, error = %e, "bind failed");
        }
    }
}

async fn handle_accept(
    shared: Arc<ExecutorShared>,
    sock_id: i64,
    cmd_id: i64,
    in_id: i64,
    out_id: i64,
) {
    let Some(listener) = shared
        .listeners
        .get(&sock_id)
        .map(|entry| Arc::clone(entry.value()))
    else {
        tracing::warn!(%sock_id, %cmd_id, "accept for unknown socket, ignoring");
        return;
    };

    let inbound = match shared.mux.open_from_wire(in_id) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::error!(%cmd_id, error = %e, "accept channel registration failed");
            return;
        }
    };
    let outbound = match shared.mux.open_to_wire(out_id) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(%cmd_id, error = %e, "accept channel registration failed");
            drain_channel(inbound);
            return;
        }
    };

    // One Accept command arms exactly one acceptance; the listener stays
    // open for future Accepts.
    let accepted = tokio::select! {
        _ = shared.mux.shutdown.cancelled() => return,
        accepted = listener.accept() => accepted,
    };
    match accepted {
        Ok((stream, peer)) => {
            tracing::debug!(%sock_id, %cmd_id, %peer, "connection accepted");
            if let Err(e) = shared
                .send(ControlMessage::Accepted {
                    cmd_id,
                    remote_host: peer.ip().to_string(),
                    remote_port: i32::from(peer.port()),
                })
                .await
            {
                tracing::warn!(%cmd_id, error = %e, "could not report accept");
                return;
            }
            let (read_half, write_half) = stream.into_split();
            tokio::spawn(pump_channel_into(inbound, write_half));
            tokio::spawn(pump_into_channel(read_half, outbound));
        }
        Err(e) => {
            tracing::error!(%sock_id, %cmd_id, error = %e, "accept failed");
            outbound.close();
            drain_channel(inbound);
        }
    }
}

async fn handle_file_push(shared: Arc<ExecutorShared>, file_id: i64, path: String, in_id: i64) {
    let target = normalize_path(Path::new(&path));

    if let Ok(meta) = tokio::fs::metadata(&target).await
        && meta.is_file()
    {
        // Cache hit: the content is already in place, no transfer needed.
        tracing::debug!(%file_id, path = %target.display(), size = meta.len(), "file already cached");
        if let Err(e) = shared
            .send(ControlMessage::FilePushResponse {
                file_id,
                path,
                status: PushStatus::Done {
                    size: meta.len() as i64,
                },
            })
            .await
        {
            tracing::warn!(%file_id, error = %e, "could not report cache hit");
        }
        return;
    }

    let inbound = match shared.mux.open_from_wire(in_id) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::error!(%file_id, error = %e, "file channel registration failed");
            return;
        }
    };

    let status = match stage_for_target(&target).await {
        Err(error) => {
            tracing::warn!(%file_id, path = %target.display(), %error, "file push failed");
            // The issuer has not been told to stream yet; it closes the
            // channel only after this reply, so consume it in the
            // background.
            drain_channel(inbound);
            PushStatus::Failed { error }
        }
        Ok((staging, file)) => {
            // The issuer starts streaming only after this.
            let ready = shared
                .send(ControlMessage::FilePushResponse {
                    file_id,
                    path: path.clone(),
                    status: PushStatus::Ready,
                })
                .await;
            if let Err(e) = ready {
                tracing::warn!(%file_id, error = %e, "could not send ready reply");
                return;
            }
            match receive_file(&inbound, staging, file, &target).await {
                Ok(size) => {
                    tracing::debug!(%file_id, path = %target.display(), size, "file cached");
                    PushStatus::Done { size }
                }
                Err(error) => {
                    tracing::warn!(%file_id, path = %target.display(), %error, "file push failed");
                    // The issuer is mid-stream and closes the channel when
                    // it has written everything; drain to the marker so the
                    // channel leaves the registry normally.
                    while inbound.next_chunk(IO_CHUNK).await.is_some() {}
                    PushStatus::Failed { error }
                }
            }
        }
    };
    if let Err(e) = shared
        .send(ControlMessage::FilePushResponse {
            file_id,
            path,
            status,
        })
        .await
    {
        tracing::warn!(%file_id, error = %e, "could not report file push result");
    }
}

/// Create the staging file next to the target so the final rename stays on
/// one filesystem.
async fn stage_for_target(
    target: &Path,
) -> Result<(tempfile::NamedTempFile, tokio::fs::File), String> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| format!("no parent directory for {}", target.display()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("creating {}: {e}", dir.display()))?;
    let staging =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| format!("creating staging file: {e}"))?;
    let writable = staging
        .reopen()
        .map_err(|e| format!("opening staging file: {e}"))?;
    Ok((staging, tokio::fs::File::from_std(writable)))
}

/// Stream the channel into the staging file and move it over the target.
async fn receive_file(
    inbound: &ChannelReader,
    staging: tempfile::NamedTempFile,
    mut file: tokio::fs::File,
    target: &Path,
) -> Result<i64, String> {
    let mut written: i64 = 0;
    while let Some(chunk) = inbound.next_chunk(IO_CHUNK).await {
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("writing staging file: {e}"))?;
        written += chunk.len() as i64;
    }
    file.flush()
        .await
        .map_err(|e| format!("flushing staging file: {e}"))?;
    drop(file);

    staging
        .persist(target)
        .map_err(|e| format!("placing {}: {}", target.display(), e.error))?;
    Ok(written)
}

/// Lexically normalize a path: strip `.` segments and resolve `..`.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Consume a channel to its end so it unregisters when the marker lands.
fn drain_channel(reader: ChannelReader) {
    tokio::spawn(async move { while reader.next_chunk(IO_CHUNK).await.is_some() {} });
}

/// Copy channel bytes into a sink until end-of-channel.
async fn pump_channel_into<W>(reader: ChannelReader, mut dst: W)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(chunk) = reader.next_chunk(IO_CHUNK).await {
        if let Err(e) = dst.write_all(&chunk).await {
            tracing::trace!(channel = reader.id(), error = %e, "sink closed mid-stream");
            return;
        }
    }
    let _ = dst.shutdown().await;
}

/// Copy source bytes into a channel until EOF, then close the channel.
async fn pump_into_channel<R>(mut src: R, writer: ChannelWriter)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; IO_CHUNK];
    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write(&buf[..n]).await.is_err() {
                    tracing::trace!(channel = writer.id(), "channel closed mid-stream");
                    break;
                }
            }
            Err(e) => {
                tracing::trace!(channel = writer.id(), error = %e, "source read failed");
                break;
            }
        }
    }
    writer.close();
}
