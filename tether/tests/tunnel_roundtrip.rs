//! End-to-end tests: a session client and an executor joined by an
//! in-memory duplex pipe, exercising the full command set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use tether::{
    ChannelReader, ChannelWriter, ExecHandler, Executor, ExitStatus, FilePushHandler, Remote,
    RemoteError, SessionClient, SocketHandler, Transport, TransportConfig, TunneledRemote,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A connected issuer/executor pair over an in-memory pipe.
async fn connected_pair() -> SessionClient {
    init_tracing();
    let (near, far) = tokio::io::duplex(16 * 1024);
    let config = TransportConfig::new().with_connect_timeout(Duration::from_secs(5));
    let (issuer, executor) = tokio::join!(
        Transport::connect(near, config.clone()),
        Transport::connect(far, config),
    );
    let client = SessionClient::new(issuer.unwrap()).unwrap();
    tokio::spawn(Executor::run(executor.unwrap()));
    client
}

enum ExecEvent {
    Started {
        stdin: ChannelWriter,
        stdout: ChannelReader,
        stderr: ChannelReader,
    },
    Finished(ExitStatus),
}

struct RecordingExec {
    events: mpsc::UnboundedSender<ExecEvent>,
}

#[async_trait]
impl ExecHandler for RecordingExec {
    async fn started(&self, stdin: ChannelWriter, stdout: ChannelReader, stderr: ChannelReader) {
        let _ = self.events.send(ExecEvent::Started {
            stdin,
            stdout,
            stderr,
        });
    }

    async fn finished(&self, status: ExitStatus) {
        let _ = self.events.send(ExecEvent::Finished(status));
    }
}

fn exec_recorder() -> (Arc<RecordingExec>, mpsc::UnboundedReceiver<ExecEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingExec { events: tx }), rx)
}

#[tokio::test]
async fn echo_process_yields_started_output_and_one_exit() {
    let client = connected_pair().await;
    let (handler, mut events) = exec_recorder();

    client
        .exec(".", vec!["echo".into(), "hi".into()], vec![], handler)
        .await
        .unwrap();

    let ExecEvent::Started { stdout, .. } = events.recv().await.unwrap() else {
        panic!("first event must be started");
    };
    assert_eq!(stdout.read_to_end().await, b"hi\n");

    let ExecEvent::Finished(status) = events.recv().await.unwrap() else {
        panic!("second event must be finished");
    };
    assert_eq!(status, ExitStatus::Exited(0));

    // The context is gone: nothing further may arrive for this proc id.
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn exec_reaches_the_requested_directory_and_environment() {
    let client = connected_pair().await;
    let (handler, mut events) = exec_recorder();
    let dir = tempfile::tempdir().unwrap();

    client
        .exec(
            dir.path().to_str().unwrap(),
            vec!["sh".into(), "-c".into(), "pwd && printf %s \"$GREETING\"".into()],
            vec![("GREETING".into(), Some("salut".into()))],
            handler,
        )
        .await
        .unwrap();

    let ExecEvent::Started { stdout, .. } = events.recv().await.unwrap() else {
        panic!("first event must be started");
    };
    let output = String::from_utf8(stdout.read_to_end().await).unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    assert_eq!(output, format!("{}\nsalut", canonical.display()));

    let ExecEvent::Finished(status) = events.recv().await.unwrap() else {
        panic!("second event must be finished");
    };
    assert_eq!(status, ExitStatus::Exited(0));
}

#[tokio::test]
async fn unspawnable_command_reports_the_spawn_failure_status() {
    let client = connected_pair().await;
    let (handler, mut events) = exec_recorder();

    client
        .exec(
            ".",
            vec!["/definitely/not/a/real/binary".into()],
            vec![],
            handler,
        )
        .await
        .unwrap();

    // No started call: the one and only event is the failure status.
    let ExecEvent::Finished(status) = events.recv().await.unwrap() else {
        panic!("a process that never ran must not report started");
    };
    assert_eq!(status, ExitStatus::SpawnFailed);
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn kill_terminates_a_long_running_process() {
    let client = connected_pair().await;
    let (handler, mut events) = exec_recorder();

    let proc_id = client
        .exec(".", vec!["sleep".into(), "30".into()], vec![], handler)
        .await
        .unwrap();

    let ExecEvent::Started { .. } = events.recv().await.unwrap() else {
        panic!("first event must be started");
    };

    client.kill(proc_id).await.unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("killed process must still report an exit");
    let ExecEvent::Finished(status) = finished.unwrap() else {
        panic!("expected finished");
    };
    assert!(matches!(status, ExitStatus::Exited(code) if code != 0));
}

#[tokio::test]
async fn kill_without_a_live_context_is_a_no_op() {
    let client = connected_pair().await;
    client.kill(123_456).await.unwrap();
}

enum PushEvent {
    Accepted(ChannelWriter),
    Confirmed { path: String, size: i64 },
    Failed { error: String },
}

struct RecordingPush {
    events: mpsc::UnboundedSender<PushEvent>,
}

#[async_trait]
impl FilePushHandler for RecordingPush {
    async fn accepted(&self, content: ChannelWriter) {
        let _ = self.events.send(PushEvent::Accepted(content));
    }

    async fn confirmed(&self, path: String, size: i64) {
        let _ = self.events.send(PushEvent::Confirmed { path, size });
    }

    async fn failed(&self, _path: String, error: String) {
        let _ = self.events.send(PushEvent::Failed { error });
    }
}

#[tokio::test]
async fn pushing_a_new_file_streams_and_confirms_its_size() {
    let client = connected_pair().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cache").join("blob.bin");
    let (tx, mut events) = mpsc::unbounded_channel();

    client
        .push_file(
            target.to_str().unwrap(),
            Arc::new(RecordingPush { events: tx }),
        )
        .await
        .unwrap();

    let PushEvent::Accepted(content) = events.recv().await.unwrap() else {
        panic!("an absent file must be accepted for transfer");
    };
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    content.write(&payload).await.unwrap();
    content.close();

    let PushEvent::Confirmed { path, size } = events.recv().await.unwrap() else {
        panic!("expected confirmation");
    };
    assert_eq!(path, target.to_str().unwrap());
    assert_eq!(size, payload.len() as i64);
    assert_eq!(std::fs::read(&target).unwrap(), payload);
}

#[tokio::test]
async fn pushing_an_existing_file_short_circuits_without_transfer() {
    let client = connected_pair().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("already-there.bin");
    std::fs::write(&target, b"cached content").unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();

    client
        .push_file(
            target.to_str().unwrap(),
            Arc::new(RecordingPush { events: tx }),
        )
        .await
        .unwrap();

    // Straight to confirmation, zero accepted calls.
    match events.recv().await.unwrap() {
        PushEvent::Confirmed { size, .. } => assert_eq!(size, b"cached content".len() as i64),
        PushEvent::Accepted(_) => panic!("cache hit must not request the content"),
        PushEvent::Failed { error } => panic!("unexpected failure: {error}"),
    }
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn pushing_to_an_unwritable_target_reports_the_error_string() {
    let client = connected_pair().await;
    let (tx, mut events) = mpsc::unbounded_channel();

    // The parent of this target is a file, so the push cannot stage.
    let dir = tempfile::tempdir().unwrap();
    let obstruction = dir.path().join("not-a-dir");
    std::fs::write(&obstruction, b"flat").unwrap();
    let target = obstruction.join("blob.bin");

    client
        .push_file(
            target.to_str().unwrap(),
            Arc::new(RecordingPush { events: tx }),
        )
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        PushEvent::Failed { error } => assert!(!error.is_empty()),
        PushEvent::Confirmed { .. } => panic!("push into a file's shadow must fail"),
        PushEvent::Accepted(_) => panic!("staging must fail before the transfer begins"),
    }
}

enum SocketEvent {
    Bound {
        host: String,
        port: i32,
    },
    Accepted {
        incoming: ChannelReader,
        outgoing: ChannelWriter,
    },
}

struct RecordingSocket {
    events: mpsc::UnboundedSender<SocketEvent>,
}

#[async_trait]
impl SocketHandler for RecordingSocket {
    async fn bound(&self, host: String, port: i32) {
        let _ = self.events.send(SocketEvent::Bound { host, port });
    }

    async fn accepted(
        &self,
        _remote_host: String,
        _remote_port: i32,
        incoming: ChannelReader,
        outgoing: ChannelWriter,
    ) {
        let _ = self.events.send(SocketEvent::Accepted { incoming, outgoing });
    }
}

#[tokio::test]
async fn two_sequential_connections_get_isolated_channel_pairs() {
    let client = connected_pair().await;
    let (tx, mut events) = mpsc::unbounded_channel();

    client
        .new_socket(Arc::new(RecordingSocket { events: tx }))
        .await
        .unwrap();

    let SocketEvent::Bound { host, port } = events.recv().await.unwrap() else {
        panic!("first event must be bound");
    };
    assert_eq!(host, "127.0.0.1");

    for greeting in ["alpha", "bravo"] {
        let mut conn = tokio::net::TcpStream::connect((host.as_str(), port as u16))
            .await
            .unwrap();
        conn.write_all(greeting.as_bytes()).await.unwrap();
        conn.shutdown().await.unwrap();

        let SocketEvent::Accepted { incoming, outgoing } = events.recv().await.unwrap() else {
            panic!("expected an accepted connection");
        };

        // Bytes from this connection only.
        assert_eq!(incoming.read_to_end().await, greeting.as_bytes());

        // And the reply goes back out through the proxied pair.
        let reply = format!("ack-{greeting}");
        outgoing.write(reply.as_bytes()).await.unwrap();
        outgoing.close();
        let mut echoed = Vec::new();
        conn.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, reply.as_bytes());
    }
}

#[tokio::test]
async fn a_dead_connection_goes_silent_instead_of_failing_pending_work() {
    let client = connected_pair().await;
    let (handler, mut events) = exec_recorder();

    client
        .exec(".", vec!["sleep".into(), "30".into()], vec![], handler)
        .await
        .unwrap();
    let ExecEvent::Started { .. } = events.recv().await.unwrap() else {
        panic!("first event must be started");
    };

    client.terminate().await;
    assert!(client.closed().is_cancelled());

    // The pending context is not failed: no further callbacks, ever.
    let silence = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(silence.is_err(), "shutdown must not synthesize callbacks");
}

#[tokio::test]
async fn remote_contract_covers_cache_process_and_socket() {
    let client = connected_pair().await;
    let dir = tempfile::tempdir().unwrap();
    let remote = TunneledRemote::new(client, dir.path().to_str().unwrap());

    // First push transfers, second push is a cache hit on the same path.
    let path = remote
        .cache_file("blob-a", Bytes::from_static(b"hello cache"))
        .await
        .unwrap();
    assert!(path.ends_with("/blob-a"));
    assert_eq!(std::fs::read(&path).unwrap(), b"hello cache");
    let again = remote
        .cache_file("blob-a", Bytes::from_static(b"ignored"))
        .await
        .unwrap();
    assert_eq!(again, path);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello cache");

    // A process with live stdio.
    let mut process = remote
        .start_process(".", vec!["cat".into()], vec![])
        .await
        .unwrap();
    let stdin = process.take_stdin().unwrap();
    let stdout = process.take_stdout().unwrap();
    stdin.write(b"ping").await.unwrap();
    stdin.close();
    assert_eq!(stdout.read_to_end().await, b"ping");
    assert_eq!(process.wait().await.unwrap(), ExitStatus::Exited(0));

    // Spawn failures surface as a typed error.
    let err = remote
        .start_process(".", vec!["/no/such/bin".into()], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::SpawnFailed));

    // A proxied socket connection.
    let mut socket = remote.open_socket().await.unwrap();
    let mut conn =
        tokio::net::TcpStream::connect((socket.host().to_string(), socket.port() as u16))
            .await
            .unwrap();
    conn.write_all(b"knock").await.unwrap();
    conn.shutdown().await.unwrap();
    let accepted = socket.next_connection().await.unwrap();
    assert_eq!(accepted.incoming.read_to_end().await, b"knock");
    socket.destroy();

    remote.terminate().await;
}
