//! Binary control protocol carried on the reserved channels.
//!
//! Every command is a 32-bit tag followed by its fields in declaration
//! order: 64-bit signed ids, 32-bit ports and exit codes, strings as a u16
//! length prefix plus UTF-8 bytes, string arrays as a u16 count plus that
//! many strings, and environment maps as a u16 count of (name, present
//! flag, value-if-present) triples. All integers are big-endian.
//!
//! The wire keeps two sentinel encodings, `i32::MIN` for "failed to
//! spawn" and a negative size for the file-push "ready" reply, but they
//! exist only here: the rest of the crate sees [`ExitStatus`] and
//! [`PushStatus`].

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::mux::ChannelReader;

const TAG_EXEC: i32 = 1;
const TAG_STARTED: i32 = 2;
const TAG_KILL: i32 = 3;
const TAG_EXIT_CODE: i32 = 4;
const TAG_BIND: i32 = 5;
const TAG_BOUND: i32 = 6;
const TAG_ACCEPT: i32 = 7;
const TAG_ACCEPTED: i32 = 8;
const TAG_FILE_PUSH: i32 = 9;
const TAG_FILE_PUSH_RESPONSE: i32 = 10;

const SPAWN_FAILED_CODE: i32 = i32::MIN;
const PUSH_PENDING_SIZE: i64 = -1;

/// How a remote process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process ran and exited with this code.
    Exited(i32),
    /// The process could never be started.
    SpawnFailed,
}

impl ExitStatus {
    fn to_wire(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::SpawnFailed => SPAWN_FAILED_CODE,
        }
    }

    fn from_wire(code: i32) -> Self {
        if code == SPAWN_FAILED_CODE {
            Self::SpawnFailed
        } else {
            Self::Exited(code)
        }
    }
}

/// State reported by a file-push response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    /// The executor is ready to receive the file's bytes.
    Ready,
    /// The file is in place with this many bytes.
    Done { size: i64 },
    /// The push failed; the transfer is over.
    Failed { error: String },
}

/// Environment delta applied to a spawned process: a present value sets
/// the variable, an absent one unsets it.
pub type EnvEntry = (String, Option<String>);

/// One control command or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Exec {
        proc_id: i64,
        stdin_id: i64,
        stdout_id: i64,
        stderr_id: i64,
        work_dir: String,
        command: Vec<String>,
        env: Vec<EnvEntry>,
    },
    Started {
        proc_id: i64,
    },
    Kill {
        proc_id: i64,
    },
    ExitCode {
        proc_id: i64,
        status: ExitStatus,
    },
    Bind {
        sock_id: i64,
    },
    Bound {
        sock_id: i64,
        host: String,
        port: i32,
    },
    Accept {
        sock_id: i64,
        cmd_id: i64,
        in_id: i64,
        out_id: i64,
    },
    Accepted {
        cmd_id: i64,
        remote_host: String,
        remote_port: i32,
    },
    FilePush {
        file_id: i64,
        path: String,
        in_id: i64,
    },
    FilePushResponse {
        file_id: i64,
        path: String,
        status: PushStatus,
    },
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong);
    }
    dst.put_u16(bytes.len() as u16);
    dst.put_slice(bytes);
    Ok(())
}

impl ControlMessage {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Self::Exec {
                proc_id,
                stdin_id,
                stdout_id,
                stderr_id,
                work_dir,
                command,
                env,
            } => {
                dst.put_i32(TAG_EXEC);
                dst.put_i64(*proc_id);
                dst.put_i64(*stdin_id);
                dst.put_i64(*stdout_id);
                dst.put_i64(*stderr_id);
                put_string(dst, work_dir)?;
                if command.len() > u16::MAX as usize {
                    return Err(ProtocolError::FieldTooLong);
                }
                dst.put_u16(command.len() as u16);
                for arg in command {
                    put_string(dst, arg)?;
                }
                if env.len() > u16::MAX as usize {
                    return Err(ProtocolError::FieldTooLong);
                }
                dst.put_u16(env.len() as u16);
                for (name, value) in env {
                    put_string(dst, name)?;
                    match value {
                        Some(value) => {
                            dst.put_u8(1);
                            put_string(dst, value)?;
                        }
                        None => dst.put_u8(0),
                    }
                }
            }
            Self::Started { proc_id } => {
                dst.put_i32(TAG_STARTED);
                dst.put_i64(*proc_id);
            }
            Self::Kill { proc_id } => {
                dst.put_i32(TAG_KILL);
                dst.put_i64(*proc_id);
            }
            Self::ExitCode { proc_id, status } => {
                dst.put_i32(TAG_EXIT_CODE);
                dst.put_i64(*proc_id);
                dst.put_i32(status.to_wire());
            }
            Self::Bind { sock_id } => {
                dst.put_i32(TAG_BIND);
                dst.put_i64(*sock_id);
            }
            Self::Bound {
                sock_id,
                host,
                port,
            } => {
                dst.put_i32(TAG_BOUND);
                dst.put_i64(*sock_id);
                put_string(dst, host)?;
                dst.put_i32(*port);
            }
            Self::Accept {
                sock_id,
                cmd_id,
                in_id,
                out_id,
            } => {
                dst.put_i32(TAG_ACCEPT);
                dst.put_i64(*sock_id);
                dst.put_i64(*cmd_id);
                dst.put_i64(*in_id);
                dst.put_i64(*out_id);
            }
            Self::Accepted {
                cmd_id,
                remote_host,
                remote_port,
            } => {
                dst.put_i32(TAG_ACCEPTED);
                dst.put_i64(*cmd_id);
                put_string(dst, remote_host)?;
                dst.put_i32(*remote_port);
            }
            Self::FilePush {
                file_id,
                path,
                in_id,
            } => {
                dst.put_i32(TAG_FILE_PUSH);
                dst.put_i64(*file_id);
                put_string(dst, path)?;
                dst.put_i64(*in_id);
            }
            Self::FilePushResponse {
                file_id,
                path,
                status,
            } => {
                dst.put_i32(TAG_FILE_PUSH_RESPONSE);
                dst.put_i64(*file_id);
                put_string(dst, path)?;
                let (size, error) = match status {
                    PushStatus::Ready => (PUSH_PENDING_SIZE, ""),
                    PushStatus::Done { size } => (*size, ""),
                    PushStatus::Failed { error } => (PUSH_PENDING_SIZE, error.as_str()),
                };
                dst.put_i64(size);
                put_string(dst, error)?;
            }
        }
        Ok(())
    }

    /// Decode one message from the front of `src`, returning it and the
    /// number of bytes consumed. `Truncated` means more bytes are needed.
    pub fn decode(src: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut cursor = Cursor::new(src);
        let tag = cursor.i32()?;
        let message = match tag {
            TAG_EXEC => {
                let proc_id = cursor.i64()?;
                let stdin_id = cursor.i64()?;
                let stdout_id = cursor.i64()?;
                let stderr_id = cursor.i64()?;
                let work_dir = cursor.string()?;
                let argc = cursor.u16()? as usize;
                let mut command = Vec::with_capacity(argc);
                for _ in 0..argc {
                    command.push(cursor.string()?);
                }
                let envc = cursor.u16()? as usize;
                let mut env = Vec::with_capacity(envc);
                for _ in 0..envc {
                    let name = cursor.string()?;
                    let value = if cursor.u8()? != 0 {
                        Some(cursor.string()?)
                    } else {
                        None
                    };
                    env.push((name, value));
                }
                Self::Exec {
                    proc_id,
                    stdin_id,
                    stdout_id,
                    stderr_id,
                    work_dir,
                    command,
                    env,
                }
            }
            TAG_STARTED => Self::Started {
                proc_id: cursor.i64()?,
            },
            TAG_KILL => Self::Kill {
                proc_id: cursor.i64()?,
            },
            TAG_EXIT_CODE => Self::ExitCode {
                proc_id: cursor.i64()?,
                status: ExitStatus::from_wire(cursor.i32()?),
            },
            TAG_BIND => Self::Bind {
                sock_id: cursor.i64()?,
            },
            TAG_BOUND => Self::Bound {
                sock_id: cursor.i64()?,
                host: cursor.string()?,
                port: cursor.i32()?,
            },
            TAG_ACCEPT => Self::Accept {
                sock_id: cursor.i64()?,
                cmd_id: cursor.i64()?,
                in_id: cursor.i64()?,
                out_id: cursor.i64()?,
            },
            TAG_ACCEPTED => Self::Accepted {
                cmd_id: cursor.i64()?,
                remote_host: cursor.string()?,
                remote_port: cursor.i32()?,
            },
            TAG_FILE_PUSH => Self::FilePush {
                file_id: cursor.i64()?,
                path: cursor.string()?,
                in_id: cursor.i64()?,
            },
            TAG_FILE_PUSH_RESPONSE => {
                let file_id = cursor.i64()?;
                let path = cursor.string()?;
                let size = cursor.i64()?;
                let error = cursor.string()?;
                let status = if !error.is_empty() {
                    PushStatus::Failed { error }
                } else if size < 0 {
                    PushStatus::Ready
                } else {
                    PushStatus::Done { size }
                };
                Self::FilePushResponse {
                    file_id,
                    path,
                    status,
                }
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok((message, cursor.pos))
    }
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.src.len() - self.pos < n {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Incremental message reader over one control channel.
///
/// The encoding is self-delimiting, so the stream accumulates channel
/// chunks and peels complete messages off the front.
pub(crate) struct ControlStream {
    reader: ChannelReader,
    acc: BytesMut,
}

impl ControlStream {
    pub(crate) fn new(reader: ChannelReader) -> Self {
        Self {
            reader,
            acc: BytesMut::new(),
        }
    }

    /// Next message, or `None` once the channel ends cleanly between
    /// messages. Ending mid-message is an error.
    pub(crate) async fn next(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        loop {
            match ControlMessage::decode(&self.acc) {
                Ok((message, used)) => {
                    let _ = self.acc.split_to(used);
                    return Ok(Some(message));
                }
                Err(ProtocolError::Truncated) => {}
                Err(e) => return Err(e),
            }
            match self.reader.next_chunk(4096).await {
                Some(chunk) => self.acc.extend_from_slice(&chunk),
                None if self.acc.is_empty() => return Ok(None),
                None => return Err(ProtocolError::Truncated),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(message: &ControlMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        message.encode(&mut buf).unwrap();
        buf
    }

    fn roundtrip(message: ControlMessage) {
        let buf = encoded(&message);
        let (decoded, used) = ControlMessage::decode(&buf).unwrap();
        assert_eq!(used, buf.len(), "decode must consume the whole message");
        assert_eq!(decoded, message);
    }

    #[test]
    fn every_command_round_trips() {
        roundtrip(ControlMessage::Exec {
            proc_id: 2,
            stdin_id: 1,
            stdout_id: 6,
            stderr_id: 11,
            work_dir: "/var/task".into(),
            command: vec!["sh".into(), "-c".into(), "echo hi".into()],
            env: vec![
                ("PATH".into(), Some("/usr/bin".into())),
                ("TMPDIR".into(), None),
            ],
        });
        roundtrip(ControlMessage::Started { proc_id: 2 });
        roundtrip(ControlMessage::Kill { proc_id: 2 });
        roundtrip(ControlMessage::ExitCode {
            proc_id: 2,
            status: ExitStatus::Exited(0),
        });
        roundtrip(ControlMessage::Bind { sock_id: 3 });
        roundtrip(ControlMessage::Bound {
            sock_id: 3,
            host: "127.0.0.1".into(),
            port: 43999,
        });
        roundtrip(ControlMessage::Accept {
            sock_id: 3,
            cmd_id: 4,
            in_id: 16,
            out_id: 21,
        });
        roundtrip(ControlMessage::Accepted {
            cmd_id: 4,
            remote_host: "127.0.0.1".into(),
            remote_port: 55012,
        });
        roundtrip(ControlMessage::FilePush {
            file_id: 5,
            path: "/cache/blob".into(),
            in_id: 26,
        });
        roundtrip(ControlMessage::FilePushResponse {
            file_id: 5,
            path: "/cache/blob".into(),
            status: PushStatus::Done { size: 8192 },
        });
    }

    #[test]
    fn spawn_failure_encodes_as_the_minimum_exit_code() {
        let buf = encoded(&ControlMessage::ExitCode {
            proc_id: 7,
            status: ExitStatus::SpawnFailed,
        });
        // tag, proc id, then the code.
        assert_eq!(&buf[12..16], i32::MIN.to_be_bytes());

        let (decoded, _) = ControlMessage::decode(&buf).unwrap();
        assert_eq!(
            decoded,
            ControlMessage::ExitCode {
                proc_id: 7,
                status: ExitStatus::SpawnFailed,
            }
        );
    }

    #[test]
    fn ready_reply_encodes_as_negative_size_and_empty_error() {
        let message = ControlMessage::FilePushResponse {
            file_id: 9,
            path: "/cache/x".into(),
            status: PushStatus::Ready,
        };
        let buf = encoded(&message);
        // tag(4) + id(8) + string(2 + 8) + size(8): size sits at 22..30.
        assert_eq!(&buf[22..30], (-1i64).to_be_bytes());
        assert_eq!(&buf[30..32], 0u16.to_be_bytes(), "error must be empty");

        let (decoded, _) = ControlMessage::decode(&buf).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn failed_reply_round_trips_its_message() {
        roundtrip(ControlMessage::FilePushResponse {
            file_id: 9,
            path: "/cache/x".into(),
            status: PushStatus::Failed {
                error: "disk full".into(),
            },
        });
    }

    #[test]
    fn absent_env_value_is_a_zero_flag_with_no_string() {
        let with_none = encoded(&ControlMessage::Exec {
            proc_id: 1,
            stdin_id: 2,
            stdout_id: 3,
            stderr_id: 4,
            work_dir: ".".into(),
            command: vec!["true".into()],
            env: vec![("UNSET_ME".into(), None)],
        });
        let with_empty = encoded(&ControlMessage::Exec {
            proc_id: 1,
            stdin_id: 2,
            stdout_id: 3,
            stderr_id: 4,
            work_dir: ".".into(),
            command: vec!["true".into()],
            env: vec![("UNSET_ME".into(), Some(String::new()))],
        });
        // Unset is flag 0 and nothing else; empty-string is flag 1 plus a
        // zero-length string, so it must be exactly two bytes longer.
        assert_eq!(with_empty.len(), with_none.len() + 2);
    }

    #[test]
    fn truncation_at_any_point_asks_for_more() {
        let buf = encoded(&ControlMessage::Bound {
            sock_id: 3,
            host: "localhost".into(),
            port: 8080,
        });
        for cut in 0..buf.len() {
            assert!(
                matches!(
                    ControlMessage::decode(&buf[..cut]),
                    Err(ProtocolError::Truncated)
                ),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(99);
        buf.put_i64(1);
        assert!(matches!(
            ControlMessage::decode(&buf),
            Err(ProtocolError::UnknownTag(99))
        ));
    }

    #[test]
    fn back_to_back_messages_decode_from_one_buffer() {
        let mut buf = encoded(&ControlMessage::Started { proc_id: 12 });
        buf.extend_from_slice(&encoded(&ControlMessage::Kill { proc_id: 17 }));

        let (first, used) = ControlMessage::decode(&buf).unwrap();
        assert_eq!(first, ControlMessage::Started { proc_id: 12 });
        let (second, _) = ControlMessage::decode(&buf[used..]).unwrap();
        assert_eq!(second, ControlMessage::Kill { proc_id: 17 });
    }
}
