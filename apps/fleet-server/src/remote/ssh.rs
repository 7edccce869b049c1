use ssh2::{Channel, ExtendedData, Session};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{
    repeat_runs, split_lines, CommandOutput, LineSink, RemoteError, SshLogin, StreamOptions,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_SLICE: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 8192;

/// Disconnects the wrapped session when dropped, whatever path the caller took.
pub(super) struct SessionGuard {
    session: Session,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.session.disconnect(None, "closing", None) {
            tracing::debug!(error = %err, "ssh disconnect failed");
        }
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u128::from(u32::MAX)) as u32
}

fn session_error(err: ssh2::Error) -> RemoteError {
    RemoteError::Session(err.to_string())
}

fn io_error(err: std::io::Error, timeout: Duration) -> RemoteError {
    if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) {
        RemoteError::Timeout(timeout)
    } else {
        RemoteError::Session(err.to_string())
    }
}

pub(super) fn connect(login: &SshLogin, timeout: Duration) -> Result<SessionGuard, RemoteError> {
    let unreachable = |message: String| RemoteError::Unreachable {
        host: login.host.clone(),
        message,
    };
    let addr = (login.host.as_str(), login.port)
        .to_socket_addrs()
        .map_err(|err| unreachable(err.to_string()))?
        .next()
        .ok_or_else(|| unreachable("no address resolved".to_string()))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout.min(CONNECT_TIMEOUT))
        .map_err(|err| unreachable(err.to_string()))?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = Session::new().map_err(session_error)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_millis(timeout));
    session.handshake().map_err(|err| unreachable(err.to_string()))?;
    let guard = SessionGuard { session };

    let auth_failed = || RemoteError::Auth {
        host: login.host.clone(),
        username: login.username.clone(),
    };
    guard
        .session
        .userauth_password(&login.username, &login.password)
        .map_err(|_| auth_failed())?;
    if !guard.session.authenticated() {
        return Err(auth_failed());
    }
    Ok(guard)
}

/// Both output streams of a running command, read without blocking.
pub(super) trait OutputSource {
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn at_eof(&self) -> bool;
}

impl OutputSource for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stderr().read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Pumped {
    Finished,
    Cancelled,
}

/// Returns whether a read made progress; `WouldBlock` means nothing is buffered yet.
fn read_some(
    read: std::io::Result<usize>,
    buf: &[u8],
    timeout: Duration,
    on_bytes: &mut dyn FnMut(&[u8]),
) -> Result<bool, RemoteError> {
    match read {
        Ok(0) => Ok(false),
        Ok(n) => {
            on_bytes(&buf[..n]);
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(io_error(err, timeout)),
    }
}

/// Drains stdout and stderr alternately until EOF, so neither stream can fill its window
/// while the other is being waited on. Gives up at `deadline` or when `cancel` fires.
pub(super) fn pump(
    source: &mut dyn OutputSource,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
    on_stdout: &mut dyn FnMut(&[u8]),
    on_stderr: &mut dyn FnMut(&[u8]),
) -> Result<Pumped, RemoteError> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Ok(Pumped::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(RemoteError::Timeout(timeout));
        }
        let read = source.read_stdout(&mut buf);
        let mut progressed = read_some(read, &buf, timeout, on_stdout)?;
        let read = source.read_stderr(&mut buf);
        progressed |= read_some(read, &buf, timeout, on_stderr)?;
        if !progressed {
            if source.at_eof() {
                return Ok(Pumped::Finished);
            }
            std::thread::sleep(POLL_SLICE);
        }
    }
}

/// Splits a byte stream into lines, holding back a trailing partial line.
#[derive(Default)]
pub(super) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(super) fn feed(&mut self, bytes: &[u8], emit: &mut dyn FnMut(String)) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            emit(String::from_utf8_lossy(&line).trim_end().to_string());
        }
    }

    pub(super) fn flush(&mut self, emit: &mut dyn FnMut(String)) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            emit(String::from_utf8_lossy(&line).trim_end().to_string());
        }
    }
}

fn open_channel(guard: &SessionGuard, command: &str, merge: bool) -> Result<Channel, RemoteError> {
    guard.session.set_blocking(true);
    let mut channel = guard.session.channel_session().map_err(session_error)?;
    if merge {
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(session_error)?;
    }
    channel.exec(command).map_err(session_error)?;
    guard.session.set_blocking(false);
    Ok(channel)
}

/// A finished channel is closed politely; an abandoned one is closed without waiting,
/// and the session disconnect in `SessionGuard` tears down the rest.
fn close_channel(guard: &SessionGuard, channel: &mut Channel, finished: bool) {
    if finished {
        guard.session.set_blocking(true);
        channel.wait_close().ok();
    } else {
        channel.close().ok();
    }
}

pub(super) fn run_command(
    guard: &SessionGuard,
    command: &str,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, RemoteError> {
    let mut channel = open_channel(guard, command, false)?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let pumped = pump(
        &mut channel,
        deadline,
        timeout,
        cancel,
        &mut |bytes: &[u8]| stdout.extend_from_slice(bytes),
        &mut |bytes: &[u8]| stderr.extend_from_slice(bytes),
    );
    close_channel(guard, &mut channel, matches!(pumped, Ok(Pumped::Finished)));
    match pumped? {
        Pumped::Finished => Ok(CommandOutput {
            stdout: split_lines(&String::from_utf8_lossy(&stdout)),
            stderr: split_lines(&String::from_utf8_lossy(&stderr)),
        }),
        Pumped::Cancelled => Err(RemoteError::Timeout(timeout)),
    }
}

/// Streams one run of `command`; returns `false` when the caller cancelled mid-stream.
fn stream_once(
    guard: &SessionGuard,
    command: &str,
    timeout: Duration,
    sink: &mut LineSink,
    cancel: &CancellationToken,
) -> Result<bool, RemoteError> {
    let mut channel = open_channel(guard, command, true)?;
    let mut lines = LineBuffer::default();
    let pumped = pump(
        &mut channel,
        Instant::now() + timeout,
        timeout,
        cancel,
        &mut |bytes: &[u8]| lines.feed(bytes, &mut *sink),
        &mut |_: &[u8]| {},
    );
    let finished = matches!(pumped, Ok(Pumped::Finished));
    close_channel(guard, &mut channel, finished);
    if finished {
        lines.flush(&mut *sink);
    }
    pumped.map(|outcome| outcome == Pumped::Finished)
}

pub(super) fn stream_command(
    guard: &SessionGuard,
    command: &str,
    options: StreamOptions,
    mut sink: LineSink,
    cancel: &CancellationToken,
) -> Result<(), RemoteError> {
    repeat_runs(&options, cancel, || {
        stream_once(guard, command, options.timeout, &mut sink, cancel)
    })
}
