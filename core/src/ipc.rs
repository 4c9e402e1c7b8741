//! Authenticated, length-bounded, newline-delimited JSON framing over a
//! Unix domain socket with filesystem rendezvous.
//!
//! The rendezvous directory is private to the session (owner-only, random
//! name); the socket lives inside it under a fixed name. The child's first
//! line must be the session token, bytewise.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::warn;

use securer_protocol::ChildFrame;
use securer_protocol::MAX_FRAME_BYTES;
use securer_protocol::TOKEN_LEN;
use securer_protocol::encode_frame;
use securer_protocol::parse_child_frame;

use crate::error::Result;
use crate::error::SecurerErr;

/// Ceiling on waiting for the child to connect, and separately on reading
/// its token line.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const SOCKET_FILE_NAME: &str = "ipc.sock";

/// `sun_path` is capped around 104 bytes on some POSIX variants; leave
/// headroom for the directory suffix and filename.
const MAX_SOCKET_PATH: usize = 96;

/// The session's private rendezvous directory. Dropping it unlinks the
/// directory and everything inside, the socket file included.
pub(crate) struct Rendezvous {
    dir: TempDir,
}

impl Rendezvous {
    pub(crate) fn create(base: Option<&Path>) -> Result<Self> {
        let base_dir = match base {
            Some(dir) => dir.to_path_buf(),
            None => std::env::temp_dir(),
        };
        let mut rendezvous = Self {
            dir: make_private_dir(&base_dir)?,
        };
        // Relocate to a short base when the platform temp dir would push the
        // socket path past the sun_path limit.
        if base.is_none()
            && rendezvous.socket_path().as_os_str().len() > MAX_SOCKET_PATH
            && Path::new("/tmp").is_dir()
        {
            rendezvous = Self {
                dir: make_private_dir(Path::new("/tmp"))?,
            };
        }
        Ok(rendezvous)
    }

    pub(crate) fn dir_path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn socket_path(&self) -> PathBuf {
        self.dir.path().join(SOCKET_FILE_NAME)
    }
}

fn make_private_dir(base: &Path) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("securer_")
        .tempdir_in(base)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

/// 32 alphanumeric characters from the thread-local CSPRNG.
pub(crate) fn generate_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub(crate) struct IpcListener {
    listener: UnixListener,
}

impl IpcListener {
    pub(crate) fn bind(socket_path: &Path) -> Result<Self> {
        Ok(Self {
            listener: UnixListener::bind(socket_path)?,
        })
    }

    /// Accepts one connection and authenticates it: the first line received
    /// must equal `token` bytewise. Both the accept and the token read are
    /// bounded by [`HANDSHAKE_TIMEOUT`].
    pub(crate) async fn accept_and_auth(&self, token: &str) -> Result<IpcChannel> {
        let (stream, _addr) = timeout(HANDSHAKE_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| {
                SecurerErr::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "child did not connect to the rendezvous socket in time",
                ))
            })??;
        let mut channel = IpcChannel::new(stream);
        let first_line = timeout(HANDSHAKE_TIMEOUT, channel.read_line_raw())
            .await
            .map_err(|_| SecurerErr::IpcAuthFailed)??;
        if first_line.as_bytes() != token.as_bytes() {
            warn!("rendezvous client presented a bad token");
            return Err(SecurerErr::IpcAuthFailed);
        }
        Ok(channel)
    }
}

/// One authenticated connection. Reads are cancel-safe: bytes pulled off the
/// socket persist in the internal buffer across a cancelled `read_frame`, so
/// the event loop can select over it freely.
#[derive(Debug)]
pub(crate) struct IpcChannel {
    stream: UnixStream,
    buf: Vec<u8>,
    scanned: usize,
}

impl IpcChannel {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(8 * 1024),
            scanned: 0,
        }
    }

    /// Reads one newline-terminated line, enforcing the frame byte cap
    /// before any parsing.
    pub(crate) async fn read_line_raw(&mut self) -> Result<String> {
        loop {
            if let Some(rel) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
                let newline_at = self.scanned + rel;
                let mut line: Vec<u8> = self.buf.drain(..=newline_at).collect();
                self.scanned = 0;
                line.pop();
                let frame_len = line.len() + 1;
                if frame_len > MAX_FRAME_BYTES {
                    return Err(SecurerErr::IpcFrameTooLarge(frame_len));
                }
                return String::from_utf8(line)
                    .map_err(|_| SecurerErr::IpcSchemaViolation("frame is not UTF-8".to_string()));
            }
            self.scanned = self.buf.len();
            if self.buf.len() >= MAX_FRAME_BYTES {
                return Err(SecurerErr::IpcFrameTooLarge(self.buf.len()));
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(SecurerErr::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "IPC channel closed by the child",
                )));
            }
        }
    }

    /// Reads and validates one child frame.
    pub(crate) async fn read_frame(&mut self) -> Result<ChildFrame> {
        let line = self.read_line_raw().await?;
        Ok(parse_child_frame(&line)?)
    }

    /// Serializes and writes one frame; enforces the byte cap on the way
    /// out as well.
    pub(crate) async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let line = encode_frame(frame)?;
        self.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
