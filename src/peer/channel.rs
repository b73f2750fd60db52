use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::protocol::Event;

pub type PeerStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Conduit names under `streams/<id>/`, in attach order.
pub const CONDUITS: [&str; 3] = ["events", "stdout", "stderr"];

const ATTACH_POLL: Duration = Duration::from_millis(20);

/// Daemon side of one request's three streams.
///
/// Every write is best-effort: a vanished peer turns into `false`, never an
/// error, and a failed stream stays failed.
pub struct PeerChannel {
    id: u64,
    events: Mutex<Option<PeerStream>>,
    stdout: Mutex<Option<PeerStream>>,
    stderr: Mutex<Option<PeerStream>>,
    orphaned: bool,
    closed: AtomicBool,
    write_timeout: Duration,
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.id)
            .field("orphaned", &self.orphaned)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerChannel {
    pub fn from_streams(
        id: u64,
        events: PeerStream,
        stdout: PeerStream,
        stderr: PeerStream,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            events: Mutex::new(Some(events)),
            stdout: Mutex::new(Some(stdout)),
            stderr: Mutex::new(Some(stderr)),
            orphaned: false,
            closed: AtomicBool::new(false),
            write_timeout,
        }
    }

    fn orphan(id: u64) -> Self {
        Self {
            id,
            events: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            orphaned: true,
            closed: AtomicBool::new(true),
            write_timeout: Duration::ZERO,
        }
    }

    /// Attach to the FIFOs under `dir` as the writing side.
    ///
    /// The peer creates the FIFOs and opens them for reading before it
    /// publishes its request. If any conduit is still unattached when
    /// `attach_timeout` expires, the channel is returned orphaned. The
    /// streams directory is removed either way.
    pub async fn open(
        dir: &Path,
        id: u64,
        attach_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let deadline = Instant::now() + attach_timeout;
        let mut senders: Vec<PeerStream> = Vec::with_capacity(CONDUITS.len());

        for name in CONDUITS {
            let path = dir.join(name);
            match attach_sender(&path, deadline).await {
                Ok(sender) => senders.push(Box::new(sender)),
                Err(e) => {
                    tracing::warn!(
                        request_id = id,
                        conduit = name,
                        error = %e,
                        "peer never attached"
                    );
                    remove_dir(dir);
                    return Self::orphan(id);
                }
            }
        }

        remove_dir(dir);
        let mut senders = senders.into_iter();
        match (senders.next(), senders.next(), senders.next()) {
            (Some(events), Some(stdout), Some(stderr)) => {
                Self::from_streams(id, events, stdout, stderr, write_timeout)
            }
            _ => Self::orphan(id),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True when the peer never connected.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Liveness probe; `false` once the peer has gone away.
    pub async fn ping(&self) -> bool {
        self.send_event(&Event::Ping).await
    }

    pub async fn send_event(&self, event: &Event) -> bool {
        if self.is_closed() {
            return false;
        }
        let line = event.encode(Utc::now().timestamp_millis());
        self.write(&self.events, line.as_bytes(), "events").await
    }

    /// Write one diagnostic line to the peer's stderr.
    pub async fn log(&self, message: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(&self.stderr, line.as_bytes(), "stderr").await
    }

    pub async fn write_stdout(&self, bytes: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.write(&self.stdout, bytes, "stdout").await
    }

    pub async fn write_stderr(&self, bytes: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.write(&self.stderr, bytes, "stderr").await
    }

    /// Close all three streams. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in [&self.events, &self.stdout, &self.stderr] {
            if let Some(mut stream) = slot.lock().await.take() {
                let _ = stream.shutdown().await;
            }
        }
    }

    async fn write(&self, slot: &Mutex<Option<PeerStream>>, bytes: &[u8], conduit: &str) -> bool {
        let mut guard = slot.lock().await;
        let Some(stream) = guard.as_mut() else {
            return false;
        };
        let result = tokio::time::timeout(self.write_timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(request_id = self.id, conduit, error = %e, "peer stream failed");
                *guard = None;
                false
            }
            Err(_) => {
                tracing::debug!(request_id = self.id, conduit, "peer stream write timed out");
                false
            }
        }
    }
}

async fn attach_sender(path: &Path, deadline: Instant) -> io::Result<pipe::Sender> {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            // ENXIO: no reader yet. NotFound: FIFO not created yet.
            Err(e)
                if e.raw_os_error() == Some(libc::ENXIO) || e.kind() == io::ErrorKind::NotFound =>
            {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, e));
                }
                tokio::time::sleep(ATTACH_POLL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn remove_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!(dir = %dir.display(), error = %e, "failed to remove streams dir");
        }
    }
}
