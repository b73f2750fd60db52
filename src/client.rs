//! Requesting side of the mailbox protocol.
//!
//! A request allocates an id from the shared counter, creates the three
//! FIFOs of its channel under `streams/<id>`, opens them for reading and
//! only then publishes `mailbox/<id>-<op>`. The daemon removes the streams
//! directory once it has attached to every FIFO.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::unix::pipe;

use crate::config::WavaHome;
use crate::error::{Result, WavaError};
use crate::lock;
use crate::peer::CONDUITS;
use crate::protocol::{CancelRequest, EventRecord, GroupRequest, JobRequest, Request};

const ATTACH_POLL: Duration = Duration::from_millis(20);
const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Client {
    home: WavaHome,
    attach_timeout: Duration,
}

impl Client {
    pub fn new(home: WavaHome) -> Self {
        Self {
            home,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(WavaHome::from_env()?))
    }

    /// How long to wait for the daemon to pick up a request.
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn home(&self) -> &WavaHome {
        &self.home
    }

    pub fn is_daemon_running(&self) -> bool {
        lock::is_locked(&self.home.lock_file())
    }

    pub async fn submit(&self, request: JobRequest) -> Result<Session> {
        self.send(&Request::Submit(request)).await
    }

    pub async fn cancel(&self, id: u64) -> Result<Session> {
        self.send(&Request::Cancel(CancelRequest { id })).await
    }

    pub async fn jobs(&self, no_headers: bool) -> Result<Session> {
        self.send(&Request::Jobs { no_headers }).await
    }

    pub async fn group(&self, request: GroupRequest) -> Result<Session> {
        self.send(&Request::Group(request)).await
    }

    pub async fn exit(&self) -> Result<Session> {
        self.send(&Request::Exit).await
    }

    /// Publish `request` and wait until the daemon has attached to its channel.
    pub async fn send(&self, request: &Request) -> Result<Session> {
        let body = request.encode()?;
        self.send_raw(request.operation().as_str(), &body).await
    }

    /// Publish `body` under an arbitrary operation name.
    pub async fn send_raw(&self, operation: &str, body: &str) -> Result<Session> {
        if !self.is_daemon_running() {
            return Err(WavaError::Closed);
        }

        let counter = self.home.counter_file();
        let id = tokio::task::spawn_blocking(move || lock::next_request_id(&counter))
            .await
            .map_err(|e| WavaError::Internal(format!("request id allocation failed: {e}")))??;
        let file_name = format!("{id}-{operation}");
        let dir = self.home.request_streams_dir(id);

        let session = match self.open_session(id, &dir) {
            Ok(session) => session,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        if let Err(e) = publish(&self.home.mailbox_dir(), &file_name, body).await {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }
        tracing::debug!(request_id = id, op = operation, "Request published");

        if !wait_for_attach(&dir, self.attach_timeout).await {
            let _ = tokio::fs::remove_file(self.home.mailbox_dir().join(&file_name)).await;
            let _ = std::fs::remove_dir_all(&dir);
            return Err(WavaError::Closed);
        }
        Ok(session)
    }

    fn open_session(&self, id: u64, dir: &Path) -> Result<Session> {
        std::fs::create_dir_all(dir)?;
        let mut receivers = Vec::with_capacity(CONDUITS.len());
        for conduit in CONDUITS {
            let path = dir.join(conduit);
            nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(std::io::Error::from)?;
            receivers.push(pipe::OpenOptions::new().open_receiver(&path)?);
        }

        let mut receivers = receivers.into_iter();
        match (receivers.next(), receivers.next(), receivers.next()) {
            (Some(events), Some(stdout), Some(stderr)) => Ok(Session {
                id,
                events,
                stdout,
                stderr,
            }),
            _ => Err(WavaError::Internal("missing channel conduit".to_string())),
        }
    }
}

/// Write the body under a dotfile name, then rename it into place.
async fn publish(mailbox: &Path, file_name: &str, body: &str) -> Result<()> {
    let target: PathBuf = mailbox.join(file_name);
    let staging = mailbox.join(format!(".{file_name}.tmp"));
    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, &target).await?;
    Ok(())
}

async fn wait_for_attach(dir: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::fs::try_exists(dir).await.unwrap_or(false) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(ATTACH_POLL).await;
    }
    true
}

/// Reading side of one request's channel.
#[derive(Debug)]
pub struct Session {
    id: u64,
    events: pipe::Receiver,
    stdout: pipe::Receiver,
    stderr: pipe::Receiver,
}

/// Everything a request produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub events: Vec<EventRecord>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub retcode: Option<i32>,
}

impl Outcome {
    pub fn event(&self, name: &str) -> Option<&EventRecord> {
        self.events.iter().find(|e| e.is(name))
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forward output to `out`/`err` and hand every event except pings to
    /// `on_event` until the daemon closes the channel. Returns the reported
    /// retcode, if any.
    pub async fn drive<O, E, F>(self, mut out: O, mut err: E, mut on_event: F) -> Result<Option<i32>>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        F: FnMut(&EventRecord),
    {
        let Session {
            events,
            mut stdout,
            mut stderr,
            ..
        } = self;

        let read_events = async {
            let mut lines = BufReader::new(events).lines();
            let mut retcode = None;
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    continue;
                }
                let record = EventRecord::parse(&line)?;
                if record.is("ping") {
                    continue;
                }
                if record.is("retcode") {
                    retcode = record.as_i64().and_then(|code| i32::try_from(code).ok());
                }
                on_event(&record);
            }
            Ok::<_, WavaError>(retcode)
        };

        let (retcode, copied_out, copied_err) = tokio::join!(
            read_events,
            tokio::io::copy(&mut stdout, &mut out),
            tokio::io::copy(&mut stderr, &mut err),
        );
        copied_out?;
        copied_err?;
        retcode
    }

    /// Buffer the whole exchange.
    pub async fn collect(self) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        let mut events = Vec::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        outcome.retcode = self
            .drive(&mut stdout, &mut stderr, |event| events.push(event.clone()))
            .await?;
        outcome.events = events;
        outcome.stdout = stdout;
        outcome.stderr = stderr;
        Ok(outcome)
    }
}
