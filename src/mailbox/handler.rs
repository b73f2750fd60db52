use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::MailboxWatcher;
use crate::config::WavaHome;
use crate::error::{Result, WavaError};
use crate::peer::PeerChannel;
use crate::protocol::{Event, Operation, Request, RequestName, RetCode};
use crate::scheduler::status::{render_groups, render_jobs};
use crate::scheduler::{Scheduler, ROOT_UID};

/// A request file claimed from the mailbox.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub name: RequestName,
    pub body: String,
    /// Owner of the request file.
    pub user: u32,
}

/// Turns mailbox files into scheduler calls.
///
/// Each request is processed on its own task; failures are reported to the
/// requester as an `error` event, a line on its stderr and a `retcode`, and
/// never stop the handler.
pub struct RequestHandler {
    home: WavaHome,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    /// Uid the daemon runs as; allowed to stop it alongside root.
    daemon_uid: u32,
    attach_timeout: Duration,
    write_timeout: Duration,
}

impl RequestHandler {
    pub fn new(
        home: WavaHome,
        scheduler: Arc<Scheduler>,
        shutdown: CancellationToken,
        daemon_uid: u32,
    ) -> Arc<Self> {
        let config = scheduler.config();
        let attach_timeout = Duration::from_millis(config.peer_attach_timeout_ms);
        let write_timeout = Duration::from_millis(config.peer_write_timeout_ms);
        Arc::new(Self {
            home,
            scheduler,
            shutdown,
            daemon_uid,
            attach_timeout,
            write_timeout,
        })
    }

    /// Watch the mailbox until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut watcher = MailboxWatcher::start(&self.home.mailbox_dir())?;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                arrival = watcher.next() => match arrival {
                    Some(path) => self.accept(&path).await,
                    None => {
                        tracing::error!("Mailbox watcher stopped");
                        break;
                    }
                },
            }
        }
        tracing::info!("Request handler stopped");
        Ok(())
    }

    async fn accept(self: &Arc<Self>, path: &Path) {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let Some((id, op)) = RequestName::split(file_name) else {
            tracing::warn!(file = %file_name, "Ignoring malformed request file");
            let _ = tokio::fs::remove_file(path).await;
            return;
        };
        let name = match op.parse::<Operation>() {
            Ok(op) => RequestName::new(id, op),
            Err(e) => {
                // Reported twice by the watcher and already answered.
                if tokio::fs::remove_file(path).await.is_err() {
                    return;
                }
                let handler = Arc::clone(self);
                tokio::spawn(async move {
                    handler.refuse(id, e).await;
                });
                return;
            }
        };

        let envelope = match claim(path, name).await {
            Ok(envelope) => envelope,
            // Reported twice by the watcher and already claimed.
            Err(WavaError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Failed to read request file");
                return;
            }
        };

        tracing::debug!(
            request_id = envelope.name.id,
            op = %envelope.name.op,
            user = envelope.user,
            "Request received"
        );
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.process(envelope).await;
        });
    }

    /// Attach to the requester's channel and run the request to completion.
    pub async fn process(self: Arc<Self>, envelope: Envelope) {
        let Envelope { name, body, user } = envelope;
        let dir = self.home.request_streams_dir(name.id);
        let peer = Arc::new(
            PeerChannel::open(&dir, name.id, self.attach_timeout, self.write_timeout).await,
        );
        if peer.is_orphaned() {
            tracing::warn!(request_id = name.id, op = %name.op, user, "Dropping request, requester never attached");
            return;
        }

        let outcome = match Request::decode(name.op, &body) {
            Ok(request) => self.dispatch(name.id, request, user, &peer).await,
            Err(e) => Err(e),
        };

        match outcome {
            // Already answered, or the job owns the channel now.
            Ok(None) => {}
            Ok(Some(code)) => {
                peer.send_event(&Event::Retcode(code.code())).await;
                peer.close().await;
            }
            Err(e) => {
                report_failure(&name, user, &body, &e);
                peer.log(&format!("wava: {e}")).await;
                peer.send_event(&Event::Error(e.to_string())).await;
                peer.send_event(&Event::Retcode(e.ret_code().code())).await;
                peer.close().await;
            }
        }
    }

    /// Answer a request whose operation is unknown. The requester still
    /// gets its error and retcode, and its streams directory is removed.
    async fn refuse(self: Arc<Self>, id: u64, error: WavaError) {
        let dir = self.home.request_streams_dir(id);
        let peer = PeerChannel::open(&dir, id, self.attach_timeout, self.write_timeout).await;
        if peer.is_orphaned() {
            tracing::warn!(request_id = id, error = %error, "Dropping request, requester never attached");
            return;
        }
        tracing::info!(request_id = id, error = %error, "Request refused");
        peer.log(&format!("wava: {error}")).await;
        peer.send_event(&Event::Error(error.to_string())).await;
        peer.send_event(&Event::Retcode(error.ret_code().code())).await;
        peer.close().await;
    }

    async fn dispatch(
        &self,
        id: u64,
        request: Request,
        user: u32,
        peer: &Arc<PeerChannel>,
    ) -> Result<Option<RetCode>> {
        match request {
            Request::Submit(job) => {
                self.scheduler.submit(id, job, user, Arc::clone(peer)).await?;
                Ok(None)
            }
            Request::Cancel(cancel) => {
                self.scheduler.cancel(cancel.id, user).await?;
                Ok(Some(RetCode::Success))
            }
            Request::Jobs { no_headers } => {
                let rows = self.scheduler.jobs().await;
                peer.write_stdout(render_jobs(&rows, no_headers).as_bytes())
                    .await;
                Ok(Some(RetCode::Success))
            }
            Request::Group(group) => {
                if group.list {
                    let groups = self.scheduler.groups().await;
                    peer.write_stdout(render_groups(&groups, group.no_headers).as_bytes())
                        .await;
                } else if group.delete {
                    let name = group
                        .name
                        .as_deref()
                        .ok_or_else(|| WavaError::Protocol("group name is required".to_string()))?;
                    self.scheduler.delete_group(name, user).await?;
                } else {
                    self.scheduler.update_group(&group, user).await?;
                }
                Ok(Some(RetCode::Success))
            }
            Request::Exit => {
                if user != ROOT_UID && user != self.daemon_uid {
                    return Err(WavaError::PermissionDenied(
                        "only root or the daemon owner may stop the daemon".to_string(),
                    ));
                }
                tracing::info!(user, "Exit requested");
                self.scheduler.close().await;
                peer.send_event(&Event::Retcode(RetCode::Success.code())).await;
                peer.close().await;
                self.shutdown.cancel();
                Ok(None)
            }
        }
    }
}

/// Read and delete a request file. The file owner identifies the requester.
async fn claim(path: &Path, name: RequestName) -> Result<Envelope> {
    let metadata = tokio::fs::metadata(path).await?;
    let body = tokio::fs::read_to_string(path).await?;
    tokio::fs::remove_file(path).await?;
    Ok(Envelope {
        name,
        body,
        user: metadata.uid(),
    })
}

fn report_failure(name: &RequestName, user: u32, body: &str, error: &WavaError) {
    match error {
        WavaError::Io(_) | WavaError::Watch(_) | WavaError::Internal(_) => tracing::error!(
            request_id = name.id,
            op = %name.op,
            user,
            payload = %body,
            error = %error,
            "Request failed unexpectedly"
        ),
        _ => tracing::info!(
            request_id = name.id,
            op = %name.op,
            user,
            error = %error,
            "Request refused"
        ),
    }
}

impl Envelope {
    pub fn new(name: RequestName, body: impl Into<String>, user: u32) -> Self {
        Self {
            name,
            body: body.into(),
            user,
        }
    }
}
