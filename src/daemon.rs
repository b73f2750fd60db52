use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, WavaHome};
use crate::error::{Result, WavaError};
use crate::lock::DaemonLock;
use crate::mailbox::RequestHandler;
use crate::os::{LinuxOs, ProcessOs};
use crate::scheduler::{Scheduler, ROOT_UID};

/// The long-running scheduler process.
pub struct Daemon {
    home: WavaHome,
    config: SchedulerConfig,
    os: Arc<dyn ProcessOs>,
}

impl Daemon {
    pub fn new(home: WavaHome, config: SchedulerConfig) -> Self {
        Self {
            home,
            config,
            os: Arc::new(LinuxOs::new()),
        }
    }

    /// Replace the process-table backend.
    pub fn with_os(mut self, os: Arc<dyn ProcessOs>) -> Self {
        self.os = os;
        self
    }

    /// Run until `shutdown` is cancelled, by a signal or an `exit` request.
    ///
    /// This is the main entry point:
    /// 1. Takes the singleton lock and creates the `$WAVA_HOME` layout
    /// 2. Builds the scheduler with the configured policies
    /// 3. Spawns the refresh loop
    /// 4. Serves the mailbox until shutdown
    /// 5. Closes the scheduler and waits for running jobs to drain
    ///
    /// # Errors
    ///
    /// Fails if another daemon holds the lock, if the configuration is
    /// invalid, or if the mailbox cannot be watched.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let euid = nix::unistd::geteuid().as_raw();
        if self.config.require_root && euid != ROOT_UID {
            return Err(WavaError::PermissionDenied(
                "the daemon is configured to run as root".to_string(),
            ));
        }

        self.home.create_dirs()?;
        let lock = DaemonLock::acquire(&self.home.lock_file())?;
        tracing::info!(
            home = %self.home.root().display(),
            lock = %lock.path().display(),
            pid = std::process::id(),
            uid = euid,
            "Daemon starting"
        );

        let drain_timeout = Duration::from_millis(self.config.kill_grace_ms * 2 + 1000);
        let scheduler = Scheduler::from_config(self.config, self.os);

        let refresh = tokio::spawn(Arc::clone(&scheduler).run_refresh_loop(shutdown.clone()));

        let handler = RequestHandler::new(
            self.home.clone(),
            Arc::clone(&scheduler),
            shutdown.clone(),
            euid,
        );
        let result = handler.run().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Request handler failed");
        }
        shutdown.cancel();

        scheduler.close().await;
        if !scheduler.wait_idle(drain_timeout).await {
            tracing::warn!("Running jobs did not exit before the drain timeout");
        }
        if let Err(e) = refresh.await {
            tracing::warn!(error = %e, "Refresh loop task failed");
        }

        tracing::info!("Daemon stopped");
        drop(lock);
        result
    }
}
