//! Worker handle: one child process fronted by a mailbox.

use crate::codec::TaskRequest;
use crate::config::PoolSettings;
use crate::errors::PoolError;
use crate::mailbox::Mailbox;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// How long a worker may linger between stdin EOF and exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One child process, its mailbox, and its request budget.
///
/// The worker does not schedule anything itself; it is a resource checked
/// in and out of the pool.
pub struct Worker {
    child: Child,
    mailbox: Arc<Mailbox>,
    pid: Option<u32>,
    count: u64,
    max_reqs: u64,
}

impl Worker {
    /// Spawn a worker process per the pool settings and wrap its pipes.
    ///
    /// The child reads framed requests on stdin and answers on stdout;
    /// stderr is inherited so worker logs reach the parent's stderr.
    pub async fn spawn(settings: &PoolSettings) -> Result<Self, PoolError> {
        let mut command = Command::new(&settings.worker_path);
        for dir in &settings.include {
            command.arg("--include").arg(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            PoolError::Spawn(format!("{}: {}", settings.worker_path.display(), e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdout not captured".to_string()))?;

        let pid = child.id();
        debug!("spawned worker process {:?}", pid);
        Ok(Worker {
            child,
            mailbox: Arc::new(Mailbox::new(stdout, stdin)),
            pid,
            count: 0,
            max_reqs: settings.max_reqs,
        })
    }

    /// Shared handle to this worker's mailbox. Stays valid while a caller
    /// drains a response after the worker itself has been released.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// Send one task request, charging it against the request budget.
    ///
    /// The budget is charged at dispatch: under early release the pool
    /// decides on recycling before the response payload is drained, so
    /// the charge must be visible by then.
    pub async fn send(&mut self, request: &TaskRequest) -> Result<u64, PoolError> {
        let payload =
            serde_json::to_value(request).map_err(|e| PoolError::Codec(e.to_string()))?;
        let id = self.mailbox.send(payload).await?;
        self.count += 1;
        Ok(id)
    }

    /// Wait until some response frame has arrived for this worker.
    pub async fn readable(&self) -> Result<(), PoolError> {
        self.mailbox.readable().await
    }

    /// Wait for the response to `id`.
    pub async fn recv(&self, id: u64) -> Result<Value, PoolError> {
        self.mailbox.recv(id).await
    }

    /// Requests dispatched to this worker so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// True while the child runs, the mailbox is open, and the request
    /// budget is not exhausted (`max_reqs == 0` means unlimited).
    pub fn alive(&mut self) -> bool {
        if self.mailbox.is_closed() {
            return false;
        }
        if self.max_reqs > 0 && self.count >= self.max_reqs {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close the mailbox, then wait for and reap the child. A child that
    /// ignores the stdin EOF is killed after a grace period.
    pub async fn shutdown(mut self) {
        self.mailbox.close().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!("worker {:?} exited: {}", self.pid, status),
            Ok(Err(err)) => warn!("failed to reap worker {:?}: {}", self.pid, err),
            Err(_) => {
                warn!("worker {:?} ignored EOF, killing it", self.pid);
                if let Err(err) = self.child.kill().await {
                    warn!("failed to kill worker {:?}: {}", self.pid, err);
                }
            }
        }
    }
}
