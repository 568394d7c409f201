//! Runs the constructed controllers until shutdown.
//!
//! Each controller gets its own task and a clone of the root token. Task
//! results are logged and counted as they arrive; a failing or panicking
//! controller does not stop the others. Once the token fires the remaining
//! tasks are detached, not joined: shutdown is best effort.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type TaskResult = (&'static str, Result<Result<(), ControllerError>, Box<dyn Any + Send>>);

/// What happened to the controller tasks while supervised.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub launched: usize,
    pub completed: usize,
    pub failed: usize,
    pub panicked: usize,
    /// Still running when shutdown was requested
    pub detached: usize,
}

impl SupervisorReport {
    fn record(&mut self, joined: Result<TaskResult, JoinError>) {
        match joined {
            Ok((name, Ok(Ok(())))) => {
                self.completed += 1;
                warn!("{} controller exited before shutdown", name);
            }
            Ok((name, Ok(Err(e)))) => {
                self.failed += 1;
                error!("{} controller failed: {}", name, e);
            }
            Ok((name, Err(panic))) => {
                self.panicked += 1;
                error!("{} controller panicked: {}", name, panic_message(panic.as_ref()));
            }
            Err(e) => {
                self.failed += 1;
                error!("Controller task could not be joined: {}", e);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Starts every reconciler and blocks until `token` fires.
pub async fn supervise(reconcilers: Vec<Box<dyn Reconciler>>, token: &CancellationToken) -> SupervisorReport {
    let mut report = SupervisorReport::default();
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();

    for reconciler in reconcilers {
        let name = reconciler.name();
        let task_token = token.clone();
        tasks.spawn(async move {
            let result = AssertUnwindSafe(reconciler.start(task_token)).catch_unwind().await;
            (name, result)
        });
        report.launched += 1;
        info!("Started {} controller", name);
    }

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            Some(joined) = tasks.join_next() => report.record(joined),
        }
    }

    report.detached = tasks.len();
    info!(
        "Shutting down: {} controllers still running, {} failed, {} panicked",
        report.detached, report.failed, report.panicked
    );
    tasks.detach_all();
    report
}
