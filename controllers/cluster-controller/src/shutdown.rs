//! Process shutdown signal.
//!
//! The first SIGINT or SIGTERM cancels the root token; a second one exits
//! the process immediately with status 1.

use crate::error::ControllerError;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

type SignalStream = BoxStream<'static, &'static str>;

/// Installs the signal handlers and returns the root cancellation token.
pub fn signal_token() -> Result<CancellationToken, ControllerError> {
    let signals = stream::select(
        listen(SignalKind::interrupt(), "SIGINT")?,
        listen(SignalKind::terminate(), "SIGTERM")?,
    )
    .boxed();

    let token = CancellationToken::new();
    tokio::spawn(watch_signals(signals, token.clone(), || {
        error!("Received second shutdown signal, exiting");
        std::process::exit(1);
    }));
    Ok(token)
}

fn listen(kind: SignalKind, name: &'static str) -> Result<SignalStream, ControllerError> {
    let signal = signal(kind).map_err(|e| ControllerError::Signal { signal: name, source: e })?;
    Ok(stream::unfold(signal, move |mut signal| async move {
        signal.recv().await.map(|()| (name, signal))
    })
    .boxed())
}

/// Cancels `token` on the first signal and calls `force_exit` on the second.
pub(crate) async fn watch_signals<F>(mut signals: SignalStream, token: CancellationToken, force_exit: F)
where
    F: FnOnce(),
{
    let Some(first) = signals.next().await else {
        return;
    };
    warn!("Received {}, shutting down", first);
    token.cancel();

    if signals.next().await.is_some() {
        force_exit();
    }
}
