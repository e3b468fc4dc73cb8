use std::future::Future;

use tracing::Instrument;

/// Spawn a detached background task, tagged with a label for the log output of everything it does.
pub fn spawn<F>(label: &'static str, future: F)
where F: Future<Output = ()> + Send + 'static {
    tokio::spawn(future.instrument(tracing::debug_span!("task", label)));
}
