use tokio::task::JoinHandle;
use tracing::Instrument;

/// A wrapper around [`JoinHandle`] that aborts the task when dropped.
///
/// Used for auxiliary tasks with an owner (the route listener, per-bind
/// helpers). Homogeneous worker fleets are tracked with a
/// [`JoinSet`](tokio::task::JoinSet) instead.
pub(crate) struct Task {
    name: &'static str,

    /// INVARIANT: `Some` until self is dropped or [`Self::stop`] is called.
    handle: Option<JoinHandle<()>>,
    span: tracing::Span,
}

impl Task {
    #[track_caller]
    pub fn spawn<Fut>(name: &'static str, fut: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Set task parent to None to avoid nesting tracing spans
        let span = tracing::info_span!(parent: None, "Task", name = name);
        let handle = tokio::spawn(
            async move {
                tracing::debug!("task started");
                fut.await;
                tracing::debug!("task exited");
            }
            .instrument(span.clone()),
        );

        Task {
            name,
            handle: Some(handle),
            span,
        }
    }

    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            match handle.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(parent: &self.span, "task {} panicked: {e:#?}", self.name);
                }
                _ => {
                    tracing::debug!(parent: &self.span, "stopped task {}", self.name);
                }
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(parent: &self.span, "dropped task {}", self.name);

            // The task future isn't dropped synchronously by abort; the tokio
            // runtime reaps it later. Prefer `Task::stop` for tasks that need
            // prompt cleanup.
            handle.abort();
        }
    }
}
