use std::{future::Future, time::Duration};
use tokio::{task::AbortHandle, time::sleep};

/// Handle to work scheduled with [`schedule`]
///
/// Dropping the handle does not cancel the work; only [`ScheduledTask::cancel`] does.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: AbortHandle,
}

impl ScheduledTask {
    /// Cancel the task if it has not completed yet
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `work` on the runtime once `delay` has elapsed
///
/// Must be called from within a tokio runtime.
pub fn schedule<F>(delay: Duration, work: F) -> ScheduledTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        work.await;
    })
    .abort_handle();

    ScheduledTask { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let task = schedule(Duration::from_millis(300), async move {
            flag.store(true, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(299)).await;
        assert!(!fired.load(Ordering::SeqCst));

        sleep(Duration::from_millis(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_work() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let task = schedule(Duration::from_millis(300), async move {
            flag.store(true, Ordering::SeqCst);
        });

        task.cancel();
        sleep(Duration::from_secs(1)).await;

        assert!(!fired.load(Ordering::SeqCst));
    }
}
