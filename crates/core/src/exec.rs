//! Serialized execution lanes.
//!
//! The engine runs work on three logical lanes: the job loop (dequeue, push,
//! publish), the main I/O lane (every HTTP call starts here and every HTTP
//! callback lands here) and the looper (the serial hand-off queue between the
//! other two). Each lane is a tokio task draining an unbounded channel of
//! closures, so everything posted to one lane runs strictly in order.
//!
//! Affinity is enforced at runtime in every build: scheduling on the wrong
//! lane is a bug that corrupts the deferred state machine, not a condition to
//! tolerate.

use std::sync::Arc;

use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send + 'static>;

tokio::task_local! {
    static CURRENT_LANE: Lane;
}

/// Logical execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    JobLoop,
    MainIo,
    Looper,
}

impl Lane {
    /// Lane the calling task runs on, if it runs on one at all.
    #[must_use]
    pub fn current() -> Option<Lane> {
        CURRENT_LANE.try_with(|lane| *lane).ok()
    }

    /// Assert that the calling task runs on this lane.
    ///
    /// # Panics
    /// Panics when called from another lane or from an unmanaged task; the
    /// state machine's correctness depends on lane confinement.
    pub fn ensure(self) {
        let current = Lane::current();
        assert!(
            current == Some(self),
            "lane affinity violation: expected {self:?}, running on {current:?}"
        );
    }

    fn name(self) -> &'static str {
        match self {
            Lane::JobLoop => "job-loop",
            Lane::MainIo => "main-io",
            Lane::Looper => "looper",
        }
    }
}

/// A single lane: closures posted to it run serially, in posting order.
pub struct SerialExecutor {
    lane: Lane,
    tx: mpsc::UnboundedSender<Task>,
}

impl SerialExecutor {
    fn start(lane: Lane) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(CURRENT_LANE.scope(lane, async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            tracing::debug!(lane = lane.name(), "lane drained and closed");
        }));
        Self { lane, tx }
    }

    /// Queue a closure for serial execution on this lane.
    ///
    /// Posting to a lane that already shut down is silently dropped; that
    /// only happens while the worker is tearing down.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            tracing::warn!(lane = self.lane.name(), "task dropped, lane is closed");
        }
    }

    #[must_use]
    pub fn lane(&self) -> Lane {
        self.lane
    }
}

/// The three lanes of one worker process.
pub struct Lanes {
    pub job_loop: SerialExecutor,
    pub main_io: SerialExecutor,
    pub looper: SerialExecutor,
}

impl Lanes {
    /// Spawn the three lane tasks on the current tokio runtime.
    #[must_use]
    pub fn start() -> Arc<Self> {
        Arc::new(Self {
            job_loop: SerialExecutor::start(Lane::JobLoop),
            main_io: SerialExecutor::start(Lane::MainIo),
            looper: SerialExecutor::start(Lane::Looper),
        })
    }

    /// Two-hop reschedule used between deferred steps: from an I/O callback,
    /// hop to the looper, then to the job loop, where `task` runs. The extra
    /// hop guarantees the next step is scheduled on a fresh turn of the I/O
    /// lane instead of re-entering the HTTP callback frame.
    pub fn hop_to_job_loop(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        let lanes = Arc::clone(self);
        self.looper.post(move || {
            lanes.job_loop.post(task);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn tasks_run_serially_in_posting_order() {
        let lanes = Lanes::start();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            lanes.main_io.post(move || seen.lock().unwrap().push(i));
        }
        lanes.main_io.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn lane_tag_is_visible_to_posted_tasks() {
        let lanes = Lanes::start();
        let (tx, rx) = oneshot::channel();
        lanes.looper.post(move || {
            Lane::Looper.ensure();
            assert_eq!(Lane::current(), Some(Lane::Looper));
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(Lane::current(), None);
    }

    #[tokio::test]
    async fn two_hop_lands_on_the_job_loop() {
        let lanes = Lanes::start();
        let hops = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let inner_hops = Arc::clone(&hops);
        let inner_lanes = Arc::clone(&lanes);
        lanes.main_io.post(move || {
            Lane::MainIo.ensure();
            inner_hops.fetch_add(1, Ordering::SeqCst);
            inner_lanes.hop_to_job_loop(move || {
                Lane::JobLoop.ensure();
                inner_hops.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        });

        rx.await.unwrap();
        assert_eq!(hops.load(Ordering::SeqCst), 2);
    }
}
