use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs a job once after a delay. There is no way to cancel a job once it
/// has been scheduled; jobs must check themselves whether they still apply.
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, name: String, job: Job);
}

pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, name: String, job: Job) {
        debug!("scheduled {name} in {}s", delay.as_secs());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("running {name}");
            job.await;
        });
    }
}
