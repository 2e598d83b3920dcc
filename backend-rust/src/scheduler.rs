//! # scheduler
//!
//! Single scheduling wheel for every periodic maintenance job (route-cache
//! prune, zone-expiry sweep, session ticks, broker reconcile). One task, one
//! clock, every job named and cancellable on shutdown.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Box<dyn Fn() -> JobFuture + Send + Sync>;

struct PeriodicJob {
    name: &'static str,
    period: Duration,
    next_due: Instant,
    run: JobFn,
}

/// Named periodic jobs driven off one interval. Jobs run sequentially on the
/// wheel's task; they must be short (each one message-passes or takes brief
/// locks, never blocks).
pub struct Scheduler {
    jobs: Vec<PeriodicJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn register<F, Fut>(mut self, name: &'static str, period: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.jobs.push(PeriodicJob {
            name,
            period,
            next_due: Instant::now() + period,
            run: Box::new(move || Box::pin(f())),
        });
        self
    }

    /// Drive the wheel until `shutdown` flips true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "scheduler started with {} jobs: {}",
            self.jobs.len(),
            self.jobs.iter().map(|j| j.name).collect::<Vec<_>>().join(", ")
        );
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    for job in &mut self.jobs {
                        if now >= job.next_due {
                            let started = Instant::now();
                            (job.run)().await;
                            let took = started.elapsed();
                            if took > Duration::from_millis(500) {
                                debug!("job {} took {took:?}", job.name);
                            }
                            job.next_due = now + job.period;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_on_their_period() {
        let fast = Arc::new(AtomicU32::new(0));
        let slow = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let f = fast.clone();
        let s = slow.clone();
        let wheel = Scheduler::new()
            .register("fast", Duration::from_millis(500), move || {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::Relaxed);
                }
            })
            .register("slow", Duration::from_secs(2), move || {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::Relaxed);
                }
            });

        let handle = tokio::spawn(wheel.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let fast_count = fast.load(Ordering::Relaxed);
        let slow_count = slow.load(Ordering::Relaxed);
        assert!(fast_count >= 7, "fast job fired {fast_count} times");
        assert!((1..=3).contains(&slow_count), "slow job fired {slow_count} times");
    }

    #[tokio::test]
    async fn shutdown_stops_the_wheel() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wheel = Scheduler::new().register("noop", Duration::from_secs(60), || async {});
        let handle = tokio::spawn(wheel.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
