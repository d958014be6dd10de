//! Self-rearming schedule timer
//!
//! The runner computes [`next_run`], sleeps until then, fires its callback
//! and queries again. Edits arrive over a `watch` channel and cancel the
//! pending sleep, so a changed schedule never fires on the old timing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Schedule, next_run};

/// Source of the current wall-clock time
pub trait WallClock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

type FireCallback = Arc<dyn Fn() + Send + Sync>;

/// Trigger bookkeeping shared by the handle and the task
#[derive(Debug, Default)]
struct Timing {
    next_fire: Option<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
}

impl Timing {
    // Never compute from before the last firing, so a clock that lags the
    // timer cannot fire the same instant twice
    fn compute(&self, schedule: Option<&Schedule>, clock: &dyn WallClock) -> Option<DateTime<Utc>> {
        let reference = match self.last_fired {
            Some(fired) => fired.max(clock.now()),
            None => clock.now(),
        };
        schedule
            .and_then(|s| next_run(s, &reference.with_timezone(&Local)))
            .map(|at| at.with_timezone(&Utc))
    }
}

/// Background task firing a callback on schedule
///
/// Calendar rules are evaluated in the local time zone. The task stops when
/// the runner is dropped. The pending trigger is known as soon as
/// [`ScheduleRunner::spawn`] or [`ScheduleRunner::update`] returns.
pub struct ScheduleRunner {
    edits: watch::Sender<Option<Schedule>>,
    timing: Arc<Mutex<Timing>>,
    clock: Arc<dyn WallClock>,
    task: JoinHandle<()>,
}

impl ScheduleRunner {
    /// Arm `schedule` (or nothing) and call `on_fire` at every trigger
    pub fn spawn<F>(schedule: Option<Schedule>, clock: Arc<dyn WallClock>, on_fire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let next_fire = Timing::default().compute(schedule.as_ref(), clock.as_ref());
        let timing = Arc::new(Mutex::new(Timing {
            next_fire,
            last_fired: None,
        }));

        let (edits, rx) = watch::channel(schedule);
        let task = tokio::spawn(run(
            rx,
            Arc::clone(&clock),
            Arc::new(on_fire),
            Arc::clone(&timing),
        ));
        Self {
            edits,
            timing,
            clock,
            task,
        }
    }

    /// Replace the schedule; the pending timer is cancelled and recomputed
    pub fn update(&self, schedule: Option<Schedule>) {
        // Held across the send so the task cannot publish a trigger of the
        // previous schedule afterwards
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        timing.next_fire = timing.compute(schedule.as_ref(), self.clock.as_ref());
        self.edits.send_replace(schedule);
    }

    /// Schedule currently armed
    pub fn schedule(&self) -> Option<Schedule> {
        self.edits.borrow().clone()
    }

    /// Instant of the pending trigger, if any
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.timing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_fire
    }
}

impl Drop for ScheduleRunner {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ScheduleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleRunner")
            .field("schedule", &self.schedule())
            .field("next_fire", &self.next_fire())
            .finish()
    }
}

async fn run(
    mut edits: watch::Receiver<Option<Schedule>>,
    clock: Arc<dyn WallClock>,
    on_fire: FireCallback,
    timing: Arc<Mutex<Timing>>,
) {
    loop {
        let next = {
            let mut timing = timing.lock().unwrap_or_else(PoisonError::into_inner);
            let schedule = edits.borrow_and_update().clone();
            let next = timing.compute(schedule.as_ref(), clock.as_ref());
            timing.next_fire = next;
            next
        };

        let Some(at) = next else {
            tracing::debug!("No schedule armed");
            if edits.changed().await.is_err() {
                break;
            }
            continue;
        };

        let wait = (at - clock.now()).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!("Next scheduled run at {} (in {:?})", at, wait);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                tracing::info!("Schedule fired");
                timing.lock().unwrap_or_else(PoisonError::into_inner).last_fired = Some(at);
                on_fire();
            }
            changed = edits.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::debug!("Schedule edited, rearming");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Wall clock that follows tokio's (pausable) clock
    struct TokioClock {
        origin: Instant,
        wall_origin: DateTime<Utc>,
    }

    impl TokioClock {
        fn new() -> Self {
            Self {
                origin: Instant::now(),
                wall_origin: Utc::now(),
            }
        }
    }

    impl WallClock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::TimeDelta::from_std(self.origin.elapsed()).unwrap_or(chrono::TimeDelta::zero());
            self.wall_origin + elapsed
        }
    }

    fn counting_runner(schedule: Option<Schedule>) -> (ScheduleRunner, mpsc::UnboundedReceiver<Instant>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = ScheduleRunner::spawn(schedule, Arc::new(TokioClock::new()), move || {
            let _ = tx.send(Instant::now());
        });
        (runner, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_rearms_after_each_fire() {
        let start = Instant::now();
        let (_runner, mut fired) = counting_runner(Some(Schedule::interval(1)));

        for n in 1..=3u64 {
            let at = fired.recv().await.unwrap();
            let elapsed = at.duration_since(start).as_secs();
            assert!((n * 60..n * 60 + 2).contains(&elapsed), "fire {n} at {elapsed}s");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_cancels_pending_timer() {
        let start = Instant::now();
        let (runner, mut fired) = counting_runner(Some(Schedule::interval(60)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        runner.update(Some(Schedule::interval(1)));

        let at = fired.recv().await.unwrap();
        let elapsed = at.duration_since(start).as_secs();
        assert!((120..122).contains(&elapsed), "fired at {elapsed}s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_schedule_never_fires() {
        let mut schedule = Schedule::interval(1);
        schedule.enabled = false;
        let (runner, mut fired) = counting_runner(Some(schedule));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(fired.try_recv().is_err());
        assert_eq!(runner.next_fire(), None);

        runner.update(None);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_next_fire_known_before_task_runs() {
        let (runner, _fired) = counting_runner(Some(Schedule::interval(60)));
        let first = runner.next_fire().unwrap();
        assert!(first > Utc::now());

        runner.update(Some(Schedule::interval(1)));
        let edited = runner.next_fire().unwrap();
        assert!(edited < first);
        assert!(edited - Utc::now() <= chrono::TimeDelta::minutes(1));

        runner.update(None);
        assert_eq!(runner.next_fire(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_fire_reported() {
        let (runner, _fired) = counting_runner(Some(Schedule::interval(5)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let next = runner.next_fire().unwrap();
        let ahead = next - Utc::now();
        assert!(ahead <= chrono::TimeDelta::minutes(5) + chrono::TimeDelta::seconds(1));
        assert_eq!(runner.schedule(), Some(Schedule::interval(5)));
    }
}
