use super::config::Settings;
use super::errors::{Result, SyncError};
use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use log::{debug, error, info, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};

/// How often the loop looks for elapsed deadlines.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Pull,
    Push,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Pull => f.write_str("pull"),
            JobKind::Push => f.write_str("push"),
        }
    }
}

/// Time of day written as "HH:MM" (24-hour, two digits each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DailyTime(NaiveTime);

impl DailyTime {
    /// First occurrence of this time of day strictly after `now`.
    pub fn next_after(self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.0);
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }
}

impl FromStr for DailyTime {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SyncError::InvalidScheduleTime(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;

        let two_digits = |part: &str| part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit());
        if !two_digits(hour) || !two_digits(minute) {
            return Err(invalid());
        }

        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(DailyTime)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

/// The two daily deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub pull: DailyTime,
    pub push: DailyTime,
}

impl Schedule {
    pub fn parse(pull: &str, push: &str) -> Result<Self> {
        Ok(Self {
            pull: pull.parse()?,
            push: push.parse()?,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::parse(&settings.pull_time, &settings.push_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub at: DailyTime,
    pub next_run: NaiveDateTime,
}

/// Registered daily jobs, each with its own next deadline.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Vec<Job>,
}

impl JobTable {
    pub fn register(&mut self, kind: JobKind, at: DailyTime, now: NaiveDateTime) {
        let next_run = at.next_after(now);
        debug!("Registered daily {kind} at {at}, next run {next_run}");
        self.jobs.push(Job { kind, at, next_run });
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Jobs whose deadline is at or before `now`, in registration order.
    /// Each one is moved to its next deadline after `now`, so a late check fires it once.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<JobKind> {
        self.jobs
            .iter_mut()
            .filter(|job| job.next_run <= now)
            .map(|job| {
                job.next_run = job.at.next_after(now);
                job.kind
            })
            .collect()
    }
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock in the local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Consumer side of fired jobs.
pub trait JobHandler: Send + Sync + 'static {
    fn run_job(&self, kind: JobKind);
}

fn lock(jobs: &Mutex<JobTable>) -> MutexGuard<'_, JobTable> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Running {
    schedule: Schedule,
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// Daily pull/push timer. Disabled until `enable` is called.
///
/// Fired jobs are sent as `JobKind`s over the channel given at construction; see
/// [`spawn_worker`] for the consumer.
pub struct Scheduler<C: Clock = LocalClock> {
    clock: Arc<C>,
    jobs: Arc<Mutex<JobTable>>,
    requests: mpsc::UnboundedSender<JobKind>,
    running: Option<Running>,
}

impl Scheduler<LocalClock> {
    pub fn new(requests: mpsc::UnboundedSender<JobKind>) -> Self {
        Self::with_clock(LocalClock, requests)
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(clock: C, requests: mpsc::UnboundedSender<JobKind>) -> Self {
        Self {
            clock: Arc::new(clock),
            jobs: Arc::new(Mutex::new(JobTable::default())),
            requests,
            running: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.running.is_some()
    }

    pub fn schedule(&self) -> Option<Schedule> {
        self.running.as_ref().map(|running| running.schedule)
    }

    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.jobs).jobs().to_vec()
    }

    /// Register the two daily jobs and start the loop. Needs a tokio runtime.
    /// Calling it while enabled restarts with the new times.
    pub fn enable(&mut self, schedule: &Schedule) {
        self.disable();

        {
            let now = self.clock.now();
            let mut jobs = lock(&self.jobs);
            jobs.clear();
            jobs.register(JobKind::Pull, schedule.pull, now);
            jobs.register(JobKind::Push, schedule.push, now);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = task::spawn(run_loop(
            self.clock.clone(),
            self.jobs.clone(),
            self.requests.clone(),
            shutdown_rx,
        ));

        self.running = Some(Running {
            schedule: *schedule,
            shutdown,
            _task: task,
        });
        info!("Auto sync enabled: pull {}, push {}", schedule.pull, schedule.push);
    }

    /// Drop all jobs and stop the loop.
    pub fn disable(&mut self) {
        lock(&self.jobs).clear();
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            info!("Auto sync disabled");
        }
    }

    /// Bring the timer in line with the stored preferences.
    ///
    /// A malformed time disables the timer and is returned as an error.
    pub fn sync_with(&mut self, settings: &Settings) -> Result<()> {
        if !settings.auto_sync_enabled {
            self.disable();
            return Ok(());
        }

        let schedule = match Schedule::from_settings(settings) {
            Ok(schedule) => schedule,
            Err(e) => {
                self.disable();
                return Err(e);
            }
        };

        if self.schedule() != Some(schedule) {
            self.enable(&schedule);
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        let Some(schedule) = self.schedule() else {
            return "Auto sync disabled".to_string();
        };

        let mut text = format!(
            "Auto sync enabled\n  pull: daily at {}\n  push: daily at {}\nNext runs:",
            schedule.pull, schedule.push
        );
        for job in self.jobs() {
            text.push_str(&format!("\n  {} at {}", job.kind, job.next_run.format("%Y-%m-%d %H:%M")));
        }
        text
    }
}

impl<C: Clock> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.disable();
    }
}

async fn run_loop<C: Clock>(
    clock: Arc<C>,
    jobs: Arc<Mutex<JobTable>>,
    requests: mpsc::UnboundedSender<JobKind>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let due = lock(&jobs).take_due(clock.now());
                for kind in due {
                    info!("Auto sync: running scheduled {kind}");
                    if requests.send(kind).is_err() {
                        warn!("Job worker is gone, stopping the scheduler loop");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("Scheduler loop shutting down");
                break;
            }
        }
    }
}

/// Run fired jobs one at a time on the blocking pool until every sender is dropped.
pub fn spawn_worker<H: JobHandler>(
    mut requests: mpsc::UnboundedReceiver<JobKind>,
    handler: Arc<H>,
) -> JoinHandle<()> {
    task::spawn(async move {
        while let Some(kind) = requests.recv().await {
            let handler = handler.clone();
            if let Err(e) = task::spawn_blocking(move || handler.run_job(kind)).await {
                error!("Scheduled {kind} did not finish: {e}");
            }
        }
        debug!("Job worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    #[derive(Clone)]
    struct FakeClock(Arc<Mutex<NaiveDateTime>>);

    impl FakeClock {
        fn new(now: NaiveDateTime) -> Self {
            Self(Arc::new(Mutex::new(now)))
        }

        fn set(&self, now: NaiveDateTime) {
            *self.0.lock().unwrap() = now;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> NaiveDateTime {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<JobKind>>);

    impl JobHandler for Recorder {
        fn run_job(&self, kind: JobKind) {
            self.0.lock().unwrap().push(kind);
        }
    }

    #[test]
    fn parses_valid_times() {
        let time: DailyTime = "09:05".parse().unwrap();
        assert_eq!(time.to_string(), "09:05");
        assert_eq!(" 23:59 ".parse::<DailyTime>().unwrap().to_string(), "23:59");
        assert_eq!("00:00".parse::<DailyTime>().unwrap().to_string(), "00:00");
    }

    #[test]
    fn rejects_malformed_times() {
        for bad in ["", "9:00", "09:0", "0900", "24:00", "12:60", "ab:cd", "09:00:00", "-1:00"] {
            assert!(
                matches!(bad.parse::<DailyTime>(), Err(SyncError::InvalidScheduleTime(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn next_after_rolls_to_tomorrow_once_passed() {
        let nine: DailyTime = "09:00".parse().unwrap();
        assert_eq!(nine.next_after(at(1, 8, 0, 0)), at(1, 9, 0, 0));
        assert_eq!(nine.next_after(at(1, 9, 0, 0)), at(2, 9, 0, 0));
        assert_eq!(nine.next_after(at(1, 23, 0, 0)), at(2, 9, 0, 0));
    }

    #[test]
    fn crossing_pull_time_fires_only_pull() {
        let schedule = Schedule::parse("09:00", "18:00").unwrap();
        let mut table = JobTable::default();
        table.register(JobKind::Pull, schedule.pull, at(1, 8, 0, 0));
        table.register(JobKind::Push, schedule.push, at(1, 8, 0, 0));

        assert!(table.take_due(at(1, 8, 59, 0)).is_empty());
        assert_eq!(table.take_due(at(1, 9, 0, 30)), vec![JobKind::Pull]);
        assert!(table.take_due(at(1, 9, 1, 30)).is_empty());
        assert_eq!(table.jobs()[0].next_run, at(2, 9, 0, 0));

        // disabling before 18:00
        table.clear();
        assert!(table.take_due(at(1, 18, 0, 30)).is_empty());
    }

    #[test]
    fn late_check_fires_missed_jobs_once() {
        let schedule = Schedule::parse("09:00", "18:00").unwrap();
        let mut table = JobTable::default();
        table.register(JobKind::Pull, schedule.pull, at(1, 8, 0, 0));
        table.register(JobKind::Push, schedule.push, at(1, 8, 0, 0));

        assert_eq!(table.take_due(at(3, 10, 0, 0)), vec![JobKind::Pull, JobKind::Push]);
        assert!(table.take_due(at(3, 10, 1, 0)).is_empty());
        assert_eq!(table.jobs()[1].next_run, at(3, 18, 0, 0));
    }

    #[test]
    fn registering_on_the_deadline_waits_a_day() {
        let mut table = JobTable::default();
        table.register(JobKind::Pull, "09:00".parse().unwrap(), at(1, 9, 0, 0));
        assert!(table.take_due(at(1, 9, 0, 30)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_fires_pull_at_deadline_and_stops_when_disabled() {
        let clock = FakeClock::new(at(1, 8, 59, 0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::with_clock(clock.clone(), tx);

        scheduler.enable(&Schedule::parse("09:00", "18:00").unwrap());
        assert!(scheduler.is_enabled());
        assert_eq!(scheduler.jobs().len(), 2);

        // the first tick happens right away, nothing is due yet
        time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        clock.set(at(1, 9, 0, 10));
        let fired = time::timeout(Duration::from_secs(120), rx.recv()).await.unwrap();
        assert_eq!(fired, Some(JobKind::Pull));

        clock.set(at(1, 9, 30, 0));
        time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());

        scheduler.disable();
        assert!(!scheduler.is_enabled());
        assert!(scheduler.jobs().is_empty());

        clock.set(at(1, 18, 30, 0));
        time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_with_follows_settings() {
        let clock = FakeClock::new(at(1, 8, 0, 0));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::with_clock(clock, tx);

        let mut settings = Settings::default();
        scheduler.sync_with(&settings).unwrap();
        assert!(!scheduler.is_enabled());
        assert_eq!(scheduler.describe(), "Auto sync disabled");

        settings.auto_sync_enabled = true;
        scheduler.sync_with(&settings).unwrap();
        assert_eq!(scheduler.schedule(), Some(Schedule::parse("09:00", "18:00").unwrap()));
        assert!(scheduler.describe().contains("pull at 2024-05-01 09:00"));

        settings.push_time = "20:30".to_string();
        scheduler.sync_with(&settings).unwrap();
        assert_eq!(scheduler.schedule().unwrap().push.to_string(), "20:30");

        settings.pull_time = "nine".to_string();
        assert!(scheduler.sync_with(&settings).is_err());
        assert!(!scheduler.is_enabled());
    }

    #[tokio::test]
    async fn worker_runs_each_request_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder::default());
        let worker = spawn_worker(rx, recorder.clone());

        tx.send(JobKind::Pull).unwrap();
        tx.send(JobKind::Push).unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![JobKind::Pull, JobKind::Push]);
    }
}
