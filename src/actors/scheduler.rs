use crate::actors::messages::SchedulerMessage;
use crate::config::{ScheduleConfig, MAX_INTERVAL_MINUTES};
use crate::core::MessageSource;
use crate::scraper::pacing::jittered;
use crate::scraper::Fetcher;
use crate::storage::MessageStore;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

const CHANNEL_BUFFER_SIZE: usize = 8;

pub struct SchedulerHandle {
    sender: Sender<SchedulerMessage>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Spawn the scheduler actor. The first cycle fires immediately.
    pub fn spawn<S, St>(fetcher: Fetcher<S, St>, config: ScheduleConfig) -> Self
    where
        S: MessageSource + 'static,
        St: MessageStore + 'static,
    {
        let (sender, receiver) = channel(CHANNEL_BUFFER_SIZE);
        let task = tokio::spawn(scheduler_actor(receiver, fetcher, config));
        Self { sender, task }
    }

    pub async fn send_message(&self, message: SchedulerMessage) -> anyhow::Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send message to Scheduler: {}", e))
    }

    pub async fn run_now(&self) -> anyhow::Result<()> {
        self.send_message(SchedulerMessage::RunNow).await
    }

    /// Stop the schedule, waiting for an in-flight cycle to finish first.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_message(SchedulerMessage::Shutdown(ack_tx)).await?;
        ack_rx
            .await
            .map_err(|e| anyhow::anyhow!("Scheduler exited without acknowledging shutdown: {}", e))?;
        self.task
            .await
            .map_err(|e| anyhow::anyhow!("Scheduler task failed: {}", e))
    }
}

async fn scheduler_actor<S, St>(
    mut receiver: Receiver<SchedulerMessage>,
    fetcher: Fetcher<S, St>,
    config: ScheduleConfig,
) where
    S: MessageSource,
    St: MessageStore,
{
    let (interval, jitter) = schedule_bounds(&config);

    tracing::info!(
        "[Scheduler] Started: every {} min, jitter ±{}s",
        config.interval_minutes,
        config.jitter_secs
    );

    // The startup cycle runs before any message is looked at.
    let mut cycle = 1u64;
    let started = Instant::now();
    run_scheduled_cycle(&fetcher, cycle).await;
    let mut next_fire = schedule_next(started, interval, jitter);

    loop {
        tokio::select! {
            biased;

            message = receiver.recv() => match message {
                Some(SchedulerMessage::RunNow) => {
                    cycle += 1;
                    let started = Instant::now();
                    run_scheduled_cycle(&fetcher, cycle).await;
                    next_fire = schedule_next(started, interval, jitter);
                }
                Some(SchedulerMessage::Shutdown(ack)) => {
                    tracing::info!("[Scheduler] Received shutdown signal after {} cycles", cycle);
                    let _ = ack.send(());
                    break;
                }
                None => {
                    tracing::info!("[Scheduler] Channel closed, shutting down");
                    break;
                }
            },

            _ = sleep_until(next_fire) => {
                cycle += 1;
                let started = Instant::now();
                run_scheduled_cycle(&fetcher, cycle).await;
                next_fire = schedule_next(started, interval, jitter);
            }
        }
    }
}

/// Interval and jitter as durations. Both are capped so deadline arithmetic
/// stays in range even for settings that skipped validation.
fn schedule_bounds(config: &ScheduleConfig) -> (Duration, Duration) {
    let interval_secs = config.interval_minutes.min(MAX_INTERVAL_MINUTES) * 60;
    (
        Duration::from_secs(interval_secs),
        Duration::from_secs(config.jitter_secs.min(interval_secs)),
    )
}

/// Next firing time measured from the start of the last cycle. A slot missed
/// because the cycle overran is skipped rather than fired back-to-back.
fn schedule_next(started: Instant, interval: Duration, jitter: Duration) -> Instant {
    let delay = jittered(interval, jitter);
    let now = Instant::now();
    let mut next = started + delay;

    if next <= now {
        tracing::warn!(
            "[Scheduler] Cycle overran its {:?} slot, skipping to the next one",
            delay
        );
        next = now + delay;
    }

    tracing::info!(
        "[Scheduler] Next cycle in {}s",
        next.saturating_duration_since(now).as_secs()
    );
    next
}

async fn run_scheduled_cycle<S, St>(fetcher: &Fetcher<S, St>, cycle: u64)
where
    S: MessageSource,
    St: MessageStore,
{
    tracing::info!("[Scheduler] Starting cycle {}", cycle);

    match fetcher.run_cycle().await {
        Ok(outcome) => tracing::info!("[Scheduler] Cycle {} finished: {}", cycle, outcome),
        Err(e) => tracing::error!("[Scheduler] Cycle {} aborted: {}", cycle, e),
    }
}
