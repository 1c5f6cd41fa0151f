//! Event queue in front of the engine.
//!
//! Producers (sensor loops, the UI, the clock) hold a cloneable [`RecorderHandle`]
//! and push [`Command`]s into one bounded channel. A single consumer running on a
//! blocking thread owns the [`Engine`] and applies commands in arrival order, so
//! store retries may sleep without stalling the async producers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::error::{RResult, RecorderError};
use crate::notify::NotificationPort;
use crate::sensors::SensorHub;
use crate::session::SessionStatus;
use crate::storage::RecordStore;
use crate::types::{ActivityTemplate, MotionEvent, PositionFix, Timestamp};

const QUEUE_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<T>;

/// Everything the consumer can be asked to do
#[derive(Debug)]
pub enum Command {
    Start {
        activity: Arc<ActivityTemplate>,
        note: String,
        now: Timestamp,
        reply: Reply<RResult<SessionStatus>>,
    },
    Recover {
        reply: Reply<RResult<Option<SessionStatus>>>,
    },
    Finish {
        now: Timestamp,
        reply: Reply<RResult<SessionStatus>>,
    },
    Cancel {
        now: Timestamp,
        reply: Reply<Option<SessionStatus>>,
    },
    Increment {
        now: Timestamp,
        reply: Reply<RResult<SessionStatus>>,
    },
    SetNote {
        note: String,
        reply: Reply<RResult<SessionStatus>>,
    },
    Status {
        reply: Reply<Option<SessionStatus>>,
    },
    Motion(MotionEvent),
    Fix(PositionFix),
    Foreground(bool),
    Tick(Timestamp),
    Shutdown,
}

/// Wall clock in milliseconds
pub fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Cloneable producer side of the queue
#[derive(Clone, Debug)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Command>,
}

impl RecorderHandle {
    async fn send(&self, command: Command) -> RResult<()> {
        self.tx.send(command).await.map_err(|_| RecorderError::Stopped)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> RResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| RecorderError::Stopped)
    }

    pub async fn start(&self, activity: Arc<ActivityTemplate>, note: &str, now: Timestamp) -> RResult<SessionStatus> {
        let note = note.to_string();
        self.request(|reply| Command::Start {
            activity,
            note,
            now,
            reply,
        })
        .await?
    }

    pub async fn recover(&self) -> RResult<Option<SessionStatus>> {
        self.request(|reply| Command::Recover { reply }).await?
    }

    pub async fn finish(&self, now: Timestamp) -> RResult<SessionStatus> {
        self.request(|reply| Command::Finish { now, reply }).await?
    }

    pub async fn cancel(&self, now: Timestamp) -> RResult<Option<SessionStatus>> {
        self.request(|reply| Command::Cancel { now, reply }).await
    }

    pub async fn increment(&self, now: Timestamp) -> RResult<SessionStatus> {
        self.request(|reply| Command::Increment { now, reply }).await?
    }

    pub async fn set_note(&self, note: &str) -> RResult<SessionStatus> {
        let note = note.to_string();
        self.request(|reply| Command::SetNote { note, reply }).await?
    }

    pub async fn status(&self) -> RResult<Option<SessionStatus>> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Sensor events are fire and forget; the consumer logs rejections.
    pub async fn motion(&self, event: MotionEvent) -> RResult<()> {
        self.send(Command::Motion(event)).await
    }

    pub async fn fix(&self, fix: PositionFix) -> RResult<()> {
        self.send(Command::Fix(fix)).await
    }

    pub async fn set_foreground(&self, foreground: bool) -> RResult<()> {
        self.send(Command::Foreground(foreground)).await
    }

    pub async fn tick(&self, now: Timestamp) -> RResult<()> {
        self.send(Command::Tick(now)).await
    }

    /// Ask the consumer to stop once everything queued before has been applied.
    pub async fn shutdown(&self) -> RResult<()> {
        self.send(Command::Shutdown).await
    }
}

/// Running consumer plus optional clock task
pub struct Recorder<S, N, H>
where
    S: RecordStore + Send + 'static,
    N: NotificationPort + Send + 'static,
    H: SensorHub + Send + 'static,
{
    consumer: JoinHandle<Engine<S, N, H>>,
    ticker: Option<JoinHandle<()>>,
}

impl<S, N, H> Recorder<S, N, H>
where
    S: RecordStore + Send + 'static,
    N: NotificationPort + Send + 'static,
    H: SensorHub + Send + 'static,
{
    /// Spawn the consumer. With `tick_every` set, a clock task feeds
    /// `Tick(now_ms())` into the same queue at that period.
    pub fn spawn(engine: Engine<S, N, H>, tick_every: Option<Duration>) -> (RecorderHandle, Self) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let consumer = tokio::task::spawn_blocking(move || consume(engine, rx));

        let ticker = tick_every.map(|period| {
            // Weak so the clock alone does not keep the consumer alive
            let weak = tx.downgrade();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let Some(tx) = weak.upgrade() else { break };
                    if tx.send(Command::Tick(now_ms())).await.is_err() {
                        break;
                    }
                }
                log::debug!("[recorder] clock stopped");
            })
        });

        (RecorderHandle { tx }, Self { consumer, ticker })
    }

    /// Wait for the consumer to stop and take the engine back.
    pub async fn join(self) -> anyhow::Result<Engine<S, N, H>> {
        let engine = self.consumer.await?;
        if let Some(ticker) = self.ticker {
            ticker.abort();
        }
        Ok(engine)
    }
}

fn consume<S, N, H>(mut engine: Engine<S, N, H>, mut rx: mpsc::Receiver<Command>) -> Engine<S, N, H>
where
    S: RecordStore,
    N: NotificationPort,
    H: SensorHub,
{
    log::debug!("[recorder] consumer started");
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Start {
                activity,
                note,
                now,
                reply,
            } => {
                let _ = reply.send(engine.start(activity, &note, now));
            }
            Command::Recover { reply } => {
                let _ = reply.send(engine.recover());
            }
            Command::Finish { now, reply } => {
                let _ = reply.send(engine.finish(now));
            }
            Command::Cancel { now, reply } => {
                let _ = reply.send(engine.cancel(now));
            }
            Command::Increment { now, reply } => {
                let _ = reply.send(engine.increment(now));
            }
            Command::SetNote { note, reply } => {
                let _ = reply.send(engine.set_note(&note));
            }
            Command::Status { reply } => {
                let _ = reply.send(engine.status());
            }
            Command::Motion(event) => {
                if let Err(err) = engine.on_motion_event(&event) {
                    log_dropped("motion event", &err);
                }
            }
            Command::Fix(fix) => {
                if let Err(err) = engine.on_position_fix(&fix) {
                    log_dropped("position fix", &err);
                }
            }
            Command::Foreground(foreground) => engine.set_foreground(foreground),
            Command::Tick(now) => {
                if let Err(err) = engine.tick(now) {
                    log_dropped("tick", &err);
                }
            }
            Command::Shutdown => break,
        }
    }
    engine.shutdown();
    log::debug!("[recorder] consumer stopped");
    engine
}

fn log_dropped(what: &str, err: &RecorderError) {
    if err.is_recoverable() {
        log::debug!("[recorder] {} dropped: {}", what, err);
    } else {
        log::warn!("[recorder] {} failed: {}", what, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecorderConfig, RetryConfig};
    use crate::notify::{NotificationKind, RecordingNotifier};
    use crate::sensors::LogSensorHub;
    use crate::session::SessionState;
    use crate::storage::MemoryStore;
    use crate::types::RepetitionMode;

    fn spawn_recorder() -> (RecorderHandle, Recorder<MemoryStore, RecordingNotifier, LogSensorHub>) {
        let config = RecorderConfig {
            retry: RetryConfig::immediate(1),
            ..RecorderConfig::default()
        };
        let engine = Engine::new(config, MemoryStore::new(), RecordingNotifier::default(), LogSensorHub::new());
        Recorder::spawn(engine, None)
    }

    #[tokio::test]
    async fn test_producers_share_one_queue() {
        let (handle, recorder) = spawn_recorder();
        let squats = Arc::new(
            ActivityTemplate::new(1, "Squats", 1).with_repetitions(1, 100, RepetitionMode::UprightAxis, 0),
        );
        handle.start(squats, "", 0).await.unwrap();

        let sensor = handle.clone();
        let producer = tokio::spawn(async move {
            for i in 0..10i64 {
                sensor.motion(MotionEvent::axis(i * 100, 3.0)).await.unwrap();
                sensor.motion(MotionEvent::axis(i * 100 + 50, -3.0)).await.unwrap();
            }
        });
        producer.await.unwrap();
        handle.increment(2_000).await.unwrap();

        let status = handle.finish(3_000).await.unwrap();
        assert_eq!(status.state, SessionState::Finished);
        assert_eq!(status.repetitions, 11);

        handle.shutdown().await.unwrap();
        let engine = recorder.join().await.unwrap();
        assert_eq!(engine.store().finished["record_0"].repetitions, 11);
        assert_eq!(engine.notifier().count(NotificationKind::RepetitionClick), 11);
    }

    #[tokio::test]
    async fn test_closed_session_reported_to_requests() {
        let (handle, recorder) = spawn_recorder();
        let plank = Arc::new(ActivityTemplate::new(2, "Plank", 1));
        handle.start(plank, "", 0).await.unwrap();
        handle.cancel(10).await.unwrap();

        assert_eq!(handle.finish(20).await, Err(RecorderError::SessionClosed));
        // Fire-and-forget events after close are dropped, not fatal
        handle.motion(MotionEvent::proximity(30, true)).await.unwrap();
        assert_eq!(handle.status().await.unwrap().unwrap().state, SessionState::Cancelled);

        handle.shutdown().await.unwrap();
        recorder.join().await.unwrap();
        assert_eq!(handle.status().await, Err(RecorderError::Stopped));
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_consumer() {
        let (handle, recorder) = spawn_recorder();
        drop(handle);
        let engine = recorder.join().await.unwrap();
        assert!(engine.status().is_none());
    }
}
