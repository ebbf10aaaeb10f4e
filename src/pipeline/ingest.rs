//! Transcriber ingest: paces caller audio into the transcriber and forwards
//! its events to the supervisor.
//!
//! Decoded frames arrive on a bounded queue. They are regrouped into
//! `chunk_ms` chunks and fed one chunk per tick, so the provider sees a
//! steady real-time stream instead of bursts. A transient transcriber
//! failure restarts the transcriber once per incident. The budget re-arms
//! once the fresh transcriber delivers an event or stays up for
//! `RESTART_WINDOW`. A lost transcript stream that cannot be restarted
//! leaves the call deaf, so it is escalated as fatal.

use super::messages::HandlerMsg;
use crate::audio::ms_to_samples;
use crate::error::{ErrorRecord, Stage, StageResult};
use crate::providers::{CallContext, Transcriber, TranscriberEvent, TranscriberFactory};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A restarted transcriber that stays up this long earns a fresh restart.
const RESTART_WINDOW: Duration = Duration::from_secs(30);

/// One restart per incident.
struct RestartBudget {
    last_restart: Option<Instant>,
}

impl RestartBudget {
    fn new() -> Self {
        Self { last_restart: None }
    }

    fn take(&mut self) -> bool {
        let now = Instant::now();
        match self.last_restart {
            Some(at) if now.duration_since(at) < RESTART_WINDOW => false,
            _ => {
                self.last_restart = Some(now);
                true
            }
        }
    }

    /// The restarted transcriber is healthy again.
    fn rearm(&mut self) {
        self.last_restart = None;
    }
}

pub(crate) struct IngestConfig {
    pub chunk_ms: u32,
    /// Samples kept when the transcriber falls behind; older audio is dropped.
    pub max_backlog: usize,
    pub finish_timeout: Duration,
}

pub(crate) async fn run_ingest(
    factory: Arc<dyn TranscriberFactory>,
    ctx: CallContext,
    mut audio_rx: mpsc::Receiver<Vec<i16>>,
    notify: mpsc::UnboundedSender<HandlerMsg>,
    config: IngestConfig,
) {
    let (mut transcriber, mut events) = match start_transcriber(&*factory, &ctx).await {
        Ok(started) => started,
        Err(e) => {
            let _ = notify.send(HandlerMsg::StageFailed(e.escalate()));
            return;
        }
    };
    let chunk_samples = ms_to_samples(config.chunk_ms).max(1);
    let mut backlog: VecDeque<i16> = VecDeque::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(config.chunk_ms.max(1))));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut budget = RestartBudget::new();
    let mut events_open = true;
    let mut dropped = 0usize;

    loop {
        tokio::select! {
            frame = audio_rx.recv() => {
                let Some(frame) = frame else { break };
                backlog.extend(frame);
                if backlog.len() > config.max_backlog {
                    let excess = backlog.len() - config.max_backlog;
                    backlog.drain(..excess);
                    dropped += excess;
                    debug!(call_id = %ctx.call_id, dropped, "transcriber backlog trimmed");
                }
            }
            _ = ticker.tick() => {
                if backlog.len() < chunk_samples {
                    continue;
                }
                let chunk: Vec<i16> = backlog.drain(..chunk_samples).collect();
                if let Err(e) = transcriber.feed(&chunk).await {
                    if !handle_error(e, &mut budget, false, &notify) {
                        continue;
                    }
                    match restart(&mut transcriber, &*factory, &ctx, &notify, config.finish_timeout).await {
                        Some(rx) => {
                            events = rx;
                            events_open = true;
                        }
                        None => break,
                    }
                }
            }
            event = events.recv(), if events_open => {
                let restart_needed = match event {
                    Some(TranscriberEvent::Error(e)) => handle_error(e, &mut budget, false, &notify),
                    Some(event) => {
                        budget.rearm();
                        let _ = notify.send(HandlerMsg::Transcript(event));
                        false
                    }
                    None => {
                        events_open = false;
                        handle_error(
                            ErrorRecord::transient(Stage::Transcriber, "transcript stream closed"),
                            &mut budget,
                            true,
                            &notify,
                        )
                    }
                };
                if restart_needed {
                    match restart(&mut transcriber, &*factory, &ctx, &notify, config.finish_timeout).await {
                        Some(rx) => {
                            events = rx;
                            events_open = true;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    // Input closed: flush the tail so the last utterance is transcribed.
    if !backlog.is_empty() {
        let tail: Vec<i16> = backlog.drain(..).collect();
        let _ = transcriber.feed(&tail).await;
    }
    let deadline = Instant::now() + config.finish_timeout;
    if tokio::time::timeout_at(deadline, transcriber.finish()).await.is_err() {
        warn!(call_id = %ctx.call_id, "transcriber did not finish in time");
    }
    while events_open {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(TranscriberEvent::Error(e))) => {
                debug!(call_id = %ctx.call_id, "transcriber error during flush: {e}");
            }
            Ok(Some(event)) => {
                let _ = notify.send(HandlerMsg::Transcript(event));
            }
            Ok(None) | Err(_) => break,
        }
    }
}

async fn start_transcriber(
    factory: &dyn TranscriberFactory,
    ctx: &CallContext,
) -> StageResult<(Box<dyn Transcriber>, mpsc::Receiver<TranscriberEvent>)> {
    let mut transcriber = factory.create(ctx)?;
    let events = transcriber.start(ctx).await?;
    Ok((transcriber, events))
}

/// Returns `true` when the transcriber should be restarted.
///
/// `deaf` marks failures after which no transcript can arrive anymore; those
/// become fatal once the budget is spent.
fn handle_error(
    error: ErrorRecord,
    budget: &mut RestartBudget,
    deaf: bool,
    notify: &mpsc::UnboundedSender<HandlerMsg>,
) -> bool {
    if error.is_transient() && budget.take() {
        debug!("transient transcriber failure, restarting: {}", error.message);
        return true;
    }
    let error = if deaf && !error.is_fatal() {
        ErrorRecord::fatal(Stage::Transcriber, format!("transcriber lost: {}", error.message))
    } else {
        error.escalate()
    };
    let _ = notify.send(HandlerMsg::StageFailed(error));
    false
}

async fn restart(
    transcriber: &mut Box<dyn Transcriber>,
    factory: &dyn TranscriberFactory,
    ctx: &CallContext,
    notify: &mpsc::UnboundedSender<HandlerMsg>,
    finish_timeout: Duration,
) -> Option<mpsc::Receiver<TranscriberEvent>> {
    let _ = tokio::time::timeout(finish_timeout, transcriber.finish()).await;
    match start_transcriber(factory, ctx).await {
        Ok((fresh, events)) => {
            *transcriber = fresh;
            info!(call_id = %ctx.call_id, "transcriber restarted");
            Some(events)
        }
        Err(e) => {
            warn!(call_id = %ctx.call_id, "transcriber restart failed: {e}");
            let fatal = ErrorRecord::fatal(
                Stage::Transcriber,
                format!("transcriber restart failed: {}", e.message),
            );
            let _ = notify.send(HandlerMsg::StageFailed(fatal));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::scripted::{ScriptedTranscriberFactory, ScriptedTranscriberHandle};

    struct Running {
        audio_tx: mpsc::Sender<Vec<i16>>,
        notify_rx: mpsc::UnboundedReceiver<HandlerMsg>,
        handle: ScriptedTranscriberHandle,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_ingest() -> Running {
        let (factory, handle) = ScriptedTranscriberFactory::new();
        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (notify, notify_rx) = mpsc::unbounded_channel();
        let ctx = CallContext {
            call_id: "c1".into(),
            language: "en".into(),
        };
        let task = tokio::spawn(run_ingest(
            Arc::new(factory),
            ctx,
            audio_rx,
            notify,
            IngestConfig {
                chunk_ms: 200,
                max_backlog: 16_000,
                finish_timeout: Duration::from_millis(200),
            },
        ));
        Running {
            audio_tx,
            notify_rx,
            handle,
            task,
        }
    }

    async fn wait_running(handle: &ScriptedTranscriberHandle, starts: usize) {
        while handle.start_count() < starts || !handle.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_fed_in_fixed_chunks() {
        let run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        for _ in 0..25 {
            run.audio_tx.send(vec![0; 160]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(run.handle.chunk_sizes(), vec![1600, 1600]);

        drop(run.audio_tx);
        run.task.await.unwrap();
        // The 5-frame tail is flushed on close.
        assert_eq!(run.handle.chunk_sizes(), vec![1600, 1600, 800]);
        assert!(run.handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn transcripts_are_forwarded() {
        let mut run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        run.handle.final_text("what time is it");
        match run.notify_rx.recv().await {
            Some(HandlerMsg::Transcript(TranscriberEvent::Final(t))) => assert_eq!(t, "what time is it"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_restarts_once_then_escalates() {
        let mut run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        run.handle.error(ErrorRecord::transient(Stage::Transcriber, "socket reset"));
        wait_running(&run.handle, 2).await;
        assert!(run.notify_rx.try_recv().is_err());

        run.handle.error(ErrorRecord::transient(Stage::Transcriber, "socket reset"));
        match run.notify_rx.recv().await {
            Some(HandlerMsg::StageFailed(e)) => assert_eq!(e.kind, ErrorKind::Recoverable),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(run.handle.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_drops_far_apart_each_get_a_restart() {
        let mut run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        assert!(run.handle.close_events());
        wait_running(&run.handle, 2).await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(run.handle.close_events());
        wait_running(&run.handle, 3).await;
        assert_eq!(run.handle.start_count(), 3);
        assert!(run.notify_rx.try_recv().is_err());

        run.handle.final_text("hello");
        match run.notify_rx.recv().await {
            Some(HandlerMsg::Transcript(TranscriberEvent::Final(t))) => assert_eq!(t, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_rearms_the_restart_budget() {
        let mut run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        assert!(run.handle.close_events());
        wait_running(&run.handle, 2).await;

        run.handle.partial("hel");
        assert!(matches!(
            run.notify_rx.recv().await,
            Some(HandlerMsg::Transcript(TranscriberEvent::Partial(_)))
        ));
        assert!(run.handle.close_events());
        wait_running(&run.handle, 3).await;
        assert!(run.notify_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_stream_loss_is_fatal() {
        let mut run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        assert!(run.handle.close_events());
        wait_running(&run.handle, 2).await;

        assert!(run.handle.close_events());
        match run.notify_rx.recv().await {
            Some(HandlerMsg::StageFailed(e)) => {
                assert_eq!(e.kind, ErrorKind::Fatal);
                assert_eq!(e.stage, Stage::Transcriber);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(run.handle.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_is_fatal() {
        let mut run = spawn_ingest();
        wait_running(&run.handle, 1).await;
        run.handle.fail_starts(1);
        assert!(run.handle.close_events());
        match run.notify_rx.recv().await {
            Some(HandlerMsg::StageFailed(e)) => assert_eq!(e.kind, ErrorKind::Fatal),
            other => panic!("unexpected {other:?}"),
        }
        drop(run.audio_tx);
        run.task.await.unwrap();
        assert_eq!(run.handle.start_count(), 1);
    }
}
