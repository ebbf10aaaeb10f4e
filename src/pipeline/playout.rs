//! Paced playout of synthesized frames to the media sink.

use super::messages::{HandlerMsg, PlayoutItem};
use crate::audio::{FRAME_MS, RecordingBuffer};
use crate::rtp::MediaSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Turn id meaning "nothing may play".
pub(crate) const NO_TURN: u64 = 0;

/// Send queued frames one per 20 ms tick.
///
/// Frames whose turn is no longer `active_turn` are dropped unsent; this is
/// how a barge-in silences audio already sitting in the queue. Every frame
/// that goes out is also appended to the assistant recording track.
pub(crate) async fn run_playout(
    mut rx: mpsc::Receiver<PlayoutItem>,
    mut sink: Box<dyn MediaSink>,
    active_turn: Arc<AtomicU64>,
    recording: Arc<Mutex<RecordingBuffer>>,
    notify: mpsc::UnboundedSender<HandlerMsg>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(FRAME_MS)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_turn = NO_TURN;
    let mut stale = 0u64;

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            None => break,
            Some(PlayoutItem::Frame { turn_id, frame }) => {
                if turn_id != active_turn.load(Ordering::SeqCst) {
                    stale += 1;
                    continue;
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Re-check: a barge-in may have landed during the tick.
                if turn_id != active_turn.load(Ordering::SeqCst) {
                    stale += 1;
                    continue;
                }
                if turn_id != last_turn {
                    sink.begin_talkspurt();
                    last_turn = turn_id;
                }
                if let Err(e) = sink.send_frame(&frame).await {
                    debug!("outbound frame not sent: {e}");
                }
                recording
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_assistant(&frame);
            }
            Some(PlayoutItem::EndOfTurn(turn_id)) => {
                if turn_id == active_turn.load(Ordering::SeqCst) {
                    let _ = notify.send(HandlerMsg::PlayoutDone(turn_id));
                }
            }
        }
    }
    if stale > 0 {
        debug!(stale, "dropped frames of cancelled turns");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::rtp::ChannelSink;

    struct Running {
        tx: mpsc::Sender<PlayoutItem>,
        sent: mpsc::UnboundedReceiver<Vec<i16>>,
        notify_rx: mpsc::UnboundedReceiver<HandlerMsg>,
        active: Arc<AtomicU64>,
        recording: Arc<Mutex<RecordingBuffer>>,
        cancel: CancellationToken,
    }

    fn spawn_playout() -> Running {
        let (tx, rx) = mpsc::channel(100);
        let (sink, sent) = ChannelSink::new();
        let (notify, notify_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicU64::new(1));
        let recording = Arc::new(Mutex::new(RecordingBuffer::new(true)));
        let cancel = CancellationToken::new();
        tokio::spawn(run_playout(
            rx,
            Box::new(sink),
            Arc::clone(&active),
            Arc::clone(&recording),
            notify,
            cancel.clone(),
        ));
        Running {
            tx,
            sent,
            notify_rx,
            active,
            recording,
            cancel,
        }
    }

    fn frame(turn_id: u64, value: i16) -> PlayoutItem {
        PlayoutItem::Frame {
            turn_id,
            frame: vec![value; 160],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_and_recorded() {
        let mut run = spawn_playout();
        let start = tokio::time::Instant::now();
        for v in 1..=5 {
            run.tx.send(frame(1, v)).await.unwrap();
        }
        run.tx.send(PlayoutItem::EndOfTurn(1)).await.unwrap();

        assert!(matches!(run.notify_rx.recv().await, Some(HandlerMsg::PlayoutDone(1))));
        // First tick is immediate, then one frame per 20 ms.
        assert!(start.elapsed() >= Duration::from_millis(80));
        let mut values = Vec::new();
        while let Ok(f) = run.sent.try_recv() {
            values.push(f[0]);
        }
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(run.recording.lock().unwrap().duration(), Duration::from_millis(100));
        run.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_turn_frames_are_dropped() {
        let mut run = spawn_playout();
        run.active.store(NO_TURN, Ordering::SeqCst);
        for v in 1..=3 {
            run.tx.send(frame(1, v)).await.unwrap();
        }
        run.tx.send(PlayoutItem::EndOfTurn(1)).await.unwrap();
        run.active.store(2, Ordering::SeqCst);
        run.tx.send(frame(2, 9)).await.unwrap();
        run.tx.send(PlayoutItem::EndOfTurn(2)).await.unwrap();

        assert!(matches!(run.notify_rx.recv().await, Some(HandlerMsg::PlayoutDone(2))));
        assert_eq!(run.sent.try_recv().unwrap()[0], 9);
        assert!(run.sent.try_recv().is_err());
    }
}
