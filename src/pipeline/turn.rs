//! One reply turn: language model → segmenter → synthesis → playout queue.
//!
//! Generation and synthesis run concurrently inside the turn task. Segments
//! are synthesized strictly in order and each segment's frames are fully
//! queued before the next segment starts, so audio never interleaves.

use super::messages::{HandlerMsg, PlayoutItem, TurnKind, TurnOutcome, TurnReport};
use crate::config::SegmenterConfig;
use crate::error::{ErrorRecord, Stage};
use crate::providers::{ChatMessage, LanguageModelClient, QueryOptions, Synthesizer};
use crate::runtime::{EventSink, RuntimeEvent};
use crate::segmenter::{StreamingSegmenter, TextSegment, segment};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Where the turn's text comes from.
pub(crate) enum TurnSource {
    Reply {
        llm: Arc<dyn LanguageModelClient>,
        system_prompt: String,
        /// History including the caller's latest utterance.
        history: Vec<ChatMessage>,
        options: QueryOptions,
        first_token_timeout: Duration,
    },
    Canned(String),
}

pub(crate) struct TurnContext {
    pub call_id: String,
    pub turn_id: u64,
    pub user_text: Option<String>,
    pub source: TurnSource,
    pub synth: Arc<dyn Synthesizer>,
    pub segmenter: SegmenterConfig,
    pub cancel: CancellationToken,
    pub playout: mpsc::Sender<PlayoutItem>,
    pub notify: mpsc::UnboundedSender<HandlerMsg>,
    pub events: EventSink,
}

enum Halt {
    Cancelled,
    Failed(ErrorRecord),
}

type Step<T> = std::result::Result<T, Halt>;

struct Spoken {
    halt: Option<Halt>,
    text: String,
    frames: usize,
}

pub(crate) async fn run_turn(ctx: TurnContext) -> TurnReport {
    let (seg_tx, seg_rx) = mpsc::unbounded_channel();
    let kind = match ctx.source {
        TurnSource::Reply { .. } => TurnKind::Reply,
        TurnSource::Canned(_) => TurnKind::Canned,
    };

    let produce = async {
        let result = produce_segments(&ctx, seg_tx).await;
        if matches!(result, Err(Halt::Failed(_))) {
            ctx.cancel.cancel();
        }
        result
    };
    let speak = async {
        let spoken = speak_segments(&ctx, seg_rx).await;
        if matches!(spoken.halt, Some(Halt::Failed(_))) {
            ctx.cancel.cancel();
        }
        spoken
    };
    let (produced, spoken) = tokio::join!(produce, speak);

    let outcome = match (produced, spoken.halt) {
        (Err(Halt::Failed(e)), _) | (_, Some(Halt::Failed(e))) => TurnOutcome::Failed(e),
        (Err(Halt::Cancelled), _) | (_, Some(Halt::Cancelled)) => TurnOutcome::Interrupted,
        (Ok(()), None) => TurnOutcome::Completed,
    };
    debug!(
        call_id = %ctx.call_id,
        turn = ctx.turn_id,
        frames = spoken.frames,
        ?outcome,
        "turn finished"
    );
    TurnReport {
        turn_id: ctx.turn_id,
        kind,
        user_text: ctx.user_text.clone(),
        assistant_text: spoken.text,
        frames: spoken.frames,
        outcome,
    }
}

async fn produce_segments(ctx: &TurnContext, seg_tx: mpsc::UnboundedSender<TextSegment>) -> Step<()> {
    let (llm, system_prompt, history, options, first_token_timeout) = match &ctx.source {
        TurnSource::Canned(text) => {
            for seg in segment(text, &ctx.segmenter) {
                let _ = seg_tx.send(seg);
            }
            return Ok(());
        }
        TurnSource::Reply {
            llm,
            system_prompt,
            history,
            options,
            first_token_timeout,
        } => (llm, system_prompt, history, options, *first_token_timeout),
    };

    // One deadline covers both the request and the first fragment.
    let deadline = Instant::now() + first_token_timeout;
    let first_token_expired = || {
        Halt::Failed(ErrorRecord::recoverable(
            Stage::LanguageModel,
            format!("no reply within {}s", first_token_timeout.as_secs_f32()),
        ))
    };

    let mut stream = tokio::select! {
        () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
        res = timeout_at(deadline, llm.query(system_prompt, history, options)) => match res {
            Err(_) => return Err(first_token_expired()),
            Ok(Err(e)) => return Err(Halt::Failed(e.escalate())),
            Ok(Ok(stream)) => stream,
        },
    };

    let mut segmenter = StreamingSegmenter::new(ctx.segmenter.clone());
    let mut first = true;
    loop {
        let next = if first {
            first = false;
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
                res = timeout_at(deadline, stream.next()) => match res {
                    Err(_) => return Err(first_token_expired()),
                    Ok(next) => next,
                },
            }
        } else {
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
                next = stream.next() => next,
            }
        };
        match next {
            Some(Ok(fragment)) => {
                trace!(turn = ctx.turn_id, %fragment, "reply fragment");
                for seg in segmenter.push(&fragment) {
                    let _ = seg_tx.send(seg);
                }
            }
            Some(Err(e)) => return Err(Halt::Failed(e.escalate())),
            None => break,
        }
    }
    if let Some(seg) = segmenter.finish() {
        let _ = seg_tx.send(seg);
    }
    Ok(())
}

async fn speak_segments(ctx: &TurnContext, mut seg_rx: mpsc::UnboundedReceiver<TextSegment>) -> Spoken {
    let mut spoken = Spoken {
        halt: None,
        text: String::new(),
        frames: 0,
    };
    match speak_all(ctx, &mut seg_rx, &mut spoken).await {
        Ok(()) => {}
        Err(halt) => spoken.halt = Some(halt),
    }
    spoken
}

async fn speak_all(
    ctx: &TurnContext,
    seg_rx: &mut mpsc::UnboundedReceiver<TextSegment>,
    spoken: &mut Spoken,
) -> Step<()> {
    let mut announced = false;
    loop {
        let seg = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
            seg = seg_rx.recv() => seg,
        };
        let Some(seg) = seg else { break };
        let text = seg.speakable();
        if text.is_empty() {
            continue;
        }
        ctx.events.emit(RuntimeEvent::AssistantSegment {
            call_id: ctx.call_id.clone(),
            turn: ctx.turn_id,
            index: seg.index,
            text: text.to_owned(),
            is_last: seg.is_last,
        });

        let mut frames = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
            res = ctx.synth.synthesize(text, ctx.cancel.child_token()) => {
                res.map_err(|e| Halt::Failed(e.escalate()))?
            }
        };
        loop {
            let frame = tokio::select! {
                () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
                frame = frames.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(Halt::Failed(e.escalate())),
                None => break,
            };
            if !announced {
                announced = true;
                let _ = ctx.notify.send(HandlerMsg::TurnSpeaking(ctx.turn_id));
            }
            let item = PlayoutItem::Frame {
                turn_id: ctx.turn_id,
                frame,
            };
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(Halt::Cancelled),
                res = ctx.playout.send(item) => {
                    if res.is_err() {
                        return Err(Halt::Cancelled);
                    }
                }
            }
            spoken.frames += 1;
        }
        spoken.text.push_str(&seg.text);
    }
    tokio::select! {
        () = ctx.cancel.cancelled() => Err(Halt::Cancelled),
        res = ctx.playout.send(PlayoutItem::EndOfTurn(ctx.turn_id)) => {
            if res.is_err() { Err(Halt::Cancelled) } else { Ok(()) }
        }
    }
}
