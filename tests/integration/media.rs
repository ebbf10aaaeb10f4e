//! Audio over RTP: barge-in and voicemail capture.

use crate::helpers::{BridgeOptions, Phone, WAIT, drain_events, start_bridge, start_bridge_with, wait_until};
use std::time::Duration;
use voxbridge::RuntimeEvent;
use voxbridge::pipeline::ConversationState;
use voxbridge::providers::scripted::{ScriptedReply, ScriptedSynthesizerFactory};
use voxbridge::sip::CallState;

#[tokio::test]
async fn caller_speech_interrupts_reply() {
    let options = BridgeOptions {
        replies: vec![ScriptedReply::fragments(["Let me tell you a long story."])],
        synth: ScriptedSynthesizerFactory::default().with_frames(200),
        ..BridgeOptions::default()
    };
    let mut t = start_bridge_with(options, |_| {}).await;
    let manager = t.bridge.manager();
    let mut phone = Phone::new(t.bridge.sip_addr()).await;

    let ok = phone.call("barge-1", "100").await;
    assert!(wait_until(WAIT, || manager.handler("barge-1").is_some()).await);
    let handler = manager.handler("barge-1").unwrap();
    assert!(wait_until(WAIT, || t.stt.is_running()).await);

    t.stt.final_text("tell me a story");
    assert!(handler.wait_for_state(ConversationState::Speaking, WAIT).await);
    let before = phone.collect_rtp(Duration::from_millis(200)).await;
    assert!(!before.is_empty());

    phone.send_audio(t.bridge.media_addr(), 8000, 25).await;
    assert!(handler.wait_for_state(ConversationState::Listening, WAIT).await);

    // Playback stops well short of the 200 synthesized frames.
    let _ = phone.collect_rtp(Duration::from_millis(100)).await;
    let after = phone.collect_rtp(Duration::from_millis(500)).await;
    assert!(after.is_empty(), "{} packets after barge-in", after.len());

    let events = drain_events(&mut t.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::BargeIn { call_id, .. } if call_id == "barge-1"))
    );

    phone.hang_up("barge-1", &ok).await;
    manager.settle().await;
    let turns = t.store.turns("barge-1");
    assert_eq!(turns.len(), 1);
    assert!(turns[0].interrupted);
}

#[tokio::test]
async fn media_before_ack_is_ignored() {
    let t = start_bridge(|_| {}).await;
    let manager = t.bridge.manager();
    let media = t.bridge.media();
    let mut phone = Phone::new(t.bridge.sip_addr()).await;

    phone.send(&phone.invite("early-1", "100")).await;
    let ok = phone.expect_for(200, "INVITE").await;
    assert_eq!(manager.call_state("early-1"), Some(CallState::Answering));

    // Answered but not yet acknowledged: no route, no handler, nothing heard.
    phone.send_audio(t.bridge.media_addr(), 3000, 25).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(media.route_count(), 0);
    assert!(manager.handler("early-1").is_none());
    assert_eq!(t.stt.start_count(), 0);
    assert_eq!(t.stt.fed_samples(), 0);

    phone.send(&phone.in_dialog("ACK", 1, "early-1", &ok)).await;
    assert!(wait_until(WAIT, || manager.handler("early-1").is_some()).await);
    assert_eq!(media.route_count(), 1);
    assert!(wait_until(WAIT, || t.stt.is_running()).await);
    phone.send_audio(t.bridge.media_addr(), 3000, 25).await;
    assert!(wait_until(WAIT, || t.stt.fed_samples() > 0).await);

    phone.hang_up("early-1", &ok).await;
    manager.settle().await;
    assert_eq!(media.route_count(), 0);
}

#[tokio::test]
async fn voicemail_scheme_records_message() {
    let t = start_bridge(|_| {}).await;
    let manager = t.bridge.manager();
    let mut phone = Phone::new(t.bridge.sip_addr()).await;

    let ok = phone.call("vm-1", "200").await;
    assert!(wait_until(WAIT, || manager.handler("vm-1").is_some()).await);
    // The prompt is played before recording starts.
    let prompt = phone.collect_rtp(Duration::from_millis(500)).await;
    assert_eq!(prompt.len(), 5);
    assert_eq!(t.synth.texts(), vec!["Beep".to_owned()]);

    let handler = manager.handler("vm-1").unwrap();
    assert!(handler.wait_for_state(ConversationState::Recording, WAIT).await);
    assert!(wait_until(WAIT, || t.stt.is_running()).await);
    phone.send_audio(t.bridge.media_addr(), 3000, 25).await;
    assert!(wait_until(WAIT, || t.stt.fed_samples() > 0).await);
    assert!(t.stt.final_text("please call me back"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    phone.hang_up("vm-1", &ok).await;
    manager.settle().await;

    let voicemails = t.store.voicemails();
    assert_eq!(voicemails.len(), 1);
    assert_eq!(voicemails[0].call_id, "vm-1");
    assert_eq!(voicemails[0].called, "200");
    assert_eq!(voicemails[0].transcript, "please call me back");
    let path = voicemails[0].recording_path.clone().unwrap();
    assert!(path.starts_with(t.dir.path()));
    assert!(path.exists());

    let call = t.store.call("vm-1").unwrap();
    assert_eq!(call.recording_attachments, 1);
    assert_eq!(call.recording.as_deref(), Some(path.as_path()));
    assert!(t.llm.queries().is_empty());
}
