//! Answered calls from INVITE to BYE.

use crate::helpers::{BridgeOptions, Phone, WAIT, drain_events, start_bridge, start_bridge_with, wait_until};
use std::time::Duration;
use voxbridge::pipeline::ConversationState;
use voxbridge::providers::scripted::ScriptedReply;
use voxbridge::sip::CallState;
use voxbridge::RuntimeEvent;

#[tokio::test]
async fn conversation_call_end_to_end() {
    let options = BridgeOptions {
        replies: vec![ScriptedReply::fragments(["We open at nine."])],
        ..BridgeOptions::default()
    };
    let mut t = start_bridge_with(options, |_| {}).await;
    let manager = t.bridge.manager();
    let mut phone = Phone::new(t.bridge.sip_addr()).await;

    phone.send(&phone.invite("happy-1", "100")).await;
    phone.expect_status(100).await;
    let ringing = phone.expect_status(180).await;
    assert!(ringing.headers.get("To").unwrap().contains("tag="));
    let ok = phone.expect_for(200, "INVITE").await;
    let media_port = t.bridge.media_addr().port();
    assert!(ok.body.contains(&format!("m=audio {media_port} RTP/AVP 0")));
    assert!(ok.body.contains("a=rtpmap:0 PCMU/8000"));
    assert!(ok.headers.get("Contact").unwrap().contains("sip:100@127.0.0.1"));
    assert_eq!(manager.call_state("happy-1"), Some(CallState::Answering));

    phone.send(&phone.in_dialog("ACK", 1, "happy-1", &ok)).await;
    assert!(wait_until(WAIT, || manager.handler("happy-1").is_some()).await);
    assert_eq!(manager.call_state("happy-1"), Some(CallState::Active));
    let handler = manager.handler("happy-1").unwrap();
    assert!(handler.wait_for_state(ConversationState::Listening, WAIT).await);

    // Caller audio reaches the transcriber through the media bridge.
    phone.send_audio(t.bridge.media_addr(), 100, 20).await;
    assert!(wait_until(WAIT, || t.stt.fed_samples() >= 1600).await);

    assert!(wait_until(WAIT, || t.stt.is_running()).await);
    assert!(t.stt.final_text("what are your hours"));
    let packets = phone.collect_rtp(Duration::from_millis(600)).await;
    assert_eq!(packets.len(), 5);
    assert!(packets.iter().all(|p| p.payload_type == 0 && p.payload.len() == 160));
    assert!(packets[0].marker);
    assert!(packets.windows(2).all(|w| w[1].sequence == w[0].sequence.wrapping_add(1)));
    assert!(handler.wait_for_state(ConversationState::Listening, WAIT).await);

    phone.hang_up("happy-1", &ok).await;
    manager.settle().await;
    assert_eq!(manager.call_count(), 0);
    assert!(handler.is_stopped());

    let call = t.store.call("happy-1").unwrap();
    assert_eq!(
        call.status_history,
        vec![CallState::Ringing, CallState::Answering, CallState::Active, CallState::Ended]
    );
    assert!(call.answered_at.is_some() && call.ended_at.is_some());
    assert_eq!(call.metadata.caller, "alice");
    assert_eq!(call.metadata.scheme_id, "desk");
    assert_eq!(call.recording_attachments, 1);
    assert!(call.recording.unwrap().exists());

    let turns = t.store.turns("happy-1");
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].user_text, "what are your hours");
    assert_eq!(turns[0].assistant_text, "We open at nine.");

    let states: Vec<CallState> = drain_events(&mut t.events)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::CallState { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![CallState::Ringing, CallState::Answering, CallState::Active, CallState::Ended]
    );

    // A second BYE finds no dialog.
    phone.send(&phone.in_dialog("BYE", 3, "happy-1", &ok)).await;
    phone.expect_for(481, "BYE").await;
}

#[tokio::test]
async fn retransmitted_invite_replays_response() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let invite = phone.invite("dup-1", "100");

    phone.send(&invite).await;
    let first = phone.expect_for(200, "INVITE").await;
    phone.send(&invite).await;
    let second = phone.expect_for(200, "INVITE").await;
    assert_eq!(first.headers.get("To"), second.headers.get("To"));
    assert_eq!(first.body, second.body);
    assert_eq!(t.store.call_count(), 1);

    phone.send(&phone.in_dialog("ACK", 1, "dup-1", &first)).await;
    let manager = t.bridge.manager();
    assert!(wait_until(WAIT, || manager.handler("dup-1").is_some()).await);
    phone.hang_up("dup-1", &first).await;
}

#[tokio::test]
async fn options_lists_supported_methods() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let me = phone.sip_addr();
    phone
        .send(&format!(
            "OPTIONS sip:100@{} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-opt\r\n\
             From: <sip:probe@{me}>;tag=p1\r\n\
             To: <sip:100@{}>\r\n\
             Call-ID: opt-1\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n",
            t.bridge.sip_addr(),
            t.bridge.sip_addr()
        ))
        .await;
    let response = phone.expect_for(200, "OPTIONS").await;
    assert_eq!(response.headers.get("Allow"), Some("INVITE, ACK, BYE, CANCEL, OPTIONS"));
    assert_eq!(t.store.call_count(), 0);
}

#[tokio::test]
async fn max_duration_hangs_up_from_bridge() {
    let t = start_bridge(|cfg| {
        cfg.handler.max_call_duration_secs = 1;
    })
    .await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    phone.call("long-1", "100").await;

    let bye = phone.expect_request("BYE").await;
    assert_eq!(bye.call_id(), Some("long-1"));
    assert!(bye.headers.get("From").unwrap().contains("sip:100@"));
    assert!(bye.headers.get("To").unwrap().contains("tag=phone-long-1"));
    phone.ok(&bye).await;

    let manager = t.bridge.manager();
    manager.settle().await;
    assert_eq!(manager.call_count(), 0);
    let call = t.store.call("long-1").unwrap();
    assert_eq!(call.status, CallState::Ended);
}

#[tokio::test]
async fn bridge_shutdown_hangs_up_active_calls() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    phone.call("shut-1", "100").await;
    let manager = t.bridge.manager();
    assert!(wait_until(WAIT, || manager.handler("shut-1").is_some()).await);

    t.bridge.shutdown().await.unwrap();
    let bye = phone.expect_request("BYE").await;
    assert_eq!(bye.call_id(), Some("shut-1"));
    let call = t.store.call("shut-1").unwrap();
    assert_eq!(call.status, CallState::Ended);
    assert!(manager.handler("shut-1").is_none());
}
