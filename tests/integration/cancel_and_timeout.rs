//! Calls that never become active.

use crate::helpers::{Phone, WAIT, start_bridge, wait_until};
use std::time::Duration;
use voxbridge::sip::{CallState, SipMessage};

#[tokio::test]
async fn cancel_while_ringing_terminates_invite() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let manager = t.bridge.manager();

    phone.send(&phone.invite("slow-1", "500")).await;
    phone.expect_status(180).await;
    assert_eq!(manager.call_state("slow-1"), Some(CallState::Answering));

    phone.send(&phone.cancel("slow-1", "500")).await;
    phone.expect_for(200, "CANCEL").await;
    phone.expect_for(487, "INVITE").await;

    manager.settle().await;
    assert_eq!(manager.call_count(), 0);
    assert!(wait_until(WAIT, || {
        t.store
            .call("slow-1")
            .is_some_and(|c| c.status == CallState::Cancelled)
    })
    .await);
    let call = t.store.call("slow-1").unwrap();
    assert_eq!(
        call.status_history,
        vec![CallState::Ringing, CallState::Answering, CallState::Cancelled]
    );
    assert!(call.answered_at.is_none());

    // The ring delay has passed; no 200 OK may follow the 487.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let mut buf = vec![0u8; 4096];
    while let Ok(Ok((len, _))) =
        tokio::time::timeout(Duration::from_millis(50), phone.sip.recv_from(&mut buf)).await
    {
        if let Ok(SipMessage::Response(r)) = SipMessage::parse(&buf[..len]) {
            assert_ne!(r.status, 200, "answered after CANCEL");
        }
    }
    assert_eq!(t.stt.start_count(), 0);
}

#[tokio::test]
async fn cancel_for_unknown_call_gets_481() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;

    phone.send(&phone.cancel("ghost-call", "100")).await;
    phone.expect_for(481, "CANCEL").await;
}

#[tokio::test]
async fn cancel_after_answer_only_acknowledges() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let manager = t.bridge.manager();

    let ok = phone.call("late-1", "100").await;
    assert!(wait_until(WAIT, || manager.handler("late-1").is_some()).await);

    phone.send(&phone.cancel("late-1", "100")).await;
    phone.expect_for(200, "CANCEL").await;
    assert_eq!(manager.call_state("late-1"), Some(CallState::Active));

    phone.hang_up("late-1", &ok).await;
    manager.settle().await;
    assert_eq!(t.store.call("late-1").unwrap().status, CallState::Ended);
}

#[tokio::test]
async fn missing_ack_retransmits_then_hangs_up() {
    let t = start_bridge(|cfg| {
        cfg.signaling.ack_timeout_ms = 400;
        cfg.signaling.retransmit_initial_ms = 50;
        cfg.signaling.retransmit_max_ms = 100;
    })
    .await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let manager = t.bridge.manager();

    phone.send(&phone.invite("noack-1", "100")).await;

    let mut oks = 0;
    let bye = loop {
        match phone.recv().await {
            Some(SipMessage::Response(r))
                if r.status == 200 && r.cseq().is_some_and(|(_, m)| m.as_str() == "INVITE") =>
            {
                oks += 1;
            }
            Some(SipMessage::Request(r)) if r.method.as_str() == "BYE" => break r,
            Some(_) => {}
            None => panic!("no BYE after ACK timeout"),
        }
    };
    assert!(oks >= 3, "expected retransmissions, saw {oks} 200 OK");
    assert_eq!(bye.call_id(), Some("noack-1"));
    phone.ok(&bye).await;

    manager.settle().await;
    assert_eq!(manager.call_count(), 0);
    assert!(manager.handler("noack-1").is_none());
    assert!(wait_until(WAIT, || {
        t.store
            .call("noack-1")
            .is_some_and(|c| c.status == CallState::Failed)
    })
    .await);
    assert_eq!(t.stt.start_count(), 0);
}
