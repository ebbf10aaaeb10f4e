//! INVITEs the bridge refuses, and requests outside any dialog.

use crate::helpers::{BridgeOptions, Phone, WAIT, start_bridge, start_bridge_with, wait_until, within};
use tokio::sync::mpsc;
use voxbridge::sip::{CallState, Method, SipMessage};
use voxbridge::store::MemoryStore;

fn failed(store: &MemoryStore, call_id: &str) -> bool {
    store
        .call(call_id)
        .is_some_and(|c| c.status == CallState::Failed)
}

#[tokio::test]
async fn unmatched_number_gets_404() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;

    phone.send(&phone.invite("nope-1", "999")).await;
    let response = phone.recv().await.unwrap();
    match response {
        SipMessage::Response(r) => assert_eq!(r.status, 404),
        other => panic!("expected 404, got {other:?}"),
    }
    assert_eq!(t.store.call_count(), 0);
    assert_eq!(t.bridge.manager().call_count(), 0);
}

#[tokio::test]
async fn disabled_scheme_is_not_answered() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;

    phone.send(&phone.invite("off-1", "400")).await;
    phone.expect_status(404).await;
    assert_eq!(t.store.call_count(), 0);
}

#[tokio::test]
async fn unmatched_invite_is_handed_to_passthrough() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = BridgeOptions {
        passthrough: Some(tx),
        ..BridgeOptions::default()
    };
    let t = start_bridge_with(options, |_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;

    phone.send(&phone.invite("pass-1", "999")).await;
    let (request, src) = within(rx.recv()).await.unwrap();
    assert_eq!(request.method, Method::Invite);
    assert_eq!(request.call_id(), Some("pass-1"));
    assert_eq!(src, phone.sip_addr());
    assert_eq!(t.store.call_count(), 0);
}

#[tokio::test]
async fn missing_assistant_rejects_503_and_records_failure() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let invite = phone.invite("ghost-1", "300");

    phone.send(&invite).await;
    phone.expect_status(100).await;
    let rejected = phone.expect_for(503, "INVITE").await;
    assert!(rejected.headers.get("To").unwrap().contains("tag="));

    assert!(wait_until(WAIT, || failed(&t.store, "ghost-1")).await);
    let call = t.store.call("ghost-1").unwrap();
    assert_eq!(call.status_history, vec![CallState::Ringing, CallState::Failed]);
    assert!(call.ended_at.is_some());
    assert_eq!(t.bridge.manager().call_count(), 0);

    // A retransmission gets the same final response without a new record.
    phone.send(&invite).await;
    let replay = phone.recv().await.unwrap();
    match replay {
        SipMessage::Response(r) => {
            assert_eq!(r.status, 503);
            assert_eq!(r.headers.get("To"), rejected.headers.get("To"));
        }
        other => panic!("expected replayed 503, got {other:?}"),
    }
    assert_eq!(t.store.call_count(), 1);
}

#[tokio::test]
async fn offer_without_pcmu_gets_488() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;

    let sdp = phone.offer("8");
    phone
        .send(&phone.invite_with_sdp("alaw-1", "100", &sdp))
        .await;
    phone.expect_for(488, "INVITE").await;
    assert!(wait_until(WAIT, || failed(&t.store, "alaw-1")).await);
}

#[tokio::test]
async fn bye_for_unknown_dialog_gets_481() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let me = phone.sip_addr();

    phone
        .send(&format!(
            "BYE sip:100@{bridge} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-stray\r\n\
             From: <sip:alice@{me}>;tag=a\r\n\
             To: <sip:100@{bridge}>;tag=b\r\n\
             Call-ID: stray-1\r\n\
             CSeq: 2 BYE\r\n\
             Content-Length: 0\r\n\r\n",
            bridge = t.bridge.sip_addr()
        ))
        .await;
    phone.expect_for(481, "BYE").await;
}

#[tokio::test]
async fn unsupported_method_gets_501() {
    let t = start_bridge(|_| {}).await;
    let phone = Phone::new(t.bridge.sip_addr()).await;
    let me = phone.sip_addr();

    phone
        .send(&format!(
            "SUBSCRIBE sip:100@{bridge} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-sub\r\n\
             From: <sip:alice@{me}>;tag=a\r\n\
             To: <sip:100@{bridge}>\r\n\
             Call-ID: sub-1\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             Content-Length: 0\r\n\r\n",
            bridge = t.bridge.sip_addr()
        ))
        .await;
    phone.expect_status(501).await;
}
