//! Capability manifest behavior: registry mutations surface on the public
//! card, the deprecated path stays served, and readers always see a
//! complete document.

mod common;

use std::time::Duration;

use common::{register_camera, test_broker, test_config, DeviceBehavior};
use fleetlink::types::AgentCard;

/// Poll the card until `pred` holds or the freshness bound is blown.
async fn wait_for_card(
    base: &str,
    pred: impl Fn(&AgentCard) -> bool,
) -> AgentCard {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let card: AgentCard = client
            .get(format!("{}/.well-known/agent-card.json", base))
            .send()
            .await
            .expect("card fetch")
            .json()
            .await
            .expect("card parse");
        if pred(&card) {
            return card;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "card did not refresh within the freshness bound"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn registering_a_device_adds_a_tagged_skill() {
    let broker = test_broker(test_config(), None).await;
    let base = common::serve(&broker).await;

    let _device = register_camera(&broker, "cam-1", DeviceBehavior::ReplyFile).await;

    let card = wait_for_card(&base, |card| {
        card.skills.iter().any(|s| s.id == "device:cam-1")
    })
    .await;

    let skill = card
        .skills
        .iter()
        .find(|s| s.id == "device:cam-1")
        .expect("device skill");
    assert!(skill.tags.contains(&"photo".to_string()));
    assert!(skill.description.contains("cam-1"));
    assert!(skill
        .output_modes
        .as_ref()
        .expect("output modes")
        .contains(&"image/jpeg".to_string()));
}

#[tokio::test]
async fn deregistering_a_device_removes_its_skill() {
    let broker = test_broker(test_config(), None).await;
    let base = common::serve(&broker).await;

    let _device = register_camera(&broker, "cam-1", DeviceBehavior::ReplyFile).await;
    wait_for_card(&base, |card| {
        card.skills.iter().any(|s| s.id == "device:cam-1")
    })
    .await;

    broker.registry().deregister("cam-1").await.expect("deregister");
    wait_for_card(&base, |card| {
        !card.skills.iter().any(|s| s.id == "device:cam-1")
    })
    .await;
}

#[tokio::test]
async fn card_declares_identity_and_capabilities() {
    let broker = test_broker(test_config(), None).await;
    let base = common::serve(&broker).await;

    let card = wait_for_card(&base, |_| true).await;
    assert_eq!(card.preferred_transport, "JSONRPC");
    assert_eq!(card.protocol_version, "0.3.0");
    assert_eq!(card.capabilities.streaming, Some(true));
    assert_eq!(card.capabilities.push_notifications, Some(true));
    assert!(card.skills.iter().any(|s| s.id == "broker-chat"));
}

#[tokio::test]
async fn deprecated_card_path_still_serves() {
    let broker = test_broker(test_config(), None).await;
    let base = common::serve(&broker).await;

    let card: AgentCard = reqwest::Client::new()
        .get(format!("{}/.well-known/agent.json", base))
        .send()
        .await
        .expect("card fetch")
        .json()
        .await
        .expect("card parse");
    assert_eq!(card.name, "fleetlink");
}
