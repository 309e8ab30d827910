//! Owner-side signing against node-side verification, for both address
//! families, plus the price an honest owner would pay.

use skyfleet_common::crypto::{
    bitcoin_address, ethereum_address, sign_bitcoin_message, sign_ethereum_message,
};
use skyfleet_common::{content_hash, CryptoError, MessageVerifier, PriceTable};
use skyfleet_proto::{
    ApplicationMessage, ApplicationSpecification, ComponentSpecification, ContainerData, MessageKind,
};

const SECRET: [u8; 32] = [11u8; 32];

fn spec(owner: &str) -> ApplicationSpecification {
    ApplicationSpecification {
        version: 4,
        name: "Shop".to_string(),
        description: String::new(),
        owner: owner.to_string(),
        instances: 3,
        expire: None,
        registration_height: 0,
        enterprise: false,
        geolocation: vec![],
        nodes: vec![],
        tiered: false,
        components: vec![ComponentSpecification {
            name: "web".to_string(),
            description: String::new(),
            repotag: "runonflux/website:latest".to_string(),
            ports: vec![31000],
            container_ports: vec![80],
            environment: vec![],
            commands: vec![],
            container_data: ContainerData::local("/appdata"),
            cpu: 0.5,
            ram: 500.0,
            hdd: 5.0,
            tiered_resources: None,
        }],
    }
}

fn unsigned(owner: &str) -> ApplicationMessage {
    ApplicationMessage {
        hash: String::new(),
        kind: MessageKind::Register,
        version: 4,
        specification: spec(owner),
        owner_address: owner.to_string(),
        signature: String::new(),
        timestamp: 1_700_000_000_000,
        height: None,
        value_paid: None,
    }
}

fn seal(mut message: ApplicationMessage, signature: String) -> ApplicationMessage {
    message.signature = signature;
    message.hash = content_hash(&message).expect("hash");
    message
}

#[test]
fn test_ethereum_owner_round_trip() {
    let owner = ethereum_address(&SECRET).expect("address");
    let message = unsigned(&owner);
    let payload = message.signing_payload().expect("payload");
    let message = seal(message, sign_ethereum_message(&SECRET, payload.as_bytes()).expect("sign"));

    assert!(MessageVerifier::new().verify(&message).is_ok());
}

#[test]
fn test_bitcoin_owner_round_trip() {
    let owner = bitcoin_address(&SECRET, true).expect("address");
    let message = unsigned(&owner);
    let payload = message.signing_payload().expect("payload");
    let message = seal(message, sign_bitcoin_message(&SECRET, payload.as_bytes(), true).expect("sign"));

    assert!(MessageVerifier::new().verify(&message).is_ok());
}

#[test]
fn test_resealed_tamper_fails_signature() {
    let owner = ethereum_address(&SECRET).expect("address");
    let message = unsigned(&owner);
    let payload = message.signing_payload().expect("payload");
    let mut message = seal(message, sign_ethereum_message(&SECRET, payload.as_bytes()).expect("sign"));

    // A relay that edits the spec and recomputes the hash still can't sign
    message.specification.instances = 30;
    message.hash = content_hash(&message).expect("hash");
    let err = MessageVerifier::new().verify(&message).expect_err("tampered");
    assert!(!matches!(err, CryptoError::HashMismatch { .. }));
}

#[test]
fn test_default_price_of_small_app() {
    let owner = ethereum_address(&SECRET).expect("address");
    // 0.5 * 0.3 * 10 + 500 * 0.1 / 100 + 5 * 0.05 = 2.25
    let price = PriceTable::default().app_price(&spec(&owner), 100, 22_000).expect("price");
    assert!((price - 2.25).abs() < 1e-9);
}
