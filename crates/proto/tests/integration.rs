//! Integration tests for the SkyFleet proto crate
//!
//! Container naming, signed content and wire shapes as a peer sees them.

use skyfleet_proto::worker::normalize_endpoint;
use skyfleet_proto::{
    host_of, parse_container_name, ApiEnvelope, ApplicationLocation, ApplicationSpecification,
    ComponentSpecification, ContainerData, ContainerIdentity, PeerMessage, StorageMode,
};

fn component(name: &str, data: &str) -> ComponentSpecification {
    ComponentSpecification {
        name: name.to_string(),
        description: String::new(),
        repotag: "runonflux/website:latest".to_string(),
        ports: vec![31000],
        container_ports: vec![80],
        environment: vec![],
        commands: vec![],
        container_data: ContainerData::parse(data),
        cpu: 0.5,
        ram: 500.0,
        hdd: 5.0,
        tiered_resources: None,
    }
}

fn spec(version: u32, components: Vec<ComponentSpecification>) -> ApplicationSpecification {
    ApplicationSpecification {
        version,
        name: "Shop".to_string(),
        description: "shop".to_string(),
        owner: "0xowner".to_string(),
        instances: 3,
        expire: None,
        registration_height: 0,
        enterprise: false,
        geolocation: vec![],
        nodes: vec![],
        tiered: false,
        components,
    }
}

// ============================================================================
// Container naming
// ============================================================================

#[test]
fn test_container_names_parse_back() {
    let app = spec(4, vec![component("web", "/appdata"), component("db", "r:/var/lib/db")]);

    // Step 1: every compose component gets its own container
    let names = app.container_names();
    assert_eq!(names, vec!["fluxweb_Shop".to_string(), "fluxdb_Shop".to_string()]);

    // Step 2: each name parses back to the owning app
    for (name, comp) in names.iter().zip(["web", "db"]) {
        let identity = parse_container_name(name).expect("managed container");
        assert_eq!(identity, ContainerIdentity { app: "Shop".into(), component: Some(comp.into()) });
    }

    // Step 3: only the replicated component is listed as such
    let replicated: Vec<&str> = app.replicated_components().map(|c| c.name.as_str()).collect();
    assert_eq!(replicated, vec!["db"]);
    assert!(app.has_replicated_storage());
}

#[test]
fn test_legacy_and_foreign_containers() {
    assert_eq!(parse_container_name("/zelShop").map(|i| i.app), Some("Shop".to_string()));
    assert_eq!(spec(3, vec![component("web", "/appdata")]).container_names(), vec!["fluxShop".to_string()]);
    assert!(parse_container_name("nginx").is_none());
    assert!(parse_container_name("flux").is_none());
    assert!(parse_container_name("flux_Shop").is_none());
}

// ============================================================================
// Signed content
// ============================================================================

#[test]
fn test_registration_height_outside_signed_content() {
    let mut app = spec(4, vec![component("web", "/appdata")]);
    let before = app.canonical_json().expect("canonical");

    app.registration_height = 1_234;
    assert_eq!(app.canonical_json().expect("canonical"), before);

    app.instances = 5;
    assert_ne!(app.canonical_json().expect("canonical"), before);
}

#[test]
fn test_storage_markers_survive_json() {
    let json = serde_json::json!({
        "version": 4,
        "name": "Vault",
        "owner": "0xowner",
        "instances": 3,
        "components": [{
            "name": "db",
            "repotag": "library/postgres:16",
            "container_data": "g:/var/lib/postgresql",
            "cpu": 1.0, "ram": 1000.0, "hdd": 20.0
        }]
    });
    let app: ApplicationSpecification = serde_json::from_value(json).expect("parse");
    assert_eq!(app.components[0].storage_mode(), StorageMode::Replicated);

    // g: is written back as r:
    let back = serde_json::to_value(&app).expect("ser");
    assert_eq!(back["components"][0]["container_data"], "r:/var/lib/postgresql");
}

// ============================================================================
// Wire shapes
// ============================================================================

#[test]
fn test_peer_message_is_tagged() {
    let msg = PeerMessage::AppRunning(vec![ApplicationLocation {
        name: "Shop".into(),
        hash: "abc".into(),
        ip: "10.0.0.1:16127".into(),
        broadcasted_at: 1_000,
        running_since: None,
        expire_at: 2_000,
    }]);
    let v = serde_json::to_value(&msg).expect("ser");
    assert_eq!(v["type"], "app_running");
    assert!(v["data"][0].get("running_since").is_none());

    let back: PeerMessage = serde_json::from_value(v).expect("de");
    assert_eq!(back, msg);
}

#[test]
fn test_endpoints() {
    assert_eq!(normalize_endpoint(" 10.0.0.1 "), "10.0.0.1:16127");
    assert_eq!(normalize_endpoint("10.0.0.1:16137"), "10.0.0.1:16137");
    assert_eq!(host_of("10.0.0.1:16137"), "10.0.0.1");
    assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
}

#[test]
fn test_envelopes() {
    let ok = serde_json::to_value(ApiEnvelope::success("Application Shop removed")).expect("ser");
    assert_eq!(ok["status"], "success");
    assert_eq!(ok["data"]["code"], 200);

    let busy = ApiEnvelope::error(409, "Busy", "removal in progress");
    assert!(!busy.is_success());
    assert_eq!(busy.data.code, 409);
}
