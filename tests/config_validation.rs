//! Configuration boundary validation

mod common;

use paqet::config::{derive_key, parse_config, trim_key};

#[test]
fn test_minimal_client_configs_parse() {
    for proto in ["kcp", "quic", "udp"] {
        let yaml = common::client_yaml(proto);
        let config = parse_config(&yaml).unwrap_or_else(|e| {
            panic!("minimal {} config should parse: {}", proto, e)
        });
        assert_eq!(config.transport.conn, 1);
    }
}

#[test]
fn test_conn_bounds() {
    let yaml = common::client_yaml("kcp").replace("protocol: kcp", "conn: 257\n  protocol: kcp");
    let err = parse_config(&yaml).unwrap_err().to_string();
    assert!(err.contains("between 1-256"), "got: {}", err);
}

#[test]
fn test_quic_stream_and_timeout_bounds() {
    let base = common::client_yaml("quic");

    let yaml = base.replace("key: \"integration-test\"", "key: \"k\"\n    max_streams: 70000");
    let err = parse_config(&yaml).unwrap_err().to_string();
    assert!(err.contains("max_streams"), "got: {}", err);

    let yaml = base.replace(
        "key: \"integration-test\"",
        "key: \"k\"\n    idle_timeout: 301",
    );
    let err = parse_config(&yaml).unwrap_err().to_string();
    assert!(err.contains("idle_timeout"), "got: {}", err);
}

#[test]
fn test_auto_requires_two_protocols() {
    let yaml = r#"
role: client
server:
  addr: "203.0.113.10:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.5:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: auto
  quic:
    key: "k"
"#;
    let err = parse_config(yaml).unwrap_err().to_string();
    assert!(err.contains("at least 2 protocol configurations"));

    let yaml = yaml.replace("  quic:\n    key: \"k\"", "  quic:\n    key: \"k\"\n  kcp:\n    key: \"k\"");
    assert!(parse_config(&yaml).is_ok());
}

#[test]
fn test_cipher_requires_key() {
    let yaml = common::client_yaml("udp").replace("key: \"integration-test\"", "block: \"aes\"");
    let err = parse_config(&yaml).unwrap_err().to_string();
    assert!(err.contains("key is required"), "got: {}", err);

    let yaml = common::client_yaml("udp").replace("key: \"integration-test\"", "block: \"none\"");
    assert!(parse_config(&yaml).is_ok());
}

#[test]
fn test_key_derivation_properties() {
    let a = derive_key("passphrase");
    let b = derive_key("passphrase");
    let c = derive_key("other passphrase");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 32);

    assert_eq!(trim_key(&a, "aes-128").len(), 16);
    assert_eq!(trim_key(&a, "aes-192").len(), 24);
    assert_eq!(trim_key(&a, "aes").len(), 32);
}
