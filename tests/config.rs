use std::io::Write;

use chacha::config;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_full_config_round_trip() {
    let file = write_config(
        r#"
server:
  addr: "127.0.0.1:8080"
  read_header_timeout: 10s
logger:
  level: debug
disk:
  dir: /var/cache/chacha
  limit_bytes: 1073741824
tls:
  cert: /etc/chacha/ca.crt
  key: /etc/chacha/ca.key
rules:
  - pattern: "^https://registry\\.example\\.com/.*$"
    ignore_authorization_header: true
    ignored_parameters: [token, signature]
    direct_connect: true
cluster:
  secret: super-secret
  nodes:
    - addr: "10.0.0.1:8080"
    - addr: "10.0.0.2:8080"
"#,
    );

    let (cfg, ignored) = config::load(file.path()).expect("load");
    assert!(ignored.is_empty());

    assert_eq!(cfg.server.addr, "127.0.0.1:8080");
    assert_eq!(cfg.server.read_header_timeout, std::time::Duration::from_secs(10));
    assert_eq!(cfg.logger.level, "debug");
    assert_eq!(cfg.disk.dir, "/var/cache/chacha");
    assert_eq!(cfg.disk.limit_bytes, 1_073_741_824);

    let tls = cfg.tls.as_ref().expect("tls section");
    assert_eq!(tls.cert, "/etc/chacha/ca.crt");

    assert_eq!(cfg.rules.len(), 1);
    assert!(cfg.rules[0].ignore_authorization_header);
    assert_eq!(cfg.rules[0].ignored_parameters, ["token", "signature"]);
    assert!(cfg.rules[0].direct_connect);

    let cluster = cfg.cluster.as_ref().expect("cluster section");
    assert_eq!(cluster.secret, "super-secret");
    assert_eq!(cluster.nodes.len(), 2);

    cfg.validate().expect("validate");
}

#[test]
fn test_unknown_fields_are_reported() {
    let file = write_config(
        r#"
server:
  addr: "127.0.0.1:8080"
  no_such_option: true
"#,
    );

    let (_, ignored) = config::load(file.path()).expect("load");
    assert_eq!(ignored, ["server.no_such_option".to_string()]);
}

#[test]
fn test_validation_catches_incomplete_sections() {
    // Missing listen address
    let file = write_config("logger:\n  level: info\n");
    let (cfg, _) = config::load(file.path()).expect("load");
    assert!(cfg.validate().is_err());

    // Disk dir without a size limit
    let file = write_config("server:\n  addr: \"127.0.0.1:8080\"\ndisk:\n  dir: /tmp/cache\n");
    let (cfg, _) = config::load(file.path()).expect("load");
    assert!(cfg.validate().is_err());

    // Cluster without a secret
    let file = write_config(
        "server:\n  addr: \"127.0.0.1:8080\"\ncluster:\n  secret: \"\"\n  nodes:\n    - addr: \"10.0.0.1:8080\"\n",
    );
    let (cfg, _) = config::load(file.path()).expect("load");
    assert!(cfg.validate().is_err());

    // Cluster without members
    let file = write_config("server:\n  addr: \"127.0.0.1:8080\"\ncluster:\n  secret: s\n  nodes: []\n");
    let (cfg, _) = config::load(file.path()).expect("load");
    assert!(cfg.validate().is_err());
}
