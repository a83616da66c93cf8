use serde_yaml::{Mapping, Value};

const DEFAULT_CONTROLLED_CONFIG: &str = r#"
mixed-port: 7890
socks-port: 7891
port: 0
redir-port: 0
tproxy-port: 0
allow-lan: false
bind-address: "*"
mode: rule
log-level: info
ipv6: true
unified-delay: true
tcp-concurrent: true
find-process-mode: strict
external-controller: 127.0.0.1:9090
external-ui: ui
external-ui-name: metacubexd
external-ui-url: https://github.com/MetaCubeX/metacubexd/archive/refs/heads/gh-pages.zip
profile:
  store-selected: true
  store-fake-ip: true
tun:
  enable: false
  device: Mihomo
  stack: mixed
  auto-route: true
  auto-redirect: false
  auto-detect-interface: true
  dns-hijack:
    - any:53
  route-exclude-address: []
  mtu: 1500
dns:
  enable: true
  ipv6: false
  enhanced-mode: fake-ip
  fake-ip-range: 198.18.0.1/16
  fake-ip-filter:
    - "*"
    - "+.lan"
    - "+.local"
    - "time.*.com"
    - "ntp.*.com"
    - "+.market.xiaomi.com"
  use-hosts: false
  use-system-hosts: false
  respect-rules: false
  default-nameserver:
    - tls://223.5.5.5
  nameserver:
    - https://doh.pub/dns-query
    - https://dns.alidns.com/dns-query
  proxy-server-nameserver:
    - https://doh.pub/dns-query
    - https://dns.alidns.com/dns-query
  direct-nameserver: []
sniffer:
  enable: true
  parse-pure-ip: true
  force-dns-mapping: true
  override-destination: false
  sniff:
    HTTP:
      ports: [80, 443]
      override-destination: false
    TLS:
      ports: [443]
    QUIC:
      ports: [443]
  skip-domain:
    - "+.push.apple.com"
"#;

/// 内置的受控配置，持久化文件缺失或损坏时使用。
pub fn controlled_config() -> Value {
    serde_yaml::from_str(DEFAULT_CONTROLLED_CONFIG)
        .unwrap_or_else(|_| Value::Mapping(Mapping::new()))
}

pub fn dns() -> Value {
    section("dns")
}

pub fn sniffer() -> Value {
    section("sniffer")
}

fn section(key: &str) -> Value {
    controlled_config()
        .as_mapping_mut()
        .and_then(|m| m.remove(key))
        .unwrap_or_else(|| Value::Mapping(Mapping::new()))
}
