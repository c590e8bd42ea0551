use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_MAX_HOPS: u16 = 16;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 20;

/// 設定ファイル全体
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub node: NodeConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// 待ち受けるホスト
    pub bind: IpAddr,
    /// 他ノードに名乗るホスト。未指定なら `bind`、`bind` が 0.0.0.0 などならループバック
    pub advertise: Option<IpAddr>,
    pub port: u16,
    pub peers: Vec<SocketAddr>,
    /// ブロードキャストを転送する最大ホップ数
    pub max_hops: u16,
    pub heartbeat_interval_secs: u64,
    /// ピアへの接続を諦めるまでの秒数。未指定なら無限に再試行
    pub connect_timeout_secs: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise: None,
            port: DEFAULT_PORT,
            peers: Vec::new(),
            max_hops: DEFAULT_MAX_HOPS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            connect_timeout_secs: None,
        }
    }
}

impl NodeConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// ノードのアドレスとして使うホスト
    pub fn advertise_ip(&self) -> IpAddr {
        match self.advertise {
            Some(ip) => ip,
            None if !self.bind.is_unspecified() => self.bind,
            None if self.bind.is_ipv4() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: PathBuf::from("keys/key.cert"),
            key: PathBuf::from("keys/key.pkey"),
        }
    }
}

/// コマンドラインからの上書き値
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<IpAddr>,
    pub advertise: Option<IpAddr>,
    pub port: Option<u16>,
    pub peers: Option<Vec<SocketAddr>>,
    pub max_hops: Option<u16>,
    /// 設定ファイルに関わらずTLSを有効にする
    pub tls: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s).with_context(|| "Failed to parse the config")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Config> {
        let s = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read the config {:?}", path))?;
        Config::from_toml(&s).with_context(|| format!("Invalid config {:?}", path))
    }

    /// CLIの値を設定ファイルの値より優先する
    pub fn merge_cli(mut self, o: Overrides) -> Result<Config> {
        if let Some(bind) = o.bind {
            self.node.bind = bind;
        }
        if let Some(advertise) = o.advertise {
            self.node.advertise = Some(advertise);
        }
        if let Some(port) = o.port {
            self.node.port = port;
        }
        if let Some(peers) = o.peers {
            self.node.peers = peers;
        }
        if let Some(max_hops) = o.max_hops {
            self.node.max_hops = max_hops;
        }
        if o.tls {
            self.tls.enabled = true;
        }
        if let Some(cert) = o.cert {
            self.tls.cert = cert;
        }
        if let Some(key) = o.key {
            self.tls.key = key;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.node.heartbeat_interval_secs == 0 {
            anyhow::bail!("`heartbeat_interval_secs` must be greater than 0");
        }
        if self.node.max_hops == 0 {
            anyhow::bail!("`max_hops` must be greater than 0");
        }
        if self.node.advertise.map_or(false, |ip| ip.is_unspecified()) {
            anyhow::bail!("`advertise` must be a concrete address other peers can dial");
        }
        if self.tls.enabled && !cfg!(feature = "rustls") {
            anyhow::bail!("TLS requested but poe_core was built without the `rustls` feature");
        }
        Ok(())
    }
}

/// `127.0.0.1:7001,127.0.0.1:7002` 形式のピア一覧を解析
///
/// 同じアドレスは最初の1つだけ残す
pub fn parse_peer_list(s: &str) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::new();
    for p in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let addr = p
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid peer address `{}`", p))?;
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }
    Ok(peers)
}
