// P2Pフラッディングノードと、その検証用スウォームランチャー

pub mod config;
pub mod keygen;
mod node;
mod peer;
mod protocol;
pub mod shell;
pub mod swarm;
pub mod topology;
mod transport;

// パブリックAPI
pub use config::{Config, NodeConfig, Overrides};
pub use node::{Delivery, Node, NodeCommand, RunningNode};
pub use protocol::{NodeMessage, Operation, Packet, Payload};
pub use transport::{BoxedStream, PeerStream, Transport};

use anyhow::Result;

/// 設定からトランスポートを作る
pub fn transport_from_config(config: &Config) -> Result<Transport> {
    if !config.tls.enabled {
        return Ok(Transport::Plain);
    }
    tls_transport(config)
}

#[cfg(feature = "rustls")]
fn tls_transport(config: &Config) -> Result<Transport> {
    Transport::tls(&config.tls.cert, &config.tls.key)
}

#[cfg(not(feature = "rustls"))]
fn tls_transport(_config: &Config) -> Result<Transport> {
    anyhow::bail!("TLS requested but poe_core was built without the `rustls` feature")
}
