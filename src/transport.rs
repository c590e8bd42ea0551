use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "rustls")]
use {
    anyhow::anyhow,
    rustls_pemfile::{certs, private_key},
    std::{fs, io::BufReader, path::Path, sync::Arc},
    tokio_rustls::{
        rustls::{pki_types::ServerName, ClientConfig, RootCertStore, ServerConfig},
        TlsAcceptor, TlsConnector,
    },
};

const KEEPALIVE_TIME: Duration = Duration::from_secs(20);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

/// ピア接続として扱えるストリーム
///
/// ノードのタスクは `&self` を跨いで await するので `Sync` も要る
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// ピア間の通信路
#[derive(Clone)]
pub enum Transport {
    /// 平文TCP
    Plain,

    /// 自己署名証明書によるTLS
    #[cfg(feature = "rustls")]
    Tls {
        acceptor: TlsAcceptor,
        connector: TlsConnector,
    },
}

impl Transport {
    /// `keygen` で生成した証明書と鍵からTLSトランスポートを作成
    ///
    /// 証明書は自分のサーバー証明書であると同時に、相手を検証するルートにもなる
    #[cfg(feature = "rustls")]
    pub fn tls(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read(cert_path)
            .with_context(|| format!("Failed to read certificate {:?}", cert_path))?;
        let key_pem =
            fs::read(key_path).with_context(|| format!("Failed to read key {:?}", key_path))?;

        let cert_chain = certs(&mut BufReader::new(&*cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid certificate PEM in {:?}", cert_path))?;
        if cert_chain.is_empty() {
            return Err(anyhow!("No certificate found in {:?}", cert_path));
        }

        let key = private_key(&mut BufReader::new(&*key_pem))
            .with_context(|| format!("Invalid key PEM in {:?}", key_path))?
            .ok_or_else(|| anyhow!("No private key found in {:?}", key_path))?;

        let mut roots = RootCertStore::empty();
        let (added, _) = roots.add_parsable_certificates(cert_chain.clone());
        if added == 0 {
            return Err(anyhow!("No usable trust root in {:?}", cert_path));
        }

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("Failed to build TLS server config")?;

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Transport::Tls {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain)
    }

    /// 受け付けたTCP接続をピアストリームにする
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        tune_socket(&stream)?;
        match self {
            Transport::Plain => Ok(Box::new(stream)),
            #[cfg(feature = "rustls")]
            Transport::Tls { acceptor, .. } => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake failed (server side)")?;
                Ok(Box::new(tls))
            }
        }
    }

    /// ピアに接続
    pub async fn connect(&self, addr: SocketAddr) -> Result<BoxedStream> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        tune_socket(&stream)?;
        debug!("TCP connected to {}", addr);

        match self {
            Transport::Plain => Ok(Box::new(stream)),
            #[cfg(feature = "rustls")]
            Transport::Tls { connector, .. } => {
                let name = ServerName::IpAddress(addr.ip().into());
                let tls = connector
                    .connect(name, stream)
                    .await
                    .with_context(|| format!("TLS handshake with {} failed", addr))?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Nagleを切り、TCP keepaliveを有効にする
fn tune_socket(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .with_context(|| "Failed to set TCP_NODELAY")?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .with_context(|| "Failed to set TCP keepalive")?;

    Ok(())
}
