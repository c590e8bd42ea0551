use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::info;

use poe_core::config::{parse_peer_list, Config, Overrides};
use poe_core::keygen::{self, CertParams};
use poe_core::swarm::{self, LaunchOptions, Mode};
use poe_core::topology::{Shape, Topology};
use poe_core::{shell, Node};

#[derive(Parser)]
#[clap(name = "poe_core")]
#[clap(about = "A peer-to-peer flooding node", long_about = None)]
#[clap(args_conflicts_with_subcommands = true)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(flatten)]
    node: NodeArgs,
}

/// サブコマンドなし: ノードとして起動
#[derive(Args)]
struct NodeArgs {
    /// 設定ファイル (TOML)
    #[clap(long)]
    config: Option<PathBuf>,

    /// 待ち受けるホスト
    #[clap(long)]
    bind: Option<IpAddr>,

    /// 他ノードに名乗るホスト (--bind 0.0.0.0 のとき用)
    #[clap(long)]
    advertise: Option<IpAddr>,

    /// 待ち受けるポート
    #[clap(long)]
    port: Option<u16>,

    /// 接続するピア (例: 127.0.0.1:7001,127.0.0.1:7002)
    #[clap(long)]
    peers: Option<String>,

    /// ブロードキャストが通過できる最大リンク数
    #[clap(long)]
    max_hops: Option<u16>,

    /// 対話シェルを起動
    #[clap(long)]
    shell: bool,

    /// ピア間をTLSで暗号化
    #[clap(long)]
    tls: bool,

    /// 証明書 (keygenで生成したkey.cert)
    #[clap(long)]
    cert: Option<PathBuf>,

    /// 秘密鍵 (keygenで生成したkey.pkey)
    #[clap(long)]
    key: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// 自己署名証明書と秘密鍵を生成
    Keygen {
        /// 出力先ディレクトリ
        #[clap(long, default_value = ".")]
        out_dir: PathBuf,

        /// 証明書のCommon Name
        #[clap(long, default_value = "Deluge Daemon")]
        cn: String,

        /// Subject Alternative NameのIPアドレス（複数指定可）
        #[clap(long = "ip")]
        ips: Vec<IpAddr>,

        /// 有効期間（日）
        #[clap(long, default_value = "1095")]
        days: u32,
    },

    /// トポロジーに従ってローカルにノード群を起動
    Swarm {
        /// complete, linear, ladder
        #[clap(long, default_value = "complete")]
        topology: Shape,

        /// ノード数（ladderでは段数）
        #[clap(long, default_value = "10")]
        nodes: u16,

        #[clap(long, default_value = "8000")]
        base_port: u16,

        /// spawn, print, in-process
        #[clap(long, default_value = "spawn")]
        mode: Mode,

        /// 起動するノードの実行ファイル（省略時はこのプログラム自身）
        #[clap(long)]
        binary: Option<PathBuf>,

        #[clap(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// 各ノードに渡す設定ファイル
        #[clap(long)]
        config: Option<PathBuf>,

        /// ピア間をTLSで暗号化
        #[clap(long)]
        tls: bool,

        /// in-processモードで各ノードから挨拶をブロードキャスト
        #[clap(long)]
        greet: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "console")]
    {
        console_subscriber::init();
    }

    #[cfg(not(feature = "console"))]
    {
        // ロギング設定
        let is_atty = atty::is(atty::Stream::Stdout);
        let level = "info";
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::from(level)),
            )
            .with_ansi(is_atty)
            .init();
    }

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    match cli.command {
        Some(Commands::Keygen {
            out_dir,
            cn,
            ips,
            days,
        }) => {
            let params = CertParams {
                common_name: cn,
                ip_sans: if ips.is_empty() {
                    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
                } else {
                    ips
                },
                validity_days: days,
            };
            // RSA鍵の生成は重いのでブロッキングスレッドで
            let bundle = tokio::task::spawn_blocking(move || keygen::generate(&params))
                .await
                .context("Key generation task panicked")??;
            let (key_path, cert_path) = keygen::write_bundle(&bundle, &out_dir)?;
            println!("{}", key_path.display());
            println!("{}", cert_path.display());
        }
        Some(Commands::Swarm {
            topology,
            nodes,
            base_port,
            mode,
            binary,
            host,
            config,
            tls,
            greet,
        }) => {
            let topo = Topology::build(topology, nodes, base_port);
            info!("{} swarm: {} nodes, {} links", topology, topo.len(), topo.edge_count());

            let mut extra_args = Vec::new();
            if let Some(config) = &config {
                extra_args.push("--config".to_string());
                extra_args.push(config.display().to_string());
            }
            if tls {
                extra_args.push("--tls".to_string());
            }

            let binary = match binary {
                Some(binary) => binary,
                None => std::env::current_exe().context("Failed to locate poe_core itself")?,
            };
            let opts = LaunchOptions {
                binary,
                host,
                extra_args,
            };

            match mode {
                Mode::Print => swarm::print_commands(&topo, &opts),
                Mode::Spawn => swarm::spawn_processes(&topo, &opts, shutdown_rx).await?,
                Mode::InProcess => {
                    let config = load_config(config.as_ref())
                        .await?
                        .merge_cli(Overrides {
                            bind: Some(host),
                            tls,
                            ..Default::default()
                        })?;
                    let transport = poe_core::transport_from_config(&config)?;
                    swarm::run_in_process(&topo, &config.node, transport, greet, shutdown_rx)
                        .await?;
                }
            }
        }
        None => run_node(cli.node, shutdown_rx).await?,
    }

    Ok(())
}

async fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).await,
        None => Ok(Config::default()),
    }
}

async fn run_node(args: NodeArgs, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let peers = match &args.peers {
        Some(peers) => Some(parse_peer_list(peers)?),
        None => None,
    };
    let config = load_config(args.config.as_ref()).await?.merge_cli(Overrides {
        bind: args.bind,
        advertise: args.advertise,
        port: args.port,
        peers,
        max_hops: args.max_hops,
        tls: args.tls,
        cert: args.cert,
        key: args.key,
    })?;

    let transport = poe_core::transport_from_config(&config)?;
    let mut node = Node::<String>::bind(config.node.clone(), transport)
        .await?
        .start();

    let connected = tokio::select! {
        r = node.connect_all(&config.node.peers) => Some(r),
        _ = shutdown_rx.recv() => None,
    };
    match connected {
        Some(r) => r?,
        None => return node.terminate().await,
    }
    info!("Connected to {} peers", config.node.peers.len());

    if args.shell {
        return shell::run(node, shutdown_rx).await;
    }

    // シャットダウン待機
    loop {
        tokio::select! {
            delivery = node.recv() => {
                match delivery {
                    Some(d) => info!("Got '{}' from {} ({} hops)", d.msg, d.from, d.hops),
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    node.terminate().await
}
