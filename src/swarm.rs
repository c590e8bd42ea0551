use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::node::{Node, RunningNode};
use crate::topology::Topology;
use crate::transport::Transport;

/// スウォームの起動方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// ノードごとにプロセスを起動
    Spawn,
    /// 起動せずにコマンドを表示
    Print,
    /// このプロセスの中でノードを動かす
    InProcess,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawn" => Ok(Mode::Spawn),
            "print" => Ok(Mode::Print),
            "in-process" => Ok(Mode::InProcess),
            _ => anyhow::bail!("Unknown mode `{}` (expected spawn, print or in-process)", s),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Spawn => "spawn",
            Mode::Print => "print",
            Mode::InProcess => "in-process",
        };
        f.write_str(s)
    }
}

/// プロセス起動時の設定
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub binary: PathBuf,
    pub host: IpAddr,
    /// 各ノードに追加で渡す引数
    pub extra_args: Vec<String>,
}

/// 1ノード分のコマンドライン
///
/// ピアが `host` に接続してくるので、ノードも `host` で待ち受ける
pub fn command_line(
    binary: &Path,
    host: IpAddr,
    port: u16,
    peers: &str,
    extra_args: &[String],
) -> Vec<String> {
    let mut argv = vec![
        binary.display().to_string(),
        "--bind".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];
    if !peers.is_empty() {
        argv.push("--peers".to_string());
        argv.push(peers.to_string());
    }
    argv.extend(extra_args.iter().cloned());
    argv
}

/// 全ノード分のコマンドを文字列で返す
pub fn render_commands(topo: &Topology, opts: &LaunchOptions) -> Vec<String> {
    let host = opts.host.to_string();
    topo.nodes()
        .iter()
        .map(|&port| {
            command_line(
                &opts.binary,
                opts.host,
                port,
                &topo.peer_list(port, &host),
                &opts.extra_args,
            )
            .join(" ")
        })
        .collect()
}

pub fn print_commands(topo: &Topology, opts: &LaunchOptions) {
    for line in render_commands(topo, opts) {
        println!("{}", line);
    }
}

/// ノードごとにプロセスを起動し、全て終了するまで待つ
///
/// シャットダウン要求が来たら残っているプロセスを全てkillする
pub async fn spawn_processes(
    topo: &Topology,
    opts: &LaunchOptions,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let host = opts.host.to_string();
    let mut children = Vec::new();

    for &port in topo.nodes() {
        let argv = command_line(
            &opts.binary,
            opts.host,
            port,
            &topo.peer_list(port, &host),
            &opts.extra_args,
        );
        debug!("Spawning {}", argv.join(" "));

        // 途中で失敗しても起動済みの子はdropでkillされる
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn node on port {}", port))?;
        children.push((port, child));
    }
    info!("Spawned {} nodes", children.len());

    // 呼び出し元の受信側をそのまま使うので、起動中に来たCtrl+Cも失われない
    let (kill_tx, _) = broadcast::channel::<()>(1);
    let mut set = JoinSet::new();
    for (port, mut child) in children {
        let mut kill_rx = kill_tx.subscribe();
        set.spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => info!("Node {} exited", port),
                        Ok(status) => warn!("Node {} exited with {}", port, status),
                        Err(e) => error!("Failed to wait for node {}: {}", port, e),
                    }
                }
                _ = kill_rx.recv() => {
                    debug!("Killing node {}", port);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill node {}: {}", port, e);
                    }
                }
            }
        });
    }

    let mut killing = false;
    loop {
        tokio::select! {
            joined = set.join_next() => {
                match joined {
                    Some(joined) => joined.context("Supervisor task panicked")?,
                    None => break,
                }
            }
            _ = shutdown_rx.recv(), if !killing => {
                info!("Stopping {} nodes", set.len());
                killing = true;
                let _ = kill_tx.send(());
            }
        }
    }
    Ok(())
}

/// 全ノードをこのプロセス内で起動し、トポロジー通りに接続する
///
/// `ephemeral` ならOSが選んだポートで待ち受け、トポロジーのポート番号は名前としてだけ使う
pub async fn launch_in_process(
    topo: &Topology,
    template: &NodeConfig,
    transport: Transport,
    ephemeral: bool,
) -> Result<HashMap<u16, RunningNode<String>>> {
    let mut bound = Vec::new();
    let mut addrs: HashMap<u16, SocketAddr> = HashMap::new();

    // 先に全ノードをbindしておけば接続はすぐに成功する
    for &port in topo.nodes() {
        let config = NodeConfig {
            port: if ephemeral { 0 } else { port },
            peers: Vec::new(),
            ..template.clone()
        };
        let node = Node::<String>::bind(config, transport.clone()).await?;
        addrs.insert(port, node.local_addr());
        bound.push((port, node));
    }

    let nodes: HashMap<u16, RunningNode<String>> = bound
        .into_iter()
        .map(|(port, node)| (port, node.start()))
        .collect();

    for (port, node) in &nodes {
        let peers: Vec<SocketAddr> = topo
            .peers_of(*port)
            .iter()
            .filter_map(|p| addrs.get(p).copied())
            .collect();
        node.connect_all(&peers)
            .await
            .with_context(|| format!("Node {} failed to reach its peers", port))?;
    }

    Ok(nodes)
}

/// プロセス内スウォームを動かし、届いたメッセージをログに出す
pub async fn run_in_process(
    topo: &Topology,
    template: &NodeConfig,
    transport: Transport,
    greet: bool,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    if let Some(limit) = fdlimit::raise_fd_limit() {
        debug!("Raised fd limit to {}", limit);
    }

    let nodes = launch_in_process(topo, template, transport, false).await?;
    info!("{} nodes running in-process ({} links)", nodes.len(), topo.edge_count());

    let (stop_tx, _) = broadcast::channel::<()>(1);
    let mut set = JoinSet::new();
    for (port, mut node) in nodes {
        let mut stop_rx = stop_tx.subscribe();
        set.spawn(async move {
            if greet {
                node.broadcast(format!("Fire at node {}", port)).await;
            }
            loop {
                tokio::select! {
                    delivery = node.recv() => {
                        match delivery {
                            Some(d) => info!("[{}] got '{}' from {} ({} hops)", port, d.msg, d.from, d.hops),
                            None => break,
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            node.terminate().await
        });
    }

    let mut stopping = false;
    loop {
        tokio::select! {
            joined = set.join_next() => {
                match joined {
                    Some(joined) => joined.context("Node task panicked")??,
                    None => break,
                }
            }
            _ = shutdown_rx.recv(), if !stopping => {
                stopping = true;
                let _ = stop_tx.send(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Shape;
    use std::time::Duration;
    use tokio::time::timeout;

    fn opts() -> LaunchOptions {
        LaunchOptions {
            binary: PathBuf::from("target/debug/poe_core"),
            host: "127.0.0.1".parse().unwrap(),
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn test_command_line() {
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        let argv = command_line(Path::new("poe_core"), localhost, 8000, "127.0.0.1:8001", &[]);
        assert_eq!(
            argv,
            vec!["poe_core", "--bind", "127.0.0.1", "--port", "8000", "--peers", "127.0.0.1:8001"]
        );

        let lonely = command_line(Path::new("poe_core"), localhost, 8000, "", &["--tls".to_string()]);
        assert_eq!(lonely, vec!["poe_core", "--bind", "127.0.0.1", "--port", "8000", "--tls"]);
    }

    #[test]
    fn test_render_complete() {
        let topo = Topology::build(Shape::Complete, 3, 8000);
        let lines = render_commands(&topo, &opts());
        assert_eq!(
            lines,
            vec![
                "target/debug/poe_core --bind 127.0.0.1 --port 8000 --peers 127.0.0.1:8001,127.0.0.1:8002",
                "target/debug/poe_core --bind 127.0.0.1 --port 8001 --peers 127.0.0.1:8000,127.0.0.1:8002",
                "target/debug/poe_core --bind 127.0.0.1 --port 8002 --peers 127.0.0.1:8000,127.0.0.1:8001",
            ]
        );
    }

    #[test]
    fn test_render_binds_children_to_host() {
        let topo = Topology::build(Shape::Linear, 2, 8000);
        let opts = LaunchOptions {
            host: "10.0.0.7".parse().unwrap(),
            ..opts()
        };
        let lines = render_commands(&topo, &opts);
        assert_eq!(
            lines,
            vec![
                "target/debug/poe_core --bind 10.0.0.7 --port 8000 --peers 10.0.0.7:8001",
                "target/debug/poe_core --bind 10.0.0.7 --port 8001 --peers 10.0.0.7:8000",
            ]
        );
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("in-process".parse::<Mode>().unwrap(), Mode::InProcess);
        assert_eq!(Mode::Print.to_string(), "print");
        assert!("fork".parse::<Mode>().is_err());
    }

    #[tokio::test]
    async fn test_spawn_fails_for_missing_binary() {
        let topo = Topology::build(Shape::Linear, 2, 8000);
        let opts = LaunchOptions {
            binary: PathBuf::from("/nonexistent/poe_core"),
            ..opts()
        };
        let (_tx, rx) = broadcast::channel(1);
        assert!(spawn_processes(&topo, &opts, rx).await.is_err());
    }

    /// `body` を実行するだけの偽ノードを作る
    #[cfg(unix)]
    fn fake_node(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake_node.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_kills_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::build(Shape::Complete, 3, 8000);
        let opts = LaunchOptions {
            binary: fake_node(dir.path(), "sleep 30"),
            ..opts()
        };
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { spawn_processes(&topo, &opts, rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("children were not killed")
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_before_children_start_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::build(Shape::Complete, 3, 8000);
        let opts = LaunchOptions {
            binary: fake_node(dir.path(), "sleep 30"),
            ..opts()
        };
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        timeout(Duration::from_secs(5), spawn_processes(&topo, &opts, rx))
            .await
            .expect("children were not killed")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_child_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        // 8000番のノードだけ即座に異常終了する
        let script = fake_node(
            dir.path(),
            "if [ \"$4\" = \"8000\" ]; then exit 3; fi\nsleep 1",
        );
        let topo = Topology::build(Shape::Linear, 3, 8000);
        let opts = LaunchOptions {
            binary: script,
            ..opts()
        };
        let (_tx, rx) = broadcast::channel(1);

        let started = tokio::time::Instant::now();
        timeout(Duration::from_secs(5), spawn_processes(&topo, &opts, rx))
            .await
            .expect("launcher never finished")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_in_process_ladder_floods() {
        let topo = Topology::ladder(2, 7000);
        let template = NodeConfig {
            connect_timeout_secs: Some(5),
            ..Default::default()
        };
        let mut nodes = launch_in_process(&topo, &template, Transport::Plain, true)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 4);

        // 全ノードが隣接ノード数だけピアを持つまで待つ
        timeout(Duration::from_secs(5), async {
            loop {
                let mut ready = true;
                for (port, node) in &nodes {
                    if node.peers().await.len() < topo.peers_of(*port).len() {
                        ready = false;
                    }
                }
                if ready {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("swarm never connected");

        let origin = nodes[&7000].addr();
        nodes[&7000].broadcast("fire".to_string()).await;

        for port in [7001, 7002, 7003] {
            let node = nodes.get_mut(&port).unwrap();
            let got = timeout(Duration::from_secs(5), node.recv())
                .await
                .expect("delivery timed out")
                .unwrap();
            assert_eq!(got.msg, "fire");
            assert_eq!(got.from, origin);
        }

        for (_, node) in nodes {
            node.terminate().await.unwrap();
        }
    }
}
