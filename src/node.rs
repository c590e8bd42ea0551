use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::peer::{Inbound, Peer};
use crate::protocol::{NodeMessage, Operation, Packet, Payload};
use crate::transport::{BoxedStream, Transport};

const MSG_CHAN_CAPACITY: usize = 128;
const SEEN_CACHE_CAPACITY: usize = 128;
const COMMAND_CHAN_CAPACITY: usize = 16;
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// ノードへの命令
pub enum NodeCommand<M> {
    Die,
    Broadcast(M),
    SendTo(SocketAddr, M),
    AddPeer(BoxedStream, SocketAddr),
    Peers(oneshot::Sender<Vec<SocketAddr>>),
}

/// アプリケーションに届いたメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<M> {
    /// 発信元ノードのアドレス
    pub from: SocketAddr,
    pub msg: M,
    /// ブロードキャストが経由したホップ数。宛先指定なら0
    pub hops: u16,
    pub directed: bool,
}

/// フラッディングノード
///
/// ピア一覧と既読キャッシュはノードのタスクだけが持つ
pub struct Node<M> {
    listener: TcpListener,
    transport: Transport,
    addr: SocketAddr,
    config: NodeConfig,
    peers: HashMap<SocketAddr, Peer<M>>,
    /// 相手の待ち受けアドレス -> 接続のキー
    routes: HashMap<SocketAddr, SocketAddr>,
    inbound_tx: mpsc::Sender<Inbound<M>>,
    inbound_rx: mpsc::Receiver<Inbound<M>>,
    accepted_tx: mpsc::Sender<(BoxedStream, SocketAddr)>,
    accepted_rx: mpsc::Receiver<(BoxedStream, SocketAddr)>,
    seen_msgs: LruCache<Uuid, ()>,
}

impl<M: NodeMessage> Node<M> {
    pub async fn bind(config: NodeConfig, transport: Transport) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .with_context(|| format!("Failed to bind to {}", config.listen_addr()))?;
        let listen_addr = listener.local_addr()?;
        // 0.0.0.0 のままでは宛先指定のメッセージが自分宛てと分からない
        let addr = SocketAddr::new(config.advertise_ip(), listen_addr.port());
        info!(
            "Listening at {} as {}{}",
            listen_addr,
            addr,
            if transport.is_tls() { " (tls)" } else { "" }
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(MSG_CHAN_CAPACITY);
        let (accepted_tx, accepted_rx) = mpsc::channel(COMMAND_CHAN_CAPACITY);
        let capacity = NonZeroUsize::new(SEEN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            listener,
            transport,
            addr,
            config,
            peers: HashMap::new(),
            routes: HashMap::new(),
            inbound_tx,
            inbound_rx,
            accepted_tx,
            accepted_rx,
            seen_msgs: LruCache::new(capacity),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// ノードのタスクを起動
    pub fn start(self) -> RunningNode<M> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHAN_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::channel(MSG_CHAN_CAPACITY);
        let addr = self.addr;
        let transport = self.transport.clone();
        let connect_timeout = self.config.connect_timeout();
        let handle = tokio::spawn(self.run(cmd_rx, delivery_tx));
        RunningNode {
            addr,
            handle,
            tx: cmd_tx,
            rx: delivery_rx,
            transport,
            connect_timeout,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<NodeCommand<M>>,
        delivery_tx: mpsc::Sender<Delivery<M>>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("[{}] accept from {}", self.addr, addr);
                            // TLSハンドシェイクでループを止めない
                            let transport = self.transport.clone();
                            let accepted_tx = self.accepted_tx.clone();
                            tokio::spawn(async move {
                                match transport.accept(stream).await {
                                    Ok(stream) => {
                                        let _ = accepted_tx.send((stream, addr)).await;
                                    }
                                    Err(e) => warn!("Rejected connection from {}: {:#}", addr, e),
                                }
                            });
                        }
                        Err(e) => {
                            warn!("[{}] accept failed: {}", self.addr, e);
                        }
                    }
                }
                Some((stream, addr)) = self.accepted_rx.recv() => {
                    self.add_peer(stream, addr).await;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(NodeCommand::Die) => {
                            info!("[{}] Node terminating", self.addr);
                            break;
                        }
                        Some(NodeCommand::Broadcast(msg)) => {
                            debug!("[{}] told to broadcast {:?}", self.addr, msg);
                            let pkt = Packet::broadcast(self.addr, msg);
                            self.seen_msgs.put(pkt.id, ());
                            self.forward(&pkt, &HashSet::new()).await;
                        }
                        Some(NodeCommand::SendTo(target, msg)) => {
                            let pkt = Packet::directed(self.addr, target, msg);
                            self.seen_msgs.put(pkt.id, ());
                            if target == self.addr {
                                self.deliver(&delivery_tx, pkt.sender, pkt.payload, 0, true).await;
                            } else {
                                self.route_directed(&pkt, target, None).await;
                            }
                        }
                        Some(NodeCommand::AddPeer(stream, addr)) => {
                            self.add_peer(stream, addr).await;
                        }
                        Some(NodeCommand::Peers(reply)) => {
                            let _ = reply.send(self.peer_addrs());
                        }
                    }
                }
                Some(inbound) = self.inbound_rx.recv() => {
                    match inbound {
                        Inbound::Packet(from, pkt) => self.handle_packet(from, pkt, &delivery_tx).await,
                        Inbound::Closed(addr) => self.remove_peer(addr),
                    }
                }
                _ = heartbeat.tick() => {
                    let pkt = Packet::heartbeat(self.addr);
                    self.forward(&pkt, &HashSet::new()).await;
                }
            }
        }
    }

    async fn add_peer(&mut self, stream: BoxedStream, addr: SocketAddr) {
        // 置き換えると古い接続のClosedで新しい接続まで消えてしまう
        if self.peers.contains_key(&addr) {
            warn!("[{}] already connected to {}, dropping the new link", self.addr, addr);
            return;
        }
        info!("[{}] peer connected: {}", self.addr, addr);
        let mut peer = Peer::new(stream, addr, self.inbound_tx.clone());

        // 相手が自分の待ち受けアドレスを覚えられるよう即座に名乗る
        if let Err(e) = peer.send_packet(&Packet::heartbeat(self.addr)).await {
            warn!("[{}] peer {} failed on first heartbeat: {:#}", self.addr, addr, e);
            return;
        }
        self.peers.insert(addr, peer);
    }

    fn remove_peer(&mut self, addr: SocketAddr) {
        if self.peers.remove(&addr).is_some() {
            info!("[{}] peer disconnected: {}", self.addr, addr);
        }
        self.routes.retain(|_, key| *key != addr);
    }

    /// 待ち受けアドレスから接続のキーを引く
    fn peer_key_for(&self, addr: SocketAddr) -> Option<SocketAddr> {
        if self.peers.contains_key(&addr) {
            return Some(addr);
        }
        self.routes
            .get(&addr)
            .copied()
            .filter(|key| self.peers.contains_key(key))
    }

    /// 接続中のピア。待ち受けアドレスが分かっていればそちらを返す
    fn peer_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .peers
            .keys()
            .map(|key| {
                self.routes
                    .iter()
                    .find(|(_, k)| *k == key)
                    .map(|(listen, _)| *listen)
                    .unwrap_or(*key)
            })
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    async fn handle_packet(
        &mut self,
        from: SocketAddr,
        pkt: Packet<M>,
        delivery_tx: &mpsc::Sender<Delivery<M>>,
    ) {
        if let Payload::Heartbeat = pkt.payload {
            debug!("[{}] heartbeat from {} via {}", self.addr, pkt.sender, from);
            if pkt.sender != from {
                self.routes.insert(pkt.sender, from);
            }
            return;
        }

        if self.seen_msgs.contains(&pkt.id) {
            return;
        }
        self.seen_msgs.put(pkt.id, ());

        let Packet {
            id,
            sender,
            op,
            payload,
        } = pkt;

        match op {
            Operation::Broadcast { mut seen, hops } => {
                if seen.contains(&self.addr) {
                    return;
                }
                info!(
                    "[{}] got msg {} from {} ({} hops)",
                    self.addr, id, sender, hops
                );

                self.deliver(delivery_tx, sender, payload.clone(), hops, false)
                    .await;

                // 次の転送で通過するリンク数が上限を超えるなら止める
                let hops = hops.saturating_add(1);
                if hops >= self.config.max_hops {
                    debug!("[{}] msg {} reached max hops", self.addr, id);
                    return;
                }

                seen.insert(self.addr);
                let exclude = self.excluded_peers(from, &seen);
                let next = Packet {
                    id,
                    sender,
                    op: Operation::Broadcast { seen, hops },
                    payload,
                };
                self.forward(&next, &exclude).await;
            }
            Operation::Directed { target } if target == self.addr => {
                info!("[{}] got directed msg {} from {}", self.addr, id, sender);
                self.deliver(delivery_tx, sender, payload, 0, true).await;
            }
            Operation::Directed { target } => {
                let next = Packet {
                    id,
                    sender,
                    op: Operation::Directed { target },
                    payload,
                };
                self.route_directed(&next, target, Some(from)).await;
            }
        }
    }

    /// 宛先が隣接していればそこだけへ、そうでなければ全ピアへ流す
    async fn route_directed(
        &mut self,
        pkt: &Packet<M>,
        target: SocketAddr,
        from: Option<SocketAddr>,
    ) {
        if let Some(key) = self.peer_key_for(target) {
            let others: HashSet<SocketAddr> =
                self.peers.keys().filter(|k| **k != key).copied().collect();
            self.forward(pkt, &others).await;
        } else {
            let exclude = from.into_iter().collect();
            self.forward(pkt, &exclude).await;
        }
    }

    /// 受信元と、既にパケットを見たノードへの接続を除外
    ///
    /// 両端から接続し合ったリンクでは1ノードに接続が2本あるので、どちらも除く
    fn excluded_peers(&self, from: SocketAddr, seen: &HashSet<SocketAddr>) -> HashSet<SocketAddr> {
        let mut exclude: HashSet<SocketAddr> = self
            .peers
            .keys()
            .filter(|key| {
                seen.contains(*key)
                    || self
                        .routes
                        .iter()
                        .any(|(listen, k)| k == *key && seen.contains(listen))
            })
            .copied()
            .collect();
        exclude.insert(from);
        exclude
    }

    async fn deliver(
        &self,
        delivery_tx: &mpsc::Sender<Delivery<M>>,
        from: SocketAddr,
        payload: Payload<M>,
        hops: u16,
        directed: bool,
    ) {
        if let Payload::Message(msg) = payload {
            let delivery = Delivery {
                from,
                msg,
                hops,
                directed,
            };
            if delivery_tx.send(delivery).await.is_err() {
                debug!("[{}] nobody is receiving deliveries", self.addr);
            }
        }
    }

    /// `exclude` 以外の全ピアへ送信し、失敗したピアを切断する
    async fn forward(&mut self, pkt: &Packet<M>, exclude: &HashSet<SocketAddr>) {
        let mut failed = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            if exclude.contains(addr) {
                continue;
            }
            if let Err(e) = peer.send_packet(pkt).await {
                warn!("[{}] failed to send to {}: {:#}", self.addr, addr, e);
                failed.push(*addr);
            }
        }
        for addr in failed {
            self.remove_peer(addr);
        }
    }
}

/// 起動済みノードへのハンドル
pub struct RunningNode<M> {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    tx: mpsc::Sender<NodeCommand<M>>,
    rx: mpsc::Receiver<Delivery<M>>,
    transport: Transport,
    connect_timeout: Option<Duration>,
}

impl<M: NodeMessage> RunningNode<M> {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn wait(self) -> Result<()> {
        self.handle.await.context("Node task panicked")
    }

    pub async fn terminate(self) -> Result<()> {
        let _ = self.tx.send(NodeCommand::Die).await;
        self.wait().await
    }

    pub async fn broadcast(&self, msg: M) {
        self.send_cmd(NodeCommand::Broadcast(msg)).await;
    }

    pub async fn send_to(&self, target: SocketAddr, msg: M) {
        self.send_cmd(NodeCommand::SendTo(target, msg)).await;
    }

    pub async fn add_peer(&self, stream: BoxedStream, addr: SocketAddr) {
        self.send_cmd(NodeCommand::AddPeer(stream, addr)).await;
    }

    pub async fn send_cmd(&self, cmd: NodeCommand<M>) {
        let _ = self.tx.send(cmd).await;
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_cmd(NodeCommand::Peers(reply_tx)).await;
        reply_rx.await.unwrap_or_default()
    }

    pub async fn recv(&mut self) -> Option<Delivery<M>> {
        self.rx.recv().await
    }

    /// ピアに接続できるまで再試行し、ピアとして登録する
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        let stream = dial(&self.transport, addr, self.connect_timeout).await?;
        self.add_peer(stream, addr).await;
        Ok(())
    }

    /// 全ピアへ並行して接続する。重複したアドレスには1度だけ接続する
    pub async fn connect_all(&self, addrs: &[SocketAddr]) -> Result<()> {
        let mut set = JoinSet::new();
        let mut dialed = HashSet::new();
        for &addr in addrs {
            if !dialed.insert(addr) {
                continue;
            }
            let transport = self.transport.clone();
            let connect_timeout = self.connect_timeout;
            set.spawn(async move { (addr, dial(&transport, addr, connect_timeout).await) });
        }

        while let Some(joined) = set.join_next().await {
            let (addr, stream) = joined.context("Dial task panicked")?;
            let stream = stream.with_context(|| format!("Giving up on peer {}", addr))?;
            self.add_peer(stream, addr).await;
        }
        Ok(())
    }
}

async fn dial(
    transport: &Transport,
    addr: SocketAddr,
    max_elapsed_time: Option<Duration>,
) -> Result<BoxedStream> {
    let policy = ExponentialBackoff {
        max_interval: MAX_RETRY_INTERVAL,
        max_elapsed_time,
        ..Default::default()
    };

    backoff::future::retry_notify(
        policy,
        move || async move { transport.connect(addr).await.map_err(backoff::Error::transient) },
        |e: anyhow::Error, duration| {
            debug!("Failed to connect to {}: {:#}. Retry in {:?}", addr, e, duration);
        },
    )
    .await
}
