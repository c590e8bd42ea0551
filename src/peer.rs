use anyhow::Result;
use std::net::SocketAddr;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{NodeMessage, Packet};
use crate::transport::BoxedStream;

/// ピアからノードへの通知
#[derive(Debug)]
pub enum Inbound<M> {
    Packet(SocketAddr, Packet<M>),
    /// 接続が切れた、または不正なデータを受信した
    Closed(SocketAddr),
}

/// 別ノードへの1本の接続
///
/// 書き込み側はノードが所有し、読み込み側は専用タスクで動く
pub struct Peer<M> {
    addr: SocketAddr,
    writer: WriteHalf<BoxedStream>,
    reader: JoinHandle<()>,
    _marker: std::marker::PhantomData<M>,
}

impl<M: NodeMessage> Peer<M> {
    pub fn new(stream: BoxedStream, addr: SocketAddr, tx: mpsc::Sender<Inbound<M>>) -> Self {
        let (read, write) = tokio::io::split(stream);
        let reader = tokio::spawn(recv_into_chan(read, addr, tx));
        Self {
            addr,
            writer: write,
            reader,
            _marker: std::marker::PhantomData,
        }
    }

    pub async fn send_packet(&mut self, packet: &Packet<M>) -> Result<()> {
        packet.write_to(&mut self.writer).await
    }
}

impl<M> Drop for Peer<M> {
    fn drop(&mut self) {
        debug!("Dropping peer {}", self.addr);
        self.reader.abort();
    }
}

/// 受信したパケットをノードのチャネルへ流し続ける
async fn recv_into_chan<M: NodeMessage>(
    mut stream: ReadHalf<BoxedStream>,
    addr: SocketAddr,
    tx: mpsc::Sender<Inbound<M>>,
) {
    loop {
        match Packet::read_from(&mut stream).await {
            Ok(pkt) => {
                if tx.send(Inbound::Packet(addr, pkt)).await.is_err() {
                    // ノードが終了した
                    return;
                }
            }
            Err(e) => {
                debug!("Peer {} closed: {:#}", addr, e);
                let _ = tx.send(Inbound::Closed(addr)).await;
                return;
            }
        }
    }
}
