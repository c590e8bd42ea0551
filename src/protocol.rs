use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Debug;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// 1フレームの最大サイズ（DoS対策）
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// ノード間で運べるメッセージ型の条件
pub trait NodeMessage:
    Send + Sync + Serialize + DeserializeOwned + Debug + Clone + 'static
{
}

impl<T> NodeMessage for T where
    T: Send + Sync + Serialize + DeserializeOwned + Debug + Clone + 'static
{
}

/// パケットの配送方法
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Operation {
    /// 全ノードへフラッディング
    Broadcast {
        /// 既にこのパケットを処理したノードのアドレス
        seen: HashSet<SocketAddr>,
        hops: u16,
    },

    /// 特定のノード宛て
    Directed { target: SocketAddr },
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Payload<M> {
    Heartbeat,
    Message(M),
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Packet<M> {
    pub id: Uuid,
    /// 送信元ノードの待ち受けアドレス
    pub sender: SocketAddr,
    pub op: Operation,
    pub payload: Payload<M>,
}

impl<M> Packet<M> {
    pub fn new(op: Operation, sender: SocketAddr, payload: Payload<M>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            op,
            payload,
        }
    }

    /// 送信元だけが既読のブロードキャストを作成
    pub fn broadcast(sender: SocketAddr, msg: M) -> Self {
        let mut seen = HashSet::new();
        seen.insert(sender);
        Self::new(
            Operation::Broadcast { seen, hops: 0 },
            sender,
            Payload::Message(msg),
        )
    }

    pub fn directed(sender: SocketAddr, target: SocketAddr, msg: M) -> Self {
        Self::new(
            Operation::Directed { target },
            sender,
            Payload::Message(msg),
        )
    }

    /// ハートビートは隣接ノードにしか届かないので宛先は送信元自身にしておく
    pub fn heartbeat(sender: SocketAddr) -> Self {
        Self::new(
            Operation::Directed { target: sender },
            sender,
            Payload::Heartbeat,
        )
    }
}

impl<M: NodeMessage> Packet<M> {
    /// パケットを送信
    /// フォーマット: [length: u32 little-endian][bincode data]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let data = bincode::serialize(self)
            .with_context(|| format!("Failed to serialize packet {}", self.id))?;

        if data.len() > MAX_FRAME_LEN as usize {
            anyhow::bail!("Packet too large: {} bytes", data.len());
        }

        writer
            .write_u32_le(data.len() as u32)
            .await
            .with_context(|| "Failed to write packet length")?;

        writer
            .write_all(&data)
            .await
            .with_context(|| "Failed to write packet data")?;

        writer.flush().await?;

        Ok(())
    }

    /// パケットを受信
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let len = reader
            .read_u32_le()
            .await
            .with_context(|| "Failed to read packet length")?;

        if len > MAX_FRAME_LEN {
            anyhow::bail!("Packet too large: {} bytes", len);
        }

        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .with_context(|| "Failed to read packet data")?;

        let pkt = bincode::deserialize(&buf).with_context(|| "Failed to deserialize packet")?;

        Ok(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_packet_roundtrip() {
        let pkt = Packet::broadcast(addr(7000), "hello".to_string());

        let mut buf = Vec::new();
        pkt.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Packet::<String>::read_from(&mut cursor).await.unwrap();

        assert_eq!(pkt, decoded);
        match decoded.op {
            Operation::Broadcast { seen, hops } => {
                assert_eq!(hops, 0);
                assert!(seen.contains(&addr(7000)));
            }
            _ => panic!("Operation mismatch"),
        }
    }

    #[tokio::test]
    async fn test_length_prefix() {
        let pkt = Packet::directed(addr(7000), addr(7001), 42u32);
        let mut buf = Vec::new();
        pkt.write_to(&mut buf).await.unwrap();

        // 先頭4バイトが残りの長さと一致するか確認
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let mut cursor = std::io::Cursor::new(buf);
        let err = Packet::<String>::read_from(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let pkt = Packet::heartbeat(addr(7000));
        let mut buf = Vec::new();
        Packet::<String>::write_to(&pkt, &mut buf).await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(Packet::<String>::read_from(&mut cursor).await.is_err());
    }

    #[test]
    fn test_fresh_ids() {
        let a = Packet::broadcast(addr(1), ());
        let b = Packet::broadcast(addr(1), ());
        assert_ne!(a.id, b.id);
    }
}
