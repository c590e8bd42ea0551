use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// スウォームの形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// 全ノードが互いに接続
    Complete,
    /// 一直線
    Linear,
    /// はしご型。ノード数は段数の2倍
    Ladder,
}

impl FromStr for Shape {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" | "mesh" => Ok(Shape::Complete),
            "linear" | "line" => Ok(Shape::Linear),
            "ladder" => Ok(Shape::Ladder),
            _ => anyhow::bail!("Unknown topology `{}` (expected complete, linear or ladder)", s),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Shape::Complete => "complete",
            Shape::Linear => "linear",
            Shape::Ladder => "ladder",
        };
        f.write_str(s)
    }
}

/// ポート番号を頂点とする無向グラフ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    nodes: Vec<u16>,
    edges: BTreeMap<u16, BTreeSet<u16>>,
}

impl Topology {
    /// `n` をノード数（はしご型なら段数）として連番ポートで組み立てる
    pub fn build(shape: Shape, n: u16, base_port: u16) -> Topology {
        match shape {
            Shape::Complete => Topology::complete(port_range(base_port, n)),
            Shape::Linear => Topology::linear(port_range(base_port, n)),
            Shape::Ladder => Topology::ladder(n, base_port),
        }
    }

    pub fn complete(ports: impl IntoIterator<Item = u16>) -> Topology {
        let mut topo = Topology::with_nodes(ports);
        let nodes = topo.nodes.clone();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                topo.link(*a, *b);
            }
        }
        topo
    }

    pub fn linear(ports: impl IntoIterator<Item = u16>) -> Topology {
        let mut topo = Topology::with_nodes(ports);
        let nodes = topo.nodes.clone();
        for pair in nodes.windows(2) {
            topo.link(pair[0], pair[1]);
        }
        topo
    }

    /// 2本のレール `base..base+rungs` と `base+rungs..base+2*rungs` を横木でつなぐ
    pub fn ladder(rungs: u16, base_port: u16) -> Topology {
        let left = port_range(base_port, rungs);
        let right = port_range(base_port.saturating_add(rungs), rungs);

        let mut topo = Topology::with_nodes(left.iter().chain(right.iter()).copied());
        for rail in [&left, &right] {
            for pair in rail.windows(2) {
                topo.link(pair[0], pair[1]);
            }
        }
        for (a, b) in left.iter().zip(right.iter()) {
            topo.link(*a, *b);
        }
        topo
    }

    fn with_nodes(ports: impl IntoIterator<Item = u16>) -> Topology {
        let mut topo = Topology::default();
        for port in ports {
            if !topo.edges.contains_key(&port) {
                topo.nodes.push(port);
                topo.edges.insert(port, BTreeSet::new());
            }
        }
        topo
    }

    fn link(&mut self, a: u16, b: u16) {
        if a == b {
            return;
        }
        self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
    }

    /// 追加された順のノード
    pub fn nodes(&self) -> &[u16] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn peers_of(&self, port: u16) -> Vec<u16> {
        self.edges
            .get(&port)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `--peers` に渡す `host:port,host:port` 形式
    pub fn peer_list(&self, port: u16, host: &str) -> String {
        self.peers_of(port)
            .iter()
            .map(|p| format!("{}:{}", host, p))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// ポートを超えない範囲で `base` から `n` 個
fn port_range(base: u16, n: u16) -> Vec<u16> {
    (0..n).filter_map(|i| base.checked_add(i)).collect()
}
