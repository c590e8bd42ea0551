use anyhow::{Context, Result};
use std::io::Write;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::info;

use crate::node::RunningNode;

/// 対話シェルのコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Direct(SocketAddr, String),
    Peers,
    Exit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim();
        let (arg0, rest) = match line.split_once(char::is_whitespace) {
            Some((arg0, rest)) => (arg0, rest.trim()),
            None => (line, ""),
        };

        match arg0 {
            "" => Ok(Command::Empty),
            "exit" | "quit" => Ok(Command::Exit),
            "peers" => Ok(Command::Peers),
            "b" | "broadcast" => {
                if rest.is_empty() {
                    anyhow::bail!("Usage: broadcast <message>");
                }
                Ok(Command::Broadcast(rest.to_string()))
            }
            "d" | "direct" => {
                let (target, msg) = rest
                    .split_once(char::is_whitespace)
                    .with_context(|| "Usage: direct <host:port> <message>")?;
                let target = target
                    .parse()
                    .with_context(|| format!("Invalid address `{}`", target))?;
                Ok(Command::Direct(target, msg.trim().to_string()))
            }
            _ => anyhow::bail!("Unknown command: '{}'", line),
        }
    }
}

fn prompt() {
    print!(">>> ");
    let _ = std::io::stdout().flush();
}

/// 標準入力からコマンドを読み、ノードを操作する
///
/// EOFか `exit` で終了し、ノードも停止させる
pub async fn run(mut node: RunningNode<String>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();

    loop {
        tokio::select! {
            delivery = node.recv() => {
                match delivery {
                    Some(d) => {
                        let kind = if d.directed { "direct" } else { "broadcast" };
                        println!("\n[{} from {}] {}", kind, d.from, d.msg);
                        prompt();
                    }
                    None => break,
                }
            }
            line = lines.next_line() => {
                let line = match line.context("Failed to read stdin")? {
                    Some(line) => line,
                    None => break,
                };
                match Command::parse(&line) {
                    Ok(Command::Exit) => break,
                    Ok(Command::Empty) => {}
                    Ok(Command::Peers) => {
                        for peer in node.peers().await {
                            println!("{}", peer);
                        }
                    }
                    Ok(Command::Broadcast(msg)) => node.broadcast(msg).await,
                    Ok(Command::Direct(target, msg)) => node.send_to(target, msg).await,
                    Err(e) => println!("{:#}", e),
                }
                prompt();
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    info!("Shell exiting");
    node.terminate().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast() {
        assert_eq!(
            Command::parse("b hello world").unwrap(),
            Command::Broadcast("hello world".to_string())
        );
        assert_eq!(
            Command::parse("  broadcast   fire  ").unwrap(),
            Command::Broadcast("fire".to_string())
        );
        assert!(Command::parse("b").is_err());
    }

    #[test]
    fn test_parse_direct() {
        assert_eq!(
            Command::parse("d 127.0.0.1:7001 over here").unwrap(),
            Command::Direct("127.0.0.1:7001".parse().unwrap(), "over here".to_string())
        );
        assert!(Command::parse("direct 127.0.0.1:7001").is_err());
        assert!(Command::parse("direct nowhere hi").is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(Command::parse("").unwrap(), Command::Empty);
        assert_eq!(Command::parse("peers").unwrap(), Command::Peers);
        assert_eq!(Command::parse("exit").unwrap(), Command::Exit);
        assert_eq!(Command::parse("quit").unwrap(), Command::Exit);

        let err = Command::parse("jump now").unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }
}
