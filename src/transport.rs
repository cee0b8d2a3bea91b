//! Broker session over plain TCP with newline-delimited JSON frames.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::PublishFault;
use crate::publisher::BrokerSession;

/// First line sent on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello<'a> {
    pub client_id: &'a str,
    pub keep_alive_s: u16,
}

/// One published message. `payload` is the already-encoded JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<'a> {
    pub topic: &'a str,
    pub payload: &'a str,
}

#[derive(Debug)]
pub struct TcpBroker {
    host: String,
    port: u16,
    keep_alive_s: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            keep_alive_s: config.keep_alive_s,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            stream: None,
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), PublishFault> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(PublishFault::NoSession);
        };

        let written = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        }
        .await;

        written.map_err(|e| {
            warn!(error = %e, "broker connection lost");
            self.stream = None;
            PublishFault::Transport(e.to_string())
        })
    }
}

impl BrokerSession for TcpBroker {
    async fn connect(&mut self, client_id: &str) -> Result<(), PublishFault> {
        self.stream = None;

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| PublishFault::Transport("connect timed out".into()))?
        .map_err(|e| PublishFault::Transport(e.to_string()))?;

        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);

        let hello = serde_json::to_string(&Hello {
            client_id,
            keep_alive_s: self.keep_alive_s,
        })
        .map_err(|_| PublishFault::Encode("hello"))?;
        self.write_line(&hello).await?;

        debug!(host = %self.host, port = self.port, "broker socket open");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishFault> {
        let line =
            serde_json::to_string(&Envelope { topic, payload }).map_err(|_| PublishFault::Encode("envelope"))?;
        self.write_line(&line).await
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_publishes_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line);
                if received.len() == 2 {
                    break;
                }
            }
            received
        });

        let config = BrokerConfig {
            port,
            ..BrokerConfig::default()
        };
        let mut broker = TcpBroker::new(&config);
        broker.connect("node-7").await.unwrap();
        assert!(broker.is_connected());
        broker.publish("vibemon/status", r#"{"status":"healthy"}"#).await.unwrap();

        let lines = server.await.unwrap();
        assert!(lines[0].contains(r#""client_id":"node-7""#));
        let envelope: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(envelope["topic"], "vibemon/status");
        assert_eq!(envelope["payload"], r#"{"status":"healthy"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BrokerConfig {
            port,
            connect_timeout_ms: 500,
            ..BrokerConfig::default()
        };
        let mut broker = TcpBroker::new(&config);
        assert!(matches!(broker.connect("node").await, Err(PublishFault::Transport(_))));
        assert!(!broker.is_connected());
        assert_eq!(broker.publish("t", "p").await, Err(PublishFault::NoSession));
    }
}
