// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::domain::runtime::ReadinessProbe;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Ready once the engine accepts a TCP connection on its port.
#[derive(Debug, Clone, Default)]
pub struct TcpReadinessProbe;

#[async_trait]
impl ReadinessProbe for TcpReadinessProbe {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpReadinessProbe.is_ready("127.0.0.1", port).await);

        drop(listener);
        assert!(!TcpReadinessProbe.is_ready("127.0.0.1", port).await);
    }
}
