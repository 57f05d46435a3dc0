//! Shared fixtures: an in-process echo upstream and a proxy bootstrap.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use proxad_host::FilterHost;
use proxad_proxy::{EngineMode, ListenerSettings, Proxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// TCP echo server, one task per connection.
pub async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

pub async fn start_proxy(
    settings: ListenerSettings,
    host: Arc<FilterHost>,
) -> (
    SocketAddr,
    CancellationToken,
    tokio::task::JoinHandle<()>,
) {
    let proxy = Proxy::bind(settings, host).await.unwrap();
    let addr = proxy.local_addr();
    let shutdown = proxy.shutdown_token();
    let handle = tokio::spawn(async move {
        proxy.run().await.unwrap();
    });
    (addr, shutdown, handle)
}

pub fn settings(upstream: SocketAddr, mode: EngineMode) -> ListenerSettings {
    ListenerSettings::new("127.0.0.1:0".parse().unwrap(), upstream.to_string(), mode)
}
