//! One-shot TCP port forwarders.
//!
//! Each accepted host connection is spliced to the guest address until either
//! side closes. Listeners are lifetime-bound to the server's cancellation.

use std::net::{IpAddr, SocketAddr};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bind `:src_port` and splice every accepted connection to `dst:dst_port`
/// until `cancel` fires. Returns the bound address once listening.
pub async fn forward(
    cancel: CancellationToken,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(("0.0.0.0", src_port)).await?;
    let local = listener.local_addr()?;
    info!("Port forwarder listening on {local}, to {dst}:{dst_port}");
    tokio::spawn(accept_loop(cancel, listener, dst, dst_port));
    Ok(local)
}

async fn accept_loop(cancel: CancellationToken, listener: TcpListener, dst: IpAddr, dst_port: u16) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut conn, _)) => {
                        tokio::spawn(async move {
                            match TcpStream::connect((dst, dst_port)).await {
                                Ok(mut upstream) => {
                                    let _ = copy_bidirectional(&mut conn, &mut upstream).await;
                                }
                                Err(err) => {
                                    warn!("port forwarder failed to connect to {dst}:{dst_port}: {err}");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        warn!("port forwarder failed to accept: {err}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn splices_both_directions() {
        let upstream = echo_upstream().await;
        let cancel = CancellationToken::new();
        let bound = forward(cancel.clone(), upstream.ip(), 0, upstream.port())
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", bound.port())).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn cancellation_closes_the_listener() {
        let upstream = echo_upstream().await;
        let cancel = CancellationToken::new();
        let bound = forward(cancel.clone(), upstream.ip(), 0, upstream.port())
            .await
            .unwrap();

        cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(TcpStream::connect(("127.0.0.1", bound.port())).await.is_err());
    }
}
