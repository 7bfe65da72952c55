use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 65536; // 64KB

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub to_upstream: u64,
    pub to_client: u64,
    pub end: RelayEnd,
}

/// Copy bytes both ways between `client` and `upstream` until either side
/// closes, errors, or (with `idle_timeout`) both stay silent too long.
///
/// The end of one direction ends the whole relay: half-open tunnels are not
/// kept alive. Both write halves are shut down before returning.
pub async fn relay<C, U>(client: C, upstream: U, idle_timeout: Option<Duration>) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let to_upstream = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);
    let activity = AtomicU64::new(0);

    let end = {
        let client_to_upstream = pump(&mut client_read, &mut upstream_write, &to_upstream, &activity);
        let upstream_to_client = pump(&mut upstream_read, &mut client_write, &to_client, &activity);
        let watchdog = idle_watchdog(idle_timeout, &activity);

        tokio::select! {
            _ = client_to_upstream => RelayEnd::ClientClosed,
            _ = upstream_to_client => RelayEnd::UpstreamClosed,
            _ = watchdog => RelayEnd::IdleTimeout,
        }
    };

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;

    RelayOutcome {
        to_upstream: to_upstream.load(Ordering::Relaxed),
        to_client: to_client.load(Ordering::Relaxed),
        end,
    }
}

async fn pump<R, W>(source: &mut R, dest: &mut W, counter: &AtomicU64, activity: &AtomicU64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if dest.write_all(&buf[..n]).await.is_err() || dest.flush().await.is_err() {
                    break;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
                activity.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn idle_watchdog(idle_timeout: Option<Duration>, activity: &AtomicU64) {
    let Some(idle) = idle_timeout else {
        return std::future::pending().await;
    };
    loop {
        let seen = activity.load(Ordering::Relaxed);
        tokio::time::sleep(idle).await;
        if activity.load(Ordering::Relaxed) == seen {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relays_bytes_both_ways_unmodified() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let task = tokio::spawn(relay(client, upstream, None));

        let mut payload = vec![0u8; 200_000];
        rand::thread_rng().fill_bytes(&mut payload);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&payload).await.unwrap();
            let mut reply = vec![0u8; 5];
            client_peer.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"pong!");
            client_peer
        });

        let mut received = vec![0u8; expected.len()];
        upstream_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        upstream_peer.write_all(b"pong!").await.unwrap();

        let client_peer = writer.await.unwrap();
        drop(client_peer);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.end, RelayEnd::ClientClosed);
        assert_eq!(outcome.to_upstream, expected.len() as u64);
        assert_eq!(outcome.to_client, 5);

        // the upstream side sees the shutdown
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_close_ends_session() {
        let (client, mut client_peer) = duplex(64);
        let (upstream, upstream_peer) = duplex(64);
        let task = tokio::spawn(relay(client, upstream, None));
        drop(upstream_peer);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.end, RelayEnd::UpstreamClosed);
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silent_tunnel() {
        let (client, _client_peer) = duplex(64);
        let (upstream, _upstream_peer) = duplex(64);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            relay(client, upstream, Some(Duration::from_millis(50))),
        )
        .await
        .expect("idle relay should end on its own");
        assert_eq!(outcome.end, RelayEnd::IdleTimeout);
    }
}
