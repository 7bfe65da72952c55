use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::error::BridgeError;
use crate::hooks::RelayHooks;
use crate::http::{self, BodyLength, RequestHead, ResponseHead};
use crate::relay::relay;
use crate::stats::BridgeStats;
use crate::upstream::{BoxedStream, UpstreamConnector};

type ClientConn = BufReader<TcpStream>;
type UpstreamConn = BufReader<BoxedStream>;

/// Everything a session needs from the bridge. Read-only after startup.
pub(crate) struct SessionContext<H> {
    pub connector: UpstreamConnector,
    pub hooks: H,
    pub idle_timeout: Option<Duration>,
    pub stats: Arc<BridgeStats>,
}

/// Lifecycle of one accepted client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    ReadingRequest,
    ConnectingUpstream,
    AuthInjected,
    Tunneling,
    Forwarding,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Closed) => self != Closed,
            (Accepted, ReadingRequest) => true,
            // a kept-alive upstream connection skips ConnectingUpstream
            (ReadingRequest, ConnectingUpstream | AuthInjected) => true,
            (ConnectingUpstream, AuthInjected) => true,
            (AuthInjected, Tunneling | Forwarding) => true,
            (Forwarding, ReadingRequest) => true,
            // 101 Switching Protocols on a forwarded request
            (Forwarding, Tunneling) => true,
            _ => false,
        }
    }
}

/// Result of one forwarded plain-HTTP exchange
enum Exchange {
    KeepAlive,
    Close,
}

/// One client connection and, once connected, its upstream connection.
pub struct RelaySession<H> {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<SessionContext<H>>,
    state: SessionState,
}

impl<H: RelayHooks> RelaySession<H> {
    pub(crate) fn new(id: u64, peer: SocketAddr, ctx: Arc<SessionContext<H>>) -> Self {
        Self {
            id,
            peer,
            ctx,
            state: SessionState::Accepted,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(session = self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Serve the connection until it closes. Both sockets are closed when
    /// this returns, whatever the outcome.
    pub async fn run(mut self, client: TcpStream) -> Result<(), BridgeError> {
        let result = self.drive(BufReader::new(client)).await;
        self.advance(SessionState::Closed);
        result
    }

    async fn drive(&mut self, mut client: ClientConn) -> Result<(), BridgeError> {
        let mut upstream: Option<UpstreamConn> = None;
        self.advance(SessionState::ReadingRequest);
        loop {
            let Some(head) = http::read_request_head(&mut client).await? else {
                trace!(session = self.id, "client closed the connection");
                return Ok(());
            };
            if head.is_connect() {
                // any kept-alive upstream connection is dropped here
                return self.tunnel(client, head).await;
            }
            match self.forward(&mut client, &mut upstream, head).await? {
                Exchange::KeepAlive => self.advance(SessionState::ReadingRequest),
                Exchange::Close => return Ok(()),
            }
        }
    }

    async fn tunnel(&mut self, mut client: ClientConn, mut head: RequestHead) -> Result<(), BridgeError> {
        if let Err(e) = self.ctx.hooks.pre_connect(&head) {
            return Err(reject(&mut client, e).await);
        }

        self.advance(SessionState::ConnectingUpstream);
        let mut upstream = match self.ctx.connector.connect().await {
            Ok(stream) => BufReader::new(stream),
            Err(e) => return Err(reject(&mut client, e).await),
        };

        self.ctx.hooks.transform_request(&mut head);
        self.advance(SessionState::AuthInjected);

        let response = match self.handshake(&mut upstream, &head).await {
            Ok(response) => response,
            Err(e) => return Err(reject(&mut client, e).await),
        };
        self.ctx.hooks.on_response(&head, &response);

        client.write_all(&response.to_bytes()).await?;
        client.flush().await?;

        if !response.is_success() {
            info!(
                session = self.id,
                dest = %head.target,
                status = response.status,
                "upstream refused tunnel"
            );
            let body = response.body_length(&head)?;
            let timeout = self.ctx.connector.timeout();
            match tokio::time::timeout(timeout, http::copy_body(&mut upstream, &mut client, body)).await {
                Ok(Ok(copied)) => trace!(session = self.id, copied, "relayed refusal body"),
                Ok(Err(e)) => debug!(session = self.id, error = %e, "failed to relay refusal body"),
                Err(_) => debug!(session = self.id, ?timeout, "refusal body still open after timeout"),
            }
            return Ok(());
        }

        info!(session = self.id, peer = %self.peer, dest = %head.target, "tunnel established");
        self.advance(SessionState::Tunneling);
        let outcome = relay(client, upstream, self.ctx.idle_timeout).await;
        self.ctx.stats.add_transfer(outcome.to_upstream, outcome.to_client);
        debug!(
            session = self.id,
            dest = %head.target,
            sent = outcome.to_upstream,
            received = outcome.to_client,
            end = ?outcome.end,
            "tunnel closed"
        );
        Ok(())
    }

    /// Send the CONNECT head upstream and wait for its answer, bounded by
    /// the connect timeout.
    async fn handshake(&self, upstream: &mut UpstreamConn, head: &RequestHead) -> Result<ResponseHead, BridgeError> {
        let timeout = self.ctx.connector.timeout();
        let exchange = async {
            upstream
                .write_all(&head.to_bytes())
                .await
                .map_err(|e| self.upstream_io(e))?;
            upstream.flush().await.map_err(|e| self.upstream_io(e))?;
            http::read_response_head(upstream).await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(self.upstream_timeout()),
        }
    }

    async fn forward(
        &mut self,
        client: &mut ClientConn,
        slot: &mut Option<UpstreamConn>,
        mut head: RequestHead,
    ) -> Result<Exchange, BridgeError> {
        head.make_target_absolute()?;
        let request_body = head.body_length()?;
        let client_keep_alive = head.wants_keep_alive();

        if let Err(e) = self.ctx.hooks.pre_connect(&head) {
            return Err(reject(client, e).await);
        }

        let reused = slot.is_some();
        let mut upstream = match slot.take() {
            Some(upstream) => upstream,
            None => {
                self.advance(SessionState::ConnectingUpstream);
                match self.ctx.connector.connect().await {
                    Ok(stream) => BufReader::new(stream),
                    Err(e) => return Err(reject(client, e).await),
                }
            }
        };

        self.ctx.hooks.transform_request(&mut head);
        self.advance(SessionState::AuthInjected);
        self.advance(SessionState::Forwarding);
        debug!(session = self.id, method = %head.method, dest = %head.target, reused, "forwarding request");

        let sent = match self.send_request(client, &mut upstream, &head, request_body).await {
            Ok(sent) => sent,
            Err(e) => return Err(reject(client, e).await),
        };

        // Interim 1xx heads are relayed as they come; the final head decides
        // the body framing. Each head must arrive within the connect timeout,
        // bodies are not bounded.
        let timeout = self.ctx.connector.timeout();
        let mut received = 0u64;
        loop {
            let next_head = match tokio::time::timeout(timeout, http::read_response_head(&mut upstream)).await {
                Ok(result) => result,
                Err(_) => Err(self.upstream_timeout()),
            };
            let response = match next_head {
                Ok(response) => response,
                Err(e) if received == 0 => return Err(reject(client, e).await),
                Err(e) => return Err(e),
            };
            self.ctx.hooks.on_response(&head, &response);
            let response_bytes = response.to_bytes();
            received += response_bytes.len() as u64;
            client.write_all(&response_bytes).await?;

            if response.is_interim() {
                client.flush().await?;
                continue;
            }

            if response.status == 101 {
                client.flush().await?;
                info!(session = self.id, dest = %head.target, "protocol upgrade, relaying raw bytes");
                self.advance(SessionState::Tunneling);
                let outcome = relay(&mut *client, upstream, self.ctx.idle_timeout).await;
                self.ctx.stats.add_transfer(sent + outcome.to_upstream, received + outcome.to_client);
                return Ok(Exchange::Close);
            }

            let body = response.body_length(&head)?;
            received += http::copy_body(&mut upstream, client, body).await?;
            self.ctx.stats.add_transfer(sent, received);
            info!(
                session = self.id,
                method = %head.method,
                dest = %head.target,
                status = response.status,
                "request forwarded"
            );

            let upstream_keeps = response.keeps_alive() && body != BodyLength::UntilClose;
            if upstream_keeps {
                *slot = Some(upstream);
            }
            return Ok(if client_keep_alive && upstream_keeps {
                Exchange::KeepAlive
            } else {
                Exchange::Close
            });
        }
    }

    async fn send_request(
        &self,
        client: &mut ClientConn,
        upstream: &mut UpstreamConn,
        head: &RequestHead,
        body: BodyLength,
    ) -> Result<u64, BridgeError> {
        let head_bytes = head.to_bytes();
        upstream.write_all(&head_bytes).await.map_err(|e| self.upstream_io(e))?;
        let body_bytes = http::copy_body(client, upstream, body).await?;
        Ok(head_bytes.len() as u64 + body_bytes)
    }

    fn upstream_timeout(&self) -> BridgeError {
        BridgeError::UpstreamTimeout {
            addr: self.ctx.connector.upstream().authority(),
            timeout: self.ctx.connector.timeout(),
        }
    }

    fn upstream_io(&self, source: std::io::Error) -> BridgeError {
        BridgeError::UpstreamConnect {
            addr: self.ctx.connector.upstream().authority(),
            source,
        }
    }
}

/// Answer the client with the status matching `err`, if it has one, and
/// hand the error back for the caller to return.
async fn reject<W>(client: &mut W, err: BridgeError) -> BridgeError
where
    W: AsyncWrite + Unpin,
{
    if let Some((status, reason)) = err.status_code() {
        let head = ResponseHead::synthetic(status, reason);
        let _ = client.write_all(&head.to_bytes()).await;
        let _ = client.flush().await;
    }
    err
}

/// Run one accepted connection to completion and account for it.
pub(crate) async fn serve<H: RelayHooks>(
    ctx: Arc<SessionContext<H>>,
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
) {
    let _active = ctx.stats.session_started();
    if let Err(e) = stream.set_nodelay(true) {
        trace!(session = id, error = %e, "failed to set TCP_NODELAY on client socket");
    }

    let session = RelaySession::new(id, peer, Arc::clone(&ctx));
    match session.run(stream).await {
        Ok(()) => trace!(session = id, "session finished"),
        Err(BridgeError::ClientProtocol(reason)) => {
            ctx.stats.session_failed();
            debug!(session = id, %peer, %reason, "dropping client with malformed request");
        }
        Err(e) => {
            ctx.stats.session_failed();
            warn!(session = id, %peer, error = %e, "session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_connect_path_transitions() {
        let path = [Accepted, ReadingRequest, ConnectingUpstream, AuthInjected, Tunneling, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_keep_alive_loop_transitions() {
        assert!(Forwarding.can_advance_to(ReadingRequest));
        assert!(ReadingRequest.can_advance_to(AuthInjected));
        assert!(AuthInjected.can_advance_to(Forwarding));
    }

    #[test]
    fn test_closed_is_terminal_and_reachable() {
        for state in [Accepted, ReadingRequest, ConnectingUpstream, AuthInjected, Tunneling, Forwarding] {
            assert!(state.can_advance_to(Closed));
            assert!(!Closed.can_advance_to(state));
        }
        assert!(!Closed.can_advance_to(Closed));
    }

    #[test]
    fn test_no_relay_before_handshake() {
        assert!(!ConnectingUpstream.can_advance_to(Tunneling));
        assert!(!ReadingRequest.can_advance_to(Tunneling));
        assert!(!Accepted.can_advance_to(Forwarding));
    }
}
