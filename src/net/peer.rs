// The gossip protocol: the three-way handshake, the three gossip actions
// (NEWBLOCK, GETBLOCKCHAIN, BLOCKCHAINBCAST), the neighbour liveness map,
// and the two background workers every running node keeps alive (auto
// propagation of locally-mined blocks, and a one-shot join advertisement).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::config;
use crate::consensus::chain::Chain;
use crate::error::{CodecError, ConnectionError, PeerError};
use crate::net::codec::{self, Envelope};
use crate::net::transport::{self, Connection};
use crate::primitives::block::Block;

/// A running node: its chain, its listening port, and the neighbours it
/// currently believes are reachable.
pub struct Peer {
    listen_port: u16,
    chain: Arc<Chain>,
    neighbours: RwLock<HashMap<String, bool>>,
}

impl Peer {
    pub fn new(listen_port: u16) -> Arc<Peer> {
        Arc::new(Peer {
            listen_port,
            chain: Arc::new(Chain::new()),
            neighbours: RwLock::new(HashMap::new()),
        })
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub async fn neighbours_snapshot(&self) -> HashMap<String, bool> {
        self.neighbours.read().await.clone()
    }

    async fn set_neighbour(&self, addr: &str, live: bool) {
        self.neighbours.write().await.insert(addr.to_string(), live);
    }

    /// Initializes the chain, binds the listener, and spawns the accept
    /// loop plus both background workers. Returns once everything is
    /// running; callers are expected to keep the process alive separately
    /// (the operator CLI's input loop, typically).
    pub async fn start(self: &Arc<Self>) -> Result<(), PeerError> {
        self.chain.init().await;

        let bind_addr = format!("{}:{}", config::p2p_bind_address(), self.listen_port);
        let listener = transport::listen(&bind_addr).await?;
        log::info!("listening on {bind_addr}");

        self.spawn_propagator();
        self.spawn_join_broadcast();

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let peer = Arc::clone(&peer);
                        tokio::spawn(async move { peer.handle_connection(stream, addr).await });
                    }
                    Err(e) => log::error!("accept failed: {e}"),
                }
            }
        });

        Ok(())
    }

    /// Drives the initiator side of the three-way handshake against `addr`.
    pub async fn add_peer(self: &Arc<Self>, addr: &str) -> Result<(), PeerError> {
        let stream = transport::dial(addr).await?;
        let mut conn = Connection::new(stream);

        conn.send(&Envelope::Ping { port: self.listen_port }).await?;
        let reply = conn.recv().await?.ok_or(PeerError::ConnectionClosed)?;
        if !matches!(reply, Envelope::Pong) {
            return Err(PeerError::HandshakeFailed);
        }
        conn.send(&Envelope::Ack).await?;

        self.set_neighbour(addr, true).await;
        log::info!("added neighbour {addr}");
        self.spawn_get_blockchain_broadcast();
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut conn = Connection::new(stream);
        let envelope = match conn.recv().await {
            Ok(Some(e)) => e,
            Ok(None) => return,
            Err(ConnectionError::Codec(CodecError::UnknownAction(action))) => {
                log::warn!("dropping unknown action {action:?} from {remote}");
                return;
            }
            Err(e) => {
                log::error!("failed to decode envelope from {remote}: {e}");
                return;
            }
        };

        match envelope {
            Envelope::Ping { port } => self.handle_ping(&mut conn, remote, port).await,
            Envelope::Pong | Envelope::Ack => {
                log::warn!("unexpected {envelope:?} from {remote} outside a handshake")
            }
            Envelope::NewBlock(b64) => self.handle_new_block(b64, remote).await,
            Envelope::GetBlockchain => self.handle_get_blockchain().await,
            Envelope::BlockchainBcast(b64) => self.handle_blockchain_bcast(b64, remote).await,
        }
    }

    async fn handle_ping(self: &Arc<Self>, conn: &mut Connection, remote: SocketAddr, port: u16) {
        if let Err(e) = conn.send(&Envelope::Pong).await {
            log::error!("failed to reply PONG to {remote}: {e}");
            return;
        }
        match conn.recv().await {
            Ok(Some(Envelope::Ack)) => {
                let addr = format!("{}:{port}", remote.ip());
                self.set_neighbour(&addr, true).await;
                log::info!("added neighbour {addr} via handshake");
                self.spawn_get_blockchain_broadcast();
            }
            Ok(Some(other)) => log::warn!("expected ACK from {remote}, got {other:?}"),
            Ok(None) => log::warn!("connection from {remote} closed before ACK"),
            Err(e) => log::error!("error awaiting ACK from {remote}: {e}"),
        }
    }

    async fn handle_new_block(self: &Arc<Self>, b64: String, remote: SocketAddr) {
        let block = match codec::decode_block_b64(&b64) {
            Ok(block) => block,
            Err(e) => {
                log::error!("failed to decode NEWBLOCK from {remote}: {e}");
                return;
            }
        };

        let tip = self.chain.tip().await;
        if block.index <= tip.index {
            log::debug!("dropping stale NEWBLOCK (index {}) from {remote}", block.index);
            return;
        }
        if tip_looks_corrupt(&tip) {
            log::warn!("local tip looks corrupt, skipping NEWBLOCK from {remote}");
            return;
        }
        if tip.hash == block.previous_hash {
            if self.chain.add_block(block).await {
                log::info!("appended block from {remote} via NEWBLOCK");
            } else {
                log::info!("rejected block from {remote} via NEWBLOCK");
            }
        } else {
            log::info!("gap detected from {remote}'s NEWBLOCK, requesting the chain");
            self.spawn_get_blockchain_broadcast();
        }
    }

    async fn handle_get_blockchain(self: &Arc<Self>) {
        self.broadcast_chain().await;
    }

    async fn handle_blockchain_bcast(self: &Arc<Self>, b64: String, remote: SocketAddr) {
        let snapshot = match codec::decode_chain_b64(&b64) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("failed to decode BLOCKCHAINBCAST from {remote}: {e}");
                return;
            }
        };
        if self.chain.replace(snapshot).await {
            log::info!("replaced chain with heavier one from {remote}");
        } else {
            log::debug!("kept current chain, candidate from {remote} was not heavier");
        }
    }

    /// Sends `envelope` to every neighbour currently believed live, each on
    /// its own short-lived connection and its own task. A neighbour is
    /// marked down if the send fails.
    async fn broadcast(self: &Arc<Self>, envelope: Envelope) {
        let targets: Vec<String> = self
            .neighbours
            .read()
            .await
            .iter()
            .filter(|(_, &live)| live)
            .map(|(addr, _)| addr.clone())
            .collect();

        for addr in targets {
            let peer = Arc::clone(self);
            let envelope = envelope.clone();
            tokio::spawn(async move {
                let outcome: Result<(), PeerError> = async {
                    let stream = transport::dial(&addr).await?;
                    let mut conn = Connection::new(stream);
                    conn.send(&envelope).await?;
                    Ok(())
                }
                .await;
                if let Err(e) = outcome {
                    log::warn!("broadcast to {addr} failed, marking down: {e}");
                    peer.set_neighbour(&addr, false).await;
                }
            });
        }
    }

    async fn broadcast_new_block(self: &Arc<Self>, block: Block) {
        self.broadcast(Envelope::NewBlock(codec::encode_block_b64(&block))).await;
    }

    async fn broadcast_chain(self: &Arc<Self>) {
        let snapshot = self.chain.snapshot().await;
        self.broadcast(Envelope::BlockchainBcast(codec::encode_chain_b64(&snapshot)))
            .await;
    }

    fn spawn_get_blockchain_broadcast(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.broadcast(Envelope::GetBlockchain).await });
    }

    /// Permanent worker: republishes every block this node mines or
    /// accepts to all live neighbours.
    fn spawn_propagator(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(block) = peer.chain.get_new_block().await {
                peer.broadcast_new_block(block).await;
            }
        });
    }

    /// One-shot worker: advertises this node's chain to whatever
    /// neighbours were configured before `start` was called.
    fn spawn_join_broadcast(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.broadcast_chain().await });
    }
}

/// Before trusting a gap/fork decision to the local tip, make sure the tip
/// itself isn't the corrupt one.
fn tip_looks_corrupt(tip: &Block) -> bool {
    !tip.has_self_consistent_hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_registers_neighbour_on_both_sides() {
        let p1 = Peer::new(19101);
        let p2 = Peer::new(19102);
        p1.start().await.unwrap();
        p2.start().await.unwrap();

        p1.add_peer("127.0.0.1:19102").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let p1_neighbours = p1.neighbours_snapshot().await;
        assert_eq!(p1_neighbours.get("127.0.0.1:19102"), Some(&true));

        let p2_neighbours = p2.neighbours_snapshot().await;
        assert_eq!(
            p2_neighbours.get("127.0.0.1:19101"),
            Some(&true),
            "receiver must record the initiator's listen port, not its ephemeral source port"
        );
    }

    #[tokio::test]
    async fn test_add_peer_fails_against_nothing_listening() {
        let p1 = Peer::new(19201);
        p1.start().await.unwrap();
        let result = p1.add_peer("127.0.0.1:1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_new_block_gossip_propagates_and_advances_tip() {
        let p1 = Peer::new(19301);
        let p2 = Peer::new(19302);
        p1.start().await.unwrap();
        p2.start().await.unwrap();

        p1.add_peer("127.0.0.1:19302").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        p1.chain().add(b"mined on p1".to_vec()).await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(p2.chain().len().await, 2);
        assert_eq!(p2.chain().tip().await.data, b"mined on p1".to_vec());
    }
}
