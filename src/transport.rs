//! gRPC transport between cluster nodes.
//!
//! Every node is both a server ([`BatchReceiver`]) and a client of every
//! other node ([`GrpcPeer`]). [`connect_mesh`] dials all peers before any
//! data moves, retrying nodes that are not up yet.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::time::sleep;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};

use crate::codec::Record;
use crate::error::{Result, SortError};
use crate::exchange::{Batch, Delivery, Exchange};
use crate::proto::node_service_client::NodeServiceClient;
use crate::proto::node_service_server::{NodeService, NodeServiceServer};
use crate::proto::{BatchReply, BatchRequest};
use crate::topology::Topology;
use crate::NodeId;

/// Message limit for both directions. Batches are bounded by the sender's
/// byte budget, and a single record may be up to 4 GiB, so tonic's cap is
/// lifted entirely.
pub const MAX_MESSAGE_SIZE: usize = usize::MAX;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers batches to one peer, in order.
#[tonic::async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_batch(&self, batch: Batch) -> Result<()>;
}

/// Outbound handles indexed by node id. The slot for this node stays empty.
pub struct PeerSet {
    me: NodeId,
    peers: Vec<Option<Arc<dyn BatchSender>>>,
}

impl PeerSet {
    pub fn new(total_nodes: usize, me: NodeId) -> Self {
        PeerSet {
            me,
            peers: (0..total_nodes).map(|_| None).collect(),
        }
    }

    pub fn insert(&mut self, node: NodeId, sender: Arc<dyn BatchSender>) {
        if node != self.me {
            if let Some(slot) = self.peers.get_mut(node) {
                *slot = Some(sender);
            }
        }
    }

    pub fn get(&self, node: NodeId) -> Result<&Arc<dyn BatchSender>> {
        self.peers
            .get(node)
            .and_then(Option::as_ref)
            .ok_or_else(|| SortError::Config(format!("node {} has no connection to node {}", self.me, node)))
    }

    /// True once every node but this one has a handle.
    pub fn is_complete(&self) -> bool {
        self.peers
            .iter()
            .enumerate()
            .all(|(id, peer)| id == self.me || peer.is_some())
    }
}

/// How often and for how long bootstrap keeps dialling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub retry_interval: Duration,
    /// `None` retries until every peer answers.
    pub timeout: Option<Duration>,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        ConnectPolicy {
            retry_interval: Duration::from_millis(300),
            timeout: None,
        }
    }
}

/// Retries for a failed `SendBatch`; the backoff doubles after each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Client half of a node pair.
pub struct GrpcPeer {
    me: NodeId,
    target: NodeId,
    client: NodeServiceClient<Channel>,
    retry: RetryPolicy,
}

impl GrpcPeer {
    pub fn new(me: NodeId, target: NodeId, channel: Channel, retry: RetryPolicy) -> Self {
        let client = NodeServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        GrpcPeer {
            me,
            target,
            client,
            retry,
        }
    }
}

fn is_transient(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::Unknown
            | Code::Cancelled
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
    )
}

#[tonic::async_trait]
impl BatchSender for GrpcPeer {
    async fn send_batch(&self, batch: Batch) -> Result<()> {
        let seq = batch.seq;
        let request = batch.into_request(self.me);
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut client = self.client.clone();
            let status = match client.send_batch(Request::new(request.clone())).await {
                Ok(reply) if reply.get_ref().ack => return Ok(()),
                Ok(_) => Status::aborted("peer did not acknowledge the batch"),
                Err(status) => status,
            };

            if attempt >= attempts || !is_transient(status.code()) {
                return Err(SortError::Transport {
                    node: self.target,
                    seq,
                    status: Box::new(status),
                });
            }
            warn!(
                "node {} send batch {} to node {} failed (attempt {}/{}): {}, retry in {:?}",
                self.me,
                seq,
                self.target,
                attempt,
                attempts,
                status.message(),
                backoff
            );
            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }
}

/// Dials every peer of `me`, retrying the unreachable ones on a fixed
/// interval until all answer or the policy's timeout runs out.
///
/// An address that cannot be parsed is fatal immediately.
pub async fn connect_mesh(
    topology: &Topology,
    me: NodeId,
    connect: ConnectPolicy,
    retry: RetryPolicy,
) -> Result<PeerSet> {
    let mut peers = PeerSet::new(topology.len(), me);
    let mut unconnected = BTreeMap::new();
    for node in topology.peers(me) {
        let endpoint = Endpoint::from_shared(node.endpoint())
            .map_err(|err| {
                SortError::Config(format!("invalid address {} for node {}: {err}", node.addr(), node.node_id))
            })?
            .connect_timeout(DIAL_TIMEOUT);
        unconnected.insert(node.node_id, (node.addr(), endpoint));
    }

    let started = Instant::now();
    while !unconnected.is_empty() {
        for (id, (addr, endpoint)) in mem::take(&mut unconnected) {
            match endpoint.connect().await {
                Ok(channel) => {
                    peers.insert(id, Arc::new(GrpcPeer::new(me, id, channel, retry)));
                    info!("node {me} dial node {id} succeed");
                }
                Err(source) => {
                    let err = SortError::Connect {
                        node: id,
                        addr: addr.clone(),
                        source,
                    };
                    warn!("node {me}: {err}, retry in {:?}", connect.retry_interval);
                    unconnected.insert(id, (addr, endpoint));
                }
            }
        }

        if unconnected.is_empty() {
            break;
        }
        if let Some(timeout) = connect.timeout {
            if started.elapsed() >= timeout {
                let missing: Vec<_> = unconnected.keys().collect();
                return Err(SortError::Config(format!(
                    "node {me} could not reach nodes {missing:?} within {timeout:?}"
                )));
            }
        }
        sleep(connect.retry_interval).await;
    }

    Ok(peers)
}

/// Server half: appends every inbound batch to the local partition.
pub struct BatchReceiver {
    exchange: Arc<Exchange>,
}

impl BatchReceiver {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        BatchReceiver { exchange }
    }

    /// Wraps the receiver in a tonic service with raised message limits.
    pub fn into_service(self) -> NodeServiceServer<BatchReceiver> {
        NodeServiceServer::new(self)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE)
    }
}

#[tonic::async_trait]
impl NodeService for BatchReceiver {
    async fn send_batch(
        &self,
        request: Request<BatchRequest>,
    ) -> Result<Response<BatchReply>, Status> {
        let BatchRequest {
            sender,
            seq,
            records,
            is_final,
        } = request.into_inner();
        let sender = sender as NodeId;

        let records = records
            .into_iter()
            .map(Record::try_from)
            .collect::<Result<Vec<_>>>()
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let count = records.len();

        match self.exchange.accept(sender, seq, records, is_final)? {
            Delivery::Applied => debug!(
                "node {} received {} records from node {} (batch {}, final: {})",
                self.exchange.me(),
                count,
                sender,
                seq,
                is_final
            ),
            Delivery::Replayed => warn!(
                "node {} ignored replayed batch {} from node {}",
                self.exchange.me(),
                seq,
                sender
            ),
        }
        Ok(Response::new(BatchReply { ack: true }))
    }
}


#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::*;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;

    use super::*;
    use crate::codec::KEY_LEN;
    use crate::topology::NodeDescriptor;

    async fn serve(exchange: Arc<Exchange>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(
            Server::builder()
                .add_service(BatchReceiver::new(exchange).into_service())
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        port
    }

    #[tokio::test]
    async fn test_batches_reach_remote_exchange() {
        let remote = Arc::new(Exchange::new(1, 2, 10));
        let port = serve(remote.clone()).await;
        let topology = Topology::new(vec![
            NodeDescriptor::new(0, "127.0.0.1", 1),
            NodeDescriptor::new(1, "127.0.0.1", port),
        ])
        .unwrap();

        let peers = connect_mesh(&topology, 0, ConnectPolicy::default(), RetryPolicy::default())
            .await
            .unwrap();
        assert!(peers.is_complete());

        let record = Record::new([0x80; KEY_LEN], "remote");
        let peer = peers.get(1).unwrap();
        peer.send_batch(Batch {
            target: 1,
            seq: 0,
            records: vec![record.clone()],
            is_final: false,
        })
        .await
        .unwrap();
        // a replay is acknowledged but not applied
        peer.send_batch(Batch {
            target: 1,
            seq: 0,
            records: vec![record.clone()],
            is_final: false,
        })
        .await
        .unwrap();
        peer.send_batch(Batch {
            target: 1,
            seq: 1,
            records: vec![],
            is_final: true,
        })
        .await
        .unwrap();

        assert!(remote.is_released());
        assert_eq!(remote.take_local(), vec![record]);
    }

    /// Answers `Unavailable` for the first `failures` calls, then hands the
    /// request to a real receiver. With `lose_ack` the failing calls are
    /// applied first, as if only the reply went missing.
    struct Flaky {
        failures: AtomicU32,
        lose_ack: bool,
        inner: BatchReceiver,
    }

    #[tonic::async_trait]
    impl NodeService for Flaky {
        async fn send_batch(
            &self,
            request: Request<BatchRequest>,
        ) -> Result<Response<BatchReply>, Status> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                if self.lose_ack {
                    self.inner.send_batch(request).await?;
                }
                return Err(Status::unavailable("peer restarting"));
            }
            self.inner.send_batch(request).await
        }
    }

    async fn serve_flaky(exchange: Arc<Exchange>, failures: u32, lose_ack: bool) -> GrpcPeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let service = Flaky {
            failures: AtomicU32::new(failures),
            lose_ack,
            inner: BatchReceiver::new(exchange),
        };
        tokio::spawn(
            Server::builder()
                .add_service(NodeServiceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        let channel = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let retry = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
        };
        GrpcPeer::new(0, 1, channel, retry)
    }

    #[rstest]
    #[case::first_try(0, false)]
    #[case::after_one(1, false)]
    #[case::on_last_attempt(2, false)]
    #[case::lost_ack(1, true)]
    #[case::two_lost_acks(2, true)]
    #[tokio::test]
    async fn test_transient_failure_is_retried(#[case] failures: u32, #[case] lose_ack: bool) {
        let remote = Arc::new(Exchange::new(1, 2, 10));
        let peer = serve_flaky(remote.clone(), failures, lose_ack).await;
        let record = Record::new([0x80; KEY_LEN], "once");

        peer.send_batch(Batch {
            target: 1,
            seq: 0,
            records: vec![record.clone()],
            is_final: true,
        })
        .await
        .unwrap();

        assert!(remote.is_released());
        assert_eq!(remote.take_local(), vec![record]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let remote = Arc::new(Exchange::new(1, 2, 10));
        let peer = serve_flaky(remote.clone(), 3, false).await;

        let err = peer
            .send_batch(Batch {
                target: 1,
                seq: 0,
                records: vec![Record::new([0x80; KEY_LEN], "lost")],
                is_final: true,
            })
            .await
            .unwrap_err();
        match err {
            SortError::Transport { node, seq, status } => {
                assert_eq!((node, seq), (1, 0));
                assert_eq!(status.code(), Code::Unavailable);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!remote.is_released());
        assert_eq!(remote.pending(1), 0);
    }

    #[tokio::test]
    async fn test_protocol_violation_is_not_retried() {
        let remote = Arc::new(Exchange::new(1, 2, 10));
        let port = serve(remote).await;
        let channel = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let peer = GrpcPeer::new(0, 1, channel, RetryPolicy::default());

        let err = peer
            .send_batch(Batch {
                target: 1,
                seq: 5,
                records: vec![],
                is_final: false,
            })
            .await
            .unwrap_err();
        match err {
            SortError::Transport { node, seq, status } => {
                assert_eq!((node, seq), (1, 5));
                assert_eq!(status.code(), Code::FailedPrecondition);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_waits_for_late_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let topology = Topology::new(vec![
            NodeDescriptor::new(0, "127.0.0.1", 1),
            NodeDescriptor::new(1, "127.0.0.1", port),
        ])
        .unwrap();

        let policy = ConnectPolicy {
            retry_interval: Duration::from_millis(50),
            timeout: None,
        };
        let dialer = tokio::spawn(async move {
            connect_mesh(&topology, 0, policy, RetryPolicy::default()).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(
            Server::builder()
                .add_service(BatchReceiver::new(Arc::new(Exchange::new(1, 2, 10))).into_service())
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        let peers = tokio::time::timeout(Duration::from_secs(10), dialer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(peers.is_complete());
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_is_config_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let topology = Topology::new(vec![
            NodeDescriptor::new(0, "127.0.0.1", 1),
            NodeDescriptor::new(1, "127.0.0.1", port),
        ])
        .unwrap();

        let policy = ConnectPolicy {
            retry_interval: Duration::from_millis(20),
            timeout: Some(Duration::from_millis(100)),
        };
        let result = connect_mesh(&topology, 0, policy, RetryPolicy::default()).await;
        assert!(matches!(result, Err(SortError::Config(_))));
    }

    #[tokio::test]
    async fn test_unparseable_address_is_fatal() {
        let topology = Topology::new(vec![
            NodeDescriptor::new(0, "127.0.0.1", 1),
            NodeDescriptor::new(1, "bad host name", 2),
        ])
        .unwrap();

        let result =
            connect_mesh(&topology, 0, ConnectPolicy::default(), RetryPolicy::default()).await;
        assert!(matches!(result, Err(SortError::Config(_))));
    }
}
