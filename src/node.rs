//! One participant's full run: serve, bootstrap, scatter, wait, sort, write.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::codec::{Record, RecordReader};
use crate::error::{Result, SortError};
use crate::exchange::{scatter, Exchange, ScatterStats, DEFAULT_BATCH_BYTES};
use crate::sorter::sort_and_save;
use crate::topology::{NodeDescriptor, Topology};
use crate::transport::{connect_mesh, BatchReceiver, ConnectPolicy, RetryPolicy};
use crate::NodeId;

/// How long a stopping server may take to drain its connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tuning for a node's run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeOptions {
    /// Records queued for one peer before they are flushed.
    pub batch_size: usize,
    /// Encoded size at which a peer's queue is flushed early.
    pub batch_bytes: usize,
    pub connect: ConnectPolicy,
    pub send: RetryPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            batch_size: 1000,
            batch_bytes: DEFAULT_BATCH_BYTES,
            connect: ConnectPolicy::default(),
            send: RetryPolicy::default(),
        }
    }
}

/// What a finished run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub records_read: u64,
    /// Read locally and owned by this node.
    pub records_kept: u64,
    pub records_sent: u64,
    pub batches_sent: u64,
    /// Size of this node's sorted output.
    pub records_written: u64,
}

impl RunSummary {
    fn new(stats: ScatterStats, records_written: u64) -> Self {
        RunSummary {
            records_read: stats.records_read,
            records_kept: stats.records_kept,
            records_sent: stats.records_sent,
            batches_sent: stats.batches_sent,
            records_written,
        }
    }
}

pub struct Node {
    id: NodeId,
    topology: Topology,
    options: NodeOptions,
}

impl Node {
    /// Fails with a configuration error if `id` is not in `topology`.
    pub fn new(id: NodeId, topology: Topology, options: NodeOptions) -> Result<Self> {
        topology.node(id)?;
        Ok(Node {
            id,
            topology,
            options,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn descriptor(&self) -> Result<&NodeDescriptor> {
        self.topology.node(self.id)
    }

    /// Binds this node's configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.descriptor()?.addr();
        let resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|err| SortError::Config(format!("cannot resolve {addr}: {err}")))?
            .next()
            .ok_or_else(|| SortError::Config(format!("{addr} resolves to no address")))?;
        TcpListener::bind(resolved)
            .await
            .map_err(|err| SortError::Config(format!("failed to listen on {addr}: {err}")))
    }

    /// Runs the node on its configured address.
    pub async fn run(self, input: &Path, output: &Path) -> Result<RunSummary> {
        let listener = self.bind().await?;
        self.run_with_listener(listener, input, output).await
    }

    /// Runs the node, serving peers on an already bound listener.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        input: &Path,
        output: &Path,
    ) -> Result<RunSummary> {
        info!("node {} configured as {:?}", self.id, self.descriptor()?);
        let exchange = Arc::new(
            Exchange::new(self.id, self.topology.len(), self.options.batch_size)
                .with_batch_bytes(self.options.batch_bytes),
        );

        // dropping `shutdown` on an early return stops the server too
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(
            Server::builder()
                .add_service(BatchReceiver::new(exchange.clone()).into_service())
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.await;
                }),
        );

        let peers = connect_mesh(
            &self.topology,
            self.id,
            self.options.connect,
            self.options.send,
        )
        .await?;
        info!("node {} connected to all {} peers", self.id, self.topology.len() - 1);

        let (records, reader) = spawn_reader(input.to_path_buf(), self.options.batch_size);
        let stats = scatter(&exchange, &peers, records).await?;
        reader.await.map_err(|err| SortError::Io(std::io::Error::other(err)))?;

        tokio::select! {
            _ = exchange.wait_released() => {}
            result = &mut server => return Err(server_stopped(result)),
        }

        let written = sort_and_save(output.to_path_buf(), exchange.take_local()).await?;
        info!(
            "node {} done: wrote {} records to {}",
            self.id,
            written,
            output.display()
        );

        drop(shutdown);
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(result) => result
                .map_err(|err| SortError::Io(std::io::Error::other(err)))?
                .map_err(SortError::Server)?,
            Err(_) => {
                warn!("node {} server did not drain in {:?}", self.id, SHUTDOWN_GRACE);
                server.abort();
            }
        }

        Ok(RunSummary::new(stats, written))
    }
}

fn server_stopped(
    result: std::result::Result<std::result::Result<(), tonic::transport::Error>, tokio::task::JoinError>,
) -> SortError {
    match result {
        Ok(Ok(())) => SortError::Protocol("server stopped before all peers finished".into()),
        Ok(Err(err)) => SortError::Server(err),
        Err(err) => SortError::Io(std::io::Error::other(err)),
    }
}

/// Streams the records of `path` from the blocking pool. The bounded channel
/// keeps reading in step with sending.
fn spawn_reader(path: PathBuf, capacity: usize) -> (mpsc::Receiver<Result<Record>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(source) => {
                let _ = tx.blocking_send(Err(SortError::Read { path, source }));
                return;
            }
        };
        for record in RecordReader::new(BufReader::new(file)) {
            let record = record.map_err(|err| match err {
                SortError::Io(source) => SortError::Read {
                    path: path.clone(),
                    source,
                },
                other => other,
            });
            if tx.blocking_send(record).is_err() {
                // receiver gone, the run is already failing
                break;
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;
    use crate::codec::write_record;

    #[rstest]
    fn test_unknown_node_is_config_error() {
        let topology = Topology::local(2, "127.0.0.1", 9000).unwrap();
        assert!(matches!(
            Node::new(2, topology, NodeOptions::default()),
            Err(SortError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_streams_then_stops_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        let mut buf = Vec::new();
        write_record(&mut buf, &Record::new(*b"0123456789", "ok")).unwrap();
        buf.extend_from_slice(&5u32.to_be_bytes());
        std::fs::write(&path, buf).unwrap();

        let (mut rx, handle) = spawn_reader(path, 1);
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(matches!(rx.recv().await, Some(Err(SortError::MalformedRecord(5)))));
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_input_is_read_error() {
        let (mut rx, _) = spawn_reader(PathBuf::from("/no/such/input"), 1);
        assert!(matches!(rx.recv().await, Some(Err(SortError::Read { .. }))));
    }

    #[tokio::test]
    async fn test_single_node_run() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        let mut buf = Vec::new();
        for key in [*b"cccccccccc", *b"aaaaaaaaaa", *b"bbbbbbbbbb"] {
            write_record(&mut buf, &Record::new(key, "v")).unwrap();
        }
        std::fs::write(&input, buf).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let topology = Topology::local(1, "127.0.0.1", port).unwrap();
        let node = Node::new(0, topology, NodeOptions::default()).unwrap();

        let summary = node.run_with_listener(listener, &input, &output).await.unwrap();
        assert_eq!(summary.records_read, 3);
        assert_eq!(summary.records_kept, 3);
        assert_eq!(summary.batches_sent, 0);
        assert_eq!(summary.records_written, 3);

        let keys: Vec<_> = RecordReader::new(File::open(&output).unwrap())
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![*b"aaaaaaaaaa", *b"bbbbbbbbbb", *b"cccccccccc"]);
    }
}
