use std::fs;
use std::path::PathBuf;

use log::info;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::error::{Result, SortError};
use crate::node::{Node, NodeOptions, RunSummary};
use crate::standalone::Job;
use crate::topology::{NodeDescriptor, Topology};
use crate::utils::part_path;
use crate::NodeId;

/// Output of one in-process node.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub node_id: NodeId,
    pub path: PathBuf,
    pub summary: RunSummary,
}

/// Starts one node per input on loopback ports and waits for all of them.
///
/// The first node failure aborts the others, which would otherwise wait on
/// the barrier forever. Outputs are returned in node id order.
pub async fn perform_sort(job: &Job, options: NodeOptions) -> Result<Vec<NodeOutput>> {
    if job.inputs.is_empty() {
        return Err(SortError::Config("at least one input is required".into()));
    }
    fs::create_dir_all(&job.output).map_err(|source| SortError::Write {
        path: job.output.clone(),
        source,
    })?;

    let mut listeners = Vec::with_capacity(job.inputs.len());
    let mut descriptors = Vec::with_capacity(job.inputs.len());
    for node_id in 0..job.inputs.len() {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        descriptors.push(NodeDescriptor::new(node_id, "127.0.0.1", port));
        listeners.push(listener);
    }
    let topology = Topology::new(descriptors)?;
    info!("standalone cluster of {} nodes", topology.len());

    let mut nodes = JoinSet::new();
    for (node_id, (listener, input)) in listeners.into_iter().zip(&job.inputs).enumerate() {
        let node = Node::new(node_id, topology.clone(), options)?;
        let input = input.clone();
        let path = part_path(&job.output, node_id);
        nodes.spawn(async move {
            let summary = node.run_with_listener(listener, &input, &path).await?;
            Ok::<_, SortError>(NodeOutput {
                node_id,
                path,
                summary,
            })
        });
    }

    let mut outputs = Vec::with_capacity(job.inputs.len());
    while let Some(joined) = nodes.join_next().await {
        let result = joined.map_err(|err| SortError::Io(std::io::Error::other(err)));
        match result.and_then(|output| output) {
            Ok(output) => outputs.push(output),
            Err(err) => {
                nodes.abort_all();
                return Err(err);
            }
        }
    }
    outputs.sort_by_key(|output| output.node_id);
    Ok(outputs)
}
