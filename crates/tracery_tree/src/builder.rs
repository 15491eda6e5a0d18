//! Tree building.
//!
//! Consumes trace results and partitions each result's fresh content into
//! new nodes. The fresh content is whatever lies past the requesting node's
//! root-path trace; partition cuts fall on interactions and on boundary
//! syscalls (`execve`, `exit`, `exit_group`, `signal`), and consecutive
//! resolved interactions on the same `(channel, direction)` endpoint collapse
//! into one node. Failed runs gain a synthetic error-marker leaf instead of
//! poisoning existing nodes; answering a blocked node clones it into a new
//! sibling rather than editing history.

use crate::node::Node;
use crate::repo::NodeRepository;
use crate::store::KvStore;
use tracery_core::{CoreResult, Direction, FlatTrace, Interaction, NodeId};
use tracery_proto::{InputEvent, NodeAnnouncement, TraceRequest, TraceResult};
use tracing::{info, warn};

enum Anchor {
    /// Boundary syscall at a trace index; always cuts
    Boundary(usize),
    /// Interaction anchor; may merge with the cluster before it
    Io(Interaction),
}

impl Anchor {
    fn trace_index(&self) -> usize {
        match self {
            Self::Boundary(index) => *index,
            Self::Io(interaction) => interaction.trace_index,
        }
    }
}

struct Cluster {
    start: usize,
    interactions: Vec<Interaction>,
}

/// Serialized consumer that grows the execution tree from trace results
pub struct TreeBuilder<S: KvStore> {
    repo: NodeRepository<S>,
}

impl<S: KvStore> TreeBuilder<S> {
    /// Create a builder over a repository
    #[must_use]
    pub fn new(repo: NodeRepository<S>) -> Self {
        Self { repo }
    }

    /// The underlying repository
    #[must_use]
    pub fn repo(&self) -> &NodeRepository<S> {
        &self.repo
    }

    /// Mutable access to the underlying repository
    pub fn repo_mut(&mut self) -> &mut NodeRepository<S> {
        &mut self.repo
    }

    /// Seed an empty tree with the root node and its initial request.
    ///
    /// Returns `None` when the tree already has nodes (a resumed run).
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn bootstrap(&mut self) -> CoreResult<Option<(NodeAnnouncement, TraceRequest)>> {
        if !self.repo.is_empty() {
            return Ok(None);
        }
        self.repo.persist(Node::new(NodeId::ROOT, None))?;
        info!("tree bootstrapped with root node");
        Ok(Some((
            NodeAnnouncement {
                id: NodeId::ROOT,
                parent_id: None,
            },
            TraceRequest {
                node_id: NodeId::ROOT,
                trace: FlatTrace::empty(),
            },
        )))
    }

    /// Trace request replaying a node's full root-path trace.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an id outside the tree.
    pub fn request_for(&mut self, id: NodeId) -> CoreResult<TraceRequest> {
        Ok(TraceRequest {
            node_id: id,
            trace: self.root_path_trace(id)?,
        })
    }

    /// Partition a trace result into new nodes, outcome kind `kind`
    /// (`finished`, `blocked`, `timeout`, `desync`, or `error`).
    ///
    /// Returns the announcements for the created nodes, parent first.
    /// Existing nodes are never modified, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the result names an unknown node;
    /// propagates store errors.
    pub fn handle_result(
        &mut self,
        kind: &str,
        result: &TraceResult,
    ) -> CoreResult<Vec<NodeAnnouncement>> {
        let prefix = self.root_path_trace(result.node_id)?;
        let mut fresh = subtract_prefix(&result.trace, &prefix);

        if let Some(failure) = failure_direction(kind) {
            let marker_index = result.trace.basic_blocks.len();
            fresh.interactions.push(Interaction::error_marker(failure, marker_index));
            warn!(
                node = %result.node_id,
                kind,
                annotation = result.annotation.as_deref().unwrap_or(""),
                "run failed; recording error marker"
            );
        }
        if fresh.is_empty() {
            info!(node = %result.node_id, kind, "result adds nothing new");
            return Ok(Vec::new());
        }

        let blocks_known = prefix.basic_blocks.len();
        let clusters = partition(&fresh, blocks_known);
        let starts: Vec<usize> = clusters.iter().map(|c| c.start).collect();
        let total = result.trace.basic_blocks.len();

        let mut announcements = Vec::new();
        let mut parent = result.node_id;
        let mut syscall_cursor = 0;
        let mut datapoint_cursor = 0;
        let count = clusters.len();

        for (i, cluster) in clusters.into_iter().enumerate() {
            let lo = if i == 0 { blocks_known } else { cluster.start };
            let hi = if i + 1 < count { starts[i + 1].max(lo) } else { total.max(lo) };
            let is_last = i + 1 == count;

            let lo_rel = lo.saturating_sub(blocks_known).min(fresh.basic_blocks.len());
            let hi_rel = hi
                .saturating_sub(blocks_known)
                .clamp(lo_rel, fresh.basic_blocks.len());

            let mut syscalls = Vec::new();
            while syscall_cursor < fresh.syscalls.len()
                && (is_last || fresh.syscalls[syscall_cursor].trace_index < hi)
            {
                syscalls.push(fresh.syscalls[syscall_cursor].clone());
                syscall_cursor += 1;
            }
            let mut datapoints = Vec::new();
            while datapoint_cursor < fresh.datapoints.len()
                && (is_last || fresh.datapoints[datapoint_cursor].trace_index < hi)
            {
                datapoints.push(fresh.datapoints[datapoint_cursor].clone());
                datapoint_cursor += 1;
            }

            let id = self.repo.allocate();
            let trace = FlatTrace {
                tracepoints: if i == 0 { fresh.tracepoints.clone() } else { Vec::new() },
                basic_blocks: fresh.basic_blocks[lo_rel..hi_rel].to_vec(),
                syscalls,
                interactions: cluster.interactions,
                datapoints,
                maps: if i == 0 { fresh.maps.clone() } else { None },
            };
            self.repo.persist(Node {
                id,
                parent_id: Some(parent),
                trace,
            })?;
            announcements.push(NodeAnnouncement {
                id,
                parent_id: Some(parent),
            });
            parent = id;
        }

        info!(
            node = %result.node_id,
            kind,
            created = announcements.len(),
            "trace result partitioned"
        );
        Ok(announcements)
    }

    /// Answer a blocked node with external input.
    ///
    /// The blocked node is never edited; a sibling is created whose trailing
    /// interaction carries the answer, and a request replaying through the
    /// answer is returned. Empty answer data means end-of-input on the
    /// blocked channel. `None` when the id is unknown or the node is not
    /// blocked.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn handle_input(
        &mut self,
        event: &InputEvent,
    ) -> CoreResult<Option<(NodeAnnouncement, TraceRequest)>> {
        let Some(node) = self.repo.get(event.id)? else {
            warn!(node = %event.id, "input for unknown node");
            return Ok(None);
        };
        if !node.is_blocked() {
            warn!(node = %event.id, "input for a node that is not blocked");
            return Ok(None);
        }
        let parent_id = node.parent_id;
        let mut trace = node.trace.clone();
        if let Some(pending) = trace.interactions.last_mut() {
            pending.data = Some(event.data.clone());
        }

        let id = self.repo.allocate();
        self.repo.persist(Node {
            id,
            parent_id,
            trace,
        })?;
        info!(blocked = %event.id, answered = %id, bytes = event.data.len(), "blocked node answered");

        let announcement = NodeAnnouncement { id, parent_id };
        let request = self.request_for(id)?;
        Ok(Some((announcement, request)))
    }

    fn root_path_trace(&mut self, id: NodeId) -> CoreResult<FlatTrace> {
        let path = self.repo.path(id)?;
        let mut trace = FlatTrace::empty();
        for step in path {
            if let Some(node) = self.repo.get(step)? {
                trace.append_slice(&node.trace);
            }
        }
        Ok(trace)
    }
}

/// Content of `full` past the already-partitioned `prefix`
fn subtract_prefix(full: &FlatTrace, prefix: &FlatTrace) -> FlatTrace {
    FlatTrace {
        tracepoints: if prefix.tracepoints.is_empty() {
            full.tracepoints.clone()
        } else {
            Vec::new()
        },
        basic_blocks: tail(&full.basic_blocks, prefix.basic_blocks.len()),
        syscalls: tail(&full.syscalls, prefix.syscalls.len()),
        interactions: tail(&full.interactions, prefix.interactions.len()),
        datapoints: tail(&full.datapoints, prefix.datapoints.len()),
        maps: if prefix.maps.is_none() { full.maps.clone() } else { None },
    }
}

fn tail<T: Clone>(items: &[T], known: usize) -> Vec<T> {
    items.get(known..).unwrap_or(&[]).to_vec()
}

fn failure_direction(kind: &str) -> Option<Direction> {
    match kind {
        "timeout" => Some(Direction::Timeout),
        "desync" => Some(Direction::Desync),
        "error" => Some(Direction::Error),
        _ => None,
    }
}

/// Split fresh content into clusters of interactions and boundary cuts
fn partition(fresh: &FlatTrace, blocks_known: usize) -> Vec<Cluster> {
    let boundaries: Vec<usize> = fresh
        .syscalls
        .iter()
        .filter(|syscall| syscall.is_boundary())
        .map(|syscall| syscall.trace_index)
        .collect();

    // Interleave boundary cuts and interactions by trace index; a boundary
    // at the same index happened at syscall entry and sorts first.
    let mut anchors = Vec::new();
    let mut next_boundary = 0;
    for interaction in &fresh.interactions {
        while next_boundary < boundaries.len()
            && boundaries[next_boundary] <= interaction.trace_index
        {
            anchors.push(Anchor::Boundary(boundaries[next_boundary]));
            next_boundary += 1;
        }
        anchors.push(Anchor::Io(interaction.clone()));
    }
    while next_boundary < boundaries.len() {
        anchors.push(Anchor::Boundary(boundaries[next_boundary]));
        next_boundary += 1;
    }

    let mut clusters: Vec<Cluster> = Vec::new();
    for anchor in anchors {
        let start = anchor.trace_index();
        match anchor {
            Anchor::Boundary(_) => clusters.push(Cluster {
                start,
                interactions: Vec::new(),
            }),
            Anchor::Io(interaction) => {
                let merges = interaction.data.is_some()
                    && clusters.last().is_some_and(|cluster| {
                        cluster.interactions.last().is_some_and(|previous| {
                            previous.data.is_some() && previous.same_endpoint(&interaction)
                        })
                    });
                if merges {
                    if let Some(cluster) = clusters.last_mut() {
                        cluster.interactions.push(interaction);
                    }
                } else {
                    clusters.push(Cluster {
                        start,
                        interactions: vec![interaction],
                    });
                }
            }
        }
    }

    if clusters.is_empty() {
        clusters.push(Cluster {
            start: blocks_known,
            interactions: Vec::new(),
        });
    }
    clusters
}
