//! Tree service.
//!
//! The single serialized consumer of trace results and input answers. Workers
//! run concurrently, but every mutation of the tree funnels through this one
//! loop, so partitioning and id assignment never race.

use std::sync::Arc;
use tracery_core::CoreResult;
use tracery_proto::{
    Bus, Envelope, InputEvent, TraceResult, CHANNEL_INPUT, CHANNEL_NODE, TRACE_CHANNEL_PREFIX,
};
use tracery_tree::{KvStore, TreeBuilder};
use tracing::{info, warn};

/// Serialized tree consumer
pub struct TreeService<S: KvStore, B: Bus> {
    builder: TreeBuilder<S>,
    bus: Arc<B>,
}

impl<S: KvStore, B: Bus> TreeService<S, B> {
    /// Create a service over a tree builder and a bus
    #[must_use]
    pub fn new(builder: TreeBuilder<S>, bus: Arc<B>) -> Self {
        Self { builder, bus }
    }

    /// The underlying tree builder
    #[must_use]
    pub fn builder(&self) -> &TreeBuilder<S> {
        &self.builder
    }

    /// Mutable access to the underlying tree builder
    pub fn builder_mut(&mut self) -> &mut TreeBuilder<S> {
        &mut self.builder
    }

    /// Seed an empty tree: announce the root node and queue its request.
    ///
    /// # Errors
    ///
    /// Propagates store and bus errors.
    pub async fn bootstrap(&mut self) -> CoreResult<()> {
        if let Some((announcement, request)) = self.builder.bootstrap()? {
            self.bus
                .publish(CHANNEL_NODE, serde_json::to_value(announcement)?)
                .await?;
            self.bus.push_work(request).await?;
        }
        Ok(())
    }

    /// Consume trace results and input answers until the bus closes.
    ///
    /// # Errors
    ///
    /// Propagates subscribe and bootstrap errors. Malformed or stale
    /// messages, and subscription lag, are logged and skipped.
    pub async fn run(&mut self) -> CoreResult<()> {
        let mut results = self.bus.subscribe(&format!("{}*", TRACE_CHANNEL_PREFIX)).await?;
        let mut inputs = self.bus.subscribe(CHANNEL_INPUT).await?;
        self.bootstrap().await?;
        info!("tree service online");

        loop {
            tokio::select! {
                envelope = results.next() => match envelope {
                    Some(envelope) => {
                        if let Err(err) = self.on_result(&envelope).await {
                            warn!(channel = envelope.channel.as_str(), %err, "trace result rejected");
                        }
                    }
                    None => break,
                },
                envelope = inputs.next() => match envelope {
                    Some(envelope) => {
                        if let Err(err) = self.on_input(&envelope).await {
                            warn!(%err, "input event rejected");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("tree service stopped");
        Ok(())
    }

    /// Partition one trace result and announce the nodes it created.
    ///
    /// # Errors
    ///
    /// Propagates parse, store, and bus errors.
    pub async fn on_result(&mut self, envelope: &Envelope) -> CoreResult<()> {
        let Some(kind) = envelope.channel.strip_prefix(TRACE_CHANNEL_PREFIX) else {
            return Ok(());
        };
        let result: TraceResult = serde_json::from_value(envelope.payload.clone())?;
        for announcement in self.builder.handle_result(kind, &result)? {
            self.bus
                .publish(CHANNEL_NODE, serde_json::to_value(announcement)?)
                .await?;
        }
        Ok(())
    }

    /// Answer a blocked node: announce the sibling and queue its replay.
    ///
    /// # Errors
    ///
    /// Propagates parse, store, and bus errors.
    pub async fn on_input(&mut self, envelope: &Envelope) -> CoreResult<()> {
        let event: InputEvent = serde_json::from_value(envelope.payload.clone())?;
        if let Some((announcement, request)) = self.builder.handle_input(&event)? {
            self.bus
                .publish(CHANNEL_NODE, serde_json::to_value(announcement)?)
                .await?;
            self.bus.push_work(request).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracery_core::{
        FlatTrace, Interaction, NodeId, SyscallRecord, CHANNEL_STDIO,
    };
    use tracery_proto::MemoryBus;
    use tracery_tree::{MemoryKv, NodeRepository};

    fn service(bus: Arc<MemoryBus>) -> TreeService<MemoryKv, MemoryBus> {
        let repo = NodeRepository::open(MemoryKv::new()).unwrap();
        TreeService::new(TreeBuilder::new(repo), bus)
    }

    fn result_envelope(kind: &str, result: &TraceResult) -> Envelope {
        Envelope {
            channel: format!("trace.{}", kind),
            payload: serde_json::to_value(result).unwrap(),
        }
    }

    fn blocked_result() -> TraceResult {
        TraceResult::new(
            NodeId::ROOT,
            FlatTrace {
                basic_blocks: vec![0x1000],
                syscalls: vec![
                    SyscallRecord::synthetic_execve(&["/bin/cat".to_string()]),
                    SyscallRecord::started("read", vec!["0".to_string()], 1),
                ],
                interactions: vec![Interaction::pending_input(CHANNEL_STDIO, 1)],
                ..FlatTrace::empty()
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_bootstrap_announces_root_and_queues_work() {
        let bus = Arc::new(MemoryBus::new());
        let mut nodes = bus.subscribe(CHANNEL_NODE).await.unwrap();
        let mut service = service(bus.clone());

        service.bootstrap().await.unwrap();

        let announced = nodes.next().await.unwrap();
        assert_eq!(announced.payload["id"], 0);
        let request = bus.pop_work().await.unwrap().unwrap();
        assert_eq!(request.node_id, NodeId::ROOT);
        assert!(request.trace.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_read_then_answer_grows_tree() {
        let bus = Arc::new(MemoryBus::new());
        let mut nodes = bus.subscribe(CHANNEL_NODE).await.unwrap();
        let mut service = service(bus.clone());
        service.bootstrap().await.unwrap();
        bus.pop_work().await.unwrap();
        nodes.next().await.unwrap();

        service
            .on_result(&result_envelope("blocked", &blocked_result()))
            .await
            .unwrap();
        // execve cluster, then the blocked leaf.
        let _execve_node = nodes.next().await.unwrap();
        let blocked_leaf = nodes.next().await.unwrap();
        let leaf_id = blocked_leaf.payload["id"].as_u64().unwrap();

        service
            .on_input(&Envelope {
                channel: CHANNEL_INPUT.to_string(),
                payload: json!({"id": leaf_id, "data": "hi\n"}),
            })
            .await
            .unwrap();

        let sibling = nodes.next().await.unwrap();
        assert_eq!(sibling.payload["parent_id"], blocked_leaf.payload["parent_id"]);

        let request = bus.pop_work().await.unwrap().unwrap();
        let trailing = request.trace.interactions.last().unwrap();
        assert_eq!(trailing.data.as_deref(), Some(&b"hi\n"[..]));
        // root, execve cluster, blocked leaf, answered sibling
        assert_eq!(service.builder().repo().len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_result_is_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let mut service = service(bus.clone());
        service.bootstrap().await.unwrap();
        let envelope = Envelope {
            channel: "trace.finished".to_string(),
            payload: json!({"bogus": true}),
        };
        assert!(service.on_result(&envelope).await.is_err());
        assert_eq!(service.builder().repo().len(), 1);
    }

    #[tokio::test]
    async fn test_non_trace_channel_is_ignored() {
        let bus = Arc::new(MemoryBus::new());
        let mut service = service(bus.clone());
        let envelope = Envelope {
            channel: "node".to_string(),
            payload: json!({"id": 1}),
        };
        service.on_result(&envelope).await.unwrap();
        assert_eq!(service.builder().repo().len(), 0);
    }
}
