//! Distributed execution over a job transport
//!
//! The submitter encodes the shared inputs once per job into a [`JobBundle`]
//! frame and hands the transport one lightweight [`PacketTask`] per packet.
//! Nodes decode the bundle once, keep a node-local utility cache, and answer
//! each task with a [`TaskReply`]. Replies arrive in any order; any failed,
//! missing, duplicated or malformed reply aborts the job.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use butterfly_common::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use parking_lot::Mutex;

use super::bundle::{JobBundle, PacketTask, TaskOutcome, TaskReply};
use super::{compute_packet, PacketResult, TaskExecutor};
use crate::cache::UtilityCache;
use crate::evaluator::{EvalContext, UtilityEvaluator};
use crate::inputs::SharedInputs;
use crate::partition::WorkPacket;

/// Moves a job to a set of nodes and brings back one reply per task
pub trait JobTransport: Send + Sync {
    fn node_count(&self) -> usize;

    /// Ship `bundle` to every node, run every task, block until all replied
    fn run_job(&self, bundle: &[u8], tasks: Vec<PacketTask>) -> Result<Vec<TaskReply>>;
}

/// Executor that farms packets out through a [`JobTransport`]
pub struct DistributedExecutor<T: JobTransport> {
    transport: T,
    n_alternatives: usize,
    next_job: AtomicU64,
}

impl<T: JobTransport> DistributedExecutor<T> {
    pub fn new(transport: T, n_alternatives: usize) -> Self {
        Self {
            transport,
            n_alternatives,
            next_job: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check one completed result against the packet it answers
    fn accept(&self, packet: &WorkPacket, result: &PacketResult) -> Result<()> {
        if result.start != packet.start
            || result.end != packet.end
            || result.n_alternatives != self.n_alternatives
            || result.values.len() != packet.row_count() * self.n_alternatives
        {
            return Err(Error::Distribution(format!(
                "packet {} came back malformed: rows [{}, {}] x {} alternatives, {} values",
                packet.id,
                result.start,
                result.end,
                result.n_alternatives,
                result.values.len()
            )));
        }
        Ok(())
    }
}

impl<T: JobTransport> TaskExecutor for DistributedExecutor<T> {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn submit(&self, packets: &[WorkPacket], inputs: &SharedInputs) -> Result<Vec<PacketResult>> {
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let bundle = JobBundle::encode_parts(job_id, self.n_alternatives, inputs)?;
        info!(
            "Job {}: {} packets on {} nodes, bundle {} bytes",
            job_id,
            packets.len(),
            self.transport.node_count(),
            bundle.len()
        );

        let tasks = packets
            .iter()
            .map(|&packet| PacketTask { job_id, packet })
            .collect();
        let replies = self.transport.run_job(&bundle, tasks)?;

        let mut pending: HashMap<u32, &WorkPacket> = packets.iter().map(|p| (p.id, p)).collect();
        let mut results = Vec::with_capacity(packets.len());
        for reply in replies {
            if reply.job_id != job_id {
                return Err(Error::Distribution(format!(
                    "reply for job {} arrived during job {job_id}",
                    reply.job_id
                )));
            }
            let packet = pending.remove(&reply.packet_id).ok_or_else(|| {
                Error::Distribution(format!(
                    "unexpected or duplicate reply for packet {}",
                    reply.packet_id
                ))
            })?;

            match reply.outcome {
                TaskOutcome::Completed(result) => {
                    self.accept(packet, &result)?;
                    results.push(result);
                }
                TaskOutcome::Failed {
                    zone: Some(zone),
                    message,
                } => {
                    return Err(Error::Computation {
                        zone,
                        message: format!("node {}: {message}", reply.node),
                    });
                }
                TaskOutcome::Failed {
                    zone: None,
                    message,
                } => {
                    return Err(Error::Distribution(format!(
                        "packet {} failed on node {}: {message}",
                        packet.id, reply.node
                    )));
                }
            }
        }

        if !pending.is_empty() {
            let mut missing: Vec<u32> = pending.into_keys().collect();
            missing.sort_unstable();
            return Err(Error::Distribution(format!(
                "{} packets never returned: {missing:?}",
                missing.len()
            )));
        }

        Ok(results)
    }
}

/// In-process transport: `nodes` threads pulling tasks from one shared queue
///
/// Each node decodes the bundle for itself and keeps its own utility cache, as
/// a remote node would. Replies travel back as encoded frames.
pub struct LoopbackTransport {
    nodes: usize,
    evaluator: Arc<dyn UtilityEvaluator>,
    unreachable: HashSet<usize>,
    packets_per_node: Mutex<Vec<usize>>,
}

impl LoopbackTransport {
    pub fn new(nodes: usize, evaluator: Arc<dyn UtilityEvaluator>) -> Result<Self> {
        if nodes == 0 {
            return Err(Error::Configuration(
                "distributed execution needs at least one node".to_string(),
            ));
        }
        Ok(Self {
            nodes,
            evaluator,
            unreachable: HashSet::new(),
            packets_per_node: Mutex::new(vec![0; nodes]),
        })
    }

    /// Mark a node as down; it fails the job as soon as it starts
    pub fn with_unreachable_node(mut self, node: usize) -> Self {
        self.unreachable.insert(node);
        self
    }

    /// Packets each node answered during the last job
    pub fn packets_per_node(&self) -> Vec<usize> {
        self.packets_per_node.lock().clone()
    }

    fn run_node(
        &self,
        node: usize,
        bundle: &[u8],
        tasks: Receiver<PacketTask>,
        replies: Sender<Vec<u8>>,
        abort: &AtomicBool,
    ) -> Result<()> {
        if self.unreachable.contains(&node) {
            return Err(Error::Distribution(format!("node {node} is unreachable")));
        }

        let job = JobBundle::decode(bundle)?;
        let cache = UtilityCache::new(job.inputs.cache_spec)?;
        let zone_ids = job.inputs.zone_ids();
        let ctx = EvalContext::new()
            .with_inputs(&job.inputs)
            .with_cache(&cache);

        let mut answered = 0;
        for task in tasks.iter() {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            if task.job_id != job.job_id {
                return Err(Error::Distribution(format!(
                    "node {node} holds job {} but got a task for job {}",
                    job.job_id, task.job_id
                )));
            }

            let outcome = match compute_packet(&task.packet, &zone_ids, self.evaluator.as_ref(), &ctx)
            {
                Ok(result) => TaskOutcome::Completed(result),
                Err(Error::Computation { zone, message }) => {
                    abort.store(true, Ordering::Relaxed);
                    TaskOutcome::Failed {
                        zone: Some(zone),
                        message,
                    }
                }
                Err(other) => {
                    abort.store(true, Ordering::Relaxed);
                    TaskOutcome::Failed {
                        zone: None,
                        message: other.to_string(),
                    }
                }
            };

            let reply = TaskReply {
                job_id: job.job_id,
                packet_id: task.packet.id,
                node,
                outcome,
            };
            replies
                .send(reply.encode()?)
                .map_err(|_| Error::Distribution(format!("node {node}: reply channel closed")))?;
            answered += 1;
        }

        self.packets_per_node.lock()[node] = answered;
        debug!("node {node}: {answered} packets, cache {:?}", cache.stats());
        Ok(())
    }
}

impl JobTransport for LoopbackTransport {
    fn node_count(&self) -> usize {
        self.nodes
    }

    fn run_job(&self, bundle: &[u8], tasks: Vec<PacketTask>) -> Result<Vec<TaskReply>> {
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<PacketTask>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        for task in tasks {
            task_tx
                .send(task)
                .map_err(|_| Error::Distribution("task queue closed".to_string()))?;
        }
        drop(task_tx);

        self.packets_per_node.lock().fill(0);
        let abort = AtomicBool::new(false);
        let abort = &abort;

        let outcomes: Vec<Result<()>> = thread::scope(|s| {
            let mut outcomes = Vec::new();
            let mut handles = Vec::with_capacity(self.nodes);
            for node in 0..self.nodes {
                let rx = task_rx.clone();
                let tx = reply_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("access-node-{node}"))
                    .spawn_scoped(s, move || {
                        let result = self.run_node(node, bundle, rx, tx, abort);
                        if result.is_err() {
                            abort.store(true, Ordering::Relaxed);
                        }
                        result
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        abort.store(true, Ordering::Relaxed);
                        outcomes.push(Err(Error::Distribution(format!(
                            "failed to start node {node}: {e}"
                        ))));
                    }
                }
            }
            outcomes.extend(handles.into_iter().map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Distribution("node panicked".to_string())))
            }));
            outcomes
        });
        drop(reply_tx);

        for outcome in outcomes {
            outcome?;
        }
        reply_rx
            .iter()
            .map(|bytes| TaskReply::decode(&bytes))
            .collect()
    }
}
