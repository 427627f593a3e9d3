//! Asynchronous batched writer: a pool of worker threads, each owning one
//! open graph transaction that it commits every `commit_every` jobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};

use blkgraph_storage::KeyValueStore;

use crate::error::GraphError;
use crate::records::VertexRecord;
use crate::schema::VertexId;
use crate::store::{GraphStore, GraphTx};

pub type ErrorCallback = Arc<dyn Fn(GraphError) + Send + Sync>;

/// A unit of work run inside a worker's open transaction.
///
/// `apply` may run more than once: when a batch fails to commit, the worker
/// replays its jobs one per commit.
pub trait WriteJob<S>: Send {
    fn apply(&mut self, txn: &mut GraphTx<S>) -> Result<(), GraphError>;

    /// The job's writes are committed.
    fn committed(self: Box<Self>) {}

    /// The job's writes were discarded; `err` also goes to the error callback.
    fn abandoned(self: Box<Self>, _err: &GraphError) {}
}

struct FnJob<F>(F);

impl<S, F> WriteJob<S> for FnJob<F>
where
    F: FnMut(&mut GraphTx<S>) -> Result<(), GraphError> + Send,
{
    fn apply(&mut self, txn: &mut GraphTx<S>) -> Result<(), GraphError> {
        (self.0)(txn)
    }
}

/// Wraps a closure as a job without commit notifications.
pub fn job_fn<S, F>(apply: F) -> Box<dyn WriteJob<S>>
where
    S: 'static,
    F: FnMut(&mut GraphTx<S>) -> Result<(), GraphError> + Send + 'static,
{
    Box::new(FnJob(apply))
}

#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    /// 0 sizes the pool to the available hardware parallelism.
    pub workers: usize,
    pub commit_every: usize,
    pub queue_depth: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            commit_every: 100,
            queue_depth: 1024,
        }
    }
}

impl WriterOptions {
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }
}

enum WriterMsg<S> {
    Job(Box<dyn WriteJob<S>>),
    Flush(Sender<()>),
}

pub struct AsyncWriter<S> {
    graph: GraphStore<S>,
    senders: Vec<Sender<WriterMsg<S>>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl<S: KeyValueStore + 'static> AsyncWriter<S> {
    pub fn new(graph: GraphStore<S>, options: WriterOptions, on_error: ErrorCallback) -> Self {
        let workers = options.resolved_workers();
        let commit_every = options.commit_every.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = bounded::<WriterMsg<S>>(options.queue_depth.max(1));
            let graph = graph.clone();
            let on_error = Arc::clone(&on_error);
            let spawned = thread::Builder::new()
                .name(format!("graph-writer-{worker}"))
                .spawn(move || {
                    let mut txn = graph.begin();
                    let mut applied: Vec<Box<dyn WriteJob<S>>> = Vec::new();
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            WriterMsg::Job(mut job) => {
                                let savepoint = txn.savepoint();
                                match job.apply(&mut txn) {
                                    Ok(()) => applied.push(job),
                                    Err(err) => {
                                        txn.rollback_to(savepoint);
                                        abandon(job, err, on_error.as_ref());
                                    }
                                }
                                if applied.len() >= commit_every {
                                    commit(&mut txn, &mut applied, on_error.as_ref());
                                }
                            }
                            WriterMsg::Flush(ack) => {
                                commit(&mut txn, &mut applied, on_error.as_ref());
                                let _ = ack.send(());
                            }
                        }
                    }
                    commit(&mut txn, &mut applied, on_error.as_ref());
                });
            match spawned {
                Ok(handle) => {
                    senders.push(tx);
                    handles.push(handle);
                }
                Err(err) => {
                    blkgraph_log::log_error!("failed to spawn graph writer {worker}: {err}");
                }
            }
        }
        blkgraph_log::log_debug!(
            "async writer started with {} worker(s), commit every {commit_every}",
            senders.len()
        );
        Self {
            graph,
            senders,
            handles,
            next: AtomicUsize::new(0),
        }
    }

    pub fn graph(&self) -> &GraphStore<S> {
        &self.graph
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queues a job. Blocks only when the chosen worker's queue is full.
    pub fn submit(&self, job: Box<dyn WriteJob<S>>) -> Result<(), GraphError> {
        if self.senders.is_empty() {
            return Err(GraphError::WriterClosed);
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[slot]
            .send(WriterMsg::Job(job))
            .map_err(|_| GraphError::WriterClosed)
    }

    /// Queues the creation of `record`. The id is reserved immediately so the
    /// caller can keep it; `on_saved` runs in the same worker transaction
    /// right after the record is written.
    pub fn create_record<R, F>(&self, record: R, mut on_saved: F) -> Result<VertexId, GraphError>
    where
        R: VertexRecord,
        F: FnMut(&mut GraphTx<S>, VertexId, &R) -> Result<(), GraphError> + Send + 'static,
    {
        let id = self.graph.allocate_id(R::KIND);
        self.submit(job_fn(move |txn: &mut GraphTx<S>| {
            txn.save_vertex(id, &record)?;
            on_saved(txn, id, &record)
        }))?;
        Ok(id)
    }

    /// Blocks until every job submitted so far is committed and flushed.
    pub fn wait_completion(&self) -> Result<(), GraphError> {
        let mut acks = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (ack_tx, ack_rx) = bounded::<()>(1);
            sender
                .send(WriterMsg::Flush(ack_tx))
                .map_err(|_| GraphError::WriterClosed)?;
            acks.push(ack_rx);
        }
        for ack in acks {
            ack.recv().map_err(|_| GraphError::WriterClosed)?;
        }
        self.graph.flush()
    }
}

impl<S> AsyncWriter<S> {
    /// Drains the queues, commits what is left and joins the workers.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                blkgraph_log::log_error!("graph writer thread panicked");
            }
        }
    }
}

impl<S> Drop for AsyncWriter<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type ErrorFn = dyn Fn(GraphError) + Send + Sync;

fn abandon<S>(job: Box<dyn WriteJob<S>>, err: GraphError, on_error: &ErrorFn) {
    job.abandoned(&err);
    on_error(err);
}

/// Commits the jobs applied since the last commit. When the batch is
/// rejected, each job is replayed and committed on its own; only the jobs
/// that still fail are abandoned.
fn commit<S: KeyValueStore>(
    txn: &mut GraphTx<S>,
    applied: &mut Vec<Box<dyn WriteJob<S>>>,
    on_error: &ErrorFn,
) {
    if applied.is_empty() {
        return;
    }
    let err = match txn.commit_and_continue() {
        Ok(()) => {
            for job in applied.drain(..) {
                job.committed();
            }
            return;
        }
        Err(err) => err,
    };
    blkgraph_log::log_warn!(
        "commit of {} graph jobs failed ({err}); replaying them one by one",
        applied.len()
    );
    for mut job in applied.drain(..) {
        let start = txn.savepoint();
        if let Err(err) = job.apply(txn) {
            txn.rollback_to(start);
            abandon(job, err, on_error);
            continue;
        }
        match txn.commit_and_continue() {
            Ok(()) => job.committed(),
            Err(err) => abandon(job, err, on_error),
        }
    }
}
