use crate::network::{Client, Stream};
use crossbeam_channel::{bounded, select, Receiver, SendError, Sender};
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

struct Worker<S> {
    index: usize,
    jobs: Sender<Vec<Client<S>>>,
    done: Receiver<Vec<Client<S>>>,
    handle: Option<JoinHandle<()>>,
}

/// Parallel socket reads behind a synchronous barrier.
///
/// With `shards` shards, `shards - 1` persistent threads are started and the
/// reactor thread serves shard 0 itself. [`fan_out`](Self::fan_out) returns
/// only after every shard finished, and workers do nothing but the read, so
/// parsing and command execution stay on the reactor thread.
pub struct ReadDispatcher<S> {
    workers: Vec<Worker<S>>,
    shutdown: Option<Sender<()>>,
}

impl<S: Stream> ReadDispatcher<S> {
    pub fn new(shards: usize, pin_cpus: bool) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut workers = Vec::with_capacity(shards.saturating_sub(1));

        for index in 1..shards.max(1) {
            let (jobs_tx, jobs_rx) = bounded::<Vec<Client<S>>>(1);
            let (done_tx, done_rx) = bounded::<Vec<Client<S>>>(1);
            let shutdown_rx = shutdown_rx.clone();

            let handle = thread::Builder::new()
                .name(format!("io-read-{}", index))
                .spawn(move || {
                    if pin_cpus {
                        pin_to_cpu(index);
                    }
                    run_worker(index, jobs_rx, done_tx, shutdown_rx);
                })?;

            workers.push(Worker {
                index,
                jobs: jobs_tx,
                done: done_rx,
                handle: Some(handle),
            });
        }

        info!("Read dispatcher started with {} shards", shards.max(1));
        Ok(Self {
            workers,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn shards(&self) -> usize {
        self.workers.len() + 1
    }

    /// Read every client once, spreading them round-robin over the shards.
    ///
    /// Each client comes back with its outcome staged (see
    /// [`Client::stage_read`]). Clients whose worker died mid-batch are lost;
    /// their streams are already dropped.
    pub fn fan_out(&mut self, clients: Vec<Client<S>>) -> Vec<Client<S>> {
        let shards = self.shards();
        let mut batches: Vec<Vec<Client<S>>> = (0..shards).map(|_| Vec::new()).collect();
        for (i, client) in clients.into_iter().enumerate() {
            batches[i % shards].push(client);
        }

        let mut batches = batches.into_iter();
        let mut own = batches.next().unwrap_or_default();
        let mut signaled = Vec::with_capacity(self.workers.len());

        for (worker, batch) in self.workers.iter().zip(batches) {
            if batch.is_empty() {
                continue;
            }
            match worker.jobs.send(batch) {
                Ok(()) => signaled.push(worker.index - 1),
                Err(SendError(batch)) => {
                    warn!(
                        "I/O worker {} is gone, reading its {} clients inline",
                        worker.index,
                        batch.len()
                    );
                    own.extend(batch);
                }
            }
        }

        for client in own.iter_mut() {
            client.stage_read();
        }

        let mut results = own;
        for slot in signaled {
            let worker = &self.workers[slot];
            match worker.done.recv() {
                Ok(batch) => results.extend(batch),
                Err(_) => error!(
                    "I/O worker {} exited before finishing its batch",
                    worker.index
                ),
            }
        }
        results
    }

    /// Stop and join every worker.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }
}

impl<S> ReadDispatcher<S> {
    fn stop_workers(&mut self) {
        // Dropping the sender disconnects every worker's shutdown receiver.
        if self.shutdown.take().is_none() {
            return;
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("I/O worker {} panicked", worker.index);
                }
            }
        }
        debug!("Read dispatcher stopped");
    }
}

impl<S> Drop for ReadDispatcher<S> {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn run_worker<S: Stream>(
    index: usize,
    jobs: Receiver<Vec<Client<S>>>,
    done: Sender<Vec<Client<S>>>,
    shutdown: Receiver<()>,
) {
    debug!("I/O worker {} started", index);
    loop {
        select! {
            recv(jobs) -> batch => {
                let Ok(mut batch) = batch else { break };
                for client in batch.iter_mut() {
                    client.stage_read();
                }
                if done.send(batch).is_err() {
                    break;
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    debug!("I/O worker {} exiting", index);
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(index: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = num_cpus::get().max(1);
    let mut set = CpuSet::new();
    let result = set
        .set(index % cpus)
        .and_then(|_| sched_setaffinity(Pid::from_raw(0), &set));
    match result {
        Ok(()) => debug!("I/O worker {} pinned to CPU {}", index, index % cpus),
        Err(e) => warn!("Failed to pin I/O worker {}: {}", index, e),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(index: usize) {
    debug!("CPU pinning unsupported here, I/O worker {} left unpinned", index);
}
