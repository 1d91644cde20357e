//! Mining worker: a dedicated task that hashes blocks handed to it by message.
//!
//! The worker owns no node state. The node sends a [`MineJob`] (a copy of the
//! candidate transactions and the current tip) and gets back exactly one
//! [`WorkerEvent`] per job. While hashing, the command channel is polled on
//! every iteration so a `Stop` is observed promptly, and the task yields back
//! to the scheduler every `yield_every` attempts.

use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ledger::{block_prefix, meets_difficulty, seal, Block, Transaction};

#[derive(Clone, Debug, PartialEq)]
pub struct MineJob {
    pub index: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub timestamp: i64,
    pub difficulty: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerCommand {
    Mine(MineJob),
    Stop,
    Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    BlockFound {
        block: Block,
        attempts: u64,
        elapsed: Duration,
    },
    Stopped {
        attempts: u64,
    },
    Failed {
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Hashing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub yield_every: u64,
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            yield_every: 1_000,
            channel_capacity: 16,
        }
    }
}

/// Node-side handle to a running worker.
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Non-blocking send used from synchronous callers such as `stop_mining`.
    pub fn try_send(&self, command: WorkerCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    pub fn sender(&self) -> mpsc::Sender<WorkerCommand> {
        self.commands.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum HashOutcome {
    Event(WorkerEvent),
    Shutdown(WorkerEvent),
}

pub struct MiningWorker {
    cfg: WorkerConfig,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    state: WorkerState,
}

impl MiningWorker {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(cfg: WorkerConfig) -> (WorkerHandle, mpsc::Receiver<WorkerEvent>) {
        let capacity = cfg.channel_capacity.max(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (evt_tx, evt_rx) = mpsc::channel(capacity);
        let worker = MiningWorker {
            cfg,
            commands: cmd_rx,
            events: evt_tx,
            state: WorkerState::Idle,
        };
        let task = tokio::spawn(worker.run());
        (
            WorkerHandle {
                commands: cmd_tx,
                task,
            },
            evt_rx,
        )
    }

    async fn run(mut self) {
        debug!("mining worker started");
        while let Some(command) = self.commands.recv().await {
            match command {
                WorkerCommand::Mine(job) => {
                    self.state = WorkerState::Hashing;
                    let outcome = self.hash(job).await;
                    self.state = WorkerState::Idle;
                    let (event, shutdown) = match outcome {
                        HashOutcome::Event(e) => (e, false),
                        HashOutcome::Shutdown(e) => (e, true),
                    };
                    if self.events.send(event).await.is_err() || shutdown {
                        break;
                    }
                }
                // Nothing in flight; the node is not waiting for a reply.
                WorkerCommand::Stop => {}
                WorkerCommand::Shutdown => break,
            }
        }
        debug!(state = ?self.state, "mining worker exited");
    }

    async fn hash(&mut self, job: MineJob) -> HashOutcome {
        let prefix = match block_prefix(&job.transactions, &job.previous_hash, job.timestamp) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, index = job.index, "block payload could not be encoded");
                return HashOutcome::Event(WorkerEvent::Failed {
                    reason: e.to_string(),
                });
            }
        };

        let started = Instant::now();
        let yield_every = self.cfg.yield_every.max(1);
        let mut nonce: u64 = 0;
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Stop) => {
                    info!(attempts = nonce, index = job.index, "hashing stopped");
                    return HashOutcome::Event(WorkerEvent::Stopped { attempts: nonce });
                }
                Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    return HashOutcome::Shutdown(WorkerEvent::Stopped { attempts: nonce });
                }
                Ok(WorkerCommand::Mine(other)) => {
                    warn!(index = other.index, "mine job ignored while hashing");
                }
                Err(TryRecvError::Empty) => {}
            }

            let hash = seal(&prefix, nonce);
            if meets_difficulty(&hash, job.difficulty) {
                let attempts = nonce + 1;
                let block = Block {
                    index: job.index,
                    hash,
                    previous_hash: job.previous_hash,
                    transactions: job.transactions,
                    timestamp: job.timestamp,
                    nonce,
                    difficulty: job.difficulty,
                };
                return HashOutcome::Event(WorkerEvent::BlockFound {
                    block,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }

            nonce = match nonce.checked_add(1) {
                Some(n) => n,
                None => {
                    return HashOutcome::Event(WorkerEvent::Failed {
                        reason: "nonce space exhausted".into(),
                    })
                }
            };
            if nonce % yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
    }
}
