//! The nonce grinder: one job at a time, FIFO, always off the async
//! I/O path, cancellable mid-search.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use bitmessage_core::pow::pow_value;
use bitmessage_core::Cryptography;

/// A pending nonce search.
#[derive(Debug, Clone)]
pub struct PowJob {
    pub initial_hash: [u8; 64],
    pub target: u64,
}

/// A finished search; `nonce` satisfies the job's target.
#[derive(Debug, Clone)]
pub struct PowSolution {
    pub initial_hash: [u8; 64],
    pub nonce: [u8; 8],
}

enum Command {
    Solve(PowJob),
    Cancel([u8; 64]),
}

/// Handle to the proof-of-work service. Cloneable; submissions are
/// serialized into a FIFO queue behind one solving engine.
#[derive(Clone)]
pub struct PowService {
    commands: mpsc::UnboundedSender<Command>,
}

impl PowService {
    /// Spawns the service; solutions arrive on the returned channel in
    /// completion order.
    pub fn start(
        crypto: Arc<dyn Cryptography>,
        num_threads: usize,
    ) -> (Self, mpsc::UnboundedReceiver<PowSolution>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (solution_tx, solution_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(crypto, num_threads.max(1), command_rx, solution_tx));
        (
            Self {
                commands: command_tx,
            },
            solution_rx,
        )
    }

    /// Queues a nonce search.
    pub fn enqueue(&self, job: PowJob) {
        if self.commands.send(Command::Solve(job)).is_err() {
            warn!("proof-of-work service is gone; job dropped");
        }
    }

    /// Cancels a queued or running search. Deleting a message takes its
    /// pending work with it.
    pub fn cancel(&self, initial_hash: [u8; 64]) {
        let _ = self.commands.send(Command::Cancel(initial_hash));
    }
}

async fn run(
    crypto: Arc<dyn Cryptography>,
    num_threads: usize,
    mut commands: mpsc::UnboundedReceiver<Command>,
    solutions: mpsc::UnboundedSender<PowSolution>,
) {
    let mut queue: VecDeque<PowJob> = VecDeque::new();
    loop {
        let job = match queue.pop_front() {
            Some(job) => job,
            None => match commands.recv().await {
                Some(Command::Solve(job)) => job,
                Some(Command::Cancel(_)) => continue,
                None => return,
            },
        };

        let stop = Arc::new(AtomicBool::new(false));
        let engine = {
            let crypto = crypto.clone();
            let stop = stop.clone();
            let job = job.clone();
            spawn_blocking(move || solve(crypto.as_ref(), &job, num_threads, &stop))
        };
        tokio::pin!(engine);

        // Keep draining commands while the engine grinds, so a cancel
        // for the running job can reach its stop flag.
        loop {
            tokio::select! {
                result = &mut engine => {
                    match result {
                        Ok(Some(nonce)) => {
                            let solution = PowSolution {
                                initial_hash: job.initial_hash,
                                nonce: nonce.to_be_bytes(),
                            };
                            if solutions.send(solution).is_err() {
                                return;
                            }
                        }
                        Ok(None) => debug!("nonce search cancelled"),
                        Err(e) => warn!("proof-of-work engine panicked: {}", e),
                    }
                    break;
                }
                command = commands.recv() => match command {
                    Some(Command::Solve(next)) => queue.push_back(next),
                    Some(Command::Cancel(hash)) => {
                        if hash == job.initial_hash {
                            stop.store(true, Ordering::SeqCst);
                        } else {
                            queue.retain(|j| j.initial_hash != hash);
                        }
                    }
                    None => {
                        stop.store(true, Ordering::SeqCst);
                        return;
                    }
                },
            }
        }
    }
}

/// Blocking multi-threaded search: thread *t* tries nonces
/// `t+1, t+1+n, t+1+2n, …` until one of them meets the target or the
/// stop flag is raised.
fn solve(
    crypto: &dyn Cryptography,
    job: &PowJob,
    num_threads: usize,
    stop: &AtomicBool,
) -> Option<u64> {
    let started = Instant::now();
    let winner = AtomicU64::new(0);
    let done = AtomicBool::new(false);
    let tried = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for t in 0..num_threads {
            let winner = &winner;
            let done = &done;
            let tried = &tried;
            scope.spawn(move || {
                let mut nonce = t as u64 + 1;
                let mut local: u64 = 0;
                while !done.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed) {
                    if pow_value(crypto, &nonce.to_be_bytes(), &job.initial_hash) <= job.target {
                        winner.store(nonce, Ordering::SeqCst);
                        done.store(true, Ordering::SeqCst);
                        break;
                    }
                    nonce += num_threads as u64;
                    local += 1;
                }
                tried.fetch_add(local, Ordering::Relaxed);
            });
        }
    });

    if !done.load(Ordering::SeqCst) {
        return None;
    }
    let elapsed = started.elapsed();
    let hashes = tried.load(Ordering::Relaxed);
    info!(
        nonce = winner.load(Ordering::SeqCst),
        hashes,
        rate = (hashes as f64 / elapsed.as_secs_f64().max(0.001)) as u64,
        "proof of work solved"
    );
    Some(winner.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmessage_core::DefaultCryptography;
    use std::time::Duration;
    use tokio::time::timeout;

    fn hash(seed: u8) -> [u8; 64] {
        [seed; 64]
    }

    /// Roughly one-in-256 nonces qualify; milliseconds of work.
    const EASY_TARGET: u64 = u64::MAX / 256;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn solution_satisfies_target() {
        let crypto = Arc::new(DefaultCryptography::new());
        let (service, mut solutions) = PowService::start(crypto.clone(), 2);

        service.enqueue(PowJob {
            initial_hash: hash(1),
            target: EASY_TARGET,
        });

        let solution = timeout(Duration::from_secs(30), solutions.recv())
            .await
            .expect("solver timed out")
            .expect("channel open");
        assert_eq!(solution.initial_hash, hash(1));
        assert!(pow_value(crypto.as_ref(), &solution.nonce, &hash(1)) <= EASY_TARGET);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_complete_in_submission_order() {
        let crypto = Arc::new(DefaultCryptography::new());
        let (service, mut solutions) = PowService::start(crypto, 2);

        for seed in [1u8, 2, 3] {
            service.enqueue(PowJob {
                initial_hash: hash(seed),
                target: EASY_TARGET,
            });
        }
        for seed in [1u8, 2, 3] {
            let solution = timeout(Duration::from_secs(30), solutions.recv())
                .await
                .expect("solver timed out")
                .expect("channel open");
            assert_eq!(solution.initial_hash, hash(seed));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_the_running_job_frees_the_engine() {
        let crypto = Arc::new(DefaultCryptography::new());
        let (service, mut solutions) = PowService::start(crypto, 2);

        // Target 0 is unsatisfiable in practice; it would grind forever.
        service.enqueue(PowJob {
            initial_hash: hash(9),
            target: 0,
        });
        service.enqueue(PowJob {
            initial_hash: hash(2),
            target: EASY_TARGET,
        });
        service.cancel(hash(9));

        let solution = timeout(Duration::from_secs(30), solutions.recv())
            .await
            .expect("engine stayed stuck on the cancelled job")
            .expect("channel open");
        assert_eq!(solution.initial_hash, hash(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_a_queued_job_removes_it() {
        let crypto = Arc::new(DefaultCryptography::new());
        let (service, mut solutions) = PowService::start(crypto, 2);

        service.enqueue(PowJob {
            initial_hash: hash(1),
            target: EASY_TARGET,
        });
        service.enqueue(PowJob {
            initial_hash: hash(7),
            target: 0, // would hang if ever started
        });
        service.enqueue(PowJob {
            initial_hash: hash(3),
            target: EASY_TARGET,
        });
        service.cancel(hash(7));

        let first = timeout(Duration::from_secs(30), solutions.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(30), solutions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.initial_hash, hash(1));
        assert_eq!(second.initial_hash, hash(3));
    }
}
