//! The work dispatcher: N worker seats, serial assignment, liveness
//! watching and in-order emission of completed chunks.
//!
//! Workers are threads with panic isolation. Every seat carries a
//! generation tag; results from a retired generation (a stalled or crashed
//! worker that later wakes up) are discarded before they can touch the
//! reorder buffer, so a single worker failure can never corrupt the output
//! stream. The sink is written by the dispatcher alone.

use crossbeam_channel::{bounded, tick, unbounded, Receiver, Sender};
use fxhash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::error::DispatchError;
use super::pipeline::ImageProcessor;
use super::source::{ImageJob, ImageSource};
use super::stream::StreamWriter;
use super::worker_status::{task_is_whitelisted, SharedState, Totals, WorkerHealth};

/// A factory building one processor per (re)spawned worker. Called on the
/// dispatcher thread; the processor is moved into the worker.
pub type ProcessorFactory =
    Box<dyn Fn(usize, Arc<WorkerHealth>) -> Box<dyn ImageProcessor> + Send + Sync>;

enum WorkerMsg {
    Done {
        worker: usize,
        generation: u64,
        serial: u64,
        chunk: Option<String>,
    },
    Failed {
        worker: usize,
        generation: u64,
        serial: u64,
        error: String,
    },
    Panicked {
        worker: usize,
        generation: u64,
        serial: u64,
    },
}

struct Seat {
    generation: u64,
    health: Arc<WorkerHealth>,
    jobs_tx: Sender<(u64, ImageJob)>,
    handle: Option<JoinHandle<()>>,
    /// Serial being processed and when the last heartbeat was seen
    busy: Option<u64>,
    last_count: u64,
    last_change: Instant,
}

pub struct Dispatcher {
    pub n_workers: usize,
    pub stall_timeout: Duration,
    pub reorder_bound: usize,
}

impl Dispatcher {
    pub fn new(n_workers: usize, stall_timeout: Duration, reorder_bound: usize) -> Self {
        Self {
            n_workers: n_workers.max(1),
            stall_timeout,
            reorder_bound: reorder_bound.max(1),
        }
    }

    fn spawn_worker(
        &self,
        worker: usize,
        generation: u64,
        factory: &ProcessorFactory,
        results_tx: &Sender<WorkerMsg>,
        shared: &Arc<SharedState>,
    ) -> Seat {
        let health = Arc::new(WorkerHealth::new());
        let (jobs_tx, jobs_rx): (Sender<(u64, ImageJob)>, Receiver<(u64, ImageJob)>) = bounded(1);
        let mut processor = factory(worker, Arc::clone(&health));
        let results = results_tx.clone();
        let shared = Arc::clone(shared);
        let worker_health = Arc::clone(&health);

        let handle = std::thread::Builder::new()
            .name(format!("snapindex-worker-{worker}"))
            .spawn(move || {
                while let Ok((serial, job)) = jobs_rx.recv() {
                    if shared.should_terminate() {
                        // The job was already assigned; report it back so
                        // the reorder buffer is not left with a hole
                        let _ = results.send(WorkerMsg::Failed {
                            worker,
                            generation,
                            serial,
                            error: String::from("cancelled"),
                        });
                        break;
                    }
                    worker_health.set_task("start");
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| processor.process(job, serial)));
                    let msg = match outcome {
                        Ok(Ok(out)) => WorkerMsg::Done {
                            worker,
                            generation,
                            serial,
                            chunk: out.chunk,
                        },
                        Ok(Err(e)) => WorkerMsg::Failed {
                            worker,
                            generation,
                            serial,
                            error: e.to_string(),
                        },
                        Err(_) => WorkerMsg::Panicked {
                            worker,
                            generation,
                            serial,
                        },
                    };
                    let panicked = matches!(msg, WorkerMsg::Panicked { .. });
                    worker_health.set_task("idle");
                    if results.send(msg).is_err() {
                        break;
                    }
                    // A panicking processor may hold broken state; let the
                    // dispatcher give this seat a fresh one
                    if panicked {
                        return;
                    }
                }
                processor.finish();
            })
            .expect("failed to spawn worker thread");

        Seat {
            generation,
            health,
            jobs_tx,
            handle: Some(handle),
            busy: None,
            last_count: 0,
            last_change: Instant::now(),
        }
    }

    /// Run the dispatch loop to completion: feed jobs from the source,
    /// respawn failed workers, and emit chunks in serial order through the
    /// writer. Returns the totals on success.
    pub fn run(
        &self,
        source: &mut dyn ImageSource,
        factory: ProcessorFactory,
        writer: &mut StreamWriter,
        shared: Arc<SharedState>,
    ) -> Result<Totals, DispatchError> {
        let (results_tx, results_rx) = unbounded::<WorkerMsg>();

        let mut seats: Vec<Seat> = (0..self.n_workers)
            .map(|w| self.spawn_worker(w, 0, &factory, &results_tx, &shared))
            .collect();

        // Reorder buffer: completed (or failed -> None) chunks by serial
        let mut pending: FxHashMap<u64, Option<String>> = FxHashMap::default();
        let mut next_serial: u64 = 1;
        let mut next_to_write: u64 = 1;
        let mut source_drained = false;
        let mut write_error: Option<DispatchError> = None;

        let ticker = tick(Duration::from_secs(1));

        loop {
            // Top up idle seats while the reorder window has room
            while write_error.is_none() && !source_drained && !shared.should_terminate() {
                if next_serial - next_to_write >= self.reorder_bound as u64 {
                    break;
                }
                let Some(idle) = seats.iter().position(|s| s.busy.is_none()) else {
                    break;
                };
                let job = match source.next_job() {
                    Ok(Some(job)) => {
                        let serial = next_serial;
                        next_serial += 1;
                        Some((serial, job))
                    }
                    Ok(None) => {
                        source_drained = true;
                        None
                    }
                    Err(e) => {
                        // End of input; in-flight work completes
                        spdlog::warn!("Image source failed, treating as end of input: {e}");
                        source_drained = true;
                        None
                    }
                };
                let Some((serial, job)) = job else { break };
                let seat = &mut seats[idle];
                if seat.jobs_tx.send((serial, job)).is_err() {
                    // Worker died between messages; mark the image failed
                    // and give the seat a fresh thread
                    spdlog::warn!("Worker {idle} vanished; respawning");
                    let generation = seat.generation + 1;
                    *seat = self.spawn_worker(idle, generation, &factory, &results_tx, &shared);
                    pending.insert(serial, None);
                    shared.record_failure();
                    continue;
                }
                seat.busy = Some(serial);
                seat.last_change = Instant::now();
                seat.last_count = seat.health.count();
            }

            // Flush everything ready at the head of the reorder buffer
            while let Some(entry) = pending.remove(&next_to_write) {
                if let Some(chunk) = entry {
                    if let Err(e) = writer.write_chunk(next_to_write, &chunk) {
                        spdlog::error!("Stream write failed: {e}");
                        shared.request_terminate();
                        write_error = Some(DispatchError::StreamError(e));
                        break;
                    }
                }
                next_to_write += 1;
            }

            // Finished?
            let all_idle = seats.iter().all(|s| s.busy.is_none());
            if (source_drained || shared.should_terminate() || write_error.is_some())
                && all_idle
                && (pending.is_empty() || write_error.is_some())
            {
                break;
            }

            crossbeam_channel::select! {
                recv(results_rx) -> msg => {
                    let Ok(msg) = msg else { break };
                    self.handle_result(msg, &mut seats, &mut pending, &shared, &factory, &results_tx);
                }
                recv(ticker) -> _ => {
                    self.check_stalls(&mut seats, &mut pending, &shared, &factory, &results_tx);
                }
            }
        }

        // Drain: close every seat's job lane and join live generations
        for seat in seats.iter_mut() {
            let (closed_tx, _closed_rx) = bounded(0);
            let old_tx = std::mem::replace(&mut seat.jobs_tx, closed_tx);
            drop(old_tx);
        }
        for seat in seats.iter_mut() {
            if let Some(handle) = seat.handle.take() {
                if seat.busy.is_none() || shared.should_terminate() {
                    let _ = handle.join();
                }
                // A seat still busy here can only be a stalled worker kept
                // past the end of input; it is abandoned, not joined
            }
        }

        if let Some(e) = write_error {
            return Err(e);
        }
        Ok(shared.totals())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_result(
        &self,
        msg: WorkerMsg,
        seats: &mut [Seat],
        pending: &mut FxHashMap<u64, Option<String>>,
        shared: &Arc<SharedState>,
        factory: &ProcessorFactory,
        results_tx: &Sender<WorkerMsg>,
    ) {
        match msg {
            WorkerMsg::Done {
                worker,
                generation,
                serial,
                chunk,
            } => {
                if seats[worker].generation != generation {
                    spdlog::info!(
                        "Discarding late result for serial {serial} from retired worker {worker}"
                    );
                    return;
                }
                seats[worker].busy = None;
                pending.insert(serial, chunk);
            }
            WorkerMsg::Failed {
                worker,
                generation,
                serial,
                error,
            } => {
                if seats[worker].generation != generation {
                    return;
                }
                seats[worker].busy = None;
                if !shared.should_terminate() {
                    spdlog::warn!("Image with serial {serial} failed: {error}");
                    shared.record_failure();
                }
                pending.insert(serial, None);
            }
            WorkerMsg::Panicked {
                worker,
                generation,
                serial,
            } => {
                if seats[worker].generation != generation {
                    return;
                }
                spdlog::error!(
                    "Worker {worker} crashed on serial {serial}; image marked failed, respawning"
                );
                shared.record_failure();
                pending.insert(serial, None);
                let new_generation = generation + 1;
                seats[worker] =
                    self.spawn_worker(worker, new_generation, factory, results_tx, shared);
            }
        }
    }

    fn check_stalls(
        &self,
        seats: &mut [Seat],
        pending: &mut FxHashMap<u64, Option<String>>,
        shared: &Arc<SharedState>,
        factory: &ProcessorFactory,
        results_tx: &Sender<WorkerMsg>,
    ) {
        for worker in 0..seats.len() {
            let seat = &mut seats[worker];
            let Some(serial) = seat.busy else { continue };

            let count = seat.health.count();
            if count != seat.last_count {
                seat.last_count = count;
                seat.last_change = Instant::now();
                continue;
            }
            if seat.last_change.elapsed() < self.stall_timeout {
                continue;
            }
            let task = seat.health.task();
            if task_is_whitelisted(task) {
                // Legitimately blocked; leave it alone
                continue;
            }

            spdlog::error!(
                "Worker {worker} stalled during '{task}' on serial {serial}; abandoning it"
            );
            shared.record_failure();
            pending.insert(serial, None);
            let generation = seat.generation + 1;
            // The stalled thread is not joined; its generation is retired so
            // any late result is discarded
            seats[worker] = self.spawn_worker(worker, generation, factory, results_tx, shared);
        }
    }
}
