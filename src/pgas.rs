//! The per-process runtime: it hosts the process group, spawns one worker
//! thread per rank (the calling thread becomes rank 0's worker) and
//! orchestrates the collective operations that must run on every rank.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_deque::Worker as Deque;

use crate::coherence::{Engine, FreeQueues};
use crate::net::Comm;
use crate::sched::task::JobRef;
use crate::sched::{Scheduler, Worker};
use crate::util::constants::BYTES_IN_PAGE;
use crate::util::options::Options;
use crate::util::{logger, memory};

pub(crate) enum WorkerCommand {
    /// Run a collective on this worker, in program order with every other
    /// collective.
    Collective(Arc<dyn Fn(&Worker) + Send + Sync>),
    Shutdown,
}

pub struct Pgas {
    pub options: Options,
    scheduler: Arc<Scheduler>,
    senders: Vec<Sender<WorkerCommand>>,
    threads: Vec<JoinHandle<()>>,
    worker0: Box<Worker>,
}

lazy_static! {
    static ref RUNTIME: Mutex<Option<Pgas>> = Mutex::new(None);
}

impl Pgas {
    fn initialize() -> Pgas {
        let options = Options::default();
        assert_eq!(
            memory::page_size(),
            BYTES_IN_PAGE,
            "unsupported OS page size"
        );
        if options.workers_per_process != 1 {
            warn!(
                "workers_per_process={} is not supported by the in-process group; using 1",
                options.workers_per_process
            );
        }
        let n = options.ranks;
        info!(
            "init: {} rank(s), shared_memory={}, block_size={:#x}, cache_size={:#x}",
            n, options.enable_shared_memory, options.block_size, options.cache_size
        );

        let mut comms = Comm::spawn(n, options.enable_shared_memory).into_iter();
        let free_queues: FreeQueues =
            Arc::new((0..n).map(|_| Mutex::new(Vec::new())).collect());
        let mut deques: Vec<Deque<JobRef>> = (0..n).map(|_| Deque::new_lifo()).collect();
        let stealers = deques.iter().map(|d| d.stealer()).collect();
        let scheduler = Scheduler::new(n, stealers);

        let comm0 = comms.next().unwrap();
        let deque0 = deques.remove(0);

        let mut senders = Vec::with_capacity(n.saturating_sub(1));
        let mut threads = Vec::with_capacity(n.saturating_sub(1));
        for (comm, deque) in comms.zip(deques.into_iter()) {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            let scheduler = scheduler.clone();
            let options = options.clone();
            let free_queues = free_queues.clone();
            let index = comm.my_rank();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("pgas-worker-{}", index))
                    .spawn(move || {
                        let engine = Engine::new(comm.clone(), &options, free_queues);
                        let worker = Worker::new(index, deque, engine, scheduler, comm);
                        unsafe { Worker::set_current(&worker) };
                        worker.engine().init_local_heap(options.local_heap_size);
                        worker_loop(&worker, &rx);
                        Worker::clear_current();
                    })
                    .expect("failed to spawn worker thread"),
            );
        }

        let engine0 = Engine::new(comm0.clone(), &options, free_queues);
        let worker0 = Box::new(Worker::new(0, deque0, engine0, scheduler.clone(), comm0));
        unsafe { Worker::set_current(&*worker0) };
        worker0.engine().init_local_heap(options.local_heap_size);

        Pgas {
            options,
            scheduler,
            senders,
            threads,
            worker0,
        }
    }

    fn finalize(self) {
        for tx in &self.senders {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        self.scheduler.request_shutdown();
        for t in self.threads {
            t.join().expect("worker thread panicked");
        }
        Worker::clear_current();
        info!("fini");
    }

    /// Run a collective closure on every rank: the workers through their
    /// command channels, rank 0 inline on the calling thread. The closure's
    /// own collectives (reservations, window creation, barriers) provide the
    /// synchronization.
    pub(crate) fn coll_exec<R>(
        &self,
        main_f: impl FnOnce(&Worker) -> R,
        worker_f: Arc<dyn Fn(&Worker) + Send + Sync>,
    ) -> R {
        for tx in &self.senders {
            tx.send(WorkerCommand::Collective(worker_f.clone()))
                .expect("worker channel closed");
        }
        self.scheduler.notify_workers();
        main_f(&self.worker0)
    }
}

fn worker_loop(worker: &Worker, rx: &Receiver<WorkerCommand>) {
    debug!("worker {} up", worker.index);
    loop {
        match rx.try_recv() {
            Ok(WorkerCommand::Collective(f)) => {
                f(worker);
                continue;
            }
            Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        if worker.scheduler().is_shutdown() {
            break;
        }
        if worker.run_one() {
            continue;
        }
        worker.engine().poll();
        worker.park();
    }
    debug!("worker {} down", worker.index);
}

/// Bring the runtime up. Options are read from `PGAS_`-prefixed environment
/// variables; the calling thread becomes rank 0's worker.
pub fn init() {
    let _ = logger::init();
    let mut guard = RUNTIME.lock().unwrap();
    assert!(guard.is_none(), "pgas runtime is already initialized");
    *guard = Some(Pgas::initialize());
}

/// Tear the runtime down, joining all worker threads and releasing global
/// memory.
pub fn fini() {
    let pgas = RUNTIME
        .lock()
        .unwrap()
        .take()
        .expect("pgas runtime is not initialized");
    pgas.finalize();
}

pub fn is_initialized() -> bool {
    RUNTIME.lock().unwrap().is_some()
}

pub(crate) fn with_runtime<R>(f: impl FnOnce(&Pgas) -> R) -> R {
    let guard = RUNTIME.lock().unwrap();
    let pgas = guard
        .as_ref()
        .expect("pgas runtime is not initialized (call init())");
    f(pgas)
}
