//! Out-of-process workers: a child process plus two parent-side pump
//! threads.
//!
//! Pipes are point-to-point, so the shared cross-boundary queue is served
//! per worker by a *feeder* thread that pulls one frame at a time from the
//! bounded channel and writes it to the child's stdin, waiting for the
//! completion acknowledgement before pulling the next. This keeps the
//! one-task-per-idle-child load balancing of a shared queue. A *reader*
//! thread decodes the child's stdout into pool events, reports a silent
//! child death as a worker crash, and reaps the process.

use std::io::{BufReader, Read, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, after, bounded, never, select};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ErrorReport, PoolError};
use crate::future::TaskId;
use crate::remote::WORKER_ENV;
use crate::remote::protocol::{self, FailureStage, WorkerOrder, WorkerReply};
use crate::sync::Latch;
use crate::worker::{PoolWorker, WorkerId};

/// Message on the cross-boundary task channel. `Stop` retires exactly one
/// worker.
pub(crate) enum RemoteOrder {
    Task {
        task_id: TaskId,
        kind: String,
        payload: Vec<u8>,
    },
    Stop,
}

/// Events delivered to the pool's consumer thread.
pub(crate) enum PoolEvent {
    Running { task_id: TaskId },
    Completed { task_id: TaskId, payload: Vec<u8> },
    TaskFailed { task_id: TaskId, report: ErrorReport },
    WorkerShutdown { worker_id: WorkerId },
    WorkerFailed { worker_id: WorkerId, error: PoolError },
    Stop,
}

/// Everything a process worker needs; consumed on start.
pub(crate) struct ProcessWorkerContext {
    pub(crate) program: PathBuf,
    pub(crate) remote_rx: Receiver<RemoteOrder>,
    pub(crate) event_tx: Sender<PoolEvent>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_tasks: Option<NonZeroUsize>,
}

/// An out-of-process worker owned by a process pool.
pub(crate) struct ProcessWorker {
    id: WorkerId,
    name: String,
    context: Mutex<Option<ProcessWorkerContext>>,
    child: Arc<Mutex<Option<Child>>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    busy: Arc<AtomicBool>,
    done: Arc<Latch>,
}

impl ProcessWorker {
    pub(crate) fn new(id: WorkerId, name: String, context: ProcessWorkerContext) -> Self {
        Self {
            id,
            name,
            context: Mutex::new(Some(context)),
            child: Arc::new(Mutex::new(None)),
            feeder: Mutex::new(None),
            reader: Mutex::new(None),
            started: AtomicBool::new(false),
            busy: Arc::new(AtomicBool::new(false)),
            done: Arc::new(Latch::new()),
        }
    }
}

impl PoolWorker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn start(&self) -> bool {
        let Some(context) = self.context.lock().take() else {
            return false;
        };
        self.started.store(true, Ordering::Release);

        let spawned = Command::new(&context.program)
            .env(WORKER_ENV, &self.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let _ = context.event_tx.send(PoolEvent::WorkerFailed {
                    worker_id: self.id,
                    error: PoolError::Spawn(err.to_string()),
                });
                self.done.open();
                return true;
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = context.event_tx.send(PoolEvent::WorkerFailed {
                worker_id: self.id,
                error: PoolError::Spawn("worker process pipes unavailable".to_string()),
            });
            self.done.open();
            return true;
        };
        *self.child.lock() = Some(child);

        // One slot: at most one task is in flight per child.
        let (ack_tx, ack_rx) = bounded::<()>(1);
        // Dropped by the reader on exit, releasing a blocked feeder.
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let feeder = {
            let busy = Arc::clone(&self.busy);
            let remote_rx = context.remote_rx;
            let idle_timeout = context.idle_timeout;
            let max_tasks = context.max_tasks;
            thread::Builder::new()
                .name(format!("{}-feeder", self.name))
                .spawn(move || {
                    feeder_loop(stdin, &remote_rx, &ack_rx, &stop_rx, idle_timeout, max_tasks, &busy);
                })
                .expect("Failed to spawn worker feeder thread")
        };
        let reader = {
            let event_tx = context.event_tx;
            let child = Arc::clone(&self.child);
            let done = Arc::clone(&self.done);
            let worker_id = self.id;
            thread::Builder::new()
                .name(format!("{}-reader", self.name))
                .spawn(move || {
                    reader_loop(BufReader::new(stdout), &event_tx, worker_id, &ack_tx, &child);
                    drop(stop_tx);
                    done.open();
                })
                .expect("Failed to spawn worker reader thread")
        };
        *self.feeder.lock() = Some(feeder);
        *self.reader.lock() = Some(reader);
        true
    }

    fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.done.is_open()
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        if !self.done.wait_timeout(timeout) {
            return false;
        }
        if let Some(handle) = self.feeder.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

/// Pump the shared task channel into the child, one frame in flight.
fn feeder_loop<W: Write>(
    mut stdin: W,
    remote_rx: &Receiver<RemoteOrder>,
    ack_rx: &Receiver<()>,
    stop_rx: &Receiver<()>,
    idle_timeout: Option<Duration>,
    max_tasks: Option<NonZeroUsize>,
    busy: &AtomicBool,
) {
    let mut dispatched = 0usize;
    loop {
        if let Some(max_tasks) = max_tasks {
            if dispatched == max_tasks.get() {
                debug!("worker reached its task budget");
                break;
            }
        }
        let idle = match idle_timeout {
            Some(timeout) => after(timeout),
            None => never(),
        };
        let order = select! {
            recv(remote_rx) -> order => match order {
                Ok(order) => order,
                Err(_) => break,
            },
            recv(stop_rx) -> _ => {
                // The reader is gone; the child is down or unreadable.
                busy.store(false, Ordering::Release);
                return;
            }
            recv(idle) -> _ => {
                debug!("worker idle timeout reached");
                break;
            }
        };
        match order {
            RemoteOrder::Stop => break,
            RemoteOrder::Task {
                task_id,
                kind,
                payload,
            } => {
                busy.store(true, Ordering::Release);
                let frame = WorkerOrder::Run {
                    task_id,
                    kind,
                    payload,
                };
                if protocol::write_frame(&mut stdin, &frame).is_err() {
                    busy.store(false, Ordering::Release);
                    return;
                }
                dispatched += 1;
                if ack_rx.recv().is_err() {
                    busy.store(false, Ordering::Release);
                    return;
                }
                busy.store(false, Ordering::Release);
            }
        }
    }
    // Graceful retirement: let the child run its finalizer and say
    // farewell. Dropping stdin afterwards closes the pipe.
    let _ = protocol::write_frame(&mut stdin, &WorkerOrder::Exit);
}

/// Decode child replies into pool events; reap the child at the end.
fn reader_loop<R: Read>(
    mut input: R,
    event_tx: &Sender<PoolEvent>,
    worker_id: WorkerId,
    ack_tx: &Sender<()>,
    child: &Mutex<Option<Child>>,
) {
    let mut farewell_seen = false;
    loop {
        match protocol::read_frame::<WorkerReply>(&mut input) {
            Ok(Some(WorkerReply::Running { task_id })) => {
                let _ = event_tx.send(PoolEvent::Running { task_id });
            }
            Ok(Some(WorkerReply::Completed { task_id, payload })) => {
                let _ = ack_tx.try_send(());
                let _ = event_tx.send(PoolEvent::Completed { task_id, payload });
            }
            Ok(Some(WorkerReply::TaskFailed { task_id, report })) => {
                let _ = ack_tx.try_send(());
                let _ = event_tx.send(PoolEvent::TaskFailed { task_id, report });
            }
            Ok(Some(WorkerReply::WorkerFailed { stage, report })) => {
                farewell_seen = true;
                let error = match stage {
                    FailureStage::Initializer => PoolError::Initializer(report),
                    FailureStage::Finalizer => PoolError::Finalizer(report),
                    FailureStage::Loop => PoolError::Worker(report),
                };
                let _ = event_tx.send(PoolEvent::WorkerFailed { worker_id, error });
            }
            Ok(Some(WorkerReply::Shutdown)) => {
                farewell_seen = true;
                let _ = event_tx.send(PoolEvent::WorkerShutdown { worker_id });
            }
            Ok(None) => break,
            Err(err) => {
                farewell_seen = true;
                let _ = event_tx.send(PoolEvent::WorkerFailed {
                    worker_id,
                    error: PoolError::Worker(ErrorReport::new(format!(
                        "failed to decode worker reply: {err}"
                    ))),
                });
                break;
            }
        }
    }
    let status = child.lock().take().map(|mut child| child.wait());
    if !farewell_seen {
        let detail = match status {
            Some(Ok(status)) => format!("worker process exited unexpectedly ({status})"),
            _ => "worker process exited unexpectedly".to_string(),
        };
        let _ = event_tx.send(PoolEvent::WorkerFailed {
            worker_id,
            error: PoolError::Worker(ErrorReport::new(detail)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::io::Cursor;

    #[test]
    fn spawn_failure_is_reported_as_an_event() {
        let (_remote_tx, remote_rx) = bounded(2);
        let (event_tx, event_rx) = unbounded();
        let worker = ProcessWorker::new(
            WorkerId(1),
            "test-process-worker-1".to_string(),
            ProcessWorkerContext {
                program: PathBuf::from("/nonexistent/horizon-taskpool-worker"),
                remote_rx,
                event_tx,
                idle_timeout: Some(Duration::from_millis(50)),
                max_tasks: None,
            },
        );
        assert!(worker.start());
        assert!(!worker.start());
        match event_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PoolEvent::WorkerFailed { worker_id, error } => {
                assert_eq!(worker_id, WorkerId(1));
                assert!(matches!(error, PoolError::Spawn(_)));
            }
            _ => panic!("expected a spawn failure event"),
        }
        assert!(!worker.is_alive());
        assert!(worker.join(Some(Duration::from_secs(1))));
    }

    #[test]
    fn feeder_writes_frames_and_retires_on_stop() {
        let (remote_tx, remote_rx) = bounded(4);
        let (ack_tx, ack_rx) = bounded(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        remote_tx
            .send(RemoteOrder::Task {
                task_id: TaskId(1),
                kind: "k".to_string(),
                payload: vec![9],
            })
            .unwrap();
        ack_tx.send(()).unwrap();
        remote_tx.send(RemoteOrder::Stop).unwrap();

        let busy = AtomicBool::new(false);
        let mut written = Vec::new();
        feeder_loop(&mut written, &remote_rx, &ack_rx, &stop_rx, None, None, &busy);

        let mut cursor = Cursor::new(written);
        assert_eq!(
            protocol::read_frame::<WorkerOrder>(&mut cursor).unwrap(),
            Some(WorkerOrder::Run {
                task_id: TaskId(1),
                kind: "k".to_string(),
                payload: vec![9],
            })
        );
        assert_eq!(
            protocol::read_frame::<WorkerOrder>(&mut cursor).unwrap(),
            Some(WorkerOrder::Exit)
        );
        assert!(!busy.load(Ordering::Acquire));
    }

    #[test]
    fn feeder_idle_timeout_retires_the_worker() {
        let (_remote_tx, remote_rx) = bounded::<RemoteOrder>(1);
        let (_ack_tx, ack_rx) = bounded(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        let busy = AtomicBool::new(false);
        let mut written = Vec::new();
        feeder_loop(
            &mut written,
            &remote_rx,
            &ack_rx,
            &stop_rx,
            Some(Duration::from_millis(20)),
            None,
            &busy,
        );
        let mut cursor = Cursor::new(written);
        assert_eq!(
            protocol::read_frame::<WorkerOrder>(&mut cursor).unwrap(),
            Some(WorkerOrder::Exit)
        );
    }

    #[test]
    fn feeder_respects_task_budget() {
        let (remote_tx, remote_rx) = bounded(4);
        let (ack_tx, ack_rx) = bounded(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        for id in 1..=3u64 {
            remote_tx
                .send(RemoteOrder::Task {
                    task_id: TaskId(id),
                    kind: "k".to_string(),
                    payload: Vec::new(),
                })
                .unwrap();
        }
        // Pre-load acks so the feeder never blocks on them.
        let acker = thread::spawn(move || {
            for _ in 0..2 {
                ack_tx.send(()).unwrap();
            }
        });

        let busy = AtomicBool::new(false);
        let mut written = Vec::new();
        feeder_loop(
            &mut written,
            &remote_rx,
            &ack_rx,
            &stop_rx,
            None,
            NonZeroUsize::new(2),
            &busy,
        );
        acker.join().unwrap();

        let mut cursor = Cursor::new(written);
        let mut frames = Vec::new();
        while let Some(frame) = protocol::read_frame::<WorkerOrder>(&mut cursor).unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3); // two runs + exit
        assert_eq!(frames[2], WorkerOrder::Exit);
        // The third task stays queued for another worker.
        assert!(matches!(remote_rx.try_recv(), Ok(RemoteOrder::Task { .. })));
    }

    #[test]
    fn reader_translates_replies_and_flags_silent_death() {
        let mut stream = Vec::new();
        protocol::write_frame(&mut stream, &WorkerReply::Running { task_id: TaskId(4) }).unwrap();
        protocol::write_frame(
            &mut stream,
            &WorkerReply::Completed {
                task_id: TaskId(4),
                payload: vec![1],
            },
        )
        .unwrap();
        // No farewell before EOF: the child died.
        let (event_tx, event_rx) = unbounded();
        let (ack_tx, ack_rx) = bounded(1);
        let child = Mutex::new(None);
        reader_loop(Cursor::new(stream), &event_tx, WorkerId(2), &ack_tx, &child);

        assert!(matches!(
            event_rx.try_recv(),
            Ok(PoolEvent::Running { task_id: TaskId(4) })
        ));
        assert!(matches!(
            event_rx.try_recv(),
            Ok(PoolEvent::Completed { task_id: TaskId(4), .. })
        ));
        assert!(ack_rx.try_recv().is_ok());
        match event_rx.try_recv() {
            Ok(PoolEvent::WorkerFailed { worker_id, error }) => {
                assert_eq!(worker_id, WorkerId(2));
                assert!(matches!(error, PoolError::Worker(_)));
            }
            _ => panic!("expected a worker crash event"),
        }
    }

    #[test]
    fn reader_passes_through_clean_shutdown() {
        let mut stream = Vec::new();
        protocol::write_frame(&mut stream, &WorkerReply::Shutdown).unwrap();
        let (event_tx, event_rx) = unbounded();
        let (ack_tx, _ack_rx) = bounded(1);
        let child = Mutex::new(None);
        reader_loop(Cursor::new(stream), &event_tx, WorkerId(3), &ack_tx, &child);
        assert!(matches!(
            event_rx.try_recv(),
            Ok(PoolEvent::WorkerShutdown { worker_id: WorkerId(3) })
        ));
        assert!(event_rx.try_recv().is_err());
    }
}
