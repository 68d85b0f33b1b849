//! Background flush worker
//!
//! Checkpoints hand their device writes to a single worker thread so the
//! coordinator only blocks in `WAIT_FLUSH`. A job is a list of chunks per
//! device; every device is flushed after its chunks are written, then the job's
//! completion hook runs and the result is sent back through [`PendingFlush`].

use std::io;
use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::device::{write_all_at, DeviceHandle};

/// Bytes to write at a device offset
#[derive(Debug, Clone)]
pub struct FlushChunk {
    /// Device offset
    pub offset: u64,
    /// Bytes to write
    pub bytes: Vec<u8>,
}

/// Writes destined for one device
pub struct FlushTarget {
    /// Destination device
    pub device: DeviceHandle,
    /// Chunks, written in order
    pub chunks: Vec<FlushChunk>,
}

impl FlushTarget {
    /// Total payload bytes
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.bytes.len()).sum()
    }

    /// Whether there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.bytes.is_empty())
    }
}

type OnDurable = Box<dyn FnOnce() + Send>;

/// A unit of work for the flush worker
pub struct FlushJob {
    targets: Vec<FlushTarget>,
    on_durable: Option<OnDurable>,
}

impl FlushJob {
    /// Create a job writing `targets`
    pub fn new(targets: Vec<FlushTarget>) -> Self {
        Self {
            targets,
            on_durable: None,
        }
    }

    /// Run `f` on the worker once every target is durable
    pub fn on_durable(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_durable = Some(Box::new(f));
        self
    }

    fn execute(self) -> io::Result<()> {
        for target in &self.targets {
            for chunk in &target.chunks {
                write_all_at(target.device.as_ref(), chunk.offset, &chunk.bytes)?;
            }
            target.device.flush_sync()?;
        }
        if let Some(f) = self.on_durable {
            f();
        }
        Ok(())
    }
}

/// Completion handle of a submitted [`FlushJob`]
#[must_use = "a flush is only known to be durable once waited for"]
pub struct PendingFlush {
    rx: Receiver<io::Result<()>>,
}

impl PendingFlush {
    /// Block until the job finished
    pub fn wait(self) -> io::Result<()> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "flush worker exited before completing the job",
            ))
        })
    }

    /// An already completed flush
    pub fn ready(result: io::Result<()>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }
}

enum FlushRequest {
    Job(FlushJob, Sender<io::Result<()>>),
    Shutdown,
}

/// Owner of the flush worker thread
pub struct FlushManager {
    tx: Sender<FlushRequest>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FlushManager {
    /// Spawn the worker
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = unbounded::<FlushRequest>();
        let worker = thread::Builder::new()
            .name("oxicpr-flush".to_string())
            .spawn(move || worker_loop(rx))?;
        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `job`; the returned handle reports its outcome.
    pub fn submit(&self, job: FlushJob) -> PendingFlush {
        let (reply, rx) = bounded(1);
        if self.tx.send(FlushRequest::Job(job, reply)).is_err() {
            return PendingFlush::ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "flush worker is not running",
            )));
        }
        PendingFlush { rx }
    }

    /// Finish queued jobs and join the worker
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(FlushRequest::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: Receiver<FlushRequest>) {
    while let Ok(req) = rx.recv() {
        match req {
            FlushRequest::Job(job, reply) => {
                let result = job.execute();
                if let Err(e) = &result {
                    warn!(error = %e, "checkpoint flush failed");
                }
                let _ = reply.send(result);
            }
            FlushRequest::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_job_writes_and_flushes() {
        let manager = FlushManager::new().unwrap();
        let device = Arc::new(MemoryDevice::new());
        let done = Arc::new(AtomicBool::new(false));

        let job = FlushJob::new(vec![FlushTarget {
            device: device.clone(),
            chunks: vec![
                FlushChunk { offset: 0, bytes: b"abc".to_vec() },
                FlushChunk { offset: 8, bytes: b"xyz".to_vec() },
            ],
        }]);
        let flag = done.clone();
        manager
            .submit(job.on_durable(move || flag.store(true, Ordering::Release)))
            .wait()
            .unwrap();

        assert!(done.load(Ordering::Acquire));
        assert_eq!(device.flush_count(), 1);
        assert_eq!(&device.durable_bytes()[8..11], b"xyz");
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let manager = FlushManager::new().unwrap();
        manager.stop();
        let err = manager.submit(FlushJob::new(Vec::new())).wait().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_ready_handle() {
        assert!(PendingFlush::ready(Ok(())).wait().is_ok());
        let err = PendingFlush::ready(Err(io::Error::other("boom")))
            .wait()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
