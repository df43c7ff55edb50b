// src/compile_queue.rs
//! Background compile queue.
//!
//! - FIFO of `CompileTask`s on an unbounded crossbeam channel
//! - Exactly one worker thread; it blocks on the channel while idle
//! - Outputs are handed to a `CompileOutputSink` (the material table), which
//!   routes them to the owning material or drops them
//! - `CompileTask::shutdown()` is the only way to stop the worker

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::compiler::{CompileOutput, CompileTask, ShaderCompiler};
use crate::error::Result;

/// Receives each finished compile.
pub trait CompileOutputSink: Send + Sync {
    /// Deliver to material `owner`. Returns false if it no longer exists.
    fn deliver(&self, owner: u16, output: CompileOutput) -> bool;
}

/// Producer handle shared by every material.
#[derive(Clone)]
pub struct CompileSender {
    tx: Sender<CompileTask>,
    next_task_id: Arc<AtomicU32>,
    pending: Arc<AtomicUsize>,
}

impl CompileSender {
    /// Fresh task id (wraps, never 0).
    pub fn next_task_id(&self) -> u32 {
        loop {
            let id = self.next_task_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Enqueue a task. Returns false if the worker is gone.
    pub fn submit(&self, task: CompileTask) -> bool {
        let counted = !task.is_shutdown_sentinel;
        if counted {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }
        match self.tx.send(task) {
            Ok(()) => true,
            Err(_) => {
                if counted {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                log::warn!("compile worker has stopped; task dropped");
                false
            }
        }
    }

    /// Tasks submitted but not yet compiled.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// The queue itself: one sender side, one receiver side.
pub struct CompileQueue {
    sender: CompileSender,
    rx: Receiver<CompileTask>,
}

impl Default for CompileQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompileQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            sender: CompileSender {
                tx,
                next_task_id: Arc::new(AtomicU32::new(0)),
                pending: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        }
    }

    pub fn sender(&self) -> CompileSender {
        self.sender.clone()
    }

    /// Start the single consumer. Consumes the queue's receiving side.
    pub fn spawn_worker(
        self,
        compiler: Arc<ShaderCompiler>,
        sink: Arc<dyn CompileOutputSink>,
        thread_name: &str,
    ) -> Result<CompileWorker> {
        let CompileQueue { sender, rx } = self;
        let pending = sender.pending.clone();
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || worker_loop(rx, compiler, sink, pending))?;
        Ok(CompileWorker {
            sender,
            handle: Some(handle),
        })
    }
}

fn worker_loop(
    rx: Receiver<CompileTask>,
    compiler: Arc<ShaderCompiler>,
    sink: Arc<dyn CompileOutputSink>,
    pending: Arc<AtomicUsize>,
) {
    log::debug!("compile worker started");
    while let Ok(task) = rx.recv() {
        if task.is_shutdown_sentinel {
            break;
        }
        let output = compiler.compile(&task);
        log::debug!(
            "compiled {} '{}' for material {} in {} ms ({})",
            task.stage,
            task.entry_point,
            task.owner,
            output.compile_time_ms,
            if output.success() { "ok" } else { "failed" }
        );
        if !sink.deliver(task.owner, output) {
            log::debug!(
                "material {} destroyed before task {} finished; output dropped",
                task.owner,
                task.task_id
            );
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    log::debug!("compile worker stopped");
}

/// Owns the worker thread. Dropping it shuts the worker down.
pub struct CompileWorker {
    sender: CompileSender,
    handle: Option<JoinHandle<()>>,
}

impl CompileWorker {
    pub fn sender(&self) -> CompileSender {
        self.sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Enqueue the sentinel and wait for the worker. Tasks queued before the
    /// sentinel still run.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.sender.submit(CompileTask::shutdown());
        if handle.join().is_err() {
            log::error!("compile worker panicked");
        }
    }
}

impl Drop for CompileWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompiledShader, NativeCompiler, ShaderReflection, ShaderStage};
    use parking_lot::Mutex;

    struct TagCompiler;

    impl NativeCompiler for TagCompiler {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn compile(&self, task: &CompileTask) -> Result<CompiledShader> {
            Ok(CompiledShader {
                stage: task.stage,
                entry_point: task.entry_point.clone(),
                blob: Arc::from(task.source.as_bytes()),
                reflection: Arc::new(ShaderReflection::default()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        live_owner: u16,
        seen: Mutex<Vec<(u16, u32)>>,
    }

    impl CompileOutputSink for RecordingSink {
        fn deliver(&self, owner: u16, output: CompileOutput) -> bool {
            if owner != self.live_owner {
                return false;
            }
            self.seen.lock().push((owner, output.task_id));
            true
        }
    }

    fn task(sender: &CompileSender, owner: u16, source: &str) -> CompileTask {
        CompileTask::new(
            ShaderStage::Fragment,
            source,
            "main",
            "shader.wgsl",
            owner,
            sender.next_task_id(),
        )
    }

    #[test]
    fn test_fifo_delivery_and_sentinel_shutdown() {
        let queue = CompileQueue::new();
        let sender = queue.sender();
        let sink = Arc::new(RecordingSink {
            live_owner: 3,
            ..Default::default()
        });
        let compiler = Arc::new(ShaderCompiler::new(Box::new(TagCompiler), 20));

        // Queue before the worker exists; nothing is lost
        for src in ["a", "b", "c"] {
            assert!(sender.submit(task(&sender, 3, src)));
        }
        assert!(sender.submit(task(&sender, 8, "gone")));
        assert_eq!(sender.pending(), 4);

        let mut worker = queue
            .spawn_worker(compiler, sink.clone(), "test-compiler")
            .unwrap();
        worker.shutdown();

        assert!(!worker.is_running());
        assert_eq!(sender.pending(), 0);
        assert_eq!(sink.seen.lock().as_slice(), &[(3, 1), (3, 2), (3, 3)]);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let queue = CompileQueue::new();
        let sender = queue.sender();
        let sink: Arc<dyn CompileOutputSink> = Arc::new(RecordingSink::default());
        let compiler = Arc::new(ShaderCompiler::new(Box::new(TagCompiler), 20));
        let worker = queue.spawn_worker(compiler, sink, "test-compiler").unwrap();
        drop(worker);
        // The receiver is gone with the thread
        assert!(!sender.submit(task(&sender, 1, "late")));
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn test_task_ids_skip_zero() {
        let queue = CompileQueue::new();
        let sender = queue.sender();
        sender.next_task_id.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(sender.next_task_id(), u32::MAX);
        assert_eq!(sender.next_task_id(), 1);
    }
}
