// Deferred execution of peer-initiated requests.
//
// The delivery path only decodes the header and queues a Job here, so a
// handler may block (including on a nested call to the peer) without
// stalling delivery of the response it is waiting for.

use crate::Core::alloc::RxBuffer;
use crate::RPC::header::CallHeader;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type RequestHandler = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

pub(crate) struct Job {
    pub handler: Arc<RequestHandler>,
    pub header: CallHeader,
    pub request: RxBuffer,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    stopped: bool,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

pub(crate) struct RequestWorker {
    queue: Arc<Queue>,
    thread: Option<JoinHandle<()>>,
}

impl RequestWorker {
    pub fn spawn<F>(name: String, serve: F) -> io::Result<Self>
    where
        F: Fn(Job) + Send + 'static,
    {
        let queue = Arc::new(Queue::default());
        let thread = {
            let queue = queue.clone();
            thread::Builder::new().name(name).spawn(move || loop {
                let job = {
                    let mut state = queue.state.lock();
                    loop {
                        if state.stopped {
                            return;
                        }
                        if let Some(job) = state.jobs.pop_front() {
                            break job;
                        }
                        queue.ready.wait(&mut state);
                    }
                };
                serve(job);
            })?
        };
        Ok(Self {
            queue,
            thread: Some(thread),
        })
    }

    pub fn submit(&self, job: Job) {
        let mut state = self.queue.state.lock();
        if state.stopped {
            // dropping the job releases its request buffer
            return;
        }
        state.jobs.push_back(job);
        self.queue.ready.notify_one();
    }

    pub fn stop(&mut self) {
        let abandoned = {
            let mut state = self.queue.state.lock();
            state.stopped = true;
            self.queue.ready.notify_all();
            std::mem::take(&mut state.jobs)
        };
        drop(abandoned);
        if let Some(handle) = self.thread.take() {
            // a handler may hold the last reference to its own correlator
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RequestWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
