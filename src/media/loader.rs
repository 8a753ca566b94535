//! Async video loader
//!
//! A single shared worker thread serving open requests keyed by cue id, so
//! file probing, codec init and index scans never run on the real-time
//! path. Results come back through a completion queue the main thread
//! drains once per tick; callbacks run synchronously there.
//!
//! Cancellation: a cue id removed from the pending set is skipped at
//! dispatch and its result (including any fully built source) is discarded
//! at the posting step.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::media::gpu::GpuContext;
use crate::media::{open_source, DecodeOptions, InputSource};

/// Invoked from `poll_completed` on the engine thread:
/// `(cue_id, path, source, success)`.
pub type LoadCallback = Box<dyn FnOnce(&str, &str, Option<Box<dyn InputSource>>, bool) + Send>;

struct LoadRequest {
    cue_id: String,
    path: String,
    callback: LoadCallback,
}

struct LoadResult {
    cue_id: String,
    path: String,
    source: Option<Box<dyn InputSource>>,
    success: bool,
    callback: LoadCallback,
}

pub struct AsyncVideoLoader {
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    request_tx: Option<mpsc::Sender<LoadRequest>>,
    results: Arc<Mutex<VecDeque<LoadResult>>>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl AsyncVideoLoader {
    /// Start the worker. `gpu` is only handed through to sources for later
    /// main-thread texture work; the worker itself never touches the GPU.
    pub fn new(options: DecodeOptions, gpu: Option<Arc<GpuContext>>) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<LoadRequest>();
        let running = Arc::new(AtomicBool::new(true));
        let results = Arc::new(Mutex::new(VecDeque::new()));
        let pending = Arc::new(Mutex::new(HashSet::new()));

        let worker = {
            let running = running.clone();
            let results = results.clone();
            let pending = pending.clone();
            std::thread::Builder::new()
                .name("video-loader".into())
                .spawn(move || {
                    Self::worker_loop(request_rx, running, results, pending, options, gpu)
                })
                .expect("spawn loader thread")
        };

        log::info!("AsyncVideoLoader: worker thread started");
        Self {
            worker: Some(worker),
            running,
            request_tx: Some(request_tx),
            results,
            pending,
        }
    }

    fn worker_loop(
        request_rx: mpsc::Receiver<LoadRequest>,
        running: Arc<AtomicBool>,
        results: Arc<Mutex<VecDeque<LoadResult>>>,
        pending: Arc<Mutex<HashSet<String>>>,
        options: DecodeOptions,
        gpu: Option<Arc<GpuContext>>,
    ) {
        while running.load(Ordering::SeqCst) {
            let request = match request_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => request,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };

            // Cancelled between enqueue and dispatch?
            if !pending.lock().contains(&request.cue_id) {
                log::info!(
                    "AsyncVideoLoader: skipping cancelled load for cue {}",
                    request.cue_id
                );
                continue;
            }

            log::info!(
                "AsyncVideoLoader: loading '{}' (cue {})",
                request.path,
                request.cue_id
            );
            let started = Instant::now();

            let source = match open_source(&request.path, &options, gpu.clone()) {
                Ok(source) => Some(source),
                Err(e) => {
                    log::warn!("AsyncVideoLoader: failed to load '{}': {e}", request.path);
                    None
                }
            };
            let success = source.is_some();
            if success {
                log::info!(
                    "AsyncVideoLoader: loaded '{}' in {} ms",
                    request.path,
                    started.elapsed().as_millis()
                );
            }

            // Cancelled while we were opening? Drop the result (and the
            // source with it) without posting.
            if !pending.lock().contains(&request.cue_id) {
                log::info!(
                    "AsyncVideoLoader: discarding result for cancelled cue {}",
                    request.cue_id
                );
                continue;
            }

            results.lock().push_back(LoadResult {
                cue_id: request.cue_id,
                path: request.path,
                source,
                success,
                callback: request.callback,
            });
        }

        log::info!("AsyncVideoLoader: worker thread exiting");
    }

    /// Queue a load. Non-blocking.
    pub fn request(&self, cue_id: &str, path: &str, callback: LoadCallback) {
        self.pending.lock().insert(cue_id.to_string());

        if let Some(tx) = &self.request_tx {
            let _ = tx.send(LoadRequest {
                cue_id: cue_id.to_string(),
                path: path.to_string(),
                callback,
            });
            log::info!("AsyncVideoLoader: queued '{path}' (cue {cue_id})");
        }
    }

    /// Drain completed loads and invoke their callbacks. Call once per
    /// tick from the engine thread. Returns the number of callbacks run.
    pub fn poll_completed(&self) -> usize {
        let mut invoked = 0;
        loop {
            let result = match self.results.lock().pop_front() {
                Some(result) => result,
                None => break,
            };

            let was_pending = self.pending.lock().remove(&result.cue_id);
            if !was_pending {
                // Cancelled after posting; the built source drops here
                continue;
            }

            (result.callback)(&result.cue_id, &result.path, result.source, result.success);
            invoked += 1;
        }
        invoked
    }

    /// Cancel any pending load for `cue_id`; in-flight work is discarded
    /// when it completes.
    pub fn cancel(&self, cue_id: &str) {
        self.pending.lock().remove(cue_id);
        log::info!("AsyncVideoLoader: cancelled load for cue {cue_id}");
    }

    pub fn is_load_pending(&self, cue_id: &str) -> bool {
        self.pending.lock().contains(cue_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn shutdown(&mut self) {
        if self.worker.is_none() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.request_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.results.lock().clear();
        self.pending.lock().clear();
        log::info!("AsyncVideoLoader: shut down");
    }
}

impl Drop for AsyncVideoLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn failed_open_reports_failure_through_callback() {
        let loader = AsyncVideoLoader::new(DecodeOptions::default(), None);
        let outcome = Arc::new(Mutex::new(None));

        let seen = outcome.clone();
        loader.request(
            "cue-1",
            "/nonexistent/clip.mov",
            Box::new(move |cue, _path, source, success| {
                *seen.lock() = Some((cue.to_string(), source.is_some(), success));
            }),
        );

        wait_for(|| !loader.is_load_pending("cue-1") || loader.poll_completed() > 0);
        // Callback may have fired inside the wait; drain any leftovers
        loader.poll_completed();

        let got = outcome.lock().clone();
        let (cue, has_source, success) = got.expect("callback should run");
        assert_eq!(cue, "cue-1");
        assert!(!has_source);
        assert!(!success);
    }

    #[test]
    fn cancelled_loads_never_call_back() {
        let loader = AsyncVideoLoader::new(DecodeOptions::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        loader.request(
            "cue-2",
            "/nonexistent/other.mov",
            Box::new(move |_, _, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        loader.cancel("cue-2");
        assert!(!loader.is_load_pending("cue-2"));

        // Give the worker time to observe and discard
        std::thread::sleep(Duration::from_millis(300));
        loader.poll_completed();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
