use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::error::{HierarchyError, Result};

/// Batches kept ready ahead of the consumer.
pub const DEFAULT_CAPACITY: usize = 3;

enum Message<T> {
    Item(T),
    Failed(HierarchyError),
    End,
}

/// Sends the terminal message when the producer exits, however it exits.
struct EndGuard<T> {
    tx: SyncSender<Message<T>>,
    clean: bool,
}

impl<T> Drop for EndGuard<T> {
    fn drop(&mut self) {
        if !self.clean {
            let _ = self.tx.send(Message::Failed(HierarchyError::Data(
                "Prefetch worker panicked".to_string(),
            )));
        }
        let _ = self.tx.send(Message::End);
    }
}

/// Pulls items from a source on a background thread into a bounded queue.
///
/// Iterating yields the source's items in order. A source error is yielded once
/// and ends the stream; so does cancellation. Dropping the prefetcher stops the
/// worker and joins it.
pub struct Prefetcher<T> {
    rx: Option<Receiver<Message<T>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl<T: Send + 'static> Prefetcher<T> {
    pub fn spawn<I>(source: I, capacity: usize) -> Result<Self>
    where
        I: Iterator<Item = Result<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("prefetch".to_string())
            .spawn(move || {
                let mut guard = EndGuard { tx, clean: false };
                for item in source {
                    if worker_stop.load(Ordering::Acquire) {
                        break;
                    }
                    match item {
                        Ok(value) => {
                            if guard.tx.send(Message::Item(value)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = guard.tx.send(Message::Failed(e));
                            break;
                        }
                    }
                }
                guard.clean = true;
            })?;

        Ok(Self {
            rx: Some(rx),
            stop,
            handle: Some(handle),
            finished: false,
        })
    }
}

impl<T> Prefetcher<T> {
    /// Asks the worker to stop. The consumer sees an error instead of a silent end.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl<T> Iterator for Prefetcher<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let message = self.rx.as_ref()?.recv();
        match message {
            Ok(Message::Item(value)) => {
                if self.is_cancelled() {
                    self.finished = true;
                    return Some(Err(HierarchyError::Data("Prefetch cancelled".to_string())));
                }
                Some(Ok(value))
            }
            Ok(Message::Failed(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            Ok(Message::End) | Err(_) => {
                self.finished = true;
                if self.is_cancelled() {
                    Some(Err(HierarchyError::Data("Prefetch cancelled".to_string())))
                } else {
                    None
                }
            }
        }
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Dropping the receiver unblocks a worker waiting on a full queue.
        drop(self.rx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Prefetch worker exited with a panic");
            }
        }
    }
}
