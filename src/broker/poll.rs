//! Per-document poll loop.
//!
//! Each document broker owns one OS thread running a cooperative
//! scheduler: block on the event channel with a short timeout, apply
//! every pending event, then run the broker's periodic checks. All
//! broker state lives on this thread; other threads only ever talk to it
//! through the [`BrokerEvent`] channel held by [`DocBrokerHandle`].

use super::events::BrokerEvent;
use super::DocumentBroker;
use crate::config::Config;
use crate::context::ProcessContext;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Idle wait per poll iteration; periodic checks run at least this often.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// After the loop stops, keep applying pending events (upload outcomes,
/// kit acks) for at most this long before tearing down.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Owning handle to a broker thread.
///
/// Dropping the handle stops the poll and joins the thread.
#[derive(Debug)]
pub struct DocBrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
    thread: Option<thread::JoinHandle<()>>,
    doc_key: String,
}

impl DocBrokerHandle {
    /// Start the poll thread for a document.
    pub fn spawn(
        uri_public: impl Into<String>,
        config: Arc<Config>,
        ctx: Arc<ProcessContext>,
    ) -> std::io::Result<Self> {
        let uri_public = uri_public.into();
        let doc_key = super::doc_key_from_uri(&uri_public);
        let (tx, rx) = mpsc::channel();
        let thread_tx = tx.clone();
        let thread_key = doc_key.clone();

        let thread = thread::Builder::new()
            .name(format!("docbroker{}", thread_key.replace('/', "_")))
            .spawn(move || {
                let mut broker =
                    DocumentBroker::new(uri_public, config, ctx, thread_tx, Instant::now());
                run_poll_loop(&mut broker, &rx);
                if broker.has_pending_upload() {
                    flush_pending(&mut broker, &rx);
                }
                broker.shutdown(Instant::now());
            })?;

        Ok(Self {
            tx,
            thread: Some(thread),
            doc_key,
        })
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    /// Channel for feeding events from the socket layer, kit, and
    /// storage workers.
    pub fn sender(&self) -> mpsc::Sender<BrokerEvent> {
        self.tx.clone()
    }

    /// Run a closure on the broker thread.
    pub fn add_callback(&self, callback: impl FnOnce(&mut DocumentBroker) + Send + 'static) {
        let _ = self.tx.send(BrokerEvent::Callback(Box::new(callback)));
    }

    /// Wake the poll without carrying work.
    pub fn wakeup(&self) {
        let _ = self.tx.send(BrokerEvent::Wakeup);
    }

    /// Ask the broker to stop; the thread is joined on drop.
    pub fn stop(&self) {
        let _ = self.tx.send(BrokerEvent::Stop);
    }

    /// Stop and wait for the broker thread to finish.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[broker] poll thread for [{}] panicked", self.doc_key);
            }
        }
    }
}

impl Drop for DocBrokerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The cooperative scheduler: drain events, then run periodic checks.
fn run_poll_loop(broker: &mut DocumentBroker, rx: &mpsc::Receiver<BrokerEvent>) {
    log::info!("[broker] poll loop started for docKey [{}]", broker.doc_key());
    loop {
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(event) => {
                if !broker.handle_event(event, Instant::now()) {
                    break;
                }
                // Drain whatever else queued up while we worked.
                let mut keep_going = true;
                while keep_going {
                    match rx.try_recv() {
                        Ok(event) => keep_going = broker.handle_event(event, Instant::now()),
                        Err(_) => break,
                    }
                }
                if !keep_going {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::warn!(
                    "[broker] event channel closed for docKey [{}]",
                    broker.doc_key()
                );
                break;
            }
        }

        if !broker.tick(Instant::now()) {
            break;
        }
    }
    log::info!(
        "[broker] poll loop finished for docKey [{}]: {}",
        broker.doc_key(),
        broker.close_reason()
    );
}

/// Bounded post-loop flush so in-flight upload outcomes still land.
fn flush_pending(broker: &mut DocumentBroker, rx: &mpsc::Receiver<BrokerEvent>) {
    let deadline = Instant::now() + FLUSH_TIMEOUT;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(event) => {
                broker.handle_event(event, Instant::now());
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_setup() -> (Arc<Config>, Arc<ProcessContext>) {
        let config = Arc::new(Config::default());
        let ctx = Arc::new(ProcessContext::new("test", "poll-tests"));
        (config, ctx)
    }

    #[test]
    fn test_spawn_and_stop() {
        let (config, ctx) = test_setup();
        let handle =
            DocBrokerHandle::spawn("https://h/wopi/files/poll1?access_token=t", config, ctx)
                .unwrap();
        assert_eq!(handle.doc_key(), "/wopi/files/poll1");
        handle.join();
    }

    #[test]
    fn test_callback_runs_on_broker_thread() {
        let (config, ctx) = test_setup();
        let handle =
            DocBrokerHandle::spawn("https://h/wopi/files/poll2?access_token=t", config, ctx)
                .unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        handle.add_callback(move |broker| {
            let _ = done_tx.send(broker.doc_key().to_string());
        });
        let doc_key = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(doc_key, "/wopi/files/poll2");
        handle.join();
    }

    #[test]
    fn test_close_document_event_stops_loop() {
        let (config, ctx) = test_setup();
        let handle =
            DocBrokerHandle::spawn("https://h/wopi/files/poll3?access_token=t", config, ctx)
                .unwrap();
        let tx = handle.sender();
        tx.send(BrokerEvent::close("test over")).unwrap();
        // The loop notices the close on its next tick and drains out.
        handle.join();
    }
}
