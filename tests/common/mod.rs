#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

use file_uploader::uploader::{ProgressCallback, Transport, UploadPayload};
use file_uploader::{UploadError, UploadResult};

/// Answers immediately. Files fail for as many attempts as scripted, then succeed.
#[derive(Default)]
pub struct ScriptedTransport {
    failures: Mutex<HashMap<String, VecDeque<()>>>,
    always_fail: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_times(&self, file_name: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(file_name.to_string(), std::iter::repeat(()).take(times).collect());
    }

    pub fn always_fail(&self, file_name: &str) {
        self.always_fail.lock().unwrap().push(file_name.to_string());
    }

    pub fn attempts(&self, file_name: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        payload: Arc<UploadPayload>,
        on_progress: ProgressCallback,
    ) -> UploadResult<Value> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(payload.file_name.clone()).or_insert(0);
            *count += 1;
            *count
        };

        on_progress(payload.len(), payload.len());

        let scripted_failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&payload.file_name)
            .and_then(VecDeque::pop_front)
            .is_some();
        let always = self
            .always_fail
            .lock()
            .unwrap()
            .contains(&payload.file_name);

        if scripted_failure || always {
            return Err(UploadError::Http {
                status: 503,
                body: format!("{} unavailable", payload.file_name),
            });
        }

        Ok(json!({ "name": payload.file_name, "attempt": attempt, "size": payload.len() }))
    }
}

/// One request waiting for the test to decide its outcome.
pub struct Call {
    pub file_name: String,
    pub data: Arc<Vec<u8>>,
    reply: oneshot::Sender<UploadResult<Value>>,
}

impl Call {
    pub fn succeed(self, response: Value) {
        let _ = self.reply.send(Ok(response));
    }

    pub fn fail(self, reason: &str) {
        let _ = self.reply.send(Err(UploadError::Http {
            status: 500,
            body: reason.to_string(),
        }));
    }

    /// True once the request future has been dropped, e.g. by an abort.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Holds every request open until the test answers it.
pub struct ControlledTransport {
    calls: mpsc::UnboundedSender<Call>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ControlledTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                calls,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ControlledTransport {
    async fn send(
        &self,
        payload: Arc<UploadPayload>,
        _on_progress: ProgressCallback,
    ) -> UploadResult<Value> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (reply, rx) = oneshot::channel();
        let _ = self.calls.send(Call {
            file_name: payload.file_name.clone(),
            data: Arc::clone(&payload.data),
            reply,
        });

        rx.await.unwrap_or(Err(UploadError::Aborted))
    }
}

/// Records events from any emitter and lets tests wait for one to show up.
pub struct EventLog<E> {
    events: Arc<Mutex<Vec<E>>>,
    notify: Arc<Notify>,
}

impl<E: Clone + Send + 'static> EventLog<E> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn listener(&self) -> impl Fn(&E) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        let notify = Arc::clone(&self.notify);
        move |event: &E| {
            events.lock().unwrap().push(event.clone());
            notify.notify_one();
        }
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&E) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub async fn wait_for(&self, pred: impl Fn(&E) -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let found = self.events.lock().unwrap().iter().any(&pred);
                if found {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for event");
    }
}
