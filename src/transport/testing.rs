//! Scripted in-process transport for controller and session tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use super::{HubTransport, TransportEvent, TransportEvents};
use crate::error::TransportError;

/// One recorded call into the fake.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Start(String),
    Send {
        method: String,
        arguments: Vec<Value>,
    },
    Invoke {
        method: String,
        arguments: Vec<Value>,
    },
    Stream {
        invocation_id: String,
        method: String,
        arguments: Vec<Value>,
    },
    Cancel(String),
    Stop,
}

/// Records every call and answers from per-operation result queues (empty
/// queue = success). Server-side events are injected with [`emit`](Self::emit).
#[derive(Default)]
pub(crate) struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    events: Mutex<Option<TransportEvents>>,
    send_results: Mutex<VecDeque<Result<(), TransportError>>>,
    invoke_results: Mutex<VecDeque<Result<Value, TransportError>>>,
    stream_results: Mutex<VecDeque<Result<(), TransportError>>>,
    cancel_results: Mutex<VecDeque<Result<(), TransportError>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an event as if the server produced it.
    pub(crate) fn emit(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("transport not started")
            .send(event)
            .expect("controller event loop gone");
    }

    pub(crate) fn started(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn next_send(&self, result: Result<(), TransportError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn next_invoke(&self, result: Result<Value, TransportError>) {
        self.invoke_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn next_stream(&self, result: Result<(), TransportError>) {
        self.stream_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn next_cancel(&self, result: Result<(), TransportError>) {
        self.cancel_results.lock().unwrap().push_back(result);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl HubTransport for FakeTransport {
    async fn start(&self, endpoint: Url, events: TransportEvents) {
        self.record(Call::Start(endpoint.to_string()));
        *self.events.lock().unwrap() = Some(events);
    }

    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), TransportError> {
        self.record(Call::Send {
            method: method.to_string(),
            arguments,
        });
        self.send_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, TransportError> {
        self.record(Call::Invoke {
            method: method.to_string(),
            arguments,
        });
        self.invoke_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }

    async fn stream(
        &self,
        invocation_id: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<(), TransportError> {
        self.record(Call::Stream {
            invocation_id: invocation_id.to_string(),
            method: method.to_string(),
            arguments,
        });
        self.stream_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn cancel_stream(&self, invocation_id: &str) -> Result<(), TransportError> {
        self.record(Call::Cancel(invocation_id.to_string()));
        self.cancel_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn stop(&self) {
        self.record(Call::Stop);
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Closed(None));
        }
    }
}
