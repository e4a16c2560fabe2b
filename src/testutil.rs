//! Test-only transport fakes
//!
//! `ScriptedTransport` records outbound calls and lets the test script every
//! reply byte-for-byte; `AutoTransport` replies to every call immediately
//! with canned per-method results so higher layers can initialize.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::cdp::transport::{Transport, TransportEvent};
use crate::error::{Error, Result};

const WAIT_DEADLINE: Duration = Duration::from_secs(2);

/// Poll `predicate` until it holds or the deadline expires.
pub(crate) async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > WAIT_DEADLINE {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Transport whose replies are scripted one by one from the test body.
pub(crate) struct ScriptedTransport {
    // Slots are taken by `wait_for_call` so repeated methods match in order.
    sent: Mutex<Vec<Option<Value>>>,
    // Untouched copy of everything sent, for absence assertions.
    log: Mutex<Vec<Value>>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    fail: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
                inbound: tx,
                fail: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Every message sent so far, regardless of `wait_for_call` consumption.
    pub fn all_sent(&self) -> Vec<Value> {
        self.log.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self
            .inbound
            .send(TransportEvent::Message(text.to_string()));
    }

    pub fn push_event(&self, method: &str, params: Value, session_id: Option<&str>) {
        let mut msg = json!({ "method": method, "params": params });
        if let Some(session_id) = session_id {
            msg["sessionId"] = Value::String(session_id.to_string());
        }
        self.push_raw(&msg.to_string());
    }

    pub fn reply_ok(&self, id: u64, result: Value) {
        self.push_raw(&json!({ "id": id, "result": result }).to_string());
    }

    pub fn reply_err(&self, id: u64, code: i64, message: &str) {
        self.push_raw(
            &json!({ "id": id, "error": { "code": code, "message": message } }).to_string(),
        );
    }

    pub fn close_remote(&self, reason: Option<&str>) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed(reason.map(String::from)));
    }

    /// Await the next unconsumed outbound call with the given method.
    /// Returns its id and params.
    pub async fn wait_for_call(&self, method: &str) -> (u64, Value) {
        let start = Instant::now();
        loop {
            {
                let mut sent = self.sent.lock();
                let slot = sent.iter_mut().find(|slot| {
                    slot.as_ref()
                        .is_some_and(|v| v["method"].as_str() == Some(method))
                });
                if let Some(slot) = slot {
                    let msg = slot.take().expect("slot checked above");
                    let id = msg["id"].as_u64().expect("outbound calls carry ids");
                    return (id, msg["params"].clone());
                }
            }
            if start.elapsed() > WAIT_DEADLINE {
                panic!("timed out waiting for outbound call {}", method);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, text: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::transport("send failed (scripted)"));
        }
        let msg: Value = serde_json::from_str(text).expect("outbound messages are JSON");
        self.log.lock().push(msg.clone());
        self.sent.lock().push(Some(msg));
        Ok(())
    }

    fn close(&self) {}
}

/// Transport that replies to every call immediately with a canned result.
pub(crate) struct AutoTransport {
    results: Mutex<HashMap<String, Value>>,
    sent: Mutex<Vec<Value>>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl AutoTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                results: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                inbound: tx,
            }),
            rx,
        )
    }

    /// Set the canned result for calls with this method.
    pub fn set_result(&self, method: &str, result: Value) {
        self.results.lock().insert(method.to_string(), result);
    }

    pub fn push_event(&self, method: &str, params: Value, session_id: Option<&str>) {
        let mut msg = json!({ "method": method, "params": params });
        if let Some(session_id) = session_id {
            msg["sessionId"] = Value::String(session_id.to_string());
        }
        let _ = self.inbound.send(TransportEvent::Message(msg.to_string()));
    }

    /// Params of every recorded call with this method, in send order.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|v| v["method"].as_str() == Some(method))
            .map(|v| v["params"].clone())
            .collect()
    }

    pub fn has_call(&self, method: &str) -> bool {
        !self.calls(method).is_empty()
    }
}

impl Transport for AutoTransport {
    fn send(&self, text: &str) -> Result<()> {
        let msg: Value = serde_json::from_str(text).expect("outbound messages are JSON");
        if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
            let method = msg["method"].as_str().unwrap_or_default();
            let result = self
                .results
                .lock()
                .get(method)
                .cloned()
                .unwrap_or_else(|| json!({}));
            let _ = self
                .inbound
                .send(TransportEvent::Message(
                    json!({ "id": id, "result": result }).to_string(),
                ));
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    fn close(&self) {}
}
