//! CDP Connection and Session
//!
//! Owns the transport, assigns message ids, correlates replies to pending
//! calls, and fans identifier-less messages out to notification subscribers.
//! A [`Session`] is a sessionId-tagged sub-channel of one connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::transport::{Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::sync::{ListenerId, Listeners};

/// A protocol notification (a message without an id).
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub method: String,
    pub params: Value,
    /// Session the browser addressed this event to; `None` for browser-level events.
    pub session_id: Option<String>,
}

/// Handler invoked from the dispatch path. Returning `Err` is fatal and
/// closes the whole connection: the shared maps can no longer be trusted
/// once a handler has failed partway through.
pub type EventHandler = Arc<dyn Fn(&ProtocolEvent) -> Result<()> + Send + Sync>;

/// One in-flight call: resolved exactly once, then removed from the map.
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    next_listener_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(ListenerId, EventHandler)>>>,
    disconnect: Listeners<String>,
}

/// A CDP connection to one browser
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a transport and start dispatching its inbound stream.
    ///
    /// The receiver is drained by a single dispatcher task, so inbound
    /// messages are processed strictly in receipt order: a notification
    /// that precedes a reply on the wire is fully fanned out before that
    /// reply resolves its pending call.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            next_listener_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            disconnect: Listeners::new(),
        });

        let connection = Self { inner };
        let dispatcher = connection.clone();
        tokio::spawn(async move { dispatcher.run_dispatch(events).await });
        connection
    }

    /// Send a call and await its correlated reply.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let result = self
            .call_raw(None, method, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a call tagged with a session id and await its reply.
    pub async fn call_session<P, R>(&self, session_id: &str, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let result = self
            .call_raw(Some(session_id), method, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub(crate) async fn call_raw(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::target_closed(method, self.close_reason()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = Value::String(session_id.to_string());
        }
        let text = serde_json::to_string(&msg)?;

        // A failed send resolves the call with that error directly; the
        // pending entry must not stay behind to be failed a second time.
        if let Err(e) = self.inner.transport.send(&text) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        tracing::trace!(method, id, session = ?session_id, "sent protocol call");

        match rx.await {
            Ok(result) => result,
            // The sender is dropped only when close() drained the map first,
            // so this arm is a close that raced the insert.
            Err(_) => Err(Error::target_closed(method, self.close_reason())),
        }
    }

    /// Fire-and-forget send: a fresh id, no pending entry, no reply await.
    ///
    /// This is the only send primitive dispatch-path handlers may use;
    /// awaiting a reply from inside the dispatcher would deadlock it.
    pub fn send_forget(&self, session_id: Option<&str>, method: &str, params: Value) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::target_closed(method, self.close_reason()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = Value::String(session_id.to_string());
        }
        let text = serde_json::to_string(&msg)?;
        self.inner.transport.send(&text)?;
        tracing::trace!(method, id, session = ?session_id, "sent fire-and-forget call");
        Ok(())
    }

    /// Subscribe to notifications with the given method name.
    pub fn subscribe(
        &self,
        method: &str,
        handler: impl Fn(&ProtocolEvent) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .entry(method.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. After this returns the handler is never invoked again.
    pub fn unsubscribe(&self, method: &str, id: ListenerId) {
        let mut subscribers = self.inner.subscribers.lock();
        if let Some(handlers) = subscribers.get_mut(method) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                subscribers.remove(method);
            }
        }
    }

    /// Register a handler for connection teardown; receives the close reason.
    pub fn on_disconnect(&self, handler: impl Fn(&String) + Send + Sync + 'static) -> ListenerId {
        self.inner.disconnect.add(handler)
    }

    pub fn remove_disconnect_listener(&self, id: ListenerId) {
        self.inner.disconnect.remove(id);
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn close_reason(&self) -> String {
        self.inner
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection closed".to_string())
    }

    /// Close the connection. Idempotent and terminal: the first caller stops
    /// the transport, fails every outstanding call with a closed-target
    /// error carrying `reason`, and notifies disconnect listeners.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.close_reason.lock() = Some(reason.to_string());
        tracing::debug!(reason, "closing connection");

        self.inner.transport.close();

        let drained: Vec<PendingCall> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            let _ = call
                .tx
                .send(Err(Error::target_closed(&call.method, reason)));
        }

        self.inner.disconnect.emit(&reason.to_string());
    }

    async fn run_dispatch(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(text) => {
                    if let Err(e) = self.process_message(&text) {
                        tracing::error!(error = %e, "fatal error in notification handler");
                        self.close(&format!("error processing protocol message: {}", e));
                        break;
                    }
                }
                TransportEvent::Closed(reason) => {
                    self.close(reason.as_deref().unwrap_or("transport closed"));
                    break;
                }
            }
        }
        if !self.is_closed() {
            self.close("transport closed");
        }
    }

    fn process_message(&self, text: &str) -> Result<()> {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                // Malformed payloads are dropped; they do not close the connection.
                tracing::warn!(error = %e, "failed to parse protocol message, dropping");
                return Ok(());
            }
        };

        if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
            let call = self.inner.pending.lock().remove(&id);
            let Some(call) = call else {
                tracing::trace!(id, "reply for unknown id");
                return Ok(());
            };

            let result = if let Some(error) = msg.get("error") {
                Err(Error::protocol(
                    &call.method,
                    error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
                    error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown"),
                ))
            } else {
                Ok(msg.get("result").cloned().unwrap_or_else(|| json!({})))
            };
            let _ = call.tx.send(result);
            return Ok(());
        }

        let Some(method) = msg.get("method").and_then(|m| m.as_str()) else {
            tracing::warn!("protocol message with neither id nor method, dropping");
            return Ok(());
        };

        let event = ProtocolEvent {
            method: method.to_string(),
            params: msg.get("params").cloned().unwrap_or_else(|| json!({})),
            session_id: msg
                .get("sessionId")
                .and_then(|s| s.as_str())
                .map(String::from),
        };
        tracing::trace!(method, session = ?event.session_id, "dispatching notification");

        // Snapshot so handlers may subscribe/unsubscribe while we iterate.
        let handlers: Vec<EventHandler> = self
            .inner
            .subscribers
            .lock()
            .get(method)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(&event)?;
        }
        Ok(())
    }
}

/// A CDP session attached to a specific target
#[derive(Clone)]
pub struct Session {
    connection: Connection,
    id: String,
    target_id: String,
}

impl Session {
    pub(crate) fn new(connection: Connection, id: String, target_id: String) -> Self {
        Self {
            connection,
            id,
            target_id,
        }
    }

    /// Get the session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// The connection this session forwards through
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Send a call scoped to this session and await its reply
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.connection.call_session(&self.id, method, params).await
    }

    /// Fire-and-forget send scoped to this session
    pub fn send_forget(&self, method: &str, params: Value) -> Result<()> {
        self.connection.send_forget(Some(&self.id), method, params)
    }

    /// Subscribe to notifications addressed to this session.
    pub fn subscribe(
        &self,
        method: &str,
        handler: impl Fn(&ProtocolEvent) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let session_id = self.id.clone();
        self.connection.subscribe(method, move |event| {
            if event.session_id.as_deref() == Some(session_id.as_str()) {
                handler(event)
            } else {
                Ok(())
            }
        })
    }

    /// Remove a subscription created through this session.
    pub fn unsubscribe(&self, method: &str, id: ListenerId) {
        self.connection.unsubscribe(method, id);
    }

    /// Detach this session from its target.
    pub async fn detach(&self) -> Result<()> {
        let _: Value = self
            .connection
            .call(
                "Target.detachFromTarget",
                &json!({ "sessionId": self.id }),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn calls_receive_their_own_replies_out_of_order() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        let c1 = conn.clone();
        let first =
            tokio::spawn(
                async move { c1.call_raw(None, "Browser.getVersion", json!({})).await },
            );
        let (id1, _) = transport.wait_for_call("Browser.getVersion").await;

        let c2 = conn.clone();
        let second =
            tokio::spawn(async move { c2.call_raw(None, "Target.getTargets", json!({})).await });
        let (id2, _) = transport.wait_for_call("Target.getTargets").await;

        // Replies arrive in reverse order.
        transport.reply_ok(id2, json!({ "which": "second" }));
        transport.reply_ok(id1, json!({ "which": "first" }));

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first["which"], "first");
        assert_eq!(second["which"], "second");
    }

    #[tokio::test]
    async fn close_fails_all_pending_calls_with_reason() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        let c1 = conn.clone();
        let pending =
            tokio::spawn(async move { c1.call_raw(None, "Page.navigate", json!({})).await });
        transport.wait_for_call("Page.navigate").await;

        conn.close("browser went away");

        let err = pending.await.unwrap().unwrap_err();
        match err {
            Error::TargetClosed { method, reason } => {
                assert_eq!(method, "Page.navigate");
                assert_eq!(reason, "browser went away");
            }
            other => panic!("expected TargetClosed, got {:?}", other),
        }

        // Closed connections refuse new calls outright.
        let err = conn
            .call_raw(None, "Page.reload", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetClosed { .. }));
    }

    #[tokio::test]
    async fn notification_is_dispatched_before_reply_resolves() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let seen = Arc::clone(&order);
        conn.subscribe("Target.targetCreated", move |event| {
            assert_eq!(event.params["targetInfo"]["targetId"], "T1");
            seen.lock().push("notification");
            Ok(())
        });

        let c1 = conn.clone();
        let call = tokio::spawn(async move {
            c1.call_raw(None, "Target.setDiscoverTargets", json!({ "discover": true }))
                .await
        });
        let (id, _) = transport.wait_for_call("Target.setDiscoverTargets").await;

        // The notification precedes the reply in the byte stream.
        transport.push_event(
            "Target.targetCreated",
            json!({ "targetInfo": { "targetId": "T1", "type": "page", "url": "", "title": "" } }),
            None,
        );
        transport.reply_ok(id, json!({}));

        call.await.unwrap().unwrap();
        order.lock().push("reply");
        assert_eq!(*order.lock(), vec!["notification", "reply"]);
    }

    #[tokio::test]
    async fn protocol_error_reply_surfaces_to_its_caller_only() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        let c1 = conn.clone();
        let call =
            tokio::spawn(async move { c1.call_raw(None, "Page.navigate", json!({})).await });
        let (id, _) = transport.wait_for_call("Page.navigate").await;
        transport.reply_err(id, -32000, "Cannot navigate to invalid URL");

        let err = call.await.unwrap().unwrap_err();
        match err {
            Error::Protocol {
                method,
                code,
                message,
            } => {
                assert_eq!(method, "Page.navigate");
                assert_eq!(code, -32000);
                assert!(message.contains("invalid URL"));
            }
            other => panic!("expected Protocol, got {:?}", other),
        }
        // The connection itself stays usable.
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_closing() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        transport.push_raw("{not json");
        transport.push_raw("[1, 2, 3]");

        let c1 = conn.clone();
        let call =
            tokio::spawn(async move { c1.call_raw(None, "Browser.getVersion", json!({})).await });
        let (id, _) = transport.wait_for_call("Browser.getVersion").await;
        transport.reply_ok(id, json!({ "product": "Chrome" }));

        assert_eq!(call.await.unwrap().unwrap()["product"], "Chrome");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn failed_send_resolves_the_call_without_a_pending_entry() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        transport.fail_sends(true);
        let err = conn
            .call_raw(None, "Page.enable", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));

        // A stray reply for the failed call's id is ignored harmlessly.
        transport.reply_ok(1, json!({}));
        transport.fail_sends(false);

        let c1 = conn.clone();
        let call =
            tokio::spawn(async move { c1.call_raw(None, "Page.enable", json!({})).await });
        let (id, _) = transport.wait_for_call("Page.enable").await;
        transport.reply_ok(id, json!({}));
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transport_closure_fails_pending_with_its_reason() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        let c1 = conn.clone();
        let pending =
            tokio::spawn(async move { c1.call_raw(None, "Page.navigate", json!({})).await });
        transport.wait_for_call("Page.navigate").await;

        transport.close_remote(Some("socket reset"));

        let err = pending.await.unwrap().unwrap_err();
        match err {
            Error::TargetClosed { reason, .. } => assert_eq!(reason, "socket reset"),
            other => panic!("expected TargetClosed, got {:?}", other),
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn handler_error_closes_the_connection() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);

        conn.subscribe("Target.attachedToTarget", |_| {
            Err(Error::invariant("parent session missing"))
        });
        transport.push_event("Target.attachedToTarget", json!({}), None);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should close after handler failure");
    }

    #[tokio::test]
    async fn session_subscriptions_only_see_their_own_events() {
        let (transport, rx) = ScriptedTransport::new();
        let conn = Connection::new(transport.clone(), rx);
        let session = Session::new(conn.clone(), "S1".to_string(), "T1".to_string());

        let hits = Arc::new(Mutex::new(0u32));
        let h = Arc::clone(&hits);
        session.subscribe("Page.lifecycleEvent", move |_| {
            *h.lock() += 1;
            Ok(())
        });

        transport.push_event("Page.lifecycleEvent", json!({}), Some("S2"));
        transport.push_event("Page.lifecycleEvent", json!({}), Some("S1"));
        transport.push_event("Page.lifecycleEvent", json!({}), None);

        // Drain the dispatcher.
        let c1 = conn.clone();
        let call =
            tokio::spawn(async move { c1.call_raw(None, "Browser.getVersion", json!({})).await });
        let (id, _) = transport.wait_for_call("Browser.getVersion").await;
        transport.reply_ok(id, json!({}));
        call.await.unwrap().unwrap();

        assert_eq!(*hits.lock(), 1);
    }
}
