//! Navigation synchronization
//!
//! A per-navigation coordinator. One navigation attempt is "done" when the
//! first of these happens: the new document reaches the requested lifecycle
//! milestones, the change turns out to be same-document, the frame is torn
//! out from under the navigation, or the caller's timeout elapses. The
//! losers of the race resolve into already-set cells as no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cdp::types::ResponseReceivedEvent;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameEvent, FrameManager};
use crate::sync::{Deferred, ListenerId};

/// Which lifecycle milestone ends the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The document and its resources finished loading.
    Load,
    /// The document was parsed.
    DomContentLoaded,
    /// No network connections for at least 500ms.
    NetworkIdle,
    /// At most two network connections for at least 500ms.
    NetworkAlmostIdle,
}

impl WaitUntil {
    fn event_name(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::DomContentLoaded => "DOMContentLoaded",
            Self::NetworkIdle => "networkIdle",
            Self::NetworkAlmostIdle => "networkAlmostIdle",
        }
    }
}

/// The document response a completed navigation produced.
#[derive(Debug, Clone)]
pub struct NavigationResponse {
    pub url: String,
    pub status: i64,
    pub status_text: String,
}

struct WatcherCore {
    frame: Arc<Frame>,
    expected: Vec<&'static str>,
    /// The load epoch the frame was in when the watcher was created.
    initial_loader_id: String,
    /// The epoch the navigate reply promised, once known.
    expected_loader_id: Mutex<Option<String>>,
    saw_same_document: AtomicBool,
    new_document: Deferred<()>,
    same_document: Deferred<()>,
    termination: Deferred<String>,
    /// Document responses (request id == loader id), keyed by loader id.
    responses: Mutex<HashMap<String, NavigationResponse>>,
}

impl WatcherCore {
    /// Re-evaluate completion after any signal about the watched frame.
    fn check(&self, frame_manager: &FrameManager) {
        if self.termination.is_set() {
            return;
        }
        if !lifecycle_complete(frame_manager, &self.frame, &self.expected) {
            return;
        }
        if self.saw_same_document.load(Ordering::SeqCst) {
            self.same_document.set(());
        }
        let loader_id = self.frame.loader_id();
        let arrived = match &*self.expected_loader_id.lock() {
            Some(expected) => loader_id == *expected,
            None => loader_id != self.initial_loader_id,
        };
        if arrived && loader_id != self.initial_loader_id {
            self.new_document.set(());
        }
    }
}

/// A frame and all of its descendants have reached every expected milestone.
fn lifecycle_complete(frame_manager: &FrameManager, frame: &Arc<Frame>, expected: &[&str]) -> bool {
    let reached = frame.lifecycle();
    if !expected.iter().all(|name| reached.contains(*name)) {
        return false;
    }
    frame_manager
        .child_frames(frame)
        .iter()
        .all(|child| lifecycle_complete(frame_manager, child, expected))
}

/// Watches one navigation attempt on one frame.
pub struct NavigatorWatcher {
    frame_manager: FrameManager,
    core: Arc<WatcherCore>,
    timeout: Duration,
    frame_listener: ListenerId,
    response_listener: ListenerId,
}

impl NavigatorWatcher {
    pub fn new(
        frame_manager: &FrameManager,
        frame: Arc<Frame>,
        wait_until: &[WaitUntil],
        timeout: Duration,
    ) -> Self {
        let expected: Vec<&'static str> = if wait_until.is_empty() {
            vec![WaitUntil::Load.event_name()]
        } else {
            wait_until.iter().map(|w| w.event_name()).collect()
        };

        let core = Arc::new(WatcherCore {
            initial_loader_id: frame.loader_id(),
            frame,
            expected,
            expected_loader_id: Mutex::new(None),
            saw_same_document: AtomicBool::new(false),
            new_document: Deferred::new(),
            same_document: Deferred::new(),
            termination: Deferred::new(),
            responses: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&core);
        let fm = frame_manager.clone();
        let frame_listener = frame_manager.on_event(move |event| {
            let Some(core) = Weak::upgrade(&weak) else {
                return;
            };
            match event {
                // Any frame's milestone can complete the tree-wide check.
                FrameEvent::Lifecycle { .. } => {
                    core.check(&fm);
                }
                FrameEvent::Navigated(frame) if Arc::ptr_eq(frame, &core.frame) => {
                    let loader_id = core.frame.loader_id();
                    let expected = core.expected_loader_id.lock().clone();
                    if let Some(expected) = expected {
                        if loader_id != expected && loader_id != core.initial_loader_id {
                            core.termination
                                .set("navigation aborted by a newer navigation".to_string());
                            return;
                        }
                    }
                    core.check(&fm);
                }
                FrameEvent::NavigatedWithinDocument(frame) if Arc::ptr_eq(frame, &core.frame) => {
                    core.saw_same_document.store(true, Ordering::SeqCst);
                    core.check(&fm);
                }
                FrameEvent::Detached(frame) if Arc::ptr_eq(frame, &core.frame) => {
                    core.termination
                        .set("navigating frame was detached".to_string());
                }
                _ => {}
            }
        });

        let weak = Arc::downgrade(&core);
        let response_listener =
            frame_manager
                .session()
                .subscribe("Network.responseReceived", move |event| {
                    let Some(core) = Weak::upgrade(&weak) else {
                        return Ok(());
                    };
                    if let Ok(ev) =
                        serde_json::from_value::<ResponseReceivedEvent>(event.params.clone())
                    {
                        // Document loads are the ones whose request id equals
                        // their loader id.
                        if !ev.loader_id.is_empty() && ev.request_id == ev.loader_id {
                            core.responses.lock().insert(
                                ev.loader_id,
                                NavigationResponse {
                                    url: ev.response.url,
                                    status: ev.response.status,
                                    status_text: ev.response.status_text,
                                },
                            );
                        }
                    }
                    Ok(())
                });

        Self {
            frame_manager: frame_manager.clone(),
            core,
            timeout,
            frame_listener,
            response_listener,
        }
    }

    /// Record which loader id the navigate reply promised. `None` means the
    /// browser did not open a new load epoch for this navigation.
    pub fn set_expected_loader(&self, loader_id: Option<String>) {
        *self.core.expected_loader_id.lock() = loader_id;
        self.core.check(&self.frame_manager);
    }

    /// Race the selected success future against termination and the timeout.
    ///
    /// Returns the document response for a completed new-document
    /// navigation (when one was observed), `None` for same-document
    /// navigations.
    pub async fn wait(&self, new_document: bool) -> Result<Option<NavigationResponse>> {
        let success = async {
            if new_document {
                self.core.new_document.wait().await
            } else {
                self.core.same_document.wait().await
            }
        };

        tokio::select! {
            biased;
            _ = success => {
                if new_document {
                    let loader_id = self.core.frame.loader_id();
                    Ok(self.core.responses.lock().get(&loader_id).cloned())
                } else {
                    Ok(None)
                }
            }
            reason = self.core.termination.wait() => Err(Error::Navigation(reason)),
            _ = tokio::time::sleep(self.timeout) => Err(Error::Timeout(format!(
                "Navigation did not complete within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

impl Drop for NavigatorWatcher {
    fn drop(&mut self) {
        self.frame_manager.remove_listener(self.frame_listener);
        self.frame_manager
            .session()
            .unsubscribe("Network.responseReceived", self.response_listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::connection::{Connection, Session};
    use crate::testutil::AutoTransport;
    use serde_json::{json, Value};

    const SESSION: &str = "S1";

    async fn page_manager() -> (Arc<AutoTransport>, FrameManager) {
        let (transport, rx) = AutoTransport::new();
        transport.set_result(
            "Page.getFrameTree",
            json!({ "frameTree": { "frame": { "id": "main", "loaderId": "L0", "url": "https://a.example" }, "childFrames": [] } }),
        );
        let conn = Connection::new(transport.clone(), rx);
        let session = Session::new(conn, SESSION.to_string(), "T1".to_string());
        let manager = FrameManager::new(session).await.unwrap();
        (transport, manager)
    }

    fn push(transport: &AutoTransport, method: &str, params: Value) {
        transport.push_event(method, params, Some(SESSION));
    }

    fn lifecycle(transport: &AutoTransport, frame: &str, loader: &str, name: &str) {
        push(
            transport,
            "Page.lifecycleEvent",
            json!({ "frameId": frame, "loaderId": loader, "name": name }),
        );
    }

    #[tokio::test]
    async fn same_document_navigation_resolves_with_null_response() {
        let (transport, manager) = page_manager().await;
        let main = manager.main_frame().unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            main,
            &[WaitUntil::Load],
            Duration::from_secs(2),
        );

        // The current document is already loaded; an anchor change arrives.
        lifecycle(&transport, "main", "L0", "load");
        watcher.set_expected_loader(None);
        push(
            &transport,
            "Page.navigatedWithinDocument",
            json!({ "frameId": "main", "url": "https://a.example#anchor" }),
        );

        let response = watcher.wait(false).await.unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn new_document_navigation_resolves_with_its_document_response() {
        let (transport, manager) = page_manager().await;
        let main = manager.main_frame().unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            main,
            &[WaitUntil::Load],
            Duration::from_secs(2),
        );
        watcher.set_expected_loader(Some("L1".to_string()));

        push(
            &transport,
            "Network.responseReceived",
            json!({
                "requestId": "L1",
                "loaderId": "L1",
                "response": { "url": "https://b.example/", "status": 200, "statusText": "OK" }
            }),
        );
        lifecycle(&transport, "main", "L1", "init");
        lifecycle(&transport, "main", "L1", "load");

        let response = watcher.wait(true).await.unwrap().expect("document response");
        assert_eq!(response.status, 200);
        assert_eq!(response.url, "https://b.example/");
    }

    #[tokio::test]
    async fn subresource_responses_are_not_navigation_responses() {
        let (transport, manager) = page_manager().await;
        let main = manager.main_frame().unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            main,
            &[WaitUntil::Load],
            Duration::from_secs(2),
        );
        watcher.set_expected_loader(Some("L1".to_string()));

        // A subresource shares the loader id but not the request id.
        push(
            &transport,
            "Network.responseReceived",
            json!({
                "requestId": "R77",
                "loaderId": "L1",
                "response": { "url": "https://b.example/app.js", "status": 200, "statusText": "OK" }
            }),
        );
        lifecycle(&transport, "main", "L1", "init");
        lifecycle(&transport, "main", "L1", "load");

        assert!(watcher.wait(true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timeout_wins_when_the_page_is_slower() {
        let (transport, manager) = page_manager().await;
        let main = manager.main_frame().unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            main,
            &[WaitUntil::Load],
            Duration::from_millis(50),
        );
        watcher.set_expected_loader(Some("L1".to_string()));

        let err = watcher.wait(true).await.unwrap_err();
        assert!(err.is_timeout());

        // The page finishing later resolves into the losing future harmlessly.
        lifecycle(&transport, "main", "L1", "init");
        lifecycle(&transport, "main", "L1", "load");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn frame_detach_terminates_the_wait() {
        let (transport, manager) = page_manager().await;
        push(
            &transport,
            "Page.frameAttached",
            json!({ "frameId": "A", "parentFrameId": "main" }),
        );
        crate::testutil::wait_until("child frame", || manager.frame("A").is_some()).await;

        let child = manager.frame("A").unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            child,
            &[WaitUntil::Load],
            Duration::from_secs(2),
        );
        watcher.set_expected_loader(Some("L5".to_string()));

        push(&transport, "Page.frameDetached", json!({ "frameId": "A" }));

        let err = watcher.wait(true).await.unwrap_err();
        match err {
            Error::Navigation(reason) => assert!(reason.contains("detached")),
            other => panic!("expected Navigation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn a_newer_navigation_aborts_the_watched_one() {
        let (transport, manager) = page_manager().await;
        push(
            &transport,
            "Page.frameAttached",
            json!({ "frameId": "A", "parentFrameId": "main" }),
        );
        crate::testutil::wait_until("child frame", || manager.frame("A").is_some()).await;

        let child = manager.frame("A").unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            child,
            &[WaitUntil::Load],
            Duration::from_secs(2),
        );
        watcher.set_expected_loader(Some("L5".to_string()));

        // The frame commits a different load epoch instead.
        push(
            &transport,
            "Page.frameNavigated",
            json!({ "frame": { "id": "A", "parentId": "main", "loaderId": "L9", "url": "https://elsewhere.example" } }),
        );

        let err = watcher.wait(true).await.unwrap_err();
        match err {
            Error::Navigation(reason) => assert!(reason.contains("newer navigation")),
            other => panic!("expected Navigation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn child_frames_gate_lifecycle_completion() {
        let (transport, manager) = page_manager().await;
        // A child is already part of the tree when the navigation starts.
        push(
            &transport,
            "Page.frameAttached",
            json!({ "frameId": "A", "parentFrameId": "main" }),
        );
        crate::testutil::wait_until("child frame", || manager.frame("A").is_some()).await;

        let main = manager.main_frame().unwrap();
        let watcher = NavigatorWatcher::new(
            &manager,
            Arc::clone(&main),
            &[WaitUntil::Load],
            Duration::from_secs(2),
        );
        watcher.set_expected_loader(Some("L1".to_string()));

        lifecycle(&transport, "main", "L1", "init");
        lifecycle(&transport, "main", "L1", "load");
        tokio::time::sleep(Duration::from_millis(30)).await;
        // The main frame alone is loaded; the tree is not.
        assert!(!watcher.core.new_document.is_set());

        lifecycle(&transport, "A", "LA", "load");
        let response = watcher.wait(true).await.unwrap();
        assert!(response.is_none());
    }
}
