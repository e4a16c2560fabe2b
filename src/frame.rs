//! Frame tree and execution contexts
//!
//! Maintains a consistent frame tree and execution-context index for one
//! page session while attach/navigate/detach notifications arrive in
//! arbitrary relative order, and contexts come and go independently of
//! frame events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::cdp::connection::{ProtocolEvent, Session};
use crate::cdp::types::{
    ExecutionContextCreatedEvent, ExecutionContextDestroyedEvent, FrameAttachedEvent,
    FrameDetachedEvent, FrameNavigatedEvent, FramePayload, FrameTree, LifecycleEventEvent,
    NavigatedWithinDocumentEvent, PageEnable, PageGetFrameTree, PageGetFrameTreeResult,
    PageSetLifecycleEventsEnabled, RuntimeEnable,
};
use crate::error::Result;
use crate::sync::{ListenerId, Listeners};

struct FrameState {
    id: String,
    parent_id: Option<String>,
    url: String,
    name: Option<String>,
    loader_id: String,
    child_ids: Vec<String>,
    lifecycle: HashSet<String>,
    detached: bool,
}

/// One frame in the tree.
///
/// Frames are shared handles: the main frame keeps its object identity
/// across cross-process navigations (its id is rewritten in place), so a
/// held reference keeps working after the swap.
pub struct Frame {
    state: Mutex<FrameState>,
    /// Current default-world execution context, when one exists.
    context: watch::Sender<Option<u64>>,
}

impl Frame {
    fn new(id: String, parent_id: Option<String>) -> Self {
        let (context, _) = watch::channel(None);
        Self {
            state: Mutex::new(FrameState {
                id,
                parent_id,
                url: String::new(),
                name: None,
                loader_id: String::new(),
                child_ids: Vec::new(),
                lifecycle: HashSet::new(),
                detached: false,
            }),
            context,
        }
    }

    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.state.lock().parent_id.clone()
    }

    pub fn url(&self) -> String {
        self.state.lock().url.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.state.lock().name.clone()
    }

    /// The current document-load epoch.
    pub fn loader_id(&self) -> String {
        self.state.lock().loader_id.clone()
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Lifecycle milestones reached by the current document.
    pub fn lifecycle(&self) -> HashSet<String> {
        self.state.lock().lifecycle.clone()
    }

    /// Id of the frame's default-world execution context, if one is live.
    pub fn execution_context_id(&self) -> Option<u64> {
        *self.context.borrow()
    }

    /// Suspend until the frame has a default-world context. Returns `None`
    /// if the frame detaches first.
    pub async fn wait_for_execution_context(&self) -> Option<u64> {
        let mut rx = self.context.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(id) = *current {
                    return Some(id);
                }
            }
            if self.is_detached() {
                return None;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Frame")
            .field("id", &state.id)
            .field("url", &state.url)
            .field("loader_id", &state.loader_id)
            .field("children", &state.child_ids.len())
            .field("detached", &state.detached)
            .finish()
    }
}

/// An isolated JavaScript global scope within a frame or worker realm.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: u64,
    /// `None` for worker realms.
    pub frame_id: Option<String>,
    pub is_default: bool,
    pub name: String,
    pub origin: String,
}

/// Frame lifecycle events emitted to subscribers.
#[derive(Clone)]
pub enum FrameEvent {
    Attached(Arc<Frame>),
    Detached(Arc<Frame>),
    Navigated(Arc<Frame>),
    NavigatedWithinDocument(Arc<Frame>),
    Lifecycle {
        frame: Arc<Frame>,
        loader_id: String,
        name: String,
    },
}

struct FrameManagerInner {
    session: Session,
    frames: Mutex<HashMap<String, Arc<Frame>>>,
    main_frame: Mutex<Option<Arc<Frame>>>,
    contexts: Mutex<HashMap<u64, ExecutionContext>>,
    listeners: Listeners<FrameEvent>,
    subscriptions: Mutex<Vec<(&'static str, ListenerId)>>,
}

/// Tracks the frame tree and execution contexts of one page session.
#[derive(Clone)]
pub struct FrameManager {
    inner: Arc<FrameManagerInner>,
}

impl FrameManager {
    /// Install handlers, enable the Page and Runtime domains, and seed the
    /// tree from the browser's current view.
    pub async fn new(session: Session) -> Result<Self> {
        let inner = Arc::new(FrameManagerInner {
            session: session.clone(),
            frames: Mutex::new(HashMap::new()),
            main_frame: Mutex::new(None),
            contexts: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
            subscriptions: Mutex::new(Vec::new()),
        });
        let manager = Self { inner };

        manager.install_handler("Page.frameAttached", Self::on_frame_attached);
        manager.install_handler("Page.frameNavigated", Self::on_frame_navigated);
        manager.install_handler("Page.frameDetached", Self::on_frame_detached);
        manager.install_handler(
            "Page.navigatedWithinDocument",
            Self::on_navigated_within_document,
        );
        manager.install_handler("Page.lifecycleEvent", Self::on_lifecycle_event);
        manager.install_handler(
            "Runtime.executionContextCreated",
            Self::on_execution_context_created,
        );
        manager.install_handler(
            "Runtime.executionContextDestroyed",
            Self::on_execution_context_destroyed,
        );
        manager.install_handler(
            "Runtime.executionContextsCleared",
            Self::on_execution_contexts_cleared,
        );

        let _: Value = session.call("Page.enable", &PageEnable {}).await?;
        let tree: PageGetFrameTreeResult =
            session.call("Page.getFrameTree", &PageGetFrameTree {}).await?;
        manager.handle_frame_tree(&tree.frame_tree);
        let _: Value = session
            .call(
                "Page.setLifecycleEventsEnabled",
                &PageSetLifecycleEventsEnabled { enabled: true },
            )
            .await?;
        let _: Value = session.call("Runtime.enable", &RuntimeEnable {}).await?;

        Ok(manager)
    }

    fn install_handler(
        &self,
        method: &'static str,
        handler: fn(&Self, &ProtocolEvent) -> Result<()>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.session.subscribe(method, move |event| {
            match Weak::upgrade(&weak) {
                Some(inner) => handler(&Self { inner }, event),
                None => Ok(()),
            }
        });
        self.inner.subscriptions.lock().push((method, id));
    }

    fn handle_frame_tree(&self, tree: &FrameTree) {
        if let Some(parent_id) = &tree.frame.parent_id {
            self.attach_frame(&tree.frame.id, parent_id);
        }
        self.navigate_frame(&tree.frame);
        for child in &tree.child_frames {
            self.handle_frame_tree(child);
        }
    }

    fn on_frame_attached(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: FrameAttachedEvent = serde_json::from_value(event.params.clone())?;
        self.attach_frame(&ev.frame_id, &ev.parent_frame_id);
        Ok(())
    }

    fn attach_frame(&self, frame_id: &str, parent_id: &str) {
        let frame = {
            let mut frames = self.inner.frames.lock();
            // Only a new child under a known parent creates a frame.
            if frames.contains_key(frame_id) || !frames.contains_key(parent_id) {
                return;
            }
            let frame = Arc::new(Frame::new(
                frame_id.to_string(),
                Some(parent_id.to_string()),
            ));
            frames.insert(frame_id.to_string(), Arc::clone(&frame));
            if let Some(parent) = frames.get(parent_id) {
                parent.state.lock().child_ids.push(frame_id.to_string());
            }
            frame
        };
        self.inner.listeners.emit(&FrameEvent::Attached(frame));
    }

    fn on_frame_navigated(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: FrameNavigatedEvent = serde_json::from_value(event.params.clone())?;
        self.navigate_frame(&ev.frame);
        Ok(())
    }

    fn navigate_frame(&self, payload: &FramePayload) {
        let is_main = payload.parent_id.is_none();
        let mut detached = Vec::new();

        let frame = {
            let mut frames = self.inner.frames.lock();
            let existing = frames.get(&payload.id).cloned().or_else(|| {
                if is_main {
                    self.inner.main_frame.lock().clone()
                } else {
                    None
                }
            });

            if existing.is_none() && !is_main {
                tracing::error!(frame_id = %payload.id, "navigation event for unknown frame");
                return;
            }

            // A frame never navigates while still owning stale children.
            if let Some(frame) = &existing {
                Self::detach_children(&mut frames, frame, &mut detached);
            }

            let frame = match existing {
                Some(frame) => {
                    let old_id = frame.id();
                    if is_main && old_id != payload.id {
                        // Cross-process main-frame swap: identity preserved,
                        // id rewritten, map entry re-keyed.
                        frames.remove(&old_id);
                        frame.state.lock().id = payload.id.clone();
                        frames.insert(payload.id.clone(), Arc::clone(&frame));
                    }
                    frame
                }
                None => {
                    let frame = Arc::new(Frame::new(payload.id.clone(), None));
                    frames.insert(payload.id.clone(), Arc::clone(&frame));
                    frame
                }
            };

            {
                let mut state = frame.state.lock();
                state.url = payload.url.clone();
                state.name = payload.name.clone();
                if !payload.loader_id.is_empty() {
                    state.loader_id = payload.loader_id.clone();
                }
            }
            if is_main {
                *self.inner.main_frame.lock() = Some(Arc::clone(&frame));
            }
            frame
        };

        for gone in detached {
            self.inner.listeners.emit(&FrameEvent::Detached(gone));
        }
        self.inner.listeners.emit(&FrameEvent::Navigated(frame));
    }

    /// Detach every descendant of `frame` depth-first, children of a child
    /// before the child itself. Pushes detached frames onto `out` in
    /// emission order.
    fn detach_children(
        frames: &mut HashMap<String, Arc<Frame>>,
        frame: &Arc<Frame>,
        out: &mut Vec<Arc<Frame>>,
    ) {
        let child_ids: Vec<String> = frame.state.lock().child_ids.drain(..).collect();
        for child_id in child_ids {
            if let Some(child) = frames.get(&child_id).cloned() {
                Self::detach_children(frames, &child, out);
                child.state.lock().detached = true;
                frames.remove(&child_id);
                // Wake context waiters so they observe the detach.
                child.context.send_replace(None);
                out.push(child);
            }
        }
    }

    fn on_frame_detached(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: FrameDetachedEvent = serde_json::from_value(event.params.clone())?;
        let mut detached = Vec::new();
        {
            let mut frames = self.inner.frames.lock();
            let Some(frame) = frames.get(&ev.frame_id).cloned() else {
                return Ok(());
            };
            Self::detach_children(&mut frames, &frame, &mut detached);
            if let Some(parent_id) = frame.state.lock().parent_id.clone() {
                if let Some(parent) = frames.get(&parent_id) {
                    parent
                        .state
                        .lock()
                        .child_ids
                        .retain(|child| child != &ev.frame_id);
                }
            }
            frame.state.lock().detached = true;
            frames.remove(&ev.frame_id);
            frame.context.send_replace(None);
            detached.push(frame);
        }
        for gone in detached {
            self.inner.listeners.emit(&FrameEvent::Detached(gone));
        }
        Ok(())
    }

    fn on_navigated_within_document(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: NavigatedWithinDocumentEvent = serde_json::from_value(event.params.clone())?;
        let frame = self.inner.frames.lock().get(&ev.frame_id).cloned();
        let Some(frame) = frame else {
            tracing::error!(frame_id = %ev.frame_id, "same-document navigation for unknown frame");
            return Ok(());
        };
        frame.state.lock().url = ev.url;
        self.inner
            .listeners
            .emit(&FrameEvent::NavigatedWithinDocument(Arc::clone(&frame)));
        self.inner.listeners.emit(&FrameEvent::Navigated(frame));
        Ok(())
    }

    fn on_lifecycle_event(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: LifecycleEventEvent = serde_json::from_value(event.params.clone())?;
        let frame = self.inner.frames.lock().get(&ev.frame_id).cloned();
        let Some(frame) = frame else {
            return Ok(());
        };
        {
            let mut state = frame.state.lock();
            // "init" opens a new document-load epoch.
            if ev.name == "init" {
                state.loader_id = ev.loader_id.clone();
                state.lifecycle.clear();
            }
            state.lifecycle.insert(ev.name.clone());
        }
        self.inner.listeners.emit(&FrameEvent::Lifecycle {
            frame,
            loader_id: ev.loader_id,
            name: ev.name,
        });
        Ok(())
    }

    fn on_execution_context_created(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: ExecutionContextCreatedEvent = serde_json::from_value(event.params.clone())?;
        let description = ev.context;
        let context = ExecutionContext {
            id: description.id,
            frame_id: description.aux_data.frame_id.clone(),
            is_default: description.aux_data.is_default,
            name: description.name,
            origin: description.origin,
        };
        self.inner.contexts.lock().insert(context.id, context.clone());

        // Only a frame's default world becomes "the" context for the frame.
        if context.is_default {
            if let Some(frame_id) = &context.frame_id {
                if let Some(frame) = self.inner.frames.lock().get(frame_id).cloned() {
                    frame.context.send_replace(Some(context.id));
                }
            }
        }
        Ok(())
    }

    fn on_execution_context_destroyed(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: ExecutionContextDestroyedEvent = serde_json::from_value(event.params.clone())?;
        self.remove_context(ev.execution_context_id, true);
        Ok(())
    }

    fn on_execution_contexts_cleared(&self, _event: &ProtocolEvent) -> Result<()> {
        let ids: Vec<u64> = self.inner.contexts.lock().keys().copied().collect();
        for id in ids {
            self.remove_context(id, false);
        }
        Ok(())
    }

    /// The one removal path for contexts, individual or bulk, so a frame is
    /// never left pointing at a dead context.
    fn remove_context(&self, id: u64, warn_unknown: bool) {
        let context = self.inner.contexts.lock().remove(&id);
        let Some(context) = context else {
            if warn_unknown {
                // Signals a notification that arrived out of causal order.
                tracing::error!(context_id = id, "destroy for unknown execution context");
            }
            return;
        };
        if context.is_default {
            if let Some(frame_id) = &context.frame_id {
                if let Some(frame) = self.inner.frames.lock().get(frame_id).cloned() {
                    frame.context.send_if_modified(|current| {
                        if *current == Some(id) {
                            *current = None;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
    }

    /// The session this manager instruments.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// The top frame of the page, once known.
    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        self.inner.main_frame.lock().clone()
    }

    /// Frame by id.
    pub fn frame(&self, frame_id: &str) -> Option<Arc<Frame>> {
        self.inner.frames.lock().get(frame_id).cloned()
    }

    /// Every frame reachable from the tree, in no particular order.
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.inner.frames.lock().values().cloned().collect()
    }

    /// Live child frames of `frame`.
    pub fn child_frames(&self, frame: &Frame) -> Vec<Arc<Frame>> {
        // Map lock before frame lock, matching the mutation paths.
        let frames = self.inner.frames.lock();
        let child_ids = frame.state.lock().child_ids.clone();
        child_ids
            .iter()
            .filter_map(|id| frames.get(id).cloned())
            .collect()
    }

    /// The current default-world execution context for `frame`.
    pub fn execution_context(&self, frame: &Frame) -> Option<ExecutionContext> {
        let id = frame.execution_context_id()?;
        self.inner.contexts.lock().get(&id).cloned()
    }

    /// Subscribe to frame lifecycle events.
    pub fn on_event(&self, handler: impl Fn(&FrameEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.add(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    /// Detach the manager's handlers from the session.
    pub fn dispose(&self) {
        for (method, id) in self.inner.subscriptions.lock().drain(..) {
            self.inner.session.unsubscribe(method, id);
        }
    }
}
