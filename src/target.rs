//! Target discovery and session attachment
//!
//! Turns the browser's raw notion of "targets" into a view the rest of the
//! driver can rely on without races: a discovery snapshot that fixes the set
//! of targets required before initialization is complete, the auto-attach
//! handshake for every new target, and the session tree.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::cdp::connection::{Connection, ProtocolEvent, Session};
use crate::cdp::types::{
    AttachedToTargetEvent, DetachedFromTargetEvent, TargetCreatedEvent, TargetDestroyedEvent,
    TargetInfo, TargetInfoChangedEvent, TargetSetAutoAttach, TargetSetDiscoverTargets,
};
use crate::error::{Error, Result};
use crate::sync::{Deferred, ListenerId, Listeners};

/// A debuggable unit exposed by the browser.
///
/// A target with no session is known but not instrumented.
pub struct Target {
    info: Mutex<TargetInfo>,
    session: Option<Session>,
    initialized: AtomicBool,
}

impl Target {
    pub fn new(info: TargetInfo, session: Option<Session>) -> Self {
        Self {
            info: Mutex::new(info),
            session,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        self.info.lock().target_id.clone()
    }

    pub fn target_type(&self) -> String {
        self.info.lock().target_type.clone()
    }

    pub fn url(&self) -> String {
        self.info.lock().url.clone()
    }

    pub fn info(&self) -> TargetInfo {
        self.info.lock().clone()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub(crate) fn update_info(&self, info: TargetInfo) {
        *self.info.lock() = info;
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.lock();
        f.debug_struct("Target")
            .field("id", &info.target_id)
            .field("type", &info.target_type)
            .field("url", &info.url)
            .field("attached", &self.session.is_some())
            .finish()
    }
}

/// Builds the concrete target object for a newly attached target.
pub type TargetFactory = Arc<dyn Fn(TargetInfo, Option<Session>) -> Arc<Target> + Send + Sync>;

/// Decides which targets the driver instruments at all.
pub type TargetFilter = Arc<dyn Fn(&TargetInfo) -> bool + Send + Sync>;

/// Runs against every target attached under a given parent session, before
/// the target is resumed.
pub type AttachInterceptor = Arc<dyn Fn(&Arc<Target>, &Arc<Target>) -> Result<()> + Send + Sync>;

/// The factory used when no custom one is injected.
pub fn default_target_factory() -> TargetFactory {
    Arc::new(|info, session| Arc::new(Target::new(info, session)))
}

/// Target lifecycle events emitted to subscribers.
#[derive(Clone)]
pub enum TargetEvent {
    /// A target became known, attached or not.
    Discovered(TargetInfo),
    /// A target finished its attach handshake and its scripts are running.
    Available(Arc<Target>),
    /// An initialized attached target changed URL.
    Changed(Arc<Target>),
    /// An attached target detached.
    Gone(Arc<Target>),
}

struct TargetManagerInner {
    connection: Connection,
    factory: TargetFactory,
    filter: Option<TargetFilter>,
    /// targetId -> attached target
    attached: Mutex<HashMap<String, Arc<Target>>>,
    /// sessionId -> attached target
    sessions: Mutex<HashMap<String, Arc<Target>>>,
    /// targetId -> everything discovered, attached or not
    discovered: Mutex<HashMap<String, TargetInfo>>,
    ignored: Mutex<HashSet<String>>,
    /// Targets that must attach before initialization is complete. Fixed
    /// once, from the discovery snapshot.
    pending_init: Mutex<HashSet<String>>,
    discovery_done: Deferred<()>,
    initialized: Deferred<()>,
    /// parent sessionId -> interceptors, run in registration order
    interceptors: Mutex<HashMap<String, Vec<AttachInterceptor>>>,
    listeners: Listeners<TargetEvent>,
    subscriptions: Mutex<Vec<(&'static str, ListenerId)>>,
}

/// Discovers targets, manages auto-attach handshakes, and maintains the
/// session tree.
#[derive(Clone)]
pub struct TargetManager {
    inner: Arc<TargetManagerInner>,
}

impl TargetManager {
    /// Install handlers on the connection and start discovering targets.
    ///
    /// The required-for-initialization set is computed exactly once, when
    /// the discovery call completes; targets discovered after that snapshot
    /// are never added to it.
    pub fn new(connection: Connection, factory: TargetFactory, filter: Option<TargetFilter>) -> Self {
        let inner = Arc::new(TargetManagerInner {
            connection: connection.clone(),
            factory,
            filter,
            attached: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
            ignored: Mutex::new(HashSet::new()),
            pending_init: Mutex::new(HashSet::new()),
            discovery_done: Deferred::new(),
            initialized: Deferred::new(),
            interceptors: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
            subscriptions: Mutex::new(Vec::new()),
        });
        let manager = Self { inner };

        manager.install_handler("Target.targetCreated", Self::on_target_created);
        manager.install_handler("Target.targetDestroyed", Self::on_target_destroyed);
        manager.install_handler("Target.targetInfoChanged", Self::on_target_info_changed);
        manager.install_handler("Target.attachedToTarget", Self::on_attached_to_target);
        manager.install_handler("Target.detachedFromTarget", Self::on_detached_from_target);

        let discovery = manager.clone();
        tokio::spawn(async move { discovery.run_discovery().await });

        manager
    }

    fn install_handler(
        &self,
        method: &'static str,
        handler: fn(&Self, &ProtocolEvent) -> Result<()>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.connection.subscribe(method, move |event| {
            match Weak::upgrade(&weak) {
                Some(inner) => handler(&Self { inner }, event),
                None => Ok(()),
            }
        });
        self.inner.subscriptions.lock().push((method, id));
    }

    async fn run_discovery(&self) {
        let result: Result<Value> = self
            .inner
            .connection
            .call(
                "Target.setDiscoverTargets",
                &TargetSetDiscoverTargets { discover: true },
            )
            .await;
        match result {
            Ok(_) => {
                {
                    let discovered = self.inner.discovered.lock();
                    let mut pending = self.inner.pending_init.lock();
                    for info in discovered.values() {
                        if info.is_browser() || !self.accepts(info) {
                            continue;
                        }
                        pending.insert(info.target_id.clone());
                    }
                }
                self.inner.discovery_done.set(());
                self.check_initialized();
            }
            Err(e) => {
                tracing::error!(error = %e, "target discovery failed");
                self.inner
                    .connection
                    .close(&format!("target discovery failed: {}", e));
            }
        }
    }

    /// Enable auto-attach, wait for the discovery snapshot, and then for
    /// every snapshotted target to finish its attach handshake.
    pub async fn initialize(&self) -> Result<()> {
        let _: Value = self
            .inner
            .connection
            .call(
                "Target.setAutoAttach",
                &TargetSetAutoAttach {
                    auto_attach: true,
                    wait_for_debugger_on_start: true,
                    flatten: true,
                },
            )
            .await?;
        self.inner.discovery_done.wait().await;
        self.check_initialized();
        self.inner.initialized.wait().await;
        Ok(())
    }

    fn accepts(&self, info: &TargetInfo) -> bool {
        self.inner.filter.as_ref().map_or(true, |f| f(info))
    }

    fn check_initialized(&self) {
        if self.inner.discovery_done.is_set() && self.inner.pending_init.lock().is_empty() {
            self.inner.initialized.set(());
        }
    }

    fn retire_pending(&self, target_id: &str) {
        self.inner.pending_init.lock().remove(target_id);
        self.check_initialized();
    }

    fn on_target_created(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: TargetCreatedEvent = serde_json::from_value(event.params.clone())?;
        tracing::debug!(target_id = %ev.target_info.target_id, r#type = %ev.target_info.target_type, "target discovered");
        self.inner
            .discovered
            .lock()
            .insert(ev.target_info.target_id.clone(), ev.target_info.clone());
        self.inner
            .listeners
            .emit(&TargetEvent::Discovered(ev.target_info));
        Ok(())
    }

    fn on_target_destroyed(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: TargetDestroyedEvent = serde_json::from_value(event.params.clone())?;
        self.inner.discovered.lock().remove(&ev.target_id);
        self.inner.ignored.lock().remove(&ev.target_id);
        // A target destroyed while still pending must not hold up
        // initialization forever.
        self.retire_pending(&ev.target_id);
        Ok(())
    }

    fn on_target_info_changed(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: TargetInfoChangedEvent = serde_json::from_value(event.params.clone())?;
        let info = ev.target_info;
        self.inner
            .discovered
            .lock()
            .insert(info.target_id.clone(), info.clone());

        let target = self.inner.attached.lock().get(&info.target_id).cloned();
        if let Some(target) = target {
            let url_changed = target.url() != info.url;
            target.update_info(info);
            if url_changed && target.is_initialized() {
                self.inner.listeners.emit(&TargetEvent::Changed(target));
            }
        }
        Ok(())
    }

    fn on_attached_to_target(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: AttachedToTargetEvent = serde_json::from_value(event.params.clone())?;
        let parent_session_id = event.session_id.clone();
        let info = ev.target_info;
        let session = Session::new(
            self.inner.connection.clone(),
            ev.session_id.clone(),
            info.target_id.clone(),
        );

        tracing::debug!(
            target_id = %info.target_id,
            session_id = %ev.session_id,
            r#type = %info.target_type,
            "target attached"
        );

        if !self.accepts(&info) {
            self.inner.ignored.lock().insert(info.target_id.clone());
            if ev.waiting_for_debugger {
                session.send_forget("Runtime.runIfWaitingForDebugger", json!({}))?;
            }
            self.inner.connection.send_forget(
                parent_session_id.as_deref(),
                "Target.detachFromTarget",
                json!({ "sessionId": ev.session_id }),
            )?;
            return Ok(());
        }

        let target = (self.inner.factory)(info.clone(), Some(session.clone()));
        self.inner
            .attached
            .lock()
            .insert(info.target_id.clone(), Arc::clone(&target));
        self.inner
            .sessions
            .lock()
            .insert(ev.session_id.clone(), Arc::clone(&target));
        target.mark_initialized();

        // Service workers are never held for interception: surface them and
        // let them run immediately.
        if info.is_service_worker() {
            self.retire_pending(&info.target_id);
            self.inner.listeners.emit(&TargetEvent::Available(target));
            if ev.waiting_for_debugger {
                session.send_forget("Runtime.runIfWaitingForDebugger", json!({}))?;
            }
            return Ok(());
        }

        if let Some(parent_session_id) = parent_session_id.as_deref() {
            let interceptors = self
                .inner
                .interceptors
                .lock()
                .get(parent_session_id)
                .cloned()
                .unwrap_or_default();
            if !interceptors.is_empty() {
                let parent = self
                    .inner
                    .sessions
                    .lock()
                    .get(parent_session_id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::invariant(format!(
                            "no attached target for parent session {}",
                            parent_session_id
                        ))
                    })?;
                for interceptor in &interceptors {
                    interceptor(&target, &parent)?;
                }
            }
        }

        self.retire_pending(&info.target_id);
        self.inner.listeners.emit(&TargetEvent::Available(target));

        // Re-arm auto-attach for targets nested under this one, then let
        // its scripts run.
        session.send_forget(
            "Target.setAutoAttach",
            json!({ "autoAttach": true, "waitForDebuggerOnStart": true, "flatten": true }),
        )?;
        if ev.waiting_for_debugger {
            session.send_forget("Runtime.runIfWaitingForDebugger", json!({}))?;
        }
        Ok(())
    }

    fn on_detached_from_target(&self, event: &ProtocolEvent) -> Result<()> {
        let ev: DetachedFromTargetEvent = serde_json::from_value(event.params.clone())?;
        let target = self.inner.sessions.lock().remove(&ev.session_id);
        let Some(target) = target else {
            // Detach for a session we never registered (e.g. a filtered
            // target we let go ourselves).
            return Ok(());
        };
        tracing::debug!(target_id = %target.id(), session_id = %ev.session_id, "target detached");
        self.inner.attached.lock().remove(&target.id());
        self.retire_pending(&target.id());
        self.inner.listeners.emit(&TargetEvent::Gone(target));
        Ok(())
    }

    /// All currently attached targets.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.inner.attached.lock().values().cloned().collect()
    }

    /// Attached target by target id.
    pub fn get(&self, target_id: &str) -> Option<Arc<Target>> {
        self.inner.attached.lock().get(target_id).cloned()
    }

    /// Attached target by session id.
    pub fn get_by_session(&self, session_id: &str) -> Option<Arc<Target>> {
        self.inner.sessions.lock().get(session_id).cloned()
    }

    /// Everything discovered so far, attached or not.
    pub fn discovered(&self) -> Vec<TargetInfo> {
        self.inner.discovered.lock().values().cloned().collect()
    }

    pub fn is_ignored(&self, target_id: &str) -> bool {
        self.inner.ignored.lock().contains(target_id)
    }

    /// Register an interceptor for targets attached under `parent_session_id`.
    pub fn add_interceptor(&self, parent_session_id: &str, interceptor: AttachInterceptor) {
        self.inner
            .interceptors
            .lock()
            .entry(parent_session_id.to_string())
            .or_default()
            .push(interceptor);
    }

    /// Subscribe to target lifecycle events.
    pub fn on_event(&self, handler: impl Fn(&TargetEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.add(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    #[cfg(test)]
    fn discovery_complete(&self) -> bool {
        self.inner.discovery_done.is_set()
    }

    /// Detach the manager's handlers from the connection.
    pub fn dispose(&self) {
        for (method, id) in self.inner.subscriptions.lock().drain(..) {
            self.inner.connection.unsubscribe(method, id);
        }
    }
}
