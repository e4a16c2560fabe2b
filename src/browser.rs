//! Browser facade
//!
//! Wires the pieces together: process lifecycle → endpoint → connection →
//! target manager, plus thin pages whose navigation is synchronized
//! through [`NavigatorWatcher`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cdp::connection::{Connection, Session};
use crate::cdp::transport::WebSocketTransport;
use crate::cdp::types::{
    BrowserClose, BrowserGetVersion, BrowserGetVersionResult, NetworkEnable, PageNavigate,
    PageNavigateResult, PageReload, TargetCloseTarget, TargetCloseTargetResult,
    TargetCreateTarget, TargetCreateTargetResult,
};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameManager};
use crate::navigation::{NavigationResponse, NavigatorWatcher, WaitUntil};
use crate::process::BrowserProcess;
use crate::sync::Deferred;
use crate::target::{default_target_factory, Target, TargetEvent, TargetManager};
use crate::LaunchConfig;

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A running browser under this driver's control
pub struct Browser {
    process: Option<Arc<BrowserProcess>>,
    connection: Connection,
    targets: TargetManager,
    config: Arc<LaunchConfig>,
}

impl Browser {
    /// Launch a browser with default configuration.
    pub async fn launch() -> Result<Self> {
        Self::launch_with_config(LaunchConfig::default()).await
    }

    /// Launch with custom configuration.
    pub async fn launch_with_config(config: LaunchConfig) -> Result<Self> {
        let config = Arc::new(config);
        let process = Arc::new(BrowserProcess::new(&config)?);
        let endpoint = process.start().await?;

        let (transport, events) = WebSocketTransport::connect(&endpoint)?;
        let connection = Connection::new(Arc::new(transport), events);
        Self::from_connection(connection, Some(process), config).await
    }

    /// Attach to an already-running browser's DevTools endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (transport, events) = WebSocketTransport::connect(ws_url)?;
        let connection = Connection::new(Arc::new(transport), events);
        Self::from_connection(connection, None, Arc::new(LaunchConfig::default())).await
    }

    async fn from_connection(
        connection: Connection,
        process: Option<Arc<BrowserProcess>>,
        config: Arc<LaunchConfig>,
    ) -> Result<Self> {
        let targets = TargetManager::new(connection.clone(), default_target_factory(), None);
        targets.initialize().await?;
        Ok(Self {
            process,
            connection,
            targets,
            config,
        })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The target manager for this browser.
    pub fn targets(&self) -> &TargetManager {
        &self.targets
    }

    /// Browser product string, e.g. `Chrome/128.0.6613.84`.
    pub async fn version(&self) -> Result<String> {
        let version: BrowserGetVersionResult = self
            .connection
            .call("Browser.getVersion", &BrowserGetVersion {})
            .await?;
        Ok(version.product)
    }

    /// Wait for an attached target matching `predicate`, present or future.
    pub async fn wait_for_target(
        &self,
        predicate: impl Fn(&Arc<Target>) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<Arc<Target>> {
        let predicate = Arc::new(predicate);
        let found: Arc<Deferred<Arc<Target>>> = Arc::new(Deferred::new());

        let seen = Arc::clone(&found);
        let check = Arc::clone(&predicate);
        let listener = self.targets.on_event(move |event| {
            if let TargetEvent::Available(target) = event {
                if check(target) {
                    seen.set(Arc::clone(target));
                }
            }
        });
        // Targets that attached before the listener existed.
        for target in self.targets.targets() {
            if predicate(&target) {
                found.set(target);
            }
        }

        let result = tokio::select! {
            target = found.wait() => Ok(target),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(format!(
                "No matching target appeared within {}ms",
                timeout.as_millis()
            ))),
        };
        self.targets.remove_listener(listener);
        result
    }

    /// Open a new page and wait for its target to finish attaching.
    pub async fn new_page(&self) -> Result<Page> {
        let created: TargetCreateTargetResult = self
            .connection
            .call(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: "about:blank".to_string(),
                    width: None,
                    height: None,
                },
            )
            .await?;

        let target_id = created.target_id;
        let target = self
            .wait_for_target(
                move |target| target.id() == target_id,
                Duration::from_millis(self.config.navigation_timeout_ms),
            )
            .await?;
        Page::attach(target, Arc::clone(&self.config)).await
    }

    /// All attached page targets.
    pub fn pages(&self) -> Vec<Arc<Target>> {
        self.targets
            .targets()
            .into_iter()
            .filter(|target| target.info().is_page())
            .collect()
    }

    /// Close the browser: graceful protocol close, then the connection,
    /// then the process with kill escalation.
    pub async fn close(self) -> Result<()> {
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            self.connection
                .call::<_, Value>("Browser.close", &BrowserClose {}),
        )
        .await;
        self.connection.close("browser closed");
        if let Some(process) = &self.process {
            process.exit(CLOSE_GRACE).await?;
        }
        Ok(())
    }
}

/// A thin handle over one page target.
///
/// This stays deliberately small: navigation synchronization and frame
/// access only. Element-level conveniences belong to higher layers.
pub struct Page {
    target: Arc<Target>,
    session: Session,
    frames: FrameManager,
    config: Arc<LaunchConfig>,
}

impl Page {
    pub(crate) async fn attach(target: Arc<Target>, config: Arc<LaunchConfig>) -> Result<Self> {
        let session = target
            .session()
            .cloned()
            .ok_or_else(|| Error::invariant("page target has no session"))?;
        let frames = FrameManager::new(session.clone()).await?;
        let _: Value = session
            .call("Network.enable", &NetworkEnable::default())
            .await?;
        Ok(Self {
            target,
            session,
            frames,
            config,
        })
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The frame tree of this page.
    pub fn frames(&self) -> &FrameManager {
        &self.frames
    }

    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        self.frames.main_frame()
    }

    /// Current URL of the main frame.
    pub fn url(&self) -> Option<String> {
        self.frames.main_frame().map(|frame| frame.url())
    }

    /// Navigate to `url` and wait for the load milestone.
    pub async fn goto(&self, url: &str) -> Result<Option<NavigationResponse>> {
        self.goto_with(
            url,
            &[WaitUntil::Load],
            Duration::from_millis(self.config.navigation_timeout_ms),
        )
        .await
    }

    /// Navigate with explicit milestones and deadline.
    pub async fn goto_with(
        &self,
        url: &str,
        wait_until: &[WaitUntil],
        timeout: Duration,
    ) -> Result<Option<NavigationResponse>> {
        let frame = self
            .frames
            .main_frame()
            .ok_or_else(|| Error::FrameNotFound("main frame".to_string()))?;
        let watcher = NavigatorWatcher::new(&self.frames, Arc::clone(&frame), wait_until, timeout);

        let result: PageNavigateResult = self
            .session
            .call(
                "Page.navigate",
                &PageNavigate {
                    url: url.to_string(),
                    referrer: None,
                },
            )
            .await?;
        if let Some(error) = result.error_text {
            return Err(Error::Navigation(error));
        }

        // A non-empty loader id means the browser opened a new document.
        let loader_id = result.loader_id.filter(|id| !id.is_empty());
        let new_document = loader_id.is_some();
        watcher.set_expected_loader(loader_id);
        watcher.wait(new_document).await
    }

    /// Reload and wait for the load milestone.
    pub async fn reload(&self) -> Result<Option<NavigationResponse>> {
        let frame = self
            .frames
            .main_frame()
            .ok_or_else(|| Error::FrameNotFound("main frame".to_string()))?;
        let watcher = NavigatorWatcher::new(
            &self.frames,
            Arc::clone(&frame),
            &[WaitUntil::Load],
            Duration::from_millis(self.config.navigation_timeout_ms),
        );
        let _: Value = self
            .session
            .call("Page.reload", &PageReload { ignore_cache: None })
            .await?;
        watcher.set_expected_loader(None);
        watcher.wait(true).await
    }

    /// Close this page's target.
    pub async fn close(&self) -> Result<()> {
        let _: TargetCloseTargetResult = self
            .session
            .connection()
            .call(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: self.target.id(),
                },
            )
            .await?;
        Ok(())
    }
}
