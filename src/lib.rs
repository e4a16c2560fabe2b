//! # Strix
//!
//! Low-level Chrome DevTools Protocol driver.
//!
//! Strix launches (or attaches to) a browser, multiplexes one WebSocket
//! across every debuggable target, tracks the frame and execution-context
//! tree as navigation happens, and synchronizes navigations against the
//! browser's racing lifecycle signals.
//!
//! ## Features
//!
//! - **One connection, many targets** - flattened sessions with strict
//!   in-order dispatch and per-call reply correlation
//! - **Race-free attach** - auto-attach holds new targets paused until
//!   instrumentation is installed, then resumes them
//! - **Stable frame handles** - the main frame keeps its identity across
//!   cross-process navigations
//! - **Event-driven navigation** - lifecycle milestones, same-document
//!   detection, termination, and timeouts race; first signal wins
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strix::Browser;
//!
//! #[tokio::main]
//! async fn main() -> strix::Result<()> {
//!     let browser = Browser::launch().await?;
//!
//!     let page = browser.new_page().await?;
//!     let response = page.goto("https://example.com").await?;
//!     if let Some(response) = response {
//!         println!("{} -> {}", response.url, response.status);
//!     }
//!
//!     browser.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use strix::{Browser, LaunchConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> strix::Result<()> {
//! let config = LaunchConfig {
//!     headless: false,
//!     start_timeout_ms: 60_000,
//!     ..Default::default()
//! };
//!
//! let browser = Browser::launch_with_config(config).await?;
//! # Ok(())
//! # }
//! ```

pub mod browser;
pub mod cdp;
pub mod error;
pub mod frame;
pub mod navigation;
pub mod process;
pub mod sync;
pub mod target;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use browser::{Browser, Page};
pub use cdp::{Connection, ProtocolEvent, Session, Transport, TransportEvent, WebSocketTransport};
pub use error::{Error, Result};
pub use frame::{ExecutionContext, Frame, FrameEvent, FrameManager};
pub use navigation::{NavigationResponse, NavigatorWatcher, WaitUntil};
pub use process::{find_browser, BrowserProcess, ProcessState};
pub use sync::{Deferred, ListenerId, Listeners};
pub use target::{
    default_target_factory, AttachInterceptor, Target, TargetEvent, TargetFactory, TargetFilter,
    TargetManager,
};

use std::path::PathBuf;

/// Configuration for launching a browser
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the browser binary (`None` = probe common install locations)
    pub executable: Option<PathBuf>,
    /// Profile directory (`None` = generate a temp dir owned by the driver)
    pub user_data_dir: Option<PathBuf>,
    /// Headless mode
    pub headless: bool,
    /// Extra command-line flags appended after the defaults
    pub args: Vec<String>,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
    /// How long to wait for the DevTools endpoint announcement
    pub start_timeout_ms: u64,
    /// Default deadline for navigations
    pub navigation_timeout_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: None,
            user_data_dir: None,
            headless: true,
            args: Vec::new(),
            window_width: 1920,
            window_height: 1080,
            start_timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
        }
    }
}

impl LaunchConfig {
    /// Create a visible (non-headless) config
    pub fn visible() -> Self {
        Self {
            headless: false,
            ..Default::default()
        }
    }
}
