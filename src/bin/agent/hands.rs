use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use screen_guide::engine::EngineHandle;
use screen_guide::error::ExecError;
use screen_guide::screen::{
    GlobalAction, LaunchableApp, NodePath, ScreenHost, ScreenTree, SettingsPage,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom;

const MUTATION_POLL: Duration = Duration::from_millis(250);

/// One browser tab acting as the guided "device screen".
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
    home_url: String,
    apps: Vec<LaunchableApp>,
}

impl BrowserSession {
    /// Attaches to `debug_url` when given, otherwise launches a visible Chrome.
    pub fn launch(
        debug_url: Option<&str>,
        home_url: &str,
        apps: Vec<(String, String)>,
    ) -> Result<Self> {
        let browser = match debug_url {
            Some(url) => {
                info!(url, "attaching to running Chrome");
                Browser::connect(url.to_string()).context("could not attach to Chrome")?
            }
            None => {
                info!("launching Chrome");
                let options = LaunchOptions {
                    headless: false,
                    args: vec![
                        OsStr::new("--no-first-run"),
                        OsStr::new("--no-default-browser-check"),
                        OsStr::new("--disable-infobars"),
                    ],
                    idle_browser_timeout: Duration::from_secs(24 * 60 * 60),
                    ..Default::default()
                };
                Browser::new(options).context("browser launch failed")?
            }
        };

        let tab = browser.new_tab()?;
        tab.navigate_to(home_url)?.wait_until_navigated()?;
        dom::install_mutation_counter(&tab)?;
        info!(home_url, "browser ready");

        let apps = apps
            .into_iter()
            .map(|(label, url)| LaunchableApp { label, id: url })
            .collect();
        Ok(Self {
            _browser: browser,
            tab,
            home_url: home_url.to_string(),
            apps,
        })
    }

    fn navigate(&self, url: &str) -> Result<(), ExecError> {
        self.tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(host_error)?;
        if let Err(e) = dom::install_mutation_counter(&self.tab) {
            warn!(error = %e, "mutation counter not installed");
        }
        Ok(())
    }

    fn on_element(
        &self,
        path: &NodePath,
        op: impl FnOnce(&Tab) -> Result<bool>,
    ) -> Result<(), ExecError> {
        match op(&self.tab) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ExecError::Host(format!("node {path} is gone"))),
            Err(e) => Err(host_error(e)),
        }
    }
}

fn host_error(e: anyhow::Error) -> ExecError {
    ExecError::Host(format!("{e:#}"))
}

/// Runs a blocking tab call in place. The engine task stays serialized while the
/// worker's other tasks move to another thread. Needs the multi-thread runtime.
fn off_runtime<T>(call: impl FnOnce() -> T) -> T {
    tokio::task::block_in_place(call)
}

impl ScreenHost for BrowserSession {
    fn root(&self) -> Option<ScreenTree> {
        match off_runtime(|| dom::capture_tree(&self.tab)) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(error = %e, "screen capture failed");
                None
            }
        }
    }

    fn click(&self, path: &NodePath) -> Result<(), ExecError> {
        off_runtime(|| self.on_element(path, |tab| dom::click(tab, path)))
    }

    fn scroll(&self, path: &NodePath, forward: bool) -> Result<(), ExecError> {
        off_runtime(|| self.on_element(path, |tab| dom::scroll(tab, path, forward)))
    }

    fn set_text(&self, path: &NodePath, text: &str) -> Result<(), ExecError> {
        off_runtime(|| self.on_element(path, |tab| dom::set_text(tab, path, text)))
    }

    fn global(&self, action: GlobalAction) -> Result<(), ExecError> {
        off_runtime(|| match action {
            GlobalAction::Back => self
                .tab
                .evaluate("history.back()", false)
                .map(|_| ())
                .map_err(host_error),
            GlobalAction::Home => self.navigate(&self.home_url),
        })
    }

    fn launchable_apps(&self) -> Vec<LaunchableApp> {
        self.apps.clone()
    }

    fn launch(&self, app: &LaunchableApp) -> Result<(), ExecError> {
        off_runtime(|| self.navigate(&app.id))?;
        match off_runtime(|| dom::get_current_url(&self.tab)) {
            Ok(url) => debug!(app = %app.label, %url, "app opened"),
            Err(e) => debug!(app = %app.label, error = %e, "app opened, url unknown"),
        }
        Ok(())
    }

    fn open_settings(&self, page: SettingsPage) -> Result<(), ExecError> {
        let url = match page {
            SettingsPage::Main => "chrome://settings/",
            SettingsPage::Sound => "chrome://settings/content/sound",
            SettingsPage::Display => "chrome://settings/appearance",
            SettingsPage::Bluetooth => "chrome://bluetooth-internals/",
            SettingsPage::Wifi => {
                return Err(ExecError::Host("no Wi-Fi settings in a browser host".into()));
            }
        };
        off_runtime(|| self.navigate(url))
    }
}

/// Polls the page's mutation counter and pings the engine on change.
/// Ends when the engine is gone.
pub fn watch_mutations(session: Arc<BrowserSession>, engine: EngineHandle) {
    tokio::task::spawn_blocking(move || {
        let mut last = None;
        loop {
            std::thread::sleep(MUTATION_POLL);
            let count = match dom::mutation_count(&session.tab) {
                Ok(count) => count,
                Err(e) => {
                    debug!(error = %e, "mutation poll failed");
                    continue;
                }
            };
            let Some(count) = count else {
                // Navigation replaced the document.
                if let Err(e) = dom::install_mutation_counter(&session.tab) {
                    debug!(error = %e, "mutation counter not reinstalled");
                }
                if !engine.screen_mutated() {
                    break;
                }
                last = Some(0);
                continue;
            };
            if last != Some(count) {
                if last.is_some() && !engine.screen_mutated() {
                    break;
                }
                last = Some(count);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn tab_calls_leave_the_worker_to_other_tasks() {
        let reached = tokio::spawn(async {
            let (tx, rx) = std::sync::mpsc::channel();
            tokio::spawn(async move {
                let _ = tx.send(());
            });
            off_runtime(move || rx.recv_timeout(Duration::from_secs(5)).is_ok())
        })
        .await
        .unwrap();
        assert!(reached);
    }
}
