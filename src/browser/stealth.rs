//! Launch flags and page init script that keep the headless browser from
//! announcing itself to bot-detection code.

use chromiumoxide::browser::{BrowserConfig, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use std::time::Duration;

use super::BrowserError;

/// Realistic desktop Chrome user agent.
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Runs before any page script: hides the webdriver flag, stubs the `chrome`
/// object headless builds omit, and keeps `permissions.query` for
/// notifications from returning the automation-specific answer.
const INIT_SCRIPT: &str = r"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
window.navigator.permissions.query = (parameters) =>
    parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : originalQuery(parameters);
";

/// Browser launch configuration with stealth defaults.
///
/// Sandbox is disabled for constrained hosts (containers, root), and the
/// renderer old-space is capped so a leaky page cannot take the host down
/// before the memory governor reacts.
pub fn launch_config(headless: bool) -> Result<BrowserConfig, BrowserError> {
    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .arg(format!("--user-agent={USER_AGENT}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--disable-software-rasterizer")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-popup-blocking")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-prompt-on-repost")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .arg("--js-flags=--max-old-space-size=512");

    if headless {
        builder = builder.headless_mode(HeadlessMode::default());
    } else {
        builder = builder.with_head();
    }

    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        builder = builder.chrome_executable(path);
    }

    builder.build().map_err(BrowserError::Launch)
}

/// Install the init script on a fresh page.
pub async fn install(page: &Page) -> Result<(), BrowserError> {
    page.execute(AddScriptToEvaluateOnNewDocumentParams {
        source: INIT_SCRIPT.to_string(),
        include_command_line_api: None,
        world_name: None,
        run_immediately: None,
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_script_covers_the_three_evasions() {
        assert!(INIT_SCRIPT.contains("webdriver"));
        assert!(INIT_SCRIPT.contains("window.chrome"));
        assert!(INIT_SCRIPT.contains("permissions.query"));
    }
}
