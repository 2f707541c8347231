//! Consent-management request blocking.
//!
//! Cookie-consent overlays are useless in a streamed view and routinely eat
//! the first click, so requests to the known consent-management providers are
//! aborted at the fetch layer. Interception failures never block the page.

use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::Page;
use futures::StreamExt;

use super::BrowserError;

/// Host substrings of the blocked consent-management providers.
const BLOCKED_HOST_MARKERS: &[&str] = &[
    "cookielaw",
    "onetrust",
    "cookiebot",
    "quantcast",
    "consensu",
    "trustarc",
    "cookieyes",
    "usercentrics",
    "privacy-mgmt",
    "privacy-center",
];

/// Whether a request URL points at a consent-management provider.
pub fn is_blocked(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str()
                .map(|host| BLOCKED_HOST_MARKERS.iter().any(|m| host.contains(m)))
        })
        .unwrap_or(false)
}

/// Enable fetch interception on the page and spawn the filter task.
///
/// The task lives as long as the page's event stream; it ends on its own when
/// the page closes.
pub async fn install(page: &Page) -> Result<(), BrowserError> {
    page.execute(
        EnableParams::builder()
            .pattern(
                RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(RequestStage::Request)
                    .build(),
            )
            .build(),
    )
    .await?;

    let mut paused = page.event_listener::<EventRequestPaused>().await?;
    let page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let request_id = event.request_id.clone();
            if is_blocked(&event.request.url) {
                tracing::debug!(url = %event.request.url, "blocking consent-management request");
                if let Ok(params) = FailRequestParams::builder()
                    .request_id(request_id)
                    .error_reason(ErrorReason::Aborted)
                    .build()
                {
                    let _ = page.execute(params).await;
                }
            } else {
                let _ = page.execute(ContinueRequestParams::new(request_id)).await;
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consent_provider_hosts_are_blocked() {
        assert!(is_blocked("https://cdn.cookielaw.org/consent/x.js"));
        assert!(is_blocked("https://geolocation.onetrust.com/check"));
        assert!(is_blocked("https://consent.cookiebot.com/uc.js"));
        assert!(is_blocked("https://cmp.quantcast.com/choice.js"));
        assert!(is_blocked("https://example.mgr.consensu.org/cmp.js"));
        assert!(is_blocked("https://consent.trustarc.com/notice"));
        assert!(is_blocked("https://cdn.cookieyes.com/client.js"));
        assert!(is_blocked("https://app.usercentrics.eu/latest/main.js"));
        assert!(is_blocked("https://site.privacy-mgmt.com/messages"));
        assert!(is_blocked("https://api.privacy-center.org/v1/consent"));
    }

    #[test]
    fn ordinary_hosts_continue() {
        assert!(!is_blocked("https://example.com/"));
        assert!(!is_blocked("https://cdn.jsdelivr.net/npm/pkg"));
        // Markers match the host only, never the path.
        assert!(!is_blocked("https://example.com/onetrust/page"));
    }

    #[test]
    fn unparseable_urls_are_not_blocked() {
        assert!(!is_blocked("not a url"));
        assert!(!is_blocked(""));
    }
}
