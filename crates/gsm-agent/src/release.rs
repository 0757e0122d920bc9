//! Remote release discovery by scraping the upstream download pages.
//!
//! Nothing here is cached: every call fetches the page again.

use std::path::Path;

use regex::Regex;
use reqwest::Url;

use crate::build_info::{BuildVersion, format_version};
use crate::error::{ProvisionError, Result};
use crate::support::{env_string, http_timeout};

/// The upstream site rejects requests without a browser-like agent.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";

/// Where and how to look for server builds.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    /// Page whose first matching link is the current server download.
    pub download_page_url: String,
    /// Page listing historical builds, scanned for the version token.
    pub builds_page_url: String,
    /// Substring every server build link contains (case-sensitive).
    pub build_marker: String,
    /// Substring selecting the platform archive, after `build_marker`.
    pub platform_marker: String,
    /// File name prefix in front of the version digits, e.g. `samp037_...`.
    pub version_prefix: String,
    pub user_agent: String,
}

impl Default for ReleaseSource {
    fn default() -> Self {
        Self {
            download_page_url: "https://sa-mp.mp/create-server/".to_string(),
            builds_page_url: "https://sa-mp.mp/downloads/".to_string(),
            build_marker: "svr".to_string(),
            platform_marker: "win32".to_string(),
            version_prefix: "samp".to_string(),
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl ReleaseSource {
    pub fn from_env() -> Self {
        let mut s = Self::default();
        if let Some(v) = env_string("GSM_SAMP_DOWNLOAD_PAGE_URL") {
            s.download_page_url = v;
        }
        if let Some(v) = env_string("GSM_SAMP_BUILDS_PAGE_URL") {
            s.builds_page_url = v;
        }
        if let Some(v) = env_string("GSM_SAMP_PLATFORM_MARKER") {
            s.platform_marker = v;
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRelease {
    pub version: Option<BuildVersion>,
    pub download_url: Url,
}

#[derive(Debug, Clone)]
pub struct ReleaseResolver {
    client: reqwest::Client,
    source: ReleaseSource,
    link_re: Regex,
    version_re: Regex,
}

impl ReleaseResolver {
    pub fn new(source: ReleaseSource) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(source.user_agent.clone())
            .timeout(http_timeout())
            .build()
            .map_err(|e| ProvisionError::network("build http client", e))?;
        let link_re = link_pattern(&source)?;
        let version_re = version_pattern(&source.version_prefix)?;
        Ok(Self {
            client,
            source,
            link_re,
            version_re,
        })
    }

    pub fn source(&self) -> &ReleaseSource {
        &self.source
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn fetch_page(&self, url: &str) -> Result<(Url, String)> {
        let page = Url::parse(url).map_err(|e| ProvisionError::Parse {
            what: "page url".to_string(),
            message: format!("{url}: {e}"),
        })?;
        let body = self
            .client
            .get(page.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProvisionError::network(format!("fetching {url}"), e))?
            .text()
            .await
            .map_err(|e| ProvisionError::network(format!("reading {url}"), e))?;
        Ok((page, body))
    }

    /// URL of the first matching server build on the download page.
    pub async fn resolve_download_link(&self) -> Result<Url> {
        let (page, html) = self.fetch_page(&self.source.download_page_url).await?;
        let link = find_release_links(&self.link_re, &html, &page)
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::NoReleaseLink {
                page: page.to_string(),
            })?;
        tracing::debug!(url = %link, "resolved download link");
        Ok(link)
    }

    /// Version of the first build link on the listing page that carries a
    /// parseable version token.
    pub async fn resolve_remote_version(&self) -> Result<BuildVersion> {
        let (page, html) = self.fetch_page(&self.source.builds_page_url).await?;
        let links = find_release_links(&self.link_re, &html, &page);
        if links.is_empty() {
            return Err(ProvisionError::NoReleaseLink {
                page: page.to_string(),
            });
        }
        for link in &links {
            match version_from_link(&self.version_re, link) {
                Some(v) => {
                    tracing::debug!(url = %link, version = %v, "resolved remote version");
                    return Ok(v);
                }
                None => tracing::debug!(url = %link, "no version token in link"),
            }
        }
        Err(ProvisionError::Parse {
            what: "remote build version".to_string(),
            message: format!("no link on {page} carries a version token"),
        })
    }

    /// Both halves of a release in one go. The version is best-effort.
    pub async fn resolve_release(&self) -> Result<RemoteRelease> {
        let download_url = self.resolve_download_link().await?;
        let version = match version_from_link(&self.version_re, &download_url) {
            Some(v) => Some(v),
            None => self.resolve_remote_version().await.ok(),
        };
        Ok(RemoteRelease {
            version,
            download_url,
        })
    }

    pub(crate) fn version_of(&self, link: &Url) -> Option<BuildVersion> {
        version_from_link(&self.version_re, link)
    }
}

fn link_pattern(source: &ReleaseSource) -> Result<Regex> {
    let pattern = format!(
        r#"<a\s+[^>]*href="(?P<url>[^"]*{}[^"]*{}[^"]*)"[^>]*>"#,
        regex::escape(&source.build_marker),
        regex::escape(&source.platform_marker)
    );
    Regex::new(&pattern).map_err(|e| ProvisionError::Parse {
        what: "release link pattern".to_string(),
        message: e.to_string(),
    })
}

fn version_pattern(prefix: &str) -> Result<Regex> {
    Regex::new(&format!("{}([0-9]+)_", regex::escape(prefix))).map_err(|e| {
        ProvisionError::Parse {
            what: "version pattern".to_string(),
            message: e.to_string(),
        }
    })
}

/// Matching links in document order, resolved against the page URL.
pub fn find_release_links(link_re: &Regex, html: &str, page: &Url) -> Vec<Url> {
    link_re
        .captures_iter(html)
        .filter_map(|caps| {
            let raw = caps.name("url")?.as_str().replace("&amp;", "&");
            page.join(raw.trim()).ok()
        })
        .collect()
}

/// Extracts the version token from the link's file name.
pub fn version_from_link(version_re: &Regex, link: &Url) -> Option<BuildVersion> {
    let file_name = link.path_segments()?.next_back()?;
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let token = version_re.captures(stem)?.get(1)?.as_str();
    Some(format_version(token))
}

/// Final path segment of a download URL, used as the local archive name.
pub fn archive_name(url: &Url) -> Result<String> {
    url.path_segments()
        .and_then(|mut s| s.next_back())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::Parse {
            what: "archive name".to_string(),
            message: format!("download url has no file name: {url}"),
        })
}
