//! Authenticated RETS HTTP client.
//!
//! Hides cookie and capability-URL management from the rest of the service.
//! Every loop obtains a [`Session`] through [`RetsClient::login`]; the disk
//! cache lets them share one server-side session until its one-hour expiry.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RetsConfig;
use crate::error::RetsError;
use crate::rets::parser;
use crate::rets::session::{Session, SessionCache};

/// Per-request timeout. Large metadata and photo bundles are slow on the
/// vendor side; five minutes matches the server's own proxy limits.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct RetsClient {
    http: reqwest::Client,
    config: RetsConfig,
    login_url: Url,
    cache: SessionCache,
}

impl RetsClient {
    pub fn new(config: RetsConfig, cache_dir: &Path) -> Result<Self, RetsError> {
        let login_url = Url::parse(&config.login_url)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            config,
            login_url,
            cache: SessionCache::new(cache_dir),
        })
    }

    /// Returns the cached session when unexpired, otherwise performs a fresh
    /// login and persists the new session.
    pub async fn login(&self) -> Result<Session, RetsError> {
        if let Some(session) = self.cache.load() {
            return Ok(session);
        }
        self.fresh_login().await
    }

    async fn fresh_login(&self) -> Result<Session, RetsError> {
        debug!(url = %self.login_url, "logging in to RETS server");
        let response = self
            .http
            .get(self.login_url.clone())
            .query(&[("rets-version", self.config.version.as_str())])
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("RETS-Version", &self.config.version)
            .header("User-Agent", &self.config.user_agent)
            .send()
            .await?;

        let session_id = cookie_header(response.headers());
        let body = response.text().await?;
        let login = parser::parse_login(&body)?;

        if login.reply.code != 0 {
            return Err(RetsError::LoginRejected {
                reply_code: login.reply.code,
                reply_text: login.reply.text,
            });
        }
        let session_id = session_id.ok_or(RetsError::NoCookie)?;

        let session = Session::new(session_id, login.capabilities);
        self.cache.store(&session)?;
        info!(expires = %session.session_expires, "RETS login succeeded");
        Ok(session)
    }

    /// Calls the Logout capability and clears the session cache. Failure is
    /// logged and swallowed; the server expires stale sessions on its own.
    pub async fn logout(&self, session: &Session) {
        let result: Result<(), RetsError> = async {
            let url = self.resolve(session.capability("Logout")?)?;
            self.http
                .get(url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .header("Cookie", &session.session_id)
                .header("RETS-Version", &self.config.version)
                .header("User-Agent", &self.config.user_agent)
                .send()
                .await?
                .error_for_status()?;
            self.cache.clear()?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!("RETS logout complete"),
            Err(err) => warn!(error = %err, "RETS logout failed"),
        }
    }

    /// Issues an authenticated GET against a capability (or server-relative)
    /// URL and returns the raw body with response headers. The caller decides
    /// whether the bytes are text or binary.
    pub async fn request(
        &self,
        session: &Session,
        relative_url: &str,
        query: &[(&str, String)],
    ) -> Result<(Bytes, HeaderMap), RetsError> {
        let url = self.resolve(relative_url)?;
        let response = self
            .http
            .get(url)
            .query(query)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Cookie", &session.session_id)
            .header("RETS-Version", &self.config.version)
            .header("User-Agent", &self.config.user_agent)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Stale server-side session; drop the cache so the next login()
            // starts fresh.
            if let Err(err) = self.cache.clear() {
                warn!(error = %err, "failed to clear session cache after 401");
            }
        }
        let response = response.error_for_status()?;

        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok((body, headers))
    }

    /// Resolve a capability URL, which may be absolute or server-relative,
    /// against the login URL's origin.
    pub fn resolve(&self, capability_url: &str) -> Result<Url, RetsError> {
        if capability_url.starts_with("http://") || capability_url.starts_with("https://") {
            Ok(Url::parse(capability_url)?)
        } else {
            Ok(self.login_url.join(capability_url)?)
        }
    }
}

/// Concatenate the name=value pair of every `Set-Cookie` header into a single
/// `Cookie` header value.
fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v: &HeaderValue| v.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RetsClient {
        let config = RetsConfig {
            login_url: "https://rets.example.com/rets/login".into(),
            version: "RETS/1.7.2".into(),
            vendor: "VENDOR".into(),
            username: "user".into(),
            password: "pass".into(),
            user_agent: "agent/1.0".into(),
        };
        let dir = tempfile::tempdir().unwrap();
        RetsClient::new(config, dir.path()).unwrap()
    }

    #[test]
    fn resolves_relative_against_login_origin() {
        let client = client();
        assert_eq!(
            client.resolve("/rets/search").unwrap().as_str(),
            "https://rets.example.com/rets/search"
        );
        assert_eq!(
            client
                .resolve("https://media.example.com/getobject")
                .unwrap()
                .as_str(),
            "https://media.example.com/getobject"
        );
    }

    #[test]
    fn cookie_header_joins_name_value_pairs() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            "RETS-Session-ID=abc123; Path=/; HttpOnly".parse().unwrap(),
        );
        headers.append(SET_COOKIE, "JSESSIONID=xyz; Secure".parse().unwrap());
        assert_eq!(
            cookie_header(&headers).as_deref(),
            Some("RETS-Session-ID=abc123; JSESSIONID=xyz")
        );
    }

    #[test]
    fn no_cookies_yields_none() {
        assert_eq!(cookie_header(&HeaderMap::new()), None);
    }
}
