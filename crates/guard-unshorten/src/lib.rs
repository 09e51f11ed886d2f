//! HTTP redirect follower implementing [`UrlResolver`].
//!
//! Issues `HEAD` requests (falling back to `GET` for servers that refuse `HEAD`) and
//! reports the URL the redirect chain ends on. Response bodies are never read.

use std::time::Duration;

use async_trait::async_trait;
use guard_core::{errors::Error, moderation::UrlResolver, Result};
use reqwest::{redirect::Policy, Method, StatusCode};
use tracing::debug;

pub const MAX_REDIRECTS: usize = 10;

#[derive(Clone, Debug)]
pub struct HttpResolver {
    http: reqwest::Client,
}

impl HttpResolver {
    /// `timeout` bounds a single resolution; callers may race it with a shorter deadline.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .user_agent(concat!("guard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::External(format!("http client build error: {e}")))?;
        Ok(Self { http })
    }

    async fn follow(&self, method: Method, url: &str) -> Result<(StatusCode, String)> {
        let resp = self
            .http
            .request(method, url)
            .send()
            .await
            .map_err(|e| Error::External(format!("unshorten request error: {e}")))?;
        Ok((resp.status(), resp.url().to_string()))
    }
}

#[async_trait]
impl UrlResolver for HttpResolver {
    async fn resolve(&self, url: &str) -> Result<String> {
        let (status, last) = self.follow(Method::HEAD, url).await?;
        if status != StatusCode::METHOD_NOT_ALLOWED && status != StatusCode::NOT_IMPLEMENTED {
            debug!(url, resolved = %last, "url resolved");
            return Ok(last);
        }

        // Some shorteners only redirect on GET.
        let (_, last) = self.follow(Method::GET, &last).await?;
        debug!(url, resolved = %last, "url resolved via GET");
        Ok(last)
    }
}
