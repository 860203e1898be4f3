use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request, Response, StatusCode,
};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::{error::SessionError, refresh::BearerSource};

pub const CACHE_BUSTER_PARAM: &str = "t";

/// The call surface shared by the plain client and its authenticated wrapper.
#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, SessionError>;
}

#[async_trait]
impl HttpSend for Client {
    async fn send(&self, request: Request) -> Result<Response, SessionError> {
        self.execute(request).await.map_err(SessionError::from)
    }
}

/// Decorator that runs the refresh pre-flight before every request and
/// injects the bearer credential. Nothing is retried here.
pub struct AuthenticatedHttp<S = Client> {
    inner: S,
    bearer: Arc<dyn BearerSource>,
}

impl<S: HttpSend> AuthenticatedHttp<S> {
    pub fn new(inner: S, bearer: Arc<dyn BearerSource>) -> Self {
        Self { inner, bearer }
    }

    pub async fn get_text(&self, url: &str) -> Result<String, SessionError> {
        let request = Request::new(Method::GET, parse_url(url)?);
        let response = check_status(self.send(request).await?)?;
        Ok(response.text().await?)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Response, SessionError> {
        let mut request = Request::new(Method::POST, parse_url(url)?);
        let bytes = serde_json::to_vec(body)
            .map_err(|err| SessionError::ValidationRejected(err.to_string()))?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *request.body_mut() = Some(bytes.into());
        check_status(self.send(request).await?)
    }
}

#[async_trait]
impl<S: HttpSend> HttpSend for AuthenticatedHttp<S> {
    async fn send(&self, mut request: Request) -> Result<Response, SessionError> {
        let token = self.bearer.bearer().await?;

        if !request.headers().contains_key(AUTHORIZATION) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| SessionError::Unauthenticated)?;
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        if is_read(request.method()) {
            append_cache_buster(request.url_mut(), Utc::now().timestamp_millis());
        }

        debug!(method = %request.method(), path = request.url().path(), "authenticated request");
        self.inner.send(request).await
    }
}

fn is_read(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Defeats intermediary caching of reads with a time-derived query value.
pub fn append_cache_buster(url: &mut Url, now_millis: i64) {
    url.query_pairs_mut()
        .append_pair(CACHE_BUSTER_PARAM, &now_millis.to_string());
}

fn parse_url(url: &str) -> Result<Url, SessionError> {
    Url::parse(url).map_err(|err| SessionError::ValidationRejected(format!("invalid url {url}: {err}")))
}

fn check_status(response: Response) -> Result<Response, SessionError> {
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(SessionError::Unauthenticated);
    }
    Ok(response.error_for_status()?)
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
