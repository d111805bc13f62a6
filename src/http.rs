//! Transport primitives shared by the refresh path and the authenticated request flow.
//!
//! Requests and responses are the `oauth2` crate's [`HttpRequest`] / [`HttpResponse`]
//! (`http` types with owned byte bodies). The refresh path only ever talks through the
//! blocking [`HttpTransport`]; [`AsyncHttpTransport`] exists for callers that drive the
//! authenticated request flow from an async client.

// std
use std::ops::Deref;
// crates.io
use oauth2::{
	HttpClientError, HttpRequest, HttpResponse, SyncHttpClient,
	http::{
		HeaderValue, Method, Request,
		header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
	},
};
use reqwest::redirect::Policy;
// self
use crate::{_prelude::*, auth::TokenSecret, error::TransportError};

/// Boxed future returned by [`AsyncHttpTransport::execute`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + 'a + Send>>;

/// Blocking HTTP transport.
///
/// Implementations must be safe to share across threads; the cache calls them while holding
/// its refresh guard, either on the caller's thread or on a blocking worker.
pub trait HttpTransport
where
	Self: Send + Sync,
{
	/// Sends `request` and returns the full response, whatever its status.
	fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Non-blocking HTTP transport used by the async request flow.
pub trait AsyncHttpTransport
where
	Self: Send + Sync,
{
	/// Sends `request` and resolves to the full response, whatever its status.
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_>;
}

/// Thin wrapper around [`reqwest::blocking::Client`] so shared HTTP behavior lives in one place.
///
/// Refresh-path endpoints answer directly, so the default client does not follow redirects.
/// The wrapped client's timeout (30 seconds unless configured) bounds every refresh-path call.
#[derive(Clone, Debug)]
pub struct ReqwestBlockingHttpClient(pub reqwest::blocking::Client);
impl ReqwestBlockingHttpClient {
	/// Builds the default client.
	pub fn new() -> Result<Self, crate::error::ConfigError> {
		let client = reqwest::blocking::Client::builder().redirect(Policy::none()).build()?;

		Ok(Self(client))
	}

	/// Wraps an existing blocking client.
	pub fn with_client(client: reqwest::blocking::Client) -> Self {
		Self(client)
	}
}
impl Deref for ReqwestBlockingHttpClient {
	type Target = reqwest::blocking::Client;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl HttpTransport for ReqwestBlockingHttpClient {
	fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
		let request = reqwest::blocking::Request::try_from(request)?;
		let response = self.0.execute(request)?;
		let status = response.status();
		let headers = response.headers().to_owned();
		let mut response_new = HttpResponse::new(response.bytes()?.to_vec());

		*response_new.status_mut() = status;
		*response_new.headers_mut() = headers;

		Ok(response_new)
	}
}

/// Blocking reqwest transport whose client is built by the first request.
///
/// A [`reqwest::blocking::Client`] cannot be created on an async worker thread. Deferring the
/// build lets the cache be constructed anywhere; the client then comes to life inside the
/// guarded refresh, which async callers run on Tokio's blocking pool.
#[derive(Debug, Default)]
pub struct LazyReqwestBlockingHttpClient {
	client: Mutex<Option<ReqwestBlockingHttpClient>>,
}
impl LazyReqwestBlockingHttpClient {
	/// Creates a transport with no client yet.
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether a request has already built the underlying client.
	pub fn is_built(&self) -> bool {
		self.client.lock().is_some()
	}

	fn client(&self) -> Result<ReqwestBlockingHttpClient, TransportError> {
		let mut slot = self.client.lock();

		if let Some(client) = slot.as_ref() {
			return Ok(client.clone());
		}

		let client = ReqwestBlockingHttpClient::new().map_err(TransportError::network)?;

		*slot = Some(client.clone());

		Ok(client)
	}
}
impl HttpTransport for LazyReqwestBlockingHttpClient {
	fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
		self.client()?.execute(request)
	}
}

/// Thin wrapper around the async [`reqwest::Client`] for the async request flow.
#[derive(Clone, Debug, Default)]
pub struct ReqwestHttpClient(pub reqwest::Client);
impl ReqwestHttpClient {
	/// Wraps an existing reqwest [`reqwest::Client`].
	pub fn with_client(client: reqwest::Client) -> Self {
		Self(client)
	}
}
impl Deref for ReqwestHttpClient {
	type Target = reqwest::Client;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl AsyncHttpTransport for ReqwestHttpClient {
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let request = reqwest::Request::try_from(request)?;
			let response = self.0.execute(request).await?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let mut response_new = HttpResponse::new(response.bytes().await?.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}

/// Adapts a [`HttpTransport`] to the `oauth2` crate's [`SyncHttpClient`].
pub(crate) struct OAuthHttpClient<'a>(pub(crate) &'a dyn HttpTransport);
impl SyncHttpClient for OAuthHttpClient<'_> {
	type Error = HttpClientError<TransportError>;

	fn call(&self, request: HttpRequest) -> Result<HttpResponse, Self::Error> {
		self.0.execute(request).map_err(|err| HttpClientError::Reqwest(Box::new(err)))
	}
}

/// Builds a JSON request authorized with `access_token`.
pub(crate) fn json_request(
	method: Method,
	url: &Url,
	access_token: &TokenSecret,
	body: Vec<u8>,
) -> Result<HttpRequest, TransportError> {
	let mut builder =
		Request::builder().method(method).uri(url.as_str()).header(ACCEPT, "application/json");

	if let Some(value) = access_token.bearer_header() {
		builder = builder.header(AUTHORIZATION, value);
	}
	if !body.is_empty() {
		builder = builder
			.header(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
	}

	Ok(builder.body(body)?)
}

/// Copies a request so it can be dispatched a second time.
pub(crate) fn clone_request(request: &HttpRequest) -> HttpRequest {
	let mut copy = HttpRequest::new(request.body().clone());

	*copy.method_mut() = request.method().clone();
	*copy.uri_mut() = request.uri().clone();
	*copy.version_mut() = request.version();
	*copy.headers_mut() = request.headers().clone();

	copy
}
