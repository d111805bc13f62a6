//! Per-request authentication: attach the cached identity token, and on a 401 invalidate and
//! retry exactly once.
//!
//! [`AuthFlow`] is the two-state machine (`Attach` → `Retried`) that any request hook can
//! drive. [`IapAuth`] wraps it for the crate's own transports, offering a blocking
//! [`IapAuth::send`] and an async [`IapAuth::send_async`] with identical retry rules.

// crates.io
use oauth2::{
	HttpRequest, HttpResponse,
	http::{HeaderName, StatusCode},
};
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	cache::TokenCache,
	config::IapSettings,
	error::{ConfigError, IssuanceError},
	http::{AsyncHttpTransport, HttpTransport, clone_request},
	obs::{self, FlowKind, FlowOutcome, FlowSpan, trace_event},
};

/// What the driver does after observing a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
	/// Re-attach a token and dispatch the request once more.
	Retry,
	/// Hand the observed response back to the caller.
	Finish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlowState {
	Attach,
	Retried,
}

/// Authentication state for a single request.
///
/// Drive it as: [`attach`](AuthFlow::attach), dispatch, [`observe`](AuthFlow::observe); repeat
/// while `observe` answers [`Step::Retry`]. It answers `Retry` at most once.
#[derive(Debug)]
pub struct AuthFlow {
	cache: TokenCache,
	header_name: HeaderName,
	state: FlowState,
}
impl AuthFlow {
	/// Starts a flow that writes tokens from `cache` under `header_name`.
	pub fn new(cache: TokenCache, header_name: HeaderName) -> Self {
		Self { cache, header_name, state: FlowState::Attach }
	}

	/// Returns `true` once the single retry has been spent.
	pub fn has_retried(&self) -> bool {
		self.state == FlowState::Retried
	}

	/// Writes `Bearer {token}` into the request, replacing any existing value. Blocks while
	/// the cache refreshes.
	pub fn attach(&self, request: &mut HttpRequest) -> Result<()> {
		let token = self.cache.get_token(None)?;

		self.insert(request, token)
	}

	/// Async variant of [`AuthFlow::attach`].
	pub async fn attach_async(&self, request: &mut HttpRequest) -> Result<()> {
		let token = self.cache.get_token_async(None).await?;

		self.insert(request, token)
	}

	/// Records the response status and decides whether to retry.
	///
	/// The first 401 invalidates the shared cache and answers [`Step::Retry`]; every other
	/// status, and any status after the retry, answers [`Step::Finish`].
	pub fn observe(&mut self, status: StatusCode) -> Step {
		if status != StatusCode::UNAUTHORIZED || self.state == FlowState::Retried {
			return Step::Finish;
		}

		trace_event!(info, "Protected service rejected the identity token; retrying once.");

		self.cache.invalidate();
		self.state = FlowState::Retried;

		Step::Retry
	}

	fn insert(&self, request: &mut HttpRequest, token: TokenSecret) -> Result<()> {
		let value = token.bearer_header().ok_or(IssuanceError::InvalidToken)?;

		request.headers_mut().insert(self.header_name.clone(), value);

		Ok(())
	}
}

/// Authenticator that signs requests with IAP identity tokens.
///
/// Clones share the same [`TokenCache`].
#[derive(Clone, Debug)]
pub struct IapAuth {
	cache: TokenCache,
	header_name: HeaderName,
}
impl IapAuth {
	/// Creates an authenticator writing to `header_name` (e.g. `Authorization`).
	pub fn new(cache: TokenCache, header_name: &str) -> Result<Self> {
		let header_name = HeaderName::from_bytes(header_name.trim().as_bytes())
			.map_err(|_| ConfigError::InvalidHeaderName { name: header_name.to_owned() })?;

		Ok(Self { cache, header_name })
	}

	/// Builds an authenticator around the process-wide cache, or returns `None` when IAP
	/// authentication is disabled.
	///
	/// The first enabled call creates the process cache from `settings`; later calls reuse it.
	pub fn from_settings(settings: &IapSettings) -> Result<Option<Self>> {
		if !settings.enabled {
			return Ok(None);
		}

		let header_name = HeaderName::from_bytes(settings.auth_header_name.trim().as_bytes())
			.map_err(|_| ConfigError::InvalidHeaderName {
				name: settings.auth_header_name.clone(),
			})?;
		let cache = TokenCache::global_or_init(|| TokenCache::from_settings(settings))?;

		Ok(Some(Self { cache, header_name }))
	}

	/// Shared token cache.
	pub fn cache(&self) -> &TokenCache {
		&self.cache
	}

	/// Header the token is written to.
	pub fn header_name(&self) -> &HeaderName {
		&self.header_name
	}

	/// Starts the authentication flow for one request.
	pub fn flow(&self) -> AuthFlow {
		AuthFlow::new(self.cache.clone(), self.header_name.clone())
	}

	/// Sends `request` through a blocking transport, retrying once on 401.
	///
	/// The final response is returned whatever its status.
	pub fn send(&self, transport: &dyn HttpTransport, request: HttpRequest) -> Result<HttpResponse> {
		const KIND: FlowKind = FlowKind::Request;

		let _span = FlowSpan::new(KIND, "send").entered();

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let mut flow = self.flow();
		let mut request = request;
		let result = loop {
			if let Err(err) = flow.attach(&mut request) {
				break Err(err);
			}

			let retry = (!flow.has_retried()).then(|| clone_request(&request));
			let response = match transport.execute(request) {
				Ok(response) => response,
				Err(err) => break Err(Error::Transport(err)),
			};

			match (flow.observe(response.status()), retry) {
				(Step::Retry, Some(next)) => request = next,
				_ => break Ok(response),
			}
		};

		record_request_outcome(&result);

		result
	}

	/// Async variant of [`IapAuth::send`]. Token refreshes run off the calling task.
	pub async fn send_async(
		&self,
		transport: &dyn AsyncHttpTransport,
		request: HttpRequest,
	) -> Result<HttpResponse> {
		const KIND: FlowKind = FlowKind::Request;

		let span = FlowSpan::new(KIND, "send_async");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.drive_async(transport, request)).await;

		record_request_outcome(&result);

		result
	}

	async fn drive_async(
		&self,
		transport: &dyn AsyncHttpTransport,
		mut request: HttpRequest,
	) -> Result<HttpResponse> {
		let mut flow = self.flow();

		loop {
			flow.attach_async(&mut request).await?;

			let retry = (!flow.has_retried()).then(|| clone_request(&request));
			let response = transport.execute(request).await.map_err(Error::Transport)?;

			match (flow.observe(response.status()), retry) {
				(Step::Retry, Some(next)) => request = next,
				_ => return Ok(response),
			}
		}
	}
}

fn record_request_outcome(result: &Result<HttpResponse>) {
	match result {
		Ok(response) if response.status().is_success() =>
			obs::record_flow_outcome(FlowKind::Request, FlowOutcome::Success),
		_ => obs::record_flow_outcome(FlowKind::Request, FlowOutcome::Failure),
	}
}
