//! Single-flight identity token cache shared by blocking and async callers.
//!
//! [`TokenCache`] keeps one identity token per process. Lookups that find a fresh token return
//! it under a short read lock. Everything else (audience resolution, credential refresh,
//! issuance) runs under one refresh guard, so concurrent callers queue behind the refresh in
//! flight and then reuse its result instead of starting their own. Async callers never take the
//! guard on their scheduler thread: [`TokenCache::get_token_async`] moves the whole guarded
//! section onto Tokio's blocking pool and awaits it there.

mod metrics;

pub use metrics::CacheMetrics;

// std
use std::sync::OnceLock;
// self
use crate::{
	_prelude::*,
	audience::{AudienceResolver, SecretManagerAudience},
	auth::{Audience, CachedToken, ServiceAccount, TokenSecret},
	config::IapSettings,
	credential::{self, CredentialSource},
	error::ConfigError,
	http::{HttpTransport, LazyReqwestBlockingHttpClient},
	issuer::{IamCredentialsIssuer, IdentityTokenIssuer, ISSUED_TOKEN_LIFETIME},
	obs::{self, FlowKind, FlowOutcome, FlowSpan, trace_event},
};

/// Cached tokens this close to expiry are refreshed instead of reused.
pub const REFRESH_BUFFER: Duration = Duration::seconds(300);

static GLOBAL: OnceLock<TokenCache> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = parking_lot::const_mutex(());

/// Process-wide identity token cache.
///
/// Cloning is cheap and every clone shares the same token, guard, and metrics. Build one per
/// process (see [`TokenCache::global_or_init`]) and hand clones to every authenticator.
#[derive(Clone)]
pub struct TokenCache {
	inner: Arc<CacheInner>,
}
struct CacheInner {
	credentials: Arc<dyn CredentialSource>,
	resolver: Arc<dyn AudienceResolver>,
	issuer: Arc<dyn IdentityTokenIssuer>,
	token: RwLock<Option<CachedToken>>,
	audience: OnceLock<Audience>,
	refresh_guard: Mutex<()>,
	metrics: CacheMetrics,
}
impl TokenCache {
	/// Creates a cache around the three refresh-path collaborators.
	pub fn new(
		credentials: Arc<dyn CredentialSource>,
		resolver: Arc<dyn AudienceResolver>,
		issuer: Arc<dyn IdentityTokenIssuer>,
	) -> Self {
		Self {
			inner: Arc::new(CacheInner {
				credentials,
				resolver,
				issuer,
				token: RwLock::new(None),
				audience: OnceLock::new(),
				refresh_guard: Mutex::new(()),
				metrics: CacheMetrics::default(),
			}),
		}
	}

	/// Builds the default stack from settings: application default credentials, Secret Manager
	/// audience resolution, and IAM Credentials issuance over a blocking reqwest client.
	///
	/// Missing secret path or service account settings do not fail here; they surface as
	/// [`ConfigError`] from the first [`TokenCache::get_token`] that needs them. The HTTP client
	/// is built by the first refresh, so this is safe to call from async code.
	pub fn from_settings(settings: &IapSettings) -> Result<Self> {
		let transport: Arc<dyn HttpTransport> = Arc::new(LazyReqwestBlockingHttpClient::new());
		let credentials = credential::application_default(transport.clone())?;
		let service_account = settings
			.impersonate_service_account
			.as_deref()
			.map(ServiceAccount::new)
			.transpose()
			.map_err(ConfigError::from)?;
		let resolver = SecretManagerAudience::new(
			settings.client_id_gcp_secret_version.clone(),
			credentials.clone(),
			transport.clone(),
		)?;
		let issuer = IamCredentialsIssuer::new(service_account, transport)?;

		Ok(Self::new(credentials, Arc::new(resolver), Arc::new(issuer)))
	}

	/// Returns the process-wide cache, creating it with `init` on first use.
	///
	/// A failed `init` leaves the slot empty so a later call can try again. The instance is
	/// never torn down before process exit.
	pub fn global_or_init<F>(init: F) -> Result<Self>
	where
		F: FnOnce() -> Result<Self>,
	{
		if let Some(cache) = GLOBAL.get() {
			return Ok(cache.clone());
		}

		let _init = GLOBAL_INIT.lock();

		if let Some(cache) = GLOBAL.get() {
			return Ok(cache.clone());
		}

		let cache = init()?;

		Ok(GLOBAL.get_or_init(|| cache).clone())
	}

	/// Returns the process-wide cache if one was initialized.
	pub fn global() -> Option<Self> {
		GLOBAL.get().cloned()
	}

	/// Counters describing cache activity.
	pub fn metrics(&self) -> &CacheMetrics {
		&self.inner.metrics
	}

	/// Snapshot of the cached token, if any.
	pub fn cached(&self) -> Option<CachedToken> {
		self.inner.token.read().clone()
	}

	/// Returns a valid identity token for `audience` (or the resolved audience when `None`),
	/// blocking the calling thread while a refresh runs.
	///
	/// Do not call this from an async task; use [`TokenCache::get_token_async`] instead.
	pub fn get_token(&self, audience: Option<&str>) -> Result<TokenSecret> {
		const KIND: FlowKind = FlowKind::Token;

		let _span = FlowSpan::new(KIND, "get_token").entered();

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = self.get_token_blocking(audience);

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Async variant of [`TokenCache::get_token`].
	///
	/// Fresh tokens are returned without leaving the task. Otherwise the guarded refresh runs on
	/// Tokio's blocking pool, sharing the same guard as blocking callers, and the task suspends
	/// until it completes. Requires a Tokio runtime.
	pub async fn get_token_async(&self, audience: Option<&str>) -> Result<TokenSecret> {
		const KIND: FlowKind = FlowKind::Token;

		let span = FlowSpan::new(KIND, "get_token_async");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.get_token_offloaded(audience)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Drops the cached token. The next lookup refreshes. Idempotent.
	pub fn invalidate(&self) {
		let previous = self.inner.token.write().take();

		self.inner.metrics.record_invalidation();

		trace_event!(debug, had_token = previous.is_some(), "Identity token invalidated.");

		drop(previous);
	}

	async fn get_token_offloaded(&self, audience: Option<&str>) -> Result<TokenSecret> {
		self.inner.issuer.ensure_configured()?;

		let requested = audience.map(Audience::new).transpose().map_err(ConfigError::from)?;

		if let Some(token) = self.lookup(requested.as_ref()) {
			return Ok(token);
		}

		let handle = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?;
		let cache = self.clone();
		let audience = requested.map(String::from);

		handle
			.spawn_blocking(move || cache.get_token_blocking(audience.as_deref()))
			.await
			.map_err(|source| Error::Worker { source })?
	}

	fn get_token_blocking(&self, audience: Option<&str>) -> Result<TokenSecret> {
		self.inner.issuer.ensure_configured()?;

		let requested = audience.map(Audience::new).transpose().map_err(ConfigError::from)?;

		if let Some(token) = self.lookup(requested.as_ref()) {
			return Ok(token);
		}

		let _singleflight = self.inner.refresh_guard.lock();
		let audience = match requested {
			Some(audience) => audience,
			None => self.resolve_audience()?,
		};

		if let Some(token) = self.lookup(Some(&audience)) {
			return Ok(token);
		}

		self.refresh(audience)
	}

	/// Fast path: returns a reusable token without taking the refresh guard.
	fn lookup(&self, requested: Option<&Audience>) -> Option<TokenSecret> {
		let audience = requested.or_else(|| self.inner.audience.get())?;
		let now = OffsetDateTime::now_utc();
		let token = self
			.inner
			.token
			.read()
			.as_ref()
			.filter(|cached| cached.is_reusable_for(audience, now, REFRESH_BUFFER))
			.map(|cached| cached.value.clone())?;

		self.inner.metrics.record_hit();

		Some(token)
	}

	/// Memoized audience resolution. Caller must hold the refresh guard.
	fn resolve_audience(&self) -> Result<Audience> {
		if let Some(audience) = self.inner.audience.get() {
			return Ok(audience.clone());
		}

		let audience = self.inner.resolver.resolve()?;

		self.inner.metrics.record_resolution();

		Ok(self.inner.audience.get_or_init(|| audience).clone())
	}

	/// Mints and stores a new token. Caller must hold the refresh guard.
	fn refresh(&self, audience: Audience) -> Result<TokenSecret> {
		const KIND: FlowKind = FlowKind::Refresh;

		let _span = FlowSpan::new(KIND, "refresh").entered();

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		trace_event!(debug, audience = %audience, "Refreshing identity token.");

		let issued = credential::valid_access_token(self.inner.credentials.as_ref())
			.and_then(|access_token| self.inner.issuer.issue(&access_token, &audience));
		let token = match issued {
			Ok(token) => token,
			Err(err) => {
				self.inner.metrics.record_failure();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
				trace_event!(warn, error = %err, "Identity token refresh failed.");

				return Err(err);
			},
		};
		let record =
			CachedToken::new(token.clone(), audience, OffsetDateTime::now_utc(), ISSUED_TOKEN_LIFETIME);

		trace_event!(debug, expires_at = %record.expires_at, "Identity token refreshed.");

		*self.inner.token.write() = Some(record);

		self.inner.metrics.record_refresh();
		obs::record_flow_outcome(KIND, FlowOutcome::Success);

		Ok(token)
	}

	#[cfg(test)]
	fn prime(&self, record: CachedToken) {
		*self.inner.token.write() = Some(record);
	}
}
impl Debug for TokenCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenCache")
			.field("cached", &self.cached())
			.field("audience", &self.inner.audience.get())
			.field("metrics", &self.inner.metrics)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{
		sync::{
			Barrier,
			atomic::{AtomicUsize, Ordering},
		},
		thread,
		time::Duration as StdDuration,
	};
	// self
	use super::*;
	use crate::{
		audience::StaticAudience,
		credential::StaticCredentials,
		error::{IssuanceError, ResolutionError},
	};

	const AUDIENCE: &str = "client-1.apps.googleusercontent.com";

	/// Issues `token-1`, `token-2`, ... and counts calls; optionally slow or failing.
	#[derive(Default)]
	struct CountingIssuer {
		calls: AtomicUsize,
		delay: Option<StdDuration>,
		fail_first: AtomicUsize,
		unconfigured: bool,
	}
	impl CountingIssuer {
		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}
	impl IdentityTokenIssuer for CountingIssuer {
		fn ensure_configured(&self) -> Result<()> {
			if self.unconfigured {
				return Err(ConfigError::MissingServiceAccount.into());
			}

			Ok(())
		}

		fn issue(&self, _access_token: &TokenSecret, _audience: &Audience) -> Result<TokenSecret> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

			if let Some(delay) = self.delay {
				thread::sleep(delay);
			}
			if self
				.fail_first
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
				.is_ok()
			{
				return Err(IssuanceError::Status { status: 503, body: "unavailable".into() }.into());
			}

			Ok(TokenSecret::new(format!("token-{call}")))
		}
	}

	#[derive(Default)]
	struct CountingResolver {
		calls: AtomicUsize,
		fail_first: AtomicUsize,
	}
	impl AudienceResolver for CountingResolver {
		fn resolve(&self) -> Result<Audience> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			if self
				.fail_first
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
				.is_ok()
			{
				return Err(ResolutionError::Status { status: 500, body: "boom".into() }.into());
			}

			Ok(Audience::new(AUDIENCE).expect("Audience fixture should be valid."))
		}
	}

	fn audience() -> Audience {
		Audience::new(AUDIENCE).expect("Audience fixture should be valid.")
	}

	fn cache_with(issuer: Arc<CountingIssuer>) -> TokenCache {
		TokenCache::new(
			Arc::new(StaticCredentials::new("access")),
			Arc::new(StaticAudience::new(audience())),
			issuer,
		)
	}

	fn seeded(value: &str, expires_in: Duration) -> CachedToken {
		let now = OffsetDateTime::now_utc();

		CachedToken {
			value: TokenSecret::new(value),
			issued_for: audience(),
			issued_at: now,
			expires_at: now + expires_in,
		}
	}

	#[test]
	fn reuses_token_outside_the_buffer() {
		let issuer = Arc::new(CountingIssuer::default());
		let cache = cache_with(issuer.clone());

		cache.prime(seeded("cached", Duration::seconds(600)));

		let token = cache.get_token(Some(AUDIENCE)).expect("Cached token should be returned.");

		assert_eq!(token.expose(), "cached");
		assert_eq!(issuer.calls(), 0);
		assert_eq!(cache.metrics().hits(), 1);
	}

	#[test]
	fn refreshes_token_inside_the_buffer() {
		let issuer = Arc::new(CountingIssuer::default());
		let cache = cache_with(issuer.clone());

		cache.prime(seeded("stale", Duration::seconds(200)));

		let token = cache.get_token(Some(AUDIENCE)).expect("Refresh should succeed.");

		assert_eq!(token.expose(), "token-1");
		assert_eq!(issuer.calls(), 1);

		let cached = cache.cached().expect("Refreshed token should be cached.");

		assert_eq!(cached.value.expose(), "token-1");
		assert_eq!(cached.expires_at - cached.issued_at, ISSUED_TOKEN_LIFETIME);
	}

	#[test]
	fn resolves_audience_once_and_reuses_the_token() {
		let issuer = Arc::new(CountingIssuer::default());
		let resolver = Arc::new(CountingResolver::default());
		let cache =
			TokenCache::new(Arc::new(StaticCredentials::new("access")), resolver.clone(), issuer.clone());
		let first = cache.get_token(None).expect("First lookup should refresh.");
		let second = cache.get_token(None).expect("Second lookup should hit the cache.");

		assert_eq!(first, second);
		assert_eq!(issuer.calls(), 1);
		assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.metrics().resolutions(), 1);

		cache.invalidate();
		cache.get_token(None).expect("Lookup after invalidation should refresh.");

		assert_eq!(resolver.calls.load(Ordering::SeqCst), 1, "Audience must stay memoized.");
		assert_eq!(issuer.calls(), 2);
	}

	#[test]
	fn failed_resolution_is_not_memoized() {
		let issuer = Arc::new(CountingIssuer::default());
		let resolver =
			Arc::new(CountingResolver { fail_first: AtomicUsize::new(1), ..Default::default() });
		let cache =
			TokenCache::new(Arc::new(StaticCredentials::new("access")), resolver.clone(), issuer.clone());
		let err = cache.get_token(None).expect_err("First resolution should fail.");

		assert!(matches!(err, Error::Resolution(ResolutionError::Status { status: 500, .. })));
		assert_eq!(issuer.calls(), 0);

		cache.get_token(None).expect("Second resolution should succeed.");

		assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn issuance_failure_leaves_cache_unchanged() {
		let issuer = Arc::new(CountingIssuer { fail_first: AtomicUsize::new(1), ..Default::default() });
		let cache = cache_with(issuer.clone());

		cache.prime(seeded("stale", Duration::seconds(100)));

		let err = cache.get_token(Some(AUDIENCE)).expect_err("Issuance failure should propagate.");

		assert!(matches!(err, Error::Issuance(IssuanceError::Status { status: 503, .. })));
		assert_eq!(
			cache.cached().expect("Previous token should remain.").value.expose(),
			"stale"
		);
		assert_eq!(cache.metrics().failures(), 1);

		let token = cache.get_token(Some(AUDIENCE)).expect("Later call should retry.");

		assert_eq!(token.expose(), "token-2");
	}

	#[test]
	fn unconfigured_issuer_fails_before_any_remote_call() {
		let issuer = Arc::new(CountingIssuer { unconfigured: true, ..Default::default() });
		let resolver = Arc::new(CountingResolver::default());
		let cache =
			TokenCache::new(Arc::new(StaticCredentials::new("access")), resolver.clone(), issuer.clone());
		let err = cache.get_token(None).expect_err("Missing service account must be reported.");

		assert!(matches!(err, Error::Config(ConfigError::MissingServiceAccount)));
		assert_eq!(issuer.calls(), 0);
		assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn other_audience_is_not_served_from_cache() {
		let issuer = Arc::new(CountingIssuer::default());
		let cache = cache_with(issuer.clone());

		cache.prime(seeded("cached", Duration::seconds(600)));

		let token = cache.get_token(Some("other-client")).expect("Refresh should succeed.");

		assert_eq!(token.expose(), "token-1");
		assert_eq!(
			cache.cached().expect("Token should be cached.").issued_for.as_ref(),
			"other-client"
		);
	}

	#[test]
	fn invalidate_is_idempotent() {
		let issuer = Arc::new(CountingIssuer::default());
		let cache = cache_with(issuer.clone());

		cache.prime(seeded("cached", Duration::seconds(600)));
		cache.invalidate();

		assert!(cache.cached().is_none());

		cache.invalidate();

		assert!(cache.cached().is_none());
		assert_eq!(cache.metrics().invalidations(), 2);
		assert_eq!(issuer.calls(), 0, "Invalidation must not refresh eagerly.");
	}

	#[test]
	fn concurrent_blocking_callers_share_one_refresh() {
		const CALLERS: usize = 8;

		let issuer = Arc::new(CountingIssuer {
			delay: Some(StdDuration::from_millis(50)),
			..Default::default()
		});
		let cache = cache_with(issuer.clone());
		let barrier = Arc::new(Barrier::new(CALLERS));
		let handles = (0..CALLERS)
			.map(|_| {
				let cache = cache.clone();
				let barrier = barrier.clone();

				thread::spawn(move || {
					barrier.wait();

					cache.get_token(Some(AUDIENCE)).expect("Concurrent lookup should succeed.")
				})
			})
			.collect::<Vec<_>>();
		let tokens = handles
			.into_iter()
			.map(|handle| handle.join().expect("Caller thread should not panic."))
			.collect::<Vec<_>>();

		assert_eq!(issuer.calls(), 1);
		assert!(tokens.iter().all(|token| token.expose() == "token-1"));
	}

	#[test]
	fn mixed_blocking_and_async_callers_share_one_refresh() {
		const THREADS: usize = 4;
		const TASKS: usize = 4;

		let issuer = Arc::new(CountingIssuer {
			delay: Some(StdDuration::from_millis(100)),
			..Default::default()
		});
		let cache = cache_with(issuer.clone());
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(2)
			.enable_all()
			.build()
			.expect("Runtime should build.");
		let threads = (0..THREADS)
			.map(|_| {
				let cache = cache.clone();

				thread::spawn(move || cache.get_token(Some(AUDIENCE)))
			})
			.collect::<Vec<_>>();
		let async_tokens = runtime.block_on(async {
			let tasks = (0..TASKS)
				.map(|_| {
					let cache = cache.clone();

					tokio::spawn(async move { cache.get_token_async(Some(AUDIENCE)).await })
				})
				.collect::<Vec<_>>();
			let mut tokens = Vec::new();

			for task in tasks {
				tokens.push(
					task.await
						.expect("Task should not panic.")
						.expect("Async lookup should succeed."),
				);
			}

			tokens
		});
		let mut tokens = threads
			.into_iter()
			.map(|handle| {
				handle
					.join()
					.expect("Caller thread should not panic.")
					.expect("Blocking lookup should succeed.")
			})
			.collect::<Vec<_>>();

		tokens.extend(async_tokens);

		assert_eq!(tokens.len(), THREADS + TASKS);
		assert_eq!(issuer.calls(), 1);
		assert!(tokens.iter().all(|token| token.expose() == "token-1"));
	}

	#[test]
	fn async_lookup_without_runtime_is_reported() {
		let issuer = Arc::new(CountingIssuer::default());
		let cache = cache_with(issuer.clone());
		let future = cache.get_token_async(Some(AUDIENCE));
		let err = block_on_without_runtime(future).expect_err("No runtime must be reported.");

		assert!(matches!(err, Error::Config(ConfigError::MissingRuntime)));
		assert_eq!(issuer.calls(), 0);
	}

	/// Polls a future on the current thread without entering a Tokio runtime.
	fn block_on_without_runtime<F: Future>(future: F) -> F::Output {
		use std::task::{Context, Poll, Wake, Waker};

		struct ThreadWaker(thread::Thread);
		impl Wake for ThreadWaker {
			fn wake(self: Arc<Self>) {
				self.0.unpark();
			}
		}

		let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
		let mut context = Context::from_waker(&waker);
		let mut future = std::pin::pin!(future);

		loop {
			match future.as_mut().poll(&mut context) {
				Poll::Ready(output) => return output,
				Poll::Pending => thread::park(),
			}
		}
	}

	#[test]
	fn global_slot_initializes_once() {
		let first = TokenCache::global_or_init(|| {
			Ok(cache_with(Arc::new(CountingIssuer::default())))
		})
		.expect("Global cache should initialize.");
		let second = TokenCache::global_or_init(|| {
			panic!("Initializer must not run twice.");
		})
		.expect("Global cache should be reused.");

		assert!(Arc::ptr_eq(&first.inner, &second.inner));
		assert!(TokenCache::global().is_some());
	}
}
