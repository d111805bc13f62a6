// std
use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};
// crates.io
use httpmock::prelude::*;
use oauth2::{
	HttpRequest,
	http::{Method, Request},
};
// self
use iap_auth::{
	IapAuth, Result, TokenCache,
	audience::StaticAudience,
	auth::{Audience, TokenSecret},
	credential::StaticCredentials,
	http::{ReqwestBlockingHttpClient, ReqwestHttpClient},
	issuer::IdentityTokenIssuer,
};

/// Mints `id-1`, `id-2`, ... so each refresh is observable on the wire.
#[derive(Default)]
struct NumberedIssuer {
	calls: AtomicUsize,
}
impl IdentityTokenIssuer for NumberedIssuer {
	fn issue(&self, _access_token: &TokenSecret, _audience: &Audience) -> Result<TokenSecret> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

		Ok(TokenSecret::new(format!("id-{call}")))
	}
}

fn authenticator(header_name: &str) -> (IapAuth, Arc<NumberedIssuer>) {
	let issuer = Arc::new(NumberedIssuer::default());
	let audience =
		Audience::new("client-1.apps.googleusercontent.com").expect("Audience should be valid.");
	let cache = TokenCache::new(
		Arc::new(StaticCredentials::new("ya29.static")),
		Arc::new(StaticAudience::new(audience)),
		issuer.clone(),
	);
	let auth = IapAuth::new(cache, header_name).expect("Header name should be valid.");

	(auth, issuer)
}

fn get(server: &MockServer, path: &str) -> HttpRequest {
	Request::builder()
		.method(Method::GET)
		.uri(server.url(path))
		.body(Vec::new())
		.expect("Request should build.")
}

#[test]
fn stale_token_is_replaced_after_one_rejection() {
	let server = MockServer::start();
	let rejected = server.mock(|when, then| {
		when.method(GET).path("/api/flows").header("authorization", "Bearer id-1");
		then.status(401).body("token expired");
	});
	let accepted = server.mock(|when, then| {
		when.method(GET).path("/api/flows").header("authorization", "Bearer id-2");
		then.status(200).body("[]");
	});
	let (auth, issuer) = authenticator("Authorization");
	let transport = ReqwestBlockingHttpClient::new().expect("Blocking client should build.");
	let response =
		auth.send(&transport, get(&server, "/api/flows")).expect("Request should complete.");

	assert_eq!(response.status(), 200);
	assert_eq!(response.body(), b"[]");
	assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
	assert_eq!(auth.cache().metrics().invalidations(), 1);

	rejected.assert_calls(1);
	accepted.assert_calls(1);

	let response =
		auth.send(&transport, get(&server, "/api/flows")).expect("Request should complete.");

	assert_eq!(response.status(), 200);
	assert_eq!(issuer.calls.load(Ordering::SeqCst), 2, "Fresh token must be reused.");

	accepted.assert_calls(2);
}

#[test]
fn repeated_rejection_is_returned_after_one_retry() {
	let server = MockServer::start();
	let rejected = server.mock(|when, then| {
		when.method(GET).path("/api/flows");
		then.status(401).body("denied");
	});
	let (auth, issuer) = authenticator("Authorization");
	let transport = ReqwestBlockingHttpClient::new().expect("Blocking client should build.");
	let response =
		auth.send(&transport, get(&server, "/api/flows")).expect("Second 401 should be returned.");

	assert_eq!(response.status(), 401);
	assert_eq!(response.body(), b"denied");
	assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);

	rejected.assert_calls(2);
}

#[test]
fn custom_header_name_carries_the_token() {
	let server = MockServer::start();
	let mock = server.mock(|when, then| {
		when.method(GET).path("/health").header("x-iap-authorization", "Bearer id-1");
		then.status(204);
	});
	let (auth, _) = authenticator("X-IAP-Authorization");
	let transport = ReqwestBlockingHttpClient::new().expect("Blocking client should build.");
	let response =
		auth.send(&transport, get(&server, "/health")).expect("Request should complete.");

	assert_eq!(response.status(), 204);

	mock.assert_calls(1);
}

#[tokio::test]
async fn async_flow_retries_once_on_rejection() {
	let server = MockServer::start_async().await;
	let rejected = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/deployments").header("authorization", "Bearer id-1");
			then.status(401);
		})
		.await;
	let accepted = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/deployments")
				.header("authorization", "Bearer id-2")
				.body(r#"{"name":"etl"}"#);
			then.status(201).body(r#"{"id":"d-1"}"#);
		})
		.await;
	let (auth, issuer) = authenticator("Authorization");
	let request = Request::builder()
		.method(Method::POST)
		.uri(server.url("/api/deployments"))
		.header("content-type", "application/json")
		.body(br#"{"name":"etl"}"#.to_vec())
		.expect("Request should build.");
	let response = auth
		.send_async(&ReqwestHttpClient::default(), request)
		.await
		.expect("Async request should complete.");

	assert_eq!(response.status(), 201);
	assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);

	rejected.assert_calls_async(1).await;
	accepted.assert_calls_async(1).await;
}
