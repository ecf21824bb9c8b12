use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::oneshot;

use crate::aws::sign::{AwsAuthenticator, HeaderList, SERVICE_STS, create_header_list};
use crate::aws::{Credentials, CredentialsError};
use crate::http::{HeaderValue, header};
use crate::*;

/// Cached credentials within this window of their expiry are treated as
/// already stale and refetched.
pub const REFRESH_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// AssumeRoleWithWebIdentity issues credentials with a minimum lifespan of
/// 15 minutes; when the response carries no parseable expiration we assume
/// two thirds of that.
pub const DEFAULT_STS_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Region used to sign the chained AssumeRole call unless overridden.
pub const DEFAULT_CHAINED_REGION: &str = "us-east-1";

const STS_API_VERSION: &str = "2011-06-15";
const EXPIRED_TOKEN_ERROR: &str = "ExpiredTokenException";
const SIGNATURE_MISMATCH_ERROR: &str = "SignatureDoesNotMatch";

static REGEX_ACCESS_KEY: Lazy<Regex> =
	Lazy::new(|| Regex::new("<AccessKeyId>(.*?)</AccessKeyId>").expect("static regex"));
static REGEX_SECRET_KEY: Lazy<Regex> =
	Lazy::new(|| Regex::new("<SecretAccessKey>(.*?)</SecretAccessKey>").expect("static regex"));
static REGEX_SESSION_TOKEN: Lazy<Regex> =
	Lazy::new(|| Regex::new("<SessionToken>(.*?)</SessionToken>").expect("static regex"));
static REGEX_EXPIRATION: Lazy<Regex> =
	Lazy::new(|| Regex::new("<Expiration>(.*?)</Expiration>").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StsCredentials {
	pub credentials: Credentials,
	pub expiration: SystemTime,
}

impl StsCredentials {
	pub fn fresh_at(&self, now: SystemTime) -> bool {
		self
			.expiration
			.duration_since(now)
			.map(|left| left > REFRESH_GRACE_PERIOD)
			.unwrap_or(false)
	}
}

/// Extract credentials from an AssumeRole* XML response. Any missing field
/// is an InvalidSts failure; an unparseable expiration falls back to
/// `now + DEFAULT_STS_LIFETIME`.
pub fn parse_sts_response(body: &str, now: SystemTime) -> Result<StsCredentials, CredentialsError> {
	let field = |re: &Regex, name: &str| -> Result<String, CredentialsError> {
		re.captures(body)
			.and_then(|c| c.get(1))
			.map(|m| m.as_str().to_string())
			.ok_or_else(|| {
				trace!("response body did not contain {name}");
				CredentialsError::InvalidSts
			})
	};
	let access_key = field(&REGEX_ACCESS_KEY, "AccessKeyId")?;
	let secret_key = field(&REGEX_SECRET_KEY, "SecretAccessKey")?;
	let session_token = field(&REGEX_SESSION_TOKEN, "SessionToken")?;
	let expiration = field(&REGEX_EXPIRATION, "Expiration")?;

	let expiration = match DateTime::parse_from_rfc3339(&expiration) {
		Ok(t) => SystemTime::from(t.with_timezone(&Utc)),
		Err(e) => {
			trace!("unable to determine expiration time from STS result ({e}), using default");
			now + DEFAULT_STS_LIFETIME
		},
	};
	Ok(StsCredentials {
		credentials: Credentials::new(access_key, secret_key, Some(session_token)),
		expiration,
	})
}

#[derive(Debug, Clone)]
pub struct StsFetchRequest {
	pub uri: Strng,
	pub role_arn: Strng,
	pub kind: StsFetchKind,
}

#[derive(Debug, Clone)]
pub enum StsFetchKind {
	/// AssumeRoleWithWebIdentity with the mounted service account token.
	WebIdentity { web_token: Strng },
	/// AssumeRole for a chained role, signed with the base credentials.
	Chained {
		base: Arc<StsCredentials>,
		region: Strng,
	},
}

/// One outstanding credentials fetch at a time; implementations are stubbed
/// in tests.
#[async_trait::async_trait]
pub trait StsFetcher: Send + Sync + 'static {
	async fn fetch(&self, request: StsFetchRequest) -> Result<StsCredentials, CredentialsError>;
}

/// Talks to the STS endpoint over HTTP.
pub struct HttpStsFetcher {
	client: reqwest::Client,
	timeout: Duration,
}

impl HttpStsFetcher {
	pub fn new(timeout: Duration) -> Self {
		HttpStsFetcher {
			client: reqwest::Client::new(),
			timeout,
		}
	}

	fn session_name() -> String {
		std::env::var(crate::aws::credentials::AWS_ROLE_SESSION_NAME)
			.ok()
			.filter(|v| !v.is_empty())
			.unwrap_or_else(|| Utc::now().timestamp_millis().to_string())
	}

	fn classify_response(status: u16, body: &str) -> CredentialsError {
		if (400..=403).contains(&status) && !body.is_empty() {
			if body.contains(EXPIRED_TOKEN_ERROR) {
				return CredentialsError::ExpiredToken;
			}
			if body.contains(SIGNATURE_MISMATCH_ERROR)
				|| body.contains("Credential should be scoped to a valid region")
			{
				return CredentialsError::CredentialScopeMismatch;
			}
		}
		CredentialsError::Network
	}
}

#[async_trait::async_trait]
impl StsFetcher for HttpStsFetcher {
	async fn fetch(&self, request: StsFetchRequest) -> Result<StsCredentials, CredentialsError> {
		let (body, extra_headers) = match &request.kind {
			StsFetchKind::WebIdentity { web_token } => {
				let body = serde_urlencoded::to_string([
					("Action", "AssumeRoleWithWebIdentity"),
					("Version", STS_API_VERSION),
					("RoleArn", request.role_arn.as_str()),
					("RoleSessionName", Self::session_name().as_str()),
					("WebIdentityToken", web_token.as_str()),
				])
				.map_err(|_| CredentialsError::InvalidSts)?;
				(body, None)
			},
			StsFetchKind::Chained { base, region } => {
				let body = serde_urlencoded::to_string([
					("Action", "AssumeRole"),
					("Version", STS_API_VERSION),
					("RoleArn", request.role_arn.as_str()),
					("RoleSessionName", Self::session_name().as_str()),
				])
				.map_err(|_| CredentialsError::InvalidSts)?;
				let headers = sign_chained_request(&request.uri, &body, base, region)?;
				(body, Some(headers))
			},
		};

		debug!("assume role with token from [uri = {}]: start", request.uri);
		let mut req = self
			.client
			.post(request.uri.as_str())
			.timeout(self.timeout)
			.header(
				header::CONTENT_TYPE,
				"application/x-www-form-urlencoded",
			);
		if let Some(headers) = extra_headers {
			req = req.headers(headers);
		}
		let response = req.body(body).send().await.map_err(|e| {
			debug!("assume role with token [uri = {}]: network error {e}", request.uri);
			CredentialsError::Network
		})?;

		let status = response.status().as_u16();
		let text = response.text().await.map_err(|_| CredentialsError::Network)?;
		if status == 200 {
			if text.is_empty() {
				debug!("assume role with token [uri = {}]: body is empty", request.uri);
				return Err(CredentialsError::Network);
			}
			return parse_sts_response(&text, SystemTime::now());
		}
		debug!(
			"assume role with token [uri = {}]: response status code {status}",
			request.uri
		);
		Err(Self::classify_response(status, &text))
	}
}

// SigV4-sign the chained AssumeRole call with the base role's credentials.
fn sign_chained_request(
	uri: &str,
	body: &str,
	base: &StsCredentials,
	region: &str,
) -> Result<crate::http::HeaderMap, CredentialsError> {
	let parsed: crate::http::Uri = uri.parse().map_err(|_| CredentialsError::ClusterNotFound)?;
	let request = ::http::Request::builder()
		.method(crate::http::Method::POST)
		.uri(parsed)
		.body(())
		.map_err(|_| CredentialsError::ClusterNotFound)?;
	let (mut parts, _) = request.into_parts();
	parts.headers.insert(
		header::CONTENT_TYPE,
		HeaderValue::from_static("application/x-www-form-urlencoded"),
	);
	if let Some(authority) = parts.uri.authority()
		&& let Ok(value) = HeaderValue::from_str(authority.as_str())
	{
		parts.headers.insert(header::HOST, value);
	}

	let mut authenticator = AwsAuthenticator::new(SERVICE_STS);
	authenticator.init(
		&base.credentials.access_key_id,
		&base.credentials.secret_access_key,
		base.credentials.session_token.as_deref(),
	);
	authenticator.update_payload_hash(body.as_bytes());
	let headers_to_sign: HeaderList = create_header_list(["content-type", "host"]);
	authenticator.sign(&mut parts, &headers_to_sign, region);
	Ok(parts.headers)
}

struct Waiter {
	id: u64,
	tx: oneshot::Sender<Result<Arc<StsCredentials>, CredentialsError>>,
}

#[derive(Default)]
struct Pool {
	in_flight: bool,
	waiters: Vec<Waiter>,
	// chained roles waiting on this (default) pool's result
	chained: Vec<Strng>,
}

#[derive(Default)]
struct ProviderInner {
	cache: HashMap<Strng, Arc<StsCredentials>>,
	pools: HashMap<Strng, Pool>,
	next_context_id: u64,
}

/// A cancel-safe handle for one parked credentials lookup. Dropping or
/// cancelling it unlinks the waiter from its pool, after which no callback
/// can ever be observed; cancelling a completed context is a no-op.
pub struct StsContext {
	id: u64,
	role_arn: Strng,
	rx: Option<oneshot::Receiver<Result<Arc<StsCredentials>, CredentialsError>>>,
	inner: std::sync::Weak<Mutex<ProviderInner>>,
}

impl StsContext {
	pub async fn wait(mut self) -> Result<Arc<StsCredentials>, CredentialsError> {
		let Some(rx) = self.rx.take() else {
			return Err(CredentialsError::ContextCancelled);
		};
		rx.await.unwrap_or(Err(CredentialsError::ContextCancelled))
	}

	pub fn cancel(&mut self) {
		self.rx = None;
		if let Some(inner) = self.inner.upgrade() {
			let mut inner = inner.lock();
			if let Some(pool) = inner.pools.get_mut(&self.role_arn) {
				pool.waiters.retain(|w| w.id != self.id);
			}
		}
	}
}

impl Drop for StsContext {
	fn drop(&mut self) {
		self.cancel();
	}
}

pub enum CredentialsLookup {
	/// Fresh cached credentials, delivered synchronously.
	Ready(Arc<StsCredentials>),
	/// A fetch is under way; await the context.
	Pending(StsContext),
}

#[derive(Debug, Clone)]
pub struct StsConfig {
	/// The STS endpoint URI, e.g. `https://sts.amazonaws.com/`.
	pub uri: Strng,
	/// Region used to sign chained AssumeRole calls.
	pub region: Strng,
	/// Inherited by the fetch HTTP requests.
	pub timeout: Duration,
}

impl Default for StsConfig {
	fn default() -> Self {
		StsConfig {
			uri: strng::literal!("https://sts.amazonaws.com/"),
			region: strng::literal!("us-east-1"),
			timeout: Duration::from_secs(1),
		}
	}
}

/// Resolves credentials per role via STS, with a per-role cache, one
/// in-flight fetch per role, and role chaining through the default role.
pub struct StsCredentialsProvider {
	config: StsConfig,
	default_role_arn: Strng,
	web_token: ArcSwap<String>,
	fetcher: Arc<dyn StsFetcher>,
	inner: Arc<Mutex<ProviderInner>>,
}

impl StsCredentialsProvider {
	pub fn new(
		config: StsConfig,
		fetcher: Arc<dyn StsFetcher>,
		web_token: impl Into<String>,
		default_role_arn: Strng,
	) -> Arc<Self> {
		Arc::new(StsCredentialsProvider {
			config,
			default_role_arn,
			web_token: ArcSwap::from_pointee(web_token.into()),
			fetcher,
			inner: Default::default(),
		})
	}

	/// Pushed from the config layer whenever the token file rotates.
	pub fn set_web_token(&self, web_token: impl Into<String>) {
		self.web_token.store(Arc::new(web_token.into()));
	}

	pub fn default_role_arn(&self) -> &Strng {
		&self.default_role_arn
	}

	/// Find credentials for `role_arn` (default role when `None`).
	///
	/// A cache hit is only returned while outside the refresh grace period;
	/// otherwise the caller joins (or starts) the in-flight fetch for that
	/// role. Chained roles ride on fresh default-role credentials, or
	/// register as dependents of the default pool when those are missing or
	/// stale.
	pub fn find(
		self: &Arc<Self>,
		role_arn: Option<Strng>,
		disable_role_chaining: bool,
	) -> CredentialsLookup {
		let role_arn = role_arn.unwrap_or_else(|| self.default_role_arn.clone());
		let now = SystemTime::now();
		let mut inner = self.inner.lock();

		if let Some(cached) = inner.cache.get(&role_arn)
			&& cached.fresh_at(now)
		{
			return CredentialsLookup::Ready(cached.clone());
		}

		trace!("attempting to assume role ({role_arn})");
		let in_flight = inner
			.pools
			.entry(role_arn.clone())
			.or_default()
			.in_flight;
		if in_flight {
			return CredentialsLookup::Pending(self.add_waiter(&mut inner, role_arn));
		}

		if role_arn == self.default_role_arn || disable_role_chaining {
			self.mark_in_flight(&mut inner, &role_arn);
			let ctx = self.add_waiter(&mut inner, role_arn.clone());
			self.start_web_identity_fetch(role_arn);
			return CredentialsLookup::Pending(ctx);
		}

		// chained role: fresh base credentials let us fetch right away
		let base = inner.cache.get(&self.default_role_arn).cloned();
		if let Some(base) = base
			&& base.fresh_at(now)
		{
			trace!("found base credentials with remaining time");
			self.mark_in_flight(&mut inner, &role_arn);
			let ctx = self.add_waiter(&mut inner, role_arn.clone());
			self.start_chained_fetch(role_arn, base);
			return CredentialsLookup::Pending(ctx);
		}

		// base credentials are missing or stale: the chained pool is marked
		// in flight without fetching and triggers once the base resolves
		self.mark_in_flight(&mut inner, &role_arn);
		let ctx = self.add_waiter(&mut inner, role_arn.clone());
		let base_pool = inner.pools.entry(self.default_role_arn.clone()).or_default();
		base_pool.chained.push(role_arn);
		if !base_pool.in_flight {
			base_pool.in_flight = true;
			self.start_web_identity_fetch(self.default_role_arn.clone());
		}
		CredentialsLookup::Pending(ctx)
	}

	fn mark_in_flight(&self, inner: &mut ProviderInner, role_arn: &Strng) {
		if let Some(pool) = inner.pools.get_mut(role_arn) {
			pool.in_flight = true;
		}
	}

	fn add_waiter(&self, inner: &mut ProviderInner, role_arn: Strng) -> StsContext {
		let id = inner.next_context_id;
		inner.next_context_id += 1;
		let (tx, rx) = oneshot::channel();
		if let Some(pool) = inner.pools.get_mut(&role_arn) {
			pool.waiters.push(Waiter { id, tx });
		}
		StsContext {
			id,
			role_arn,
			rx: Some(rx),
			inner: Arc::downgrade(&self.inner),
		}
	}

	fn start_web_identity_fetch(self: &Arc<Self>, role_arn: Strng) {
		let request = StsFetchRequest {
			uri: self.config.uri.clone(),
			role_arn: role_arn.clone(),
			kind: StsFetchKind::WebIdentity {
				web_token: strng::new(self.web_token.load().as_str()),
			},
		};
		self.spawn_fetch(role_arn, request);
	}

	fn start_chained_fetch(self: &Arc<Self>, role_arn: Strng, base: Arc<StsCredentials>) {
		trace!("calling sts chained for {role_arn}");
		let request = StsFetchRequest {
			uri: self.config.uri.clone(),
			role_arn: role_arn.clone(),
			kind: StsFetchKind::Chained {
				base,
				region: self.config.region.clone(),
			},
		};
		self.spawn_fetch(role_arn, request);
	}

	fn spawn_fetch(self: &Arc<Self>, role_arn: Strng, request: StsFetchRequest) {
		let provider = self.clone();
		tokio::spawn(async move {
			let result = provider.fetcher.fetch(request).await;
			provider.on_result(role_arn, result);
		});
	}

	/// Store the result, satisfy every waiter, and kick off any chained
	/// fetches that were parked on this role.
	fn on_result(self: &Arc<Self>, role_arn: Strng, result: Result<StsCredentials, CredentialsError>) {
		let mut chained_to_start = Vec::new();
		{
			let mut inner = self.inner.lock();
			match result {
				Ok(credentials) => {
					trace!("sts connection success for {role_arn}");
					let credentials = Arc::new(credentials);
					inner.cache.insert(role_arn.clone(), credentials.clone());
					if let Some(pool) = inner.pools.get_mut(&role_arn) {
						pool.in_flight = false;
						for waiter in pool.waiters.drain(..) {
							let _ = waiter.tx.send(Ok(credentials.clone()));
						}
						for chained_role in pool.chained.drain(..) {
							chained_to_start.push((chained_role, credentials.clone()));
						}
					}
				},
				Err(error) => {
					let mut dependent_failures = Vec::new();
					if let Some(pool) = inner.pools.get_mut(&role_arn) {
						pool.in_flight = false;
						for waiter in pool.waiters.drain(..) {
							let _ = waiter.tx.send(Err(error));
						}
						dependent_failures = pool.chained.drain(..).collect();
					}
					// chained dependents cannot proceed without the base role
					for chained_role in dependent_failures {
						if let Some(pool) = inner.pools.get_mut(&chained_role) {
							pool.in_flight = false;
							for waiter in pool.waiters.drain(..) {
								let _ = waiter.tx.send(Err(error));
							}
						}
					}
				},
			}
		}
		for (chained_role, base) in chained_to_start {
			self.start_chained_fetch(chained_role, base);
		}
	}

	#[cfg(test)]
	pub(crate) fn complete_for_tests(self: &Arc<Self>, role_arn: Strng, credentials: StsCredentials) {
		self.on_result(role_arn, Ok(credentials));
	}

	#[cfg(test)]
	fn cached(&self, role_arn: &Strng) -> Option<Arc<StsCredentials>> {
		self.inner.lock().cache.get(role_arn).cloned()
	}

	#[cfg(test)]
	fn pool_state(&self, role_arn: &Strng) -> Option<(bool, usize, usize)> {
		let inner = self.inner.lock();
		inner
			.pools
			.get(role_arn)
			.map(|p| (p.in_flight, p.waiters.len(), p.chained.len()))
	}
}

impl Drop for StsCredentialsProvider {
	fn drop(&mut self) {
		// every outstanding context hears about the teardown
		let mut inner = self.inner.lock();
		for (_, pool) in inner.pools.iter_mut() {
			for waiter in pool.waiters.drain(..) {
				let _ = waiter.tx.send(Err(CredentialsError::ContextCancelled));
			}
		}
	}
}

#[cfg(test)]
#[path = "sts_tests.rs"]
mod tests;
