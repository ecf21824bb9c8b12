use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use arc_swap::ArcSwap;
use notify::Watcher;
use parking_lot::Mutex;
use secrecy::ExposeSecret;

use crate::aws::lambda::LambdaProtocolOptions;
use crate::aws::sts::{
	CredentialsLookup, HttpStsFetcher, StsConfig, StsContext, StsCredentialsProvider, StsFetcher,
};
use crate::aws::{Credentials, CredentialsError};
use crate::telemetry::metrics::AwsStats;
use crate::*;

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const AWS_WEB_IDENTITY_TOKEN_FILE: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";
pub const AWS_ROLE_ARN: &str = "AWS_ROLE_ARN";
pub const AWS_ROLE_SESSION_NAME: &str = "AWS_ROLE_SESSION_NAME";
pub const AWS_REGION: &str = "AWS_REGION";
pub const AWS_STS_REGIONAL_ENDPOINTS: &str = "AWS_STS_REGIONAL_ENDPOINTS";

// The AWS SDKs refresh roughly hourly, or at least 15 minutes before
// expiry; a 14 minute cadence keeps the published credentials fresh.
pub const REFRESH_AWS_CREDS: Duration = Duration::from_secs(14 * 60);

pub trait CredentialsProvider: Send + Sync + 'static {
	fn get_credentials(&self) -> Credentials;
}

/// The environment chain: `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
/// `AWS_SESSION_TOKEN`.
#[derive(Debug, Default)]
pub struct EnvCredentialsProvider;

impl CredentialsProvider for EnvCredentialsProvider {
	fn get_credentials(&self) -> Credentials {
		Credentials::new(
			std::env::var(AWS_ACCESS_KEY_ID).unwrap_or_default(),
			std::env::var(AWS_SECRET_ACCESS_KEY).unwrap_or_default(),
			std::env::var(AWS_SESSION_TOKEN).ok().filter(|t| !t.is_empty()),
		)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalAwsConfig {
	#[serde(default)]
	pub credentials_fetcher: Option<LocalCredentialsFetcher>,
	/// Seconds between web-identity token re-reads; zero disables the timer
	/// (the file watch still applies).
	#[serde(default)]
	pub credential_refresh_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalCredentialsFetcher {
	UseDefaultCredentials {},
	ServiceAccountCredentials {
		/// STS endpoint; defaults to the global (or, with
		/// `AWS_STS_REGIONAL_ENDPOINTS=regional`, the regional) endpoint.
		#[serde(default)]
		uri: Option<String>,
		#[serde(default)]
		timeout_seconds: Option<u64>,
		#[serde(default)]
		region: Option<String>,
	},
}

fn default_sts_uri() -> Strng {
	if std::env::var(AWS_STS_REGIONAL_ENDPOINTS).as_deref() == Ok("regional")
		&& let Ok(region) = std::env::var(AWS_REGION)
		&& !region.is_empty()
	{
		return strng::format!("https://sts.{region}.amazonaws.com/");
	}
	strng::literal!("https://sts.amazonaws.com/")
}

/// Where a signing call gets its credentials from.
pub enum CredentialsSource {
	Ready(Arc<Credentials>),
	Pending(StsContext),
}

/// Filter-level AWS configuration: owns the env-chain refresh loop, the STS
/// provider and its token-file watch, and resolves credentials per request.
pub struct AwsConfig {
	stats: AwsStats,
	provider: Option<Arc<dyn CredentialsProvider>>,
	current: ArcSwap<Credentials>,
	sts: Option<Arc<StsCredentialsProvider>>,
	tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
	watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl AwsConfig {
	pub fn new(local: LocalAwsConfig, stats: AwsStats) -> anyhow::Result<Arc<Self>> {
		Self::with_providers(local, stats, Arc::new(EnvCredentialsProvider), None)
	}

	/// Like `new`, but with injectable providers so tests can drive the
	/// refresh loops deterministically.
	pub fn with_providers(
		local: LocalAwsConfig,
		stats: AwsStats,
		provider: Arc<dyn CredentialsProvider>,
		sts_fetcher: Option<Arc<dyn StsFetcher>>,
	) -> anyhow::Result<Arc<Self>> {
		let mut config = AwsConfig {
			stats,
			provider: None,
			current: ArcSwap::from_pointee(Credentials::default()),
			sts: None,
			tasks: Mutex::new(Vec::new()),
			watcher: Mutex::new(None),
		};

		let mut token_file = None;
		match &local.credentials_fetcher {
			None => {
				// the filter will implicitly use protocol options data
			},
			Some(LocalCredentialsFetcher::UseDefaultCredentials {}) => {
				debug!("using default credentials source");
				config.provider = Some(provider);
			},
			Some(LocalCredentialsFetcher::ServiceAccountCredentials {
				uri,
				timeout_seconds,
				region,
			}) => {
				debug!("using STS credentials source");
				let (file, web_token, role_arn) = load_sts_data()?;
				let sts_config = StsConfig {
					uri: uri
						.as_deref()
						.map(strng::new)
						.unwrap_or_else(default_sts_uri),
					region: region
						.as_deref()
						.map(strng::new)
						.unwrap_or_else(|| StsConfig::default().region),
					timeout: Duration::from_secs(timeout_seconds.unwrap_or(1)),
				};
				let fetcher = sts_fetcher
					.unwrap_or_else(|| Arc::new(HttpStsFetcher::new(sts_config.timeout)));
				config.sts = Some(StsCredentialsProvider::new(
					sts_config,
					fetcher,
					web_token,
					role_arn,
				));
				token_file = Some(file);
			},
		}

		let config = Arc::new(config);
		if config.provider.is_some() {
			// fetch credentials now, then keep them fresh
			config.timer_callback();
			let weak = Arc::downgrade(&config);
			config.tasks.lock().push(tokio::spawn(async move {
				loop {
					tokio::time::sleep(REFRESH_AWS_CREDS).await;
					let Some(config) = weak.upgrade() else {
						break;
					};
					config.timer_callback();
				}
			}));
		}
		if let Some(token_file) = token_file {
			config.init_sts_refresh(
				token_file,
				Duration::from_secs(local.credential_refresh_delay_seconds),
			);
		}
		Ok(config)
	}

	pub fn stats(&self) -> &AwsStats {
		&self.stats
	}

	/// Resolution order: protocol-options inline credentials, then the
	/// environment chain snapshot, then STS.
	pub fn get_credentials(
		&self,
		ext: &LambdaProtocolOptions,
	) -> Result<CredentialsSource, CredentialsError> {
		if let (Some(access_key), Some(secret_key)) = (&ext.access_key, &ext.secret_key) {
			trace!("credentials found from protocol options");
			return Ok(CredentialsSource::Ready(Arc::new(Credentials::new(
				access_key.expose_secret(),
				secret_key.expose_secret(),
				ext
					.session_token
					.as_ref()
					.map(|t| t.expose_secret().to_string()),
			))));
		}
		if self.provider.is_some() {
			trace!("credentials found from default source");
			return Ok(CredentialsSource::Ready(self.current.load_full()));
		}
		if let Some(sts) = &self.sts {
			trace!("credentials being retrieved from STS provider");
			return Ok(match sts.find(ext.role_arn.clone(), ext.disable_role_chaining) {
				CredentialsLookup::Ready(sts_credentials) => {
					CredentialsSource::Ready(Arc::new(sts_credentials.credentials.clone()))
				},
				CredentialsLookup::Pending(context) => CredentialsSource::Pending(context),
			});
		}
		debug!("no valid credentials source found");
		Err(CredentialsError::InvalidSts)
	}

	/// One refresh pass of the environment chain. An empty fetch keeps the
	/// last good credentials and is only counted.
	pub(crate) fn timer_callback(&self) {
		let Some(provider) = &self.provider else {
			return;
		};
		let new_creds = provider.get_credentials();
		if new_creds == Credentials::default() {
			self.stats.fetch_failed.inc();
			self.stats.current_state.set(0);
			warn!(
				"can't get AWS credentials - credentials will not be refreshed and requests to AWS may fail"
			);
			return;
		}
		self.stats.fetch_success.inc();
		self.stats.current_state.set(1);
		if **self.current.load() != new_creds {
			self.stats.creds_rotated.inc();
			debug!("refreshing AWS credentials");
			self.current.store(Arc::new(new_creds));
		}
	}

	/// Re-read the web identity token and push it to the STS provider.
	pub(crate) fn refresh_web_token(&self, token_file: &Path) {
		match std::fs::read_to_string(token_file) {
			Ok(web_token) => {
				self.stats.webtoken_rotated.inc();
				// enforced non-empty at start up, more lenient here
				if web_token.is_empty() {
					self.stats.webtoken_failure.inc();
				} else if let Some(sts) = &self.sts {
					sts.set_web_token(web_token);
				}
			},
			Err(e) => {
				warn!(
					"exception while reading web token file ({}): {e}",
					token_file.display()
				);
			},
		}
	}

	fn init_sts_refresh(self: &Arc<Self>, token_file: PathBuf, refresh_delay: Duration) {
		// the file watch should be sufficient, but calls have been observed
		// to be dropped when the token is self managed, so a timer backs it up
		if !refresh_delay.is_zero() {
			debug!("STS enabled with {refresh_delay:?} time refresh");
			let weak = Arc::downgrade(self);
			let file = token_file.clone();
			self.tasks.lock().push(tokio::spawn(async move {
				loop {
					tokio::time::sleep(refresh_delay).await;
					let Some(config) = weak.upgrade() else {
						break;
					};
					config.refresh_web_token(&file);
				}
			}));
		} else {
			debug!("STS enabled without time based refresh");
		}

		let weak = Arc::downgrade(self);
		let file = token_file.clone();
		match notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
			if let Ok(event) = event
				&& event.kind.is_modify()
				&& let Some(config) = weak.upgrade()
			{
				config.refresh_web_token(&file);
			}
		}) {
			Ok(mut watcher) => {
				if let Err(e) = watcher.watch(&token_file, notify::RecursiveMode::NonRecursive) {
					warn!("failed to watch web token file {}: {e}", token_file.display());
				}
				*self.watcher.lock() = Some(watcher);
			},
			Err(e) => warn!("failed to create web token file watcher: {e}"),
		}
	}
}

impl Drop for AwsConfig {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

fn load_sts_data() -> anyhow::Result<(PathBuf, String, Strng)> {
	let token_file = std::env::var(AWS_WEB_IDENTITY_TOKEN_FILE)
		.ok()
		.filter(|v| !v.is_empty())
		.ok_or_else(|| anyhow!("env var {AWS_WEB_IDENTITY_TOKEN_FILE} must be present, and set"))?;
	let role_arn = std::env::var(AWS_ROLE_ARN)
		.ok()
		.filter(|v| !v.is_empty())
		.ok_or_else(|| anyhow!("env var {AWS_ROLE_ARN} must be present, and set"))?;
	let path = PathBuf::from(&token_file);
	let web_token = std::fs::read_to_string(&path)
		.map_err(|e| anyhow!("web token file {token_file} does not exist: {e}"))?;
	if web_token.is_empty() {
		bail!("web token file {token_file} exists but is empty");
	}
	Ok((path, web_token, strng::new(role_arn)))
}

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;
