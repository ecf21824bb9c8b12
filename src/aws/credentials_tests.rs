use parking_lot::Mutex;

use super::*;
use crate::*;
use crate::telemetry::metrics::AwsStats;

struct SwitchableProvider {
	credentials: Mutex<Credentials>,
}

impl SwitchableProvider {
	fn new(credentials: Credentials) -> Arc<Self> {
		Arc::new(SwitchableProvider {
			credentials: Mutex::new(credentials),
		})
	}

	fn set(&self, credentials: Credentials) {
		*self.credentials.lock() = credentials;
	}
}

impl CredentialsProvider for SwitchableProvider {
	fn get_credentials(&self) -> Credentials {
		self.credentials.lock().clone()
	}
}

fn default_chain_config() -> LocalAwsConfig {
	serde_yaml::from_str("credentialsFetcher:\n  useDefaultCredentials: {}\n").unwrap()
}

fn protocol_options(yaml: &str) -> LambdaProtocolOptions {
	serde_yaml::from_str(yaml).unwrap()
}

fn bare_options() -> LambdaProtocolOptions {
	protocol_options("host: lambda.us-east-1.amazonaws.com\nregion: us-east-1\n")
}

#[tokio::test]
async fn fetches_credentials_at_startup() {
	let provider = SwitchableProvider::new(Credentials::new("AKIA1", "secret", None));
	let config = AwsConfig::with_providers(
		default_chain_config(),
		AwsStats::default(),
		provider,
		None,
	)
	.unwrap();

	assert_eq!(config.stats().fetch_success.get(), 1);
	assert_eq!(config.stats().creds_rotated.get(), 1);
	assert_eq!(config.stats().current_state.get(), 1);
	let CredentialsSource::Ready(creds) = config.get_credentials(&bare_options()).unwrap() else {
		panic!("chain credentials are synchronous");
	};
	assert_eq!(creds.access_key_id, "AKIA1");
}

#[tokio::test]
async fn failed_refresh_keeps_the_last_good_credentials() {
	let provider = SwitchableProvider::new(Credentials::new("AKIA1", "secret", None));
	let config = AwsConfig::with_providers(
		default_chain_config(),
		AwsStats::default(),
		provider.clone(),
		None,
	)
	.unwrap();

	// second tick returns nothing
	provider.set(Credentials::default());
	config.timer_callback();

	assert_eq!(config.stats().fetch_failed.get(), 1);
	assert_eq!(config.stats().current_state.get(), 0);
	// no rotation beyond the initial one
	assert_eq!(config.stats().creds_rotated.get(), 1);
	let CredentialsSource::Ready(creds) = config.get_credentials(&bare_options()).unwrap() else {
		panic!();
	};
	assert_eq!(creds.access_key_id, "AKIA1");
}

#[tokio::test]
async fn unchanged_credentials_do_not_rotate() {
	let provider = SwitchableProvider::new(Credentials::new("AKIA1", "secret", None));
	let config = AwsConfig::with_providers(
		default_chain_config(),
		AwsStats::default(),
		provider,
		None,
	)
	.unwrap();
	config.timer_callback();
	assert_eq!(config.stats().fetch_success.get(), 2);
	assert_eq!(config.stats().creds_rotated.get(), 1);
}

#[tokio::test]
async fn inline_protocol_options_win() {
	let provider = SwitchableProvider::new(Credentials::new("FROM_CHAIN", "secret", None));
	let config = AwsConfig::with_providers(
		default_chain_config(),
		AwsStats::default(),
		provider,
		None,
	)
	.unwrap();
	let options = protocol_options(
		r#"
host: lambda.us-east-1.amazonaws.com
region: us-east-1
accessKey: INLINE
secretKey: inline-secret
sessionToken: inline-token
"#,
	);
	let CredentialsSource::Ready(creds) = config.get_credentials(&options).unwrap() else {
		panic!();
	};
	assert_eq!(creds.access_key_id, "INLINE");
	assert_eq!(creds.secret_access_key, "inline-secret");
	assert_eq!(creds.session_token.as_deref(), Some("inline-token"));
}

#[tokio::test]
async fn no_source_at_all_is_invalid() {
	let config = AwsConfig::with_providers(
		LocalAwsConfig::default(),
		AwsStats::default(),
		Arc::new(EnvCredentialsProvider),
		None,
	)
	.unwrap();
	assert_eq!(
		config.get_credentials(&bare_options()).err(),
		Some(CredentialsError::InvalidSts)
	);
}

#[test]
fn credentials_equality_ignores_nothing() {
	let a = Credentials::new("k", "s", Some("t".to_string()));
	let b = Credentials::new("k", "s", Some("t".to_string()));
	let c = Credentials::new("k", "s", None);
	assert_eq!(a, b);
	assert_ne!(a, c);
}

#[test]
fn debug_output_redacts_secrets() {
	let creds = Credentials::new("AKIA", "super-secret", Some("tok".to_string()));
	let debug = format!("{creds:?}");
	assert!(!debug.contains("super-secret"));
	assert!(!debug.contains("tok"));
}
