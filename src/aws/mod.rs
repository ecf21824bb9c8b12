use crate::*;

pub mod credentials;
pub mod lambda;
pub mod sign;
pub mod sts;

pub use credentials::{AwsConfig, EnvCredentialsProvider, LocalAwsConfig};
pub use lambda::{AwsLambdaFilter, LambdaProtocolOptions, LambdaRouteConfig};
pub use sign::AwsAuthenticator;
pub use sts::{StsContext, StsCredentials, StsCredentialsProvider};

/// Short-lived AWS credentials. Two sets are equal iff all three string
/// fields are equal; expiry is tracked separately where it applies.
#[derive(Clone, Default)]
pub struct Credentials {
	pub access_key_id: String,
	pub secret_access_key: String,
	pub session_token: Option<String>,
}

impl Credentials {
	pub fn new(
		access_key_id: impl Into<String>,
		secret_access_key: impl Into<String>,
		session_token: Option<String>,
	) -> Self {
		Credentials {
			access_key_id: access_key_id.into(),
			secret_access_key: secret_access_key.into(),
			session_token,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.access_key_id.is_empty() && self.secret_access_key.is_empty()
	}
}

impl PartialEq for Credentials {
	fn eq(&self, other: &Self) -> bool {
		self.access_key_id == other.access_key_id
			&& self.secret_access_key == other.secret_access_key
			&& self.session_token == other.session_token
	}
}

impl Eq for Credentials {}

// never log secret material
impl std::fmt::Debug for Credentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Credentials")
			.field("access_key_id", &self.access_key_id)
			.field("secret_access_key", &"<redacted>")
			.field(
				"session_token",
				&self.session_token.as_ref().map(|_| "<redacted>"),
			)
			.finish()
	}
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsError {
	#[error("transport failure or unrecognized response fetching credentials")]
	Network,
	#[error("failed to parse the retrieved STS credential data")]
	InvalidSts,
	#[error("web identity token is expired")]
	ExpiredToken,
	#[error("credential scope does not match the STS region")]
	CredentialScopeMismatch,
	#[error("STS cluster is not configured")]
	ClusterNotFound,
	#[error("credential fetch was cancelled")]
	ContextCancelled,
}
