pub mod aws;
pub mod http;
pub mod strng;
pub mod telemetry;

// Common imports, available to the rest of the crate via `use crate::*`.
pub use std::collections::HashMap;
pub use std::sync::Arc;
pub use std::time::{Duration, SystemTime};

pub use bytes::Bytes;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::strng::Strng;
