use crate::types::{QueryRetrieveRoot, AE};
use crate::DEFAULT_AET;

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub logging: LoggingConfig,
	#[serde(default)]
	pub http: HttpConfig,
	#[serde(default)]
	pub dicom: DicomConfig,
	#[serde(default)]
	pub pacs: PacsConfig,
}

impl AppConfig {
	/// Loads the application configuration from the following sources:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `config.yaml` in the working directory
	/// 3. Environment variables, prefixed with `DICOM_RELAY`
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		let config: Self = Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("DICOM_RELAY").separator("_"))
			.build()?
			.try_deserialize()?;
		config
			.validate()
			.map_err(|err| config::ConfigError::Message(err.to_string()))?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), NodeError> {
		let defaults = self
			.pacs
			.nodes
			.iter()
			.filter(|node| node.is_default)
			.count();
		if defaults > 1 {
			return Err(NodeError::MultipleDefaults);
		}
		for node in &self.pacs.nodes {
			let duplicates = self
				.pacs
				.nodes
				.iter()
				.filter(|other| other.name == node.name)
				.count();
			if duplicates > 1 {
				return Err(NodeError::DuplicateName(node.name.clone()));
			}
		}
		Ok(())
	}

	/// Resolves a PACS node by name, or the default node if no name is
	/// given.
	pub fn node(&self, name: Option<&str>) -> Result<&PacsNodeConfig, NodeError> {
		match name {
			Some(name) => self
				.pacs
				.nodes
				.iter()
				.find(|node| node.name == name)
				.ok_or_else(|| NodeError::Unknown(name.to_string())),
			None => self
				.pacs
				.nodes
				.iter()
				.find(|node| node.is_default)
				.ok_or(NodeError::NoDefault),
		}
	}
}

/// Invalid or missing PACS node configuration; surfaced to HTTP callers
/// as 400 Bad Request.
#[derive(Debug, Error)]
pub enum NodeError {
	#[error("Unknown PACS node '{0}'")]
	Unknown(String),
	#[error("No default PACS node is configured")]
	NoDefault,
	#[error("More than one PACS node is marked as default")]
	MultipleDefaults,
	#[error("Duplicate PACS node name '{0}'")]
	DuplicateName(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpConfig {
	pub interface: IpAddr,
	pub port: u16,
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 8080,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomConfig {
	#[serde(default)]
	pub local: LocalAeConfig,
	#[serde(default)]
	pub cache: CacheConfig,
	#[serde(default)]
	pub retrieve: RetrieveConfig,
}

/// The local application entity: what the Storage-SCP binds to and what
/// remote PACS nodes must have registered for C-MOVE to reach us.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalAeConfig {
	pub ae_title: AE,
	pub bind_address: IpAddr,
	/// Hostname registered on remote PACS nodes as the C-MOVE callback
	/// target.
	pub public_hostname: String,
	pub port: u16,
}

impl Default for LocalAeConfig {
	fn default() -> Self {
		Self {
			ae_title: AE::from(DEFAULT_AET),
			bind_address: IpAddr::from([0, 0, 0, 0]),
			public_hostname: String::from("localhost"),
			port: 11112,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
	pub path: PathBuf,
	pub retention_days: u32,
	pub max_size_gb: u64,
	/// Schedule of the age-based retention sweep.
	pub cleanup_cron: String,
	/// Schedule of the size-based LRU eviction sweep.
	pub size_cron: String,
}

impl CacheConfig {
	pub const fn max_size_bytes(&self) -> u64 {
		self.max_size_gb * 1024 * 1024 * 1024
	}

	pub const fn retention(&self) -> Duration {
		Duration::from_secs(self.retention_days as u64 * 24 * 60 * 60)
	}
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			path: PathBuf::from("./cache"),
			retention_days: 30,
			max_size_gb: 50,
			cleanup_cron: String::from("0 0 2 * * *"),
			size_cron: String::from("0 0 * * * *"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrieveConfig {
	/// Try C-GET before falling back to C-MOVE.
	pub prefer_c_get: bool,
	/// Fall back to C-MOVE on a recoverable C-GET failure.
	pub fallback_to_c_move: bool,
}

impl Default for RetrieveConfig {
	fn default() -> Self {
		Self {
			prefer_c_get: true,
			fallback_to_c_move: true,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PacsConfig {
	#[serde(default)]
	pub nodes: Vec<PacsNodeConfig>,
}

/// A remote PACS node. Immutable per record and keyed by `name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PacsNodeConfig {
	pub name: String,
	pub ae_title: AE,
	pub hostname: String,
	pub port: u16,
	#[serde(default = "PacsNodeConfig::default_connection_timeout")]
	pub connection_timeout: u64,
	#[serde(default = "PacsNodeConfig::default_response_timeout")]
	pub response_timeout: u64,
	#[serde(default = "PacsNodeConfig::default_association_timeout")]
	pub association_timeout: u64,
	#[serde(default)]
	pub query_retrieve_root: QueryRetrieveRoot,
	#[serde(default, rename = "default")]
	pub is_default: bool,
}

impl PacsNodeConfig {
	pub const fn default_connection_timeout() -> u64 {
		5_000
	}
	pub const fn default_response_timeout() -> u64 {
		30_000
	}
	pub const fn default_association_timeout() -> u64 {
		60_000
	}

	pub fn address(&self) -> String {
		format!("{}:{}", self.hostname, self.port)
	}

	pub const fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connection_timeout)
	}

	pub const fn response_timeout(&self) -> Duration {
		Duration::from_millis(self.response_timeout)
	}

	pub const fn association_timeout(&self) -> Duration {
		Duration::from_millis(self.association_timeout)
	}
}

/// Deserializer for [`tracing::Level`] as it does not implement [Deserialize]
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}
