//! Layered configuration loading.
//!
//! Sources, highest priority first:
//!
//! 1. process environment
//! 2. secrets file (dotenv syntax, never exported into the environment)
//! 3. YAML config file, with `${VAR}` / `${VAR:-default}` interpolation
//!
//! Missing files are skipped. The first non-empty value wins.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::settings::{ApiKey, FileConfig, KeySource, StreamerConfig};
use crate::domain::instrument::{Isin, IsinError};

/// Default YAML config path.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Default secrets file path.
pub const DEFAULT_SECRETS_PATH: &str = ".env";

/// Variable holding the API key.
pub const API_KEY_VAR: &str = "LEMON_API_KEY";

/// Variable holding a comma separated instrument list.
pub const INSTRUMENTS_VAR: &str = "LEMON_INSTRUMENTS";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config or secrets file exists but could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// The secrets file is not valid dotenv syntax.
    #[error("failed to parse secrets file '{path}': {message}")]
    Secrets {
        /// File path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// The config file is not valid YAML for the schema.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// YAML error.
        source: serde_yaml_bw::Error,
    },

    /// No source provided an API key.
    #[error("no API key: set {API_KEY_VAR} or api.key")]
    MissingApiKey,

    /// No source provided any instrument.
    #[error("no instruments configured: set {INSTRUMENTS_VAR} or instruments")]
    NoInstruments,

    /// An instrument entry is not a valid ISIN.
    #[error("invalid instrument '{entry}': {source}")]
    InvalidInstrument {
        /// Entry as configured.
        entry: String,
        /// Validation failure.
        source: IsinError,
    },

    /// The same ISIN is listed twice.
    #[error("instrument {0} is listed more than once")]
    DuplicateInstrument(String),

    /// A setting has an unusable value.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Resolves [`StreamerConfig`] from environment, secrets and config file.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
    secrets_path: PathBuf,
    env: HashMap<String, String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH, DEFAULT_SECRETS_PATH)
    }
}

impl ConfigLoader {
    /// Loader reading the given files and the process environment.
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>, secrets_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            secrets_path: secrets_path.into(),
            env: std::env::vars().collect(),
        }
    }

    /// Replace the environment snapshot.
    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Load and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a file cannot be read or parsed, no API
    /// key or instrument is configured, or a setting is invalid.
    pub fn load(&self) -> Result<StreamerConfig, ConfigError> {
        let secrets = read_secrets(&self.secrets_path)?;
        let file = self.read_config_file()?;

        let (api_key, key_source) = first_non_empty([
            (self.env.get(API_KEY_VAR).cloned(), KeySource::Environment),
            (secrets.get(API_KEY_VAR).cloned(), KeySource::SecretsFile),
            (file.api.key.clone(), KeySource::ConfigFile),
        ])
        .ok_or(ConfigError::MissingApiKey)?;

        let (entries, _) = first_non_empty([
            (self.env.get(INSTRUMENTS_VAR).map(|v| split_list(v)), KeySource::Environment),
            (secrets.get(INSTRUMENTS_VAR).map(|v| split_list(v)), KeySource::SecretsFile),
            (Some(file.instruments.clone()), KeySource::ConfigFile),
        ])
        .ok_or(ConfigError::NoInstruments)?;
        let instruments = parse_instruments(&entries)?;

        let config = StreamerConfig {
            api_key: ApiKey::new(api_key),
            key_source,
            instruments,
            api: file.api.settings,
            stream: file.stream,
            display: file.display,
            logging: file.logging,
            telemetry: file.telemetry,
            metrics: file.metrics,
        };
        validate(&config)?;
        Ok(config)
    }

    fn read_config_file(&self) -> Result<FileConfig, ConfigError> {
        let contents = match std::fs::read_to_string(&self.config_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.config_path.display(), "No config file");
                return Ok(FileConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.config_path.clone(),
                    source,
                });
            }
        };

        let interpolated = interpolate_env_vars(&contents, &self.env);
        if interpolated.trim().is_empty() {
            return Ok(FileConfig::default());
        }
        serde_yaml_bw::from_str(&interpolated).map_err(|source| ConfigError::Parse {
            path: self.config_path.clone(),
            source,
        })
    }
}

/// Trait for values that can be "empty" for source resolution.
trait Blank {
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Blank for Vec<String> {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

fn first_non_empty<T: Blank, const N: usize>(
    candidates: [(Option<T>, KeySource); N],
) -> Option<(T, KeySource)> {
    candidates
        .into_iter()
        .find_map(|(value, source)| value.filter(|v| !v.is_blank()).map(|v| (v, source)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_secrets(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(dotenvy::Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No secrets file");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(secrets_error(path, &e)),
    };

    iter.map(|item| item.map_err(|e| secrets_error(path, &e)))
        .collect()
}

fn secrets_error(path: &Path, err: &dotenvy::Error) -> ConfigError {
    match err {
        dotenvy::Error::Io(e) => ConfigError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::new(e.kind(), e.to_string()),
        },
        other => ConfigError::Secrets {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

fn parse_instruments(entries: &[String]) -> Result<Vec<Isin>, ConfigError> {
    let mut seen = HashSet::new();
    let mut instruments = Vec::with_capacity(entries.len());

    for entry in entries {
        let isin = Isin::parse(entry.trim()).map_err(|source| ConfigError::InvalidInstrument {
            entry: entry.clone(),
            source,
        })?;
        if !seen.insert(isin.clone()) {
            return Err(ConfigError::DuplicateInstrument(isin.as_str().to_string()));
        }
        instruments.push(isin);
    }

    if instruments.is_empty() {
        return Err(ConfigError::NoInstruments);
    }
    Ok(instruments)
}

/// Interpolate `${VAR}` and `${VAR:-default}` using `env`.
#[allow(clippy::expect_used)] // Regex is a constant pattern
fn interpolate_env_vars(input: &str, env: &HashMap<String, String>) -> String {
    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match env.get(&cap[1]) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

fn validate(config: &StreamerConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;

    if stream.ping_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "stream.ping_interval_secs must be positive".to_string(),
        ));
    }
    if stream.pong_timeout_secs <= stream.ping_interval_secs {
        return Err(ConfigError::Invalid(
            "stream.pong_timeout_secs must exceed stream.ping_interval_secs".to_string(),
        ));
    }
    if stream.connect_timeout_secs == 0 || stream.subscribe_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "stream connect/subscribe timeouts must be positive".to_string(),
        ));
    }
    if !(stream.reconnect.multiplier.is_finite() && stream.reconnect.multiplier >= 1.0) {
        return Err(ConfigError::Invalid(
            "stream.reconnect.multiplier must be at least 1.0".to_string(),
        ));
    }
    if config.api.timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "api.timeout_secs must be positive".to_string(),
        ));
    }
    for (name, url) in [
        ("api.auth_url", &config.api.auth_url),
        ("api.market_data_url", &config.api.market_data_url),
        ("stream.url", &stream.url),
    ] {
        if reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid(format!("{name} is not a valid URL: {url}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::DisplayMode;
    use std::io::Write;
    use tempfile::TempDir;
    use test_case::test_case;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            path
        }

        fn loader(&self, env: &[(&str, &str)]) -> ConfigLoader {
            ConfigLoader::new(
                self.dir.path().join("config.yaml"),
                self.dir.path().join(".env"),
            )
            .with_env(
                env.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            )
        }
    }

    #[test]
    fn environment_key_wins() {
        let fx = Fixture::new();
        fx.write(".env", "LEMON_API_KEY=from-secrets\n");
        fx.write("config.yaml", "api:\n  key: from-file\ninstruments: [US0378331005]\n");

        let config = fx.loader(&[("LEMON_API_KEY", "from-env")]).load().unwrap();
        assert_eq!(config.api_key.expose(), "from-env");
        assert_eq!(config.key_source, KeySource::Environment);
    }

    #[test]
    fn secrets_file_beats_config_file() {
        let fx = Fixture::new();
        fx.write(".env", "LEMON_API_KEY=from-secrets\n");
        fx.write("config.yaml", "api:\n  key: from-file\ninstruments: [US0378331005]\n");

        let config = fx.loader(&[]).load().unwrap();
        assert_eq!(config.api_key.expose(), "from-secrets");
        assert_eq!(config.key_source, KeySource::SecretsFile);
    }

    #[test]
    fn empty_values_fall_through() {
        let fx = Fixture::new();
        fx.write(".env", "LEMON_API_KEY=\n");
        fx.write("config.yaml", "api:\n  key: from-file\ninstruments: [US0378331005]\n");

        let config = fx.loader(&[("LEMON_API_KEY", "  ")]).load().unwrap();
        assert_eq!(config.api_key.expose(), "from-file");
        assert_eq!(config.key_source, KeySource::ConfigFile);
    }

    #[test]
    fn secrets_file_does_not_touch_process_env() {
        let fx = Fixture::new();
        fx.write(
            ".env",
            "LEMON_API_KEY=k\nLEMON_STREAM_TEST_ONLY_MARKER=1\nLEMON_INSTRUMENTS=US0378331005\n",
        );

        fx.loader(&[]).load().unwrap();
        assert!(std::env::var("LEMON_STREAM_TEST_ONLY_MARKER").is_err());
    }

    #[test]
    fn missing_files_are_skipped() {
        let fx = Fixture::new();
        let config = fx
            .loader(&[("LEMON_API_KEY", "k"), ("LEMON_INSTRUMENTS", "US0378331005")])
            .load()
            .unwrap();
        assert_eq!(config.instruments.len(), 1);
        assert_eq!(config.display.mode, DisplayMode::Log);
    }

    #[test]
    fn missing_key_is_an_error() {
        let fx = Fixture::new();
        fx.write("config.yaml", "instruments: [US0378331005]\n");
        assert!(matches!(
            fx.loader(&[]).load(),
            Err(ConfigError::MissingApiKey)
        ));
    }

    #[test]
    fn instruments_from_secrets_keep_order() {
        let fx = Fixture::new();
        fx.write(
            ".env",
            "LEMON_API_KEY=k\nLEMON_INSTRUMENTS=\"DE0007164600, US0378331005\"\n",
        );
        fx.write("config.yaml", "instruments: [US88160R1014]\n");

        let config = fx.loader(&[]).load().unwrap();
        let isins: Vec<_> = config.instruments.iter().map(Isin::as_str).collect();
        assert_eq!(isins, ["DE0007164600", "US0378331005"]);
    }

    #[test]
    fn unquoted_list_with_spaces_is_a_secrets_error() {
        let fx = Fixture::new();
        fx.write(
            ".env",
            "LEMON_API_KEY=k\nLEMON_INSTRUMENTS=DE0007164600, US0378331005\n",
        );
        fx.write("config.yaml", "instruments: [US88160R1014]\n");

        match fx.loader(&[]).load() {
            Err(ConfigError::Secrets { path, message }) => {
                assert!(path.ends_with(".env"));
                assert!(message.contains("DE0007164600"), "{message}");
            }
            other => panic!("expected secrets error, got {other:?}"),
        }
    }

    #[test]
    fn unquoted_list_without_spaces_is_accepted() {
        let fx = Fixture::new();
        fx.write(
            ".env",
            "LEMON_API_KEY=k\nLEMON_INSTRUMENTS=DE0007164600,US0378331005\n",
        );

        let config = fx.loader(&[]).load().unwrap();
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.key_source, KeySource::SecretsFile);
    }

    #[test_case("instruments: []\n" ; "empty list")]
    #[test_case("display:\n  mode: status\n" ; "absent")]
    fn no_instruments_is_an_error(yaml: &str) {
        let fx = Fixture::new();
        fx.write("config.yaml", yaml);
        assert!(matches!(
            fx.loader(&[("LEMON_API_KEY", "k")]).load(),
            Err(ConfigError::NoInstruments)
        ));
    }

    #[test]
    fn malformed_isin_names_the_entry() {
        let fx = Fixture::new();
        fx.write("config.yaml", "instruments: [US0378331005, US0378331006]\n");
        let err = fx.loader(&[("LEMON_API_KEY", "k")]).load().unwrap_err();
        match err {
            ConfigError::InvalidInstrument { entry, .. } => assert_eq!(entry, "US0378331006"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_isin_is_rejected() {
        let fx = Fixture::new();
        fx.write("config.yaml", "instruments: [US0378331005, US0378331005]\n");
        assert!(matches!(
            fx.loader(&[("LEMON_API_KEY", "k")]).load(),
            Err(ConfigError::DuplicateInstrument(isin)) if isin == "US0378331005"
        ));
    }

    #[test]
    fn unparsable_config_is_an_error() {
        let fx = Fixture::new();
        fx.write("config.yaml", "stream: [not, a, map]\n");
        assert!(matches!(
            fx.loader(&[("LEMON_API_KEY", "k")]).load(),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn config_file_is_interpolated() {
        let fx = Fixture::new();
        fx.write(
            "config.yaml",
            "api:\n  key: ${MY_KEY}\n  timeout_secs: ${TIMEOUT:-7}\ninstruments: [US0378331005]\n",
        );

        let config = fx.loader(&[("MY_KEY", "interpolated")]).load().unwrap();
        assert_eq!(config.api_key.expose(), "interpolated");
        assert_eq!(config.key_source, KeySource::ConfigFile);
        assert_eq!(config.api.timeout_secs, 7);
    }

    #[test_case("stream:\n  ping_interval_secs: 0\n" ; "zero ping interval")]
    #[test_case("stream:\n  ping_interval_secs: 30\n  pong_timeout_secs: 30\n" ; "timeout not above interval")]
    #[test_case("stream:\n  reconnect:\n    multiplier: 0.5\n" ; "shrinking backoff")]
    #[test_case("api:\n  auth_url: not a url\n" ; "bad url")]
    fn invalid_settings_are_rejected(yaml: &str) {
        let fx = Fixture::new();
        fx.write("config.yaml", &format!("{yaml}instruments: [US0378331005]\n"));
        assert!(matches!(
            fx.loader(&[("LEMON_API_KEY", "k")]).load(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn interpolation_defaults() {
        let env = HashMap::from([("SET".to_string(), "yes".to_string())]);
        assert_eq!(
            interpolate_env_vars("${SET} ${UNSET:-no} ${UNSET}", &env),
            "yes no "
        );
    }

    #[test]
    fn split_list_trims_entries() {
        assert_eq!(split_list(" A, B ,,C "), ["A", "B", "C"]);
    }
}
