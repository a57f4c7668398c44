use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::time::Duration;
use structopt::StructOpt;

use crate::manager::{Configuration, ConfigurationError};
use crate::time::DefaultTime;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    Arguments(structopt::clap::Error),

    #[error("could not read config file {path}: {err}")]
    FileRead { path: String, err: std::io::Error },

    #[error("could not parse config file {path}: {err}")]
    FileParse {
        path: String,
        err: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(ConfigurationError),
}

#[derive(StructOpt, Debug)]
#[structopt(name = "txm_config", about = "Configuration for transaction manager")]
struct TxmEnvCLIConfig {
    /// Path to transaction manager config (JSON)
    #[structopt(long, env)]
    pub txm_config: Option<String>,
    /// Max number of transactions per account broadcast each tick
    #[structopt(long, env)]
    pub txm_max_batch_size: Option<usize>,
    /// Period (ms) of the broadcast loop
    #[structopt(long, env)]
    pub txm_send_frequency: Option<u64>,
    /// Timeout value (ms) for submitting a batch
    #[structopt(long, env)]
    pub txm_timeout: Option<u64>,
    /// Max initial nonce sync attempts per account
    #[structopt(long, env)]
    pub txm_nonce_sync_retries: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TxmFileConfig {
    pub txm_max_batch_size: Option<usize>,
    pub txm_send_frequency: Option<u64>,
    pub txm_timeout: Option<u64>,
    pub txm_nonce_sync_retries: Option<usize>,
    pub txm_nonce_sync_delay: Option<u64>,
    pub txm_failure_alert_threshold: Option<usize>,
}

/// Transaction manager settings resolved from, in order of precedence, the
/// command line, the environment, the config file and the defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxmConfig {
    pub max_batch_size: usize,
    pub send_frequency: Duration,
    pub timeout: Duration,
    pub nonce_sync_retries: usize,
    pub nonce_sync_delay: Duration,
    pub failure_alert_threshold: usize,
}

impl TxmConfig {
    pub fn initialize() -> Result<Self, Error> {
        Self::initialize_from(std::env::args_os())
    }

    pub fn initialize_from<I>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator,
        I::Item: Into<OsString> + Clone,
    {
        let env_cli_config = TxmEnvCLIConfig::from_iter_safe(args).map_err(Error::Arguments)?;

        let file_config = match env_cli_config.txm_config {
            Some(ref path) => load_config_file(path)?,
            None => TxmFileConfig::default(),
        };

        let defaults = Configuration::default();

        let max_batch_size = env_cli_config
            .txm_max_batch_size
            .or(file_config.txm_max_batch_size)
            .unwrap_or(defaults.tx_max_batch_size);

        let send_frequency = env_cli_config
            .txm_send_frequency
            .or(file_config.txm_send_frequency)
            .map(Duration::from_millis)
            .unwrap_or(defaults.tx_send_frequency);

        let timeout = env_cli_config
            .txm_timeout
            .or(file_config.txm_timeout)
            .map(Duration::from_millis)
            .unwrap_or(defaults.tx_timeout);

        let nonce_sync_retries = env_cli_config
            .txm_nonce_sync_retries
            .or(file_config.txm_nonce_sync_retries)
            .unwrap_or(defaults.nonce_sync_retries);

        let nonce_sync_delay = file_config
            .txm_nonce_sync_delay
            .map(Duration::from_millis)
            .unwrap_or(defaults.nonce_sync_delay);

        let failure_alert_threshold = file_config
            .txm_failure_alert_threshold
            .unwrap_or(defaults.failure_alert_threshold);

        let config = TxmConfig {
            max_batch_size,
            send_frequency,
            timeout,
            nonce_sync_retries,
            nonce_sync_delay,
            failure_alert_threshold,
        };
        config.configuration().validate().map_err(Error::Invalid)?;
        Ok(config)
    }

    pub fn configuration(&self) -> Configuration<DefaultTime> {
        Configuration::default()
            .set_tx_max_batch_size(self.max_batch_size)
            .set_tx_send_frequency(self.send_frequency)
            .set_tx_timeout(self.timeout)
            .set_nonce_sync_retries(self.nonce_sync_retries)
            .set_nonce_sync_delay(self.nonce_sync_delay)
            .set_failure_alert_threshold(self.failure_alert_threshold)
    }
}

impl From<TxmConfig> for Configuration<DefaultTime> {
    fn from(config: TxmConfig) -> Self {
        config.configuration()
    }
}

fn load_config_file(path: &str) -> Result<TxmFileConfig, Error> {
    let contents = fs::read_to_string(path).map_err(|err| Error::FileRead {
        path: path.to_string(),
        err,
    })?;

    serde_json::from_str(&contents).map_err(|err| Error::FileParse {
        path: path.to_string(),
        err,
    })
}
