use anyhow::{bail, Result};
use skyforge_common::tags::{TagKeys, DEFAULT_OWNERSHIP_TAG_KEY, DEFAULT_TEMPLATE_TAG_KEY};
use std::time::Duration;

pub const DEFAULT_DEVICE_NAME_PREFIX: &str = "/dev/sd";

/// Timeouts, batch caps and tag keys shared by every workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub retry_backoff: Duration,
    pub instance_wait_timeout: Duration,
    pub tagging_timeout: Duration,
    pub volume_available_timeout: Duration,
    pub volume_attach_timeout: Duration,
    pub volume_delete_timeout: Duration,
    pub spot_fulfillment_timeout: Duration,
    pub group_wait_timeout: Duration,
    /// Values per tag-filter describe call.
    pub tag_filter_batch_size: usize,
    /// Ids per id-filtered describe call.
    pub instance_id_batch_size: usize,
    pub volume_id_batch_size: usize,
    pub tag_keys: TagKeys,
    pub device_name_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(5_000),
            instance_wait_timeout: Duration::from_secs(600),
            tagging_timeout: Duration::from_secs(120),
            volume_available_timeout: Duration::from_secs(300),
            volume_attach_timeout: Duration::from_secs(300),
            volume_delete_timeout: Duration::from_secs(300),
            spot_fulfillment_timeout: Duration::from_secs(600),
            group_wait_timeout: Duration::from_secs(900),
            tag_filter_batch_size: 200,
            instance_id_batch_size: 95,
            volume_id_batch_size: 95,
            tag_keys: TagKeys::default(),
            device_name_prefix: DEFAULT_DEVICE_NAME_PREFIX.to_string(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_u64(name)
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Settings {
    /// Read `SKYFORGE_*` variables (a `.env` file is honoured). Unparseable
    /// values keep their default.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let d = Settings::default();

        let settings = Settings {
            retry_backoff: env_u64("SKYFORGE_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.retry_backoff),
            instance_wait_timeout: env_secs("SKYFORGE_INSTANCE_WAIT_TIMEOUT_S", d.instance_wait_timeout),
            tagging_timeout: env_secs("SKYFORGE_TAGGING_TIMEOUT_S", d.tagging_timeout),
            volume_available_timeout: env_secs(
                "SKYFORGE_VOLUME_AVAILABLE_TIMEOUT_S",
                d.volume_available_timeout,
            ),
            volume_attach_timeout: env_secs("SKYFORGE_VOLUME_ATTACH_TIMEOUT_S", d.volume_attach_timeout),
            volume_delete_timeout: env_secs("SKYFORGE_VOLUME_DELETE_TIMEOUT_S", d.volume_delete_timeout),
            spot_fulfillment_timeout: env_secs(
                "SKYFORGE_SPOT_FULFILLMENT_TIMEOUT_S",
                d.spot_fulfillment_timeout,
            ),
            group_wait_timeout: env_secs("SKYFORGE_GROUP_WAIT_TIMEOUT_S", d.group_wait_timeout),
            tag_filter_batch_size: env_u64("SKYFORGE_TAG_FILTER_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(d.tag_filter_batch_size),
            instance_id_batch_size: env_u64("SKYFORGE_INSTANCE_ID_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(d.instance_id_batch_size),
            volume_id_batch_size: env_u64("SKYFORGE_VOLUME_ID_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(d.volume_id_batch_size),
            tag_keys: TagKeys {
                ownership: env_string("SKYFORGE_OWNERSHIP_TAG_KEY", DEFAULT_OWNERSHIP_TAG_KEY),
                template: env_string("SKYFORGE_TEMPLATE_TAG_KEY", DEFAULT_TEMPLATE_TAG_KEY),
            },
            device_name_prefix: env_string("SKYFORGE_DEVICE_NAME_PREFIX", DEFAULT_DEVICE_NAME_PREFIX),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag_filter_batch_size == 0
            || self.instance_id_batch_size == 0
            || self.volume_id_batch_size == 0
        {
            bail!("describe batch sizes must be greater than zero");
        }
        if self.tag_keys.ownership == self.tag_keys.template {
            bail!(
                "ownership and template tag keys must differ (both are '{}')",
                self.tag_keys.ownership
            );
        }
        if self.device_name_prefix.is_empty() {
            bail!("device name prefix must not be empty");
        }
        Ok(())
    }
}
