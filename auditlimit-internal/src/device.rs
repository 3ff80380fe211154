//! Per-credential cap on the number of distinct devices.
//!
//! A device is identified by the SHA-256 fingerprint of the identity string it declares (its
//! `User-Agent`). Membership lives in a set per credential, and each member has a small hash with
//! the identity and the host it came from. Both share the retention TTL, which is re-applied on
//! every registration that touches the credential, so devices disappear after a period of inactivity.
//!
//! The default registration path is check-then-add, so two concurrent registrations of new
//! devices for a credential one below the cap can both succeed. `strict_cap` closes that race by
//! adding through a store-side script that undoes the add when it overflows the cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::store::{BoundedAdd, Store, StoreOp};

const DEVICES_KEY_PREFIX: &str = "devices:";
const DEVICE_INFO_KEY_PREFIX: &str = "device_info:";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub host: String,
}

impl DeviceInfo {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("user_agent".to_string(), self.user_agent.clone()),
            ("host".to_string(), self.host.clone()),
        ]
    }

    fn from_fields(mut fields: HashMap<String, String>) -> Option<Self> {
        let user_agent = fields.remove("user_agent")?;
        Some(Self {
            user_agent,
            host: fields.remove("host").unwrap_or_default(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// Already registered; does not count against the cap
    AlreadyKnown,
    Admitted,
    /// At capacity; nothing was written
    Rejected,
}

/// The devices registered for one credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenDeviceStats {
    pub token: String,
    pub devices: Vec<DeviceInfo>,
    pub total: usize,
}

#[derive(Clone, Debug)]
pub struct DeviceRegistryConfig {
    pub max_devices: u32,
    pub retention: Duration,
    pub strict_cap: bool,
}

impl Default for DeviceRegistryConfig {
    fn default() -> Self {
        Self {
            max_devices: 3,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            strict_cap: false,
        }
    }
}

pub fn fingerprint(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

fn devices_key(credential: &str) -> String {
    format!("{DEVICES_KEY_PREFIX}{credential}")
}

fn device_info_key(credential: &str, fingerprint: &str) -> String {
    format!("{DEVICE_INFO_KEY_PREFIX}{credential}:{fingerprint}")
}

pub struct DeviceRegistry {
    store: Arc<dyn Store>,
    config: DeviceRegistryConfig,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn Store>, config: DeviceRegistryConfig) -> Self {
        Self { store, config }
    }

    pub fn max_devices(&self) -> u32 {
        self.config.max_devices
    }

    pub async fn register_device(
        &self,
        credential: &str,
        identity: &str,
        host: &str,
    ) -> Result<Registration, Error> {
        let fingerprint = fingerprint(identity);
        let set_key = devices_key(credential);
        let info_key = device_info_key(credential, &fingerprint);
        let retention = self.config.retention;

        if self.store.sismember(&set_key, &fingerprint).await? {
            return self.refresh(set_key, info_key).await;
        }

        let info = DeviceInfo {
            user_agent: identity.to_string(),
            host: host.to_string(),
        };
        let mut ops = Vec::with_capacity(4);

        if self.config.strict_cap {
            let outcome = self
                .store
                .sadd_bounded(
                    &set_key,
                    &fingerprint,
                    u64::from(self.config.max_devices),
                    retention,
                )
                .await?;
            match outcome {
                BoundedAdd::Added => {}
                // Registered by a concurrent request since the membership check
                BoundedAdd::AlreadyMember => return self.refresh(set_key, info_key).await,
                BoundedAdd::Rejected => return Ok(Registration::Rejected),
            }
        } else {
            let registered = self.store.scard(&set_key).await?;
            if registered >= u64::from(self.config.max_devices) {
                return Ok(Registration::Rejected);
            }
            ops.push(StoreOp::SAdd {
                key: set_key.clone(),
                member: fingerprint,
            });
        }

        ops.push(StoreOp::HSet {
            key: info_key.clone(),
            fields: info.to_fields(),
        });
        ops.push(StoreOp::Expire {
            key: set_key,
            ttl: retention,
        });
        ops.push(StoreOp::Expire {
            key: info_key,
            ttl: retention,
        });
        self.store.atomic_batch(&ops).await?;
        Ok(Registration::Admitted)
    }

    async fn refresh(&self, set_key: String, info_key: String) -> Result<Registration, Error> {
        let retention = self.config.retention;
        self.store
            .atomic_batch(&[
                StoreOp::Expire {
                    key: set_key,
                    ttl: retention,
                },
                StoreOp::Expire {
                    key: info_key,
                    ttl: retention,
                },
            ])
            .await?;
        Ok(Registration::AlreadyKnown)
    }

    /// Removes the device and its record. Unknown devices are not an error.
    pub async fn deregister_device(&self, credential: &str, identity: &str) -> Result<(), Error> {
        let fingerprint = fingerprint(identity);
        self.store
            .atomic_batch(&[
                StoreOp::Del {
                    key: device_info_key(credential, &fingerprint),
                },
                StoreOp::SRem {
                    key: devices_key(credential),
                    member: fingerprint,
                },
            ])
            .await
    }

    /// Members whose record has already expired are skipped
    pub async fn list_devices(&self, credential: &str) -> Result<Vec<DeviceInfo>, Error> {
        let mut devices = Vec::new();
        for fingerprint in self.store.smembers(&devices_key(credential)).await? {
            let fields = self
                .store
                .hgetall(&device_info_key(credential, &fingerprint))
                .await?;
            if let Some(info) = DeviceInfo::from_fields(fields) {
                devices.push(info);
            }
        }
        Ok(devices)
    }

    /// Devices of every credential, most devices first
    pub async fn all_device_stats(&self) -> Result<Vec<TokenDeviceStats>, Error> {
        let mut stats = Vec::new();
        for key in self.store.scan_prefix(DEVICES_KEY_PREFIX).await? {
            let Some(credential) = key.strip_prefix(DEVICES_KEY_PREFIX) else {
                continue;
            };
            let devices = self.list_devices(credential).await?;
            stats.push(TokenDeviceStats {
                token: credential.to_string(),
                total: devices.len(),
                devices,
            });
        }
        stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.token.cmp(&b.token)));
        Ok(stats)
    }
}
