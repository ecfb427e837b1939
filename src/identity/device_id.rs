//! Device identity records and id generation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::DeviceIdStrategy;
use crate::error::Result;
use crate::host::AdvertisingIdProvider;
use crate::storage::Storable;

/// Namespace an identifier lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Realm {
    DeviceId,
    AdvertisingId,
    PushToken,
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Realm::DeviceId => "device_id",
            Realm::AdvertisingId => "advertising_id",
            Realm::PushToken => "push_token",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub realm: Realm,
    pub strategy: DeviceIdStrategy,
    pub id: String,
}

impl DeviceIdentity {
    pub fn new(realm: Realm, strategy: DeviceIdStrategy, id: impl Into<String>) -> Self {
        DeviceIdentity {
            realm,
            strategy,
            id: id.into(),
        }
    }
}

/// Every known identity, one per realm. Stored as `config_0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRecord {
    identities: BTreeMap<Realm, DeviceIdentity>,
}

impl IdentityRecord {
    pub fn get(&self, realm: Realm) -> Option<&DeviceIdentity> {
        self.identities.get(&realm)
    }

    /// Replaces the identity of its realm, returning the previous one.
    pub fn set(&mut self, identity: DeviceIdentity) -> Option<DeviceIdentity> {
        self.identities.insert(identity.realm, identity)
    }

    pub fn clear(&mut self, realm: Realm) -> Option<DeviceIdentity> {
        self.identities.remove(&realm)
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl Storable for IdentityRecord {
    const PREFIX: &'static str = "config";

    fn storage_id(&self) -> i64 {
        0
    }

    fn store(&self) -> Result<Vec<u8>> {
        let list: Vec<&DeviceIdentity> = self.identities.values().collect();
        Ok(serde_json::to_vec(&list)?)
    }

    fn restore(_id: i64, data: &[u8]) -> Result<Self> {
        let list: Vec<DeviceIdentity> = serde_json::from_slice(data)?;
        Ok(IdentityRecord {
            identities: list.into_iter().map(|d| (d.realm, d)).collect(),
        })
    }
}

/// Produces a device id for `strategy`.
///
/// `advertising` asks the provider and falls back to a random UUID when it
/// has nothing and `fallback_allowed` is set. `custom` ids are never
/// generated here.
pub fn generate(
    strategy: DeviceIdStrategy,
    provider: Option<&dyn AdvertisingIdProvider>,
    fallback_allowed: bool,
) -> Option<DeviceIdentity> {
    match strategy {
        DeviceIdStrategy::Uuid => Some(uuid_identity()),
        DeviceIdStrategy::Advertising => {
            let advertised = provider
                .and_then(|p| p.advertising_id())
                .filter(|id| !id.trim().is_empty());
            match advertised {
                Some(id) => Some(DeviceIdentity::new(
                    Realm::DeviceId,
                    DeviceIdStrategy::Advertising,
                    id,
                )),
                None if fallback_allowed => Some(uuid_identity()),
                None => None,
            }
        }
        DeviceIdStrategy::Custom => None,
    }
}

fn uuid_identity() -> DeviceIdentity {
    DeviceIdentity::new(
        Realm::DeviceId,
        DeviceIdStrategy::Uuid,
        uuid::Uuid::new_v4().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdvertising(Option<&'static str>);

    impl AdvertisingIdProvider for FixedAdvertising {
        fn advertising_id(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    #[test]
    fn test_uuid_strategy() {
        let a = generate(DeviceIdStrategy::Uuid, None, false).unwrap();
        let b = generate(DeviceIdStrategy::Uuid, None, false).unwrap();
        assert_eq!(a.realm, Realm::DeviceId);
        assert_eq!(a.id.len(), 36);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_advertising_strategy_and_fallback() {
        let provider = FixedAdvertising(Some("adv-1"));
        let id = generate(DeviceIdStrategy::Advertising, Some(&provider), false).unwrap();
        assert_eq!(id.strategy, DeviceIdStrategy::Advertising);
        assert_eq!(id.id, "adv-1");

        let empty = FixedAdvertising(None);
        let fallback = generate(DeviceIdStrategy::Advertising, Some(&empty), true).unwrap();
        assert_eq!(fallback.strategy, DeviceIdStrategy::Uuid);

        assert!(generate(DeviceIdStrategy::Advertising, Some(&empty), false).is_none());
        assert!(generate(DeviceIdStrategy::Advertising, None, false).is_none());
    }

    #[test]
    fn test_custom_is_never_generated() {
        assert!(generate(DeviceIdStrategy::Custom, None, true).is_none());
    }

    #[test]
    fn test_record_store_restore() {
        let mut record = IdentityRecord::default();
        record.set(DeviceIdentity::new(Realm::DeviceId, DeviceIdStrategy::Custom, "A"));
        record.set(DeviceIdentity::new(Realm::PushToken, DeviceIdStrategy::Custom, "tok"));
        let previous = record.set(DeviceIdentity::new(Realm::DeviceId, DeviceIdStrategy::Custom, "B"));
        assert_eq!(previous.unwrap().id, "A");

        let restored = IdentityRecord::restore(0, &record.store().unwrap()).unwrap();
        assert_eq!(restored, record);
        assert_eq!(restored.get(Realm::DeviceId).unwrap().id, "B");
        assert!(restored.get(Realm::AdvertisingId).is_none());
    }
}
