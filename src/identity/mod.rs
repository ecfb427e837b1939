//! Device identity: acquisition, persistence, realms and id changes.

pub mod device_id;
pub mod legacy;
pub mod manager;

pub use device_id::{generate, DeviceIdentity, IdentityRecord, Realm};
pub use legacy::{LegacyIdSource, PropertiesFile, LEGACY_ID_KEY};
pub use manager::{DeviceIdListener, DeviceIdManager, IdentitySettings, IdentitySources};
