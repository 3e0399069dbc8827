use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use wasession_core::binary::jid::Jid;
use wasession_core::proto::adv::AdvSignedDeviceIdentity;
use wasession_core::store::error::{Result, StoreError};
use wasession_core::store::traits::{DeviceStore, IdentityStore, LidPnMappingStore};
use wasession_core::store::Device;

/// Store operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    LoadDevice,
    SaveDevice,
    DeleteDevice,
    PutIdentity,
    PutLidMapping,
}

/// Comparable view of everything pairing can write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub id: Option<Jid>,
    pub lid: Option<Jid>,
    pub business_name: String,
    pub platform: String,
    pub account: Option<AdvSignedDeviceIdentity>,
    pub identities: HashMap<String, [u8; 32]>,
    pub lid_mappings: HashMap<Jid, Jid>,
}

/// Keeps the device record, identities and LID mappings in memory.
pub struct MemoryDeviceStore {
    device: Mutex<Device>,
    identities: Mutex<HashMap<String, [u8; 32]>>,
    lid_mappings: Mutex<HashMap<Jid, Jid>>,
    failures: StdMutex<HashSet<FailurePoint>>,
}

impl Default for MemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeviceStore {
    /// A store holding a freshly generated, unpaired device.
    pub fn new() -> Self {
        Self::with_device(Device::generate())
    }

    pub fn with_device(device: Device) -> Self {
        Self {
            device: Mutex::new(device),
            identities: Mutex::default(),
            lid_mappings: Mutex::default(),
            failures: StdMutex::default(),
        }
    }

    /// A store whose device already has a phone-number JID and a LID.
    pub fn paired(id: Jid, lid: Option<Jid>) -> Self {
        let mut device = Device::generate();
        device.id = Some(id);
        device.lid = lid;
        Self::with_device(device)
    }

    pub fn fail_on(&self, point: FailurePoint) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn check(&self, point: FailurePoint) -> Result<()> {
        let failing = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&point);
        if failing {
            Err(StoreError::Database(format!("injected failure at {point:?}")))
        } else {
            Ok(())
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let device = self.device.lock().await.clone();
        StoreSnapshot {
            id: device.id,
            lid: device.lid,
            business_name: device.business_name,
            platform: device.platform,
            account: device.account,
            identities: self.identities.lock().await.clone(),
            lid_mappings: self.lid_mappings.lock().await.clone(),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn load_device(&self) -> Result<Device> {
        self.check(FailurePoint::LoadDevice)?;
        Ok(self.device.lock().await.clone())
    }

    async fn save_device(&self, device: &Device) -> Result<()> {
        self.check(FailurePoint::SaveDevice)?;
        *self.device.lock().await = device.clone();
        Ok(())
    }

    async fn delete_device(&self) -> Result<()> {
        self.check(FailurePoint::DeleteDevice)?;
        self.device.lock().await.clear_pairing();
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryDeviceStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.check(FailurePoint::PutIdentity)?;
        self.identities.lock().await.insert(address.to_string(), key);
        Ok(())
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.identities.lock().await.remove(address);
        Ok(())
    }

    async fn load_identity(&self, address: &str) -> Result<Option<[u8; 32]>> {
        Ok(self.identities.lock().await.get(address).copied())
    }
}

#[async_trait]
impl LidPnMappingStore for MemoryDeviceStore {
    async fn put_lid_pn_mapping(&self, lid: &Jid, pn: &Jid) -> Result<()> {
        self.check(FailurePoint::PutLidMapping)?;
        self.lid_mappings
            .lock()
            .await
            .insert(lid.to_non_ad(), pn.to_non_ad());
        Ok(())
    }

    async fn get_pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>> {
        Ok(self.lid_mappings.lock().await.get(&lid.to_non_ad()).cloned())
    }
}
