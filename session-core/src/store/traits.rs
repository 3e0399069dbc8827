use crate::store::device::Device;
use crate::store::error::Result;
use async_trait::async_trait;
use wasession_binary::jid::Jid;

/// Persistence of the local device record: keys plus, once paired, the
/// account identity and assigned JIDs.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Current device record. Callers get an owned copy.
    async fn load_device(&self) -> Result<Device>;

    async fn save_device(&self, device: &Device) -> Result<()>;

    /// Removes the paired identity, leaving an unpaired device behind.
    async fn delete_device(&self) -> Result<()>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()>;
    async fn delete_identity(&self, address: &str) -> Result<()>;
    async fn load_identity(&self, address: &str) -> Result<Option<[u8; 32]>>;
}

#[async_trait]
pub trait LidPnMappingStore: Send + Sync {
    async fn put_lid_pn_mapping(&self, lid: &Jid, pn: &Jid) -> Result<()>;
    async fn get_pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>>;
}

pub trait Backend: DeviceStore + IdentityStore + LidPnMappingStore {}

impl<T> Backend for T where T: DeviceStore + IdentityStore + LidPnMappingStore {}
