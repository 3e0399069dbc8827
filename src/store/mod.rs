pub mod memory;

pub use memory::{FailurePoint, MemoryDeviceStore, StoreSnapshot};
pub use wasession_core::store::{
    Backend, Device, DeviceStore, IdentityStore, LidPnMappingStore, StoreError,
};
