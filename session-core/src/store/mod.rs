pub mod device;
pub mod error;
pub mod traits;

pub use device::Device;
pub use error::StoreError;
pub use traits::{Backend, DeviceStore, IdentityStore, LidPnMappingStore};
