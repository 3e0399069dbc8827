pub use wasession_binary as binary;
pub use wasession_proto as proto;

pub mod crypto;
pub mod ib;
pub mod pair;
pub mod store;
pub mod stream;
pub mod types;
pub mod xml;
