pub mod basic;
pub mod ib;
pub mod iq;
pub mod notification;
pub mod router;
pub mod traits;
pub mod unimplemented;
