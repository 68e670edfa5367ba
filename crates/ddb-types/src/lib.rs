pub mod error;
pub mod ids;

pub use ids::{JobId, StoreId, SubstoreId, VolumeId};
