pub mod backup;
pub mod ddb_backup;
pub mod dv2;
pub mod prune;
pub mod recon;
pub mod reclaim;
pub mod resync;
pub mod status;
pub mod store;
pub mod util;
