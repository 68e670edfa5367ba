pub(crate) mod backup;
pub(crate) mod dv2;
pub(crate) mod maintain;
pub(crate) mod prune;
pub(crate) mod reclaim;
pub(crate) mod recon;
pub(crate) mod status;
pub(crate) mod store;
