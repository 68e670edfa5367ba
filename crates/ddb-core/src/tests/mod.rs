mod backup;
mod jobs;
mod reclaim;
mod recon;
mod resync;
