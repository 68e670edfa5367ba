use chrono::Duration;
use tracing::info;

use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::events::EngineEvent;
use crate::ledger::model::{AccessPath, CacheDescriptor, SealInfo, SealReason};
use ddb_types::{StoreId, SubstoreId};

/// Provision a store with `partitions` substores and their index directories.
pub fn create_store(engine: &Engine, name: &str, partitions: usize) -> Result<StoreId> {
    if name.trim().is_empty() {
        return Err(DdbError::Config("store name must not be empty".into()));
    }
    if partitions == 0 {
        return Err(DdbError::Config(
            "a store needs at least one substore".into(),
        ));
    }
    if engine
        .ledger()
        .read(|t| t.stores().any(|s| s.name == name))
    {
        return Err(DdbError::InvalidState(format!(
            "store '{name}' already exists"
        )));
    }

    let now = engine.now();
    let layout = engine.layout().clone();
    let (store, substores) = engine.ledger().write(|t| {
        let (store, substores) = t.insert_store(name, now, partitions);
        for substore in &substores {
            t.insert_access_path(AccessPath {
                store,
                substore: *substore,
                path: layout.dir(store, *substore).path().to_path_buf(),
            });
            t.insert_cache_descriptor(CacheDescriptor {
                store,
                substore: *substore,
                created_at: now,
            });
        }
        Ok((store, substores))
    })?;

    for substore in &substores {
        engine.index_dir(store, *substore).ensure()?;
    }
    info!(%store, name, substores = substores.len(), "store created");
    Ok(store)
}

/// Look a store up by name.
pub fn find_store(engine: &Engine, name: &str) -> Result<StoreId> {
    engine.ledger().read(|t| {
        t.stores()
            .find(|s| s.name == name)
            .map(|s| s.id)
            .ok_or_else(|| DdbError::StoreNameNotFound(name.to_string()))
    })
}

/// Put `store` under a WORM lock for `lock_days` from now. An existing lock
/// that ends later is kept; the window only ever grows.
pub fn enable_worm(engine: &Engine, store: StoreId, lock_days: u32) -> Result<()> {
    if lock_days == 0 {
        return Err(DdbError::Config("WORM lock must be at least one day".into()));
    }
    let until = engine.now() + Duration::days(i64::from(lock_days));
    let effective = engine.ledger().write(|t| {
        let row = t.store_mut(store)?;
        let effective = match row.worm_until {
            Some(existing) if existing >= until => existing,
            _ => until,
        };
        row.worm_until = Some(effective);
        Ok(effective)
    })?;
    info!(%store, until = %effective, "WORM lock enabled");
    Ok(())
}

/// Seal `store` on operator request. Sealing twice is a no-op.
pub fn seal(engine: &Engine, store: StoreId) -> Result<()> {
    let now = engine.now();
    let min_days = engine.config().lifetime.min_store_lifetime_days;
    let sealed = engine.ledger().write(|t| {
        let row = t.store_mut(store)?;
        if row.is_sealed() {
            return Ok(false);
        }
        let age = now.signed_duration_since(row.created_at);
        if age < Duration::days(i64::from(min_days)) {
            return Err(DdbError::InvalidState(format!(
                "{store} is {} day(s) old; sealing requires at least {min_days}",
                age.num_days()
            )));
        }
        row.sealed = Some(SealInfo {
            at: now,
            reason: SealReason::Operator,
        });
        Ok(true)
    })?;
    if sealed {
        info!(%store, "store sealed by operator");
        engine.events().publish(EngineEvent::StoreSealed { store });
    }
    Ok(())
}

/// Seal every unsealed store older than `seal_after_days`. Returns the stores sealed.
pub fn auto_seal(engine: &Engine) -> Result<Vec<StoreId>> {
    let Some(days) = engine.config().lifetime.seal_after_days else {
        return Ok(Vec::new());
    };
    let now = engine.now();
    let max_age = Duration::days(i64::from(days));
    let sealed = engine.ledger().write(|t| {
        let due: Vec<StoreId> = t
            .stores()
            .filter(|s| !s.is_sealed() && now.signed_duration_since(s.created_at) >= max_age)
            .map(|s| s.id)
            .collect();
        for store in &due {
            t.store_mut(*store)?.sealed = Some(SealInfo {
                at: now,
                reason: SealReason::MaxLifetime,
            });
        }
        Ok(due)
    })?;
    for store in &sealed {
        info!(%store, days, "store reached its maximum lifetime and was sealed");
        engine
            .events()
            .publish(EngineEvent::StoreSealed { store: *store });
    }
    Ok(sealed)
}

/// The substores of `store`, in creation order.
pub fn substores_of(engine: &Engine, store: StoreId) -> Result<Vec<SubstoreId>> {
    engine
        .ledger()
        .read(|t| t.require_store(store).map(|s| s.substores.clone()))
}
