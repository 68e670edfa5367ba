use comfy_table::Cell;

use ddb_core::commands::status::{all_store_status, store_status, StoreStatus};
use ddb_core::Engine;

use crate::dispatch::{resolve_store, CliResult};
use crate::format::{format_bytes, format_opt_time, format_time};
use crate::table::{add_kv_row, CliTableTheme};

pub(crate) fn run_status(engine: &Engine, name: Option<&str>) -> CliResult {
    let theme = CliTableTheme::detect();
    if let Some(name) = name {
        let store = resolve_store(engine, name)?;
        print_detail(&store_status(engine, store)?, theme);
        return Ok(());
    }

    let all = all_store_status(engine)?;
    if all.is_empty() {
        println!("No stores");
        return Ok(());
    }
    let mut table = theme.new_data_table(&[
        "ID", "Name", "Substores", "Active", "Pending", "Aged", "Size", "Sealed", "WORM until",
        "Resync",
    ]);
    for s in &all {
        table.add_row(vec![
            theme.count(s.store.get()),
            Cell::new(&s.name),
            theme.count(s.substores.len()),
            theme.count(s.volumes.active),
            theme.count(s.volumes.pending_prune),
            theme.count(s.volumes.aged),
            theme.count(format_bytes(s.volumes.bytes)),
            theme.flagged(
                if s.sealed.is_some() { "yes" } else { "no" },
                s.sealed.is_some(),
            ),
            Cell::new(format_opt_time(s.worm_locked_until)),
            theme.flagged(
                if s.resync_needed { "needed" } else { "-" },
                s.resync_needed,
            ),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_detail(s: &StoreStatus, theme: CliTableTheme) {
    let mut table = theme.new_kv_table();
    add_kv_row(&mut table, theme, "Store", format!("{} ({})", s.name, s.store));
    add_kv_row(&mut table, theme, "Created", format_time(s.created_at));
    let sealed = match &s.sealed {
        Some(info) => format!("{} ({})", format_time(info.at), info.reason),
        None => "no".to_string(),
    };
    add_kv_row(&mut table, theme, "Sealed", sealed);
    add_kv_row(&mut table, theme, "WORM until", format_opt_time(s.worm_locked_until));
    add_kv_row(
        &mut table,
        theme,
        "Volumes",
        format!(
            "{} active, {} pending prune, {} aged ({})",
            s.volumes.active,
            s.volumes.pending_prune,
            s.volumes.aged,
            format_bytes(s.volumes.bytes)
        ),
    );
    add_kv_row(
        &mut table,
        theme,
        "Backup jobs",
        format!("{} ({} aged)", s.backup_jobs, s.aged_jobs),
    );
    let recon = match s.open_recon {
        Some((job, phase)) => format!("{job} {phase}"),
        None => "-".to_string(),
    };
    add_kv_row(&mut table, theme, "Reconstruction", recon);
    let resync = match &s.last_resync {
        Some(entry) => format!(
            "attempt {} at {} status {}",
            entry.attempt,
            format_time(entry.at),
            entry.status
        ),
        None => "-".to_string(),
    };
    add_kv_row(
        &mut table,
        theme,
        "Resync",
        if s.resync_needed {
            format!("needed; last {resync}")
        } else {
            resync
        },
    );
    println!("{table}");

    let mut subs = theme.new_data_table(&["Substore", "State", "Last DDB backup", "Recovery"]);
    for sub in &s.substores {
        let snap = if sub.last_snap_job.is_none() {
            "-".to_string()
        } else {
            format!("{} at {}", sub.last_snap_job, format_opt_time(sub.last_snap_at))
        };
        subs.add_row(vec![
            theme.count(sub.id.get()),
            Cell::new(format!("{:?}", sub.state)),
            Cell::new(snap),
            theme.flagged(
                if sub.recovery_pending { "pending" } else { "-" },
                sub.recovery_pending,
            ),
        ]);
    }
    println!();
    println!("{subs}");
}
