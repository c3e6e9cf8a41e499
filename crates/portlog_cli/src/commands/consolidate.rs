//! Consolidate command implementation.

use super::store::StoreTarget;
use portlog_core::{
    scan_storage, Config, ConsolidationPlan, Consolidator, SegmentRegistry, StorageDir,
};

/// Runs the consolidate command.
///
/// Takes the storage directory lock, so it refuses to run next to a
/// capture daemon on the same directory.
pub fn run(
    config: &Config,
    target: &StoreTarget,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = StorageDir::open(&config.storage_dir)?;

    println!("Consolidating segments at {}", storage.path().display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let plan = scan_storage(storage.path(), &SegmentRegistry::new())?;
    print_plan(&plan, &config.key_prefix);

    if dry_run || plan.is_empty() {
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let store = target.open(runtime.handle())?;
    let consolidator = Consolidator::from_config(config, SegmentRegistry::new(), store);

    println!();
    println!("Uploading...");
    let report = consolidator.run_pass()?;

    println!("  Groups uploaded:    {}", report.groups_uploaded);
    println!("  Groups failed:      {}", report.groups_failed);
    println!("  Files removed:      {}", report.files_removed);
    println!("  Zero-byte removed:  {}", report.zero_byte_removed);
    println!("  Staging removed:    {}", report.staging_removed);
    println!("  Bytes uploaded:     {}", report.bytes_uploaded);

    if report.groups_failed > 0 {
        return Err(format!("{} group(s) could not be uploaded", report.groups_failed).into());
    }
    println!("✓ Consolidation complete");
    Ok(())
}

fn print_plan(plan: &ConsolidationPlan, prefix: &str) {
    if plan.is_empty() {
        println!("Nothing to upload");
        return;
    }

    println!("Upload Plan:");
    for batch in &plan.batches {
        println!(
            "  {} <- {} segment(s), {} bytes",
            batch.key(prefix).unwrap_or_default(),
            batch.segments.len(),
            batch.total_bytes()
        );
    }
    if !plan.zero_byte.is_empty() {
        println!("  {} zero-byte segment(s) to delete", plan.zero_byte.len());
    }
    if !plan.stale_staging.is_empty() {
        println!(
            "  {} stale staging file(s) to delete",
            plan.stale_staging.len()
        );
    }
    if plan.ignored > 0 {
        println!("  {} unrelated file(s) ignored", plan.ignored);
    }
}
