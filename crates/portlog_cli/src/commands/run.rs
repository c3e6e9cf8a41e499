//! Run command implementation.

use super::store::StoreTarget;
use portlog_core::{
    CaptureLoop, CaptureSummary, Config, Connector, Consolidator, CoreResult, SegmentRegistry,
    SerialConnector, ShutdownSignal, StorageDir,
};
use portlog_store::ObjectStore;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Runs the capture daemon until SIGINT or SIGTERM.
pub fn run(config: Config, target: &StoreTarget) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let storage = StorageDir::open(&config.storage_dir)?;

    if config.ports.is_empty() {
        tracing::warn!("no ports configured, only uploading existing segments");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("portlog")
        .build()?;
    let store = target.open(runtime.handle())?;
    let connector: Arc<dyn Connector> =
        Arc::new(SerialConnector::new(config.baud_rate, config.read_timeout));

    tracing::info!(
        storage = %storage.path().display(),
        ports = config.ports.len(),
        bucket = %config.bucket,
        prefix = %config.key_prefix,
        "portlog started"
    );

    runtime.block_on(async move {
        let stop = shutdown_signal()?;
        daemon(config, store, connector, stop).await;
        Ok::<_, std::io::Error>(())
    })?;
    drop(storage);
    Ok(())
}

/// Installs the SIGINT and SIGTERM handlers and returns a future that
/// resolves when either signal arrives.
///
/// Must be called within the runtime.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let signalled = {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        async move {
            tokio::select! {
                _ = interrupt.recv() => tracing::info!("received SIGINT, shutting down"),
                _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }
    };

    #[cfg(not(unix))]
    let signalled = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C, shutting down"),
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    Ok(signalled)
}

/// Captures every configured port and uploads on a fixed cadence until
/// `stop` resolves, then closes all segments.
async fn daemon(
    config: Config,
    store: Arc<dyn ObjectStore>,
    connector: Arc<dyn Connector>,
    stop: impl Future<Output = ()>,
) {
    let registry = SegmentRegistry::new();
    let shutdown = ShutdownSignal::new();

    let captures: Vec<(String, JoinHandle<CoreResult<CaptureSummary>>)> = config
        .ports
        .iter()
        .map(|port| {
            let mut capture = CaptureLoop::new(
                port.stream.clone(),
                port.device.as_str(),
                config.capture(),
                registry.clone(),
                shutdown.clone(),
            );
            let connector = Arc::clone(&connector);
            let task = tokio::task::spawn_blocking(move || capture.run(connector.as_ref()));
            (port.stream.to_string(), task)
        })
        .collect();

    let consolidator = Consolidator::from_config(&config, registry.clone(), store);
    let mut ticker = time::interval(config.upload_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first pass runs one interval
    // after start.
    ticker.tick().await;

    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = ticker.tick() => consolidate(&consolidator).await,
            () = &mut stop => break,
        }
    }

    shutdown.request();
    for (stream, task) in captures {
        match task.await {
            Ok(Ok(summary)) => {
                tracing::debug!(stream = %stream, segments = summary.segments_opened, "capture finished");
            }
            // Already logged by the capture loop.
            Ok(Err(_)) => {}
            Err(err) => tracing::error!(stream = %stream, error = %err, "capture task failed"),
        }
    }

    let leftover = registry.snapshot();
    if !leftover.is_empty() {
        tracing::warn!(paths = ?leftover, "segments still registered at exit");
    }
    tracing::info!("portlog stopped");
}

async fn consolidate(consolidator: &Consolidator) {
    let consolidator = consolidator.clone();
    match tokio::task::spawn_blocking(move || consolidator.run_pass()).await {
        Ok(Ok(report)) => tracing::info!(
            uploaded = report.groups_uploaded,
            failed = report.groups_failed,
            removed = report.files_removed + report.zero_byte_removed,
            bytes = report.bytes_uploaded,
            "consolidation pass"
        ),
        Ok(Err(err)) => tracing::error!(error = %err, "consolidation pass failed"),
        Err(err) => tracing::error!(error = %err, "consolidation task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use portlog_core::{PortMapping, ScriptStep, ScriptedConnector, ScriptedTransport};
    use portlog_store::MemoryObjectStore;
    use std::fs;
    use std::io::Read;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_closes_and_compresses_active_segments() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new()
            .storage_dir(dir.path())
            .port("0=/dev/test".parse::<PortMapping>().unwrap());

        let connector = ScriptedConnector::new();
        let mut steps = vec![ScriptStep::Data(b"hello\n".to_vec())];
        steps.extend((0..500).map(|_| ScriptStep::Idle(Duration::from_millis(10))));
        connector.insert("/dev/test", ScriptedTransport::new(steps));

        let store = Arc::new(MemoryObjectStore::new());
        daemon(
            config,
            store.clone(),
            Arc::new(connector),
            time::sleep(Duration::from_millis(200)),
        )
        .await;

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("0_") && names[0].ends_with(".gz"));

        let mut content = String::new();
        MultiGzDecoder::new(fs::File::open(dir.path().join(&names[0])).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.ends_with(": hello\n"));
        // The first upload is one interval away.
        assert!(store.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_resolves_shutdown_signal() {
        let stop = shutdown_signal().unwrap();

        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -TERM {}", std::process::id()))
            .status()
            .unwrap();
        assert!(status.success());

        time::timeout(Duration::from_secs(5), stop).await.unwrap();
    }
}
