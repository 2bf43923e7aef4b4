use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rpatch::chunked::plan_chunks;
use rpatch::config::{PatchConfig, ScanConfig, TransferConfig};
use rpatch::manifest::{
    generate_manifests, load_base_manifest, load_patch_manifest, write_manifests, GeneratorOptions,
};
use rpatch::progress::{PatchProgress, ProgressSender, ScanProgress, TransferProgress};
use rpatch::state::TransferState;
use rpatch::utils::{get_filename_from_url, sanitize_filename};
use rpatch::{IntegrityScanner, PatchApplier, PatchError, TransferCoordinator, TransferHandle, TransferStatus};

use crate::cli::FingerprintCheck;
use crate::daemon;

fn transfer_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    // Keep drawing when stderr is redirected to the daemon log.
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn count_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>6}/{len:<6} {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn render_transfer(pb: &ProgressBar, progress: &TransferProgress) {
    if let Some(total) = progress.total_bytes {
        pb.set_length(total);
    }
    pb.set_position(progress.downloaded_bytes);
    let speed = if progress.stalled {
        "stalled".to_string()
    } else {
        format!("{}/s", HumanBytes(progress.bytes_per_second as u64))
    };
    pb.set_message(format!("{:>12} {}", speed, progress.name));
}

/// Ctrl-C pauses a foreground download. A daemon pauses on SIGUSR1, resumes
/// on SIGUSR2 and stops on SIGTERM.
#[cfg_attr(not(unix), allow(unused_variables))]
fn spawn_signal_listener(handle: TransferHandle, daemon: bool, stop: CancellationToken) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    if daemon {
        use tokio::signal::unix::{signal, SignalKind};
        let mut pause = signal(SignalKind::user_defined1()).context("Failed to listen for SIGUSR1")?;
        let mut resume = signal(SignalKind::user_defined2()).context("Failed to listen for SIGUSR2")?;
        let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        return Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pause.recv() => {
                        handle.pause();
                    }
                    _ = resume.recv() => {
                        handle.resume();
                    }
                    _ = terminate.recv() => {
                        stop.cancel();
                        break;
                    }
                }
            }
        }));
    }

    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    }))
}

pub async fn run_download(
    url: String,
    destination: Option<PathBuf>,
    config: TransferConfig,
    daemon: bool,
) -> Result<()> {
    let destination = match destination {
        Some(path) => path,
        None => PathBuf::from(sanitize_filename(&get_filename_from_url(&url)?)),
    };

    let coordinator = TransferCoordinator::new(config);
    let handle = coordinator.start_download(&url, &destination);
    let name = handle.target().display_name();

    let stop = CancellationToken::new();
    let listener = spawn_signal_listener(handle.clone(), daemon, stop.clone())?;

    let pb = transfer_bar()?;
    pb.set_message(format!("Downloading {}", name));

    let mut status = handle.status();
    let mut progress = handle.progress();
    let outcome = loop {
        let current = status.borrow_and_update().clone();
        match current {
            TransferStatus::Running => {}
            // A paused daemon keeps waiting for SIGUSR2.
            TransferStatus::Paused if daemon => pb.set_message(format!("Paused      {}", name)),
            other => break other,
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break handle.current_status();
                }
            }
            changed = progress.changed() => {
                if changed.is_ok() {
                    render_transfer(&pb, &progress.borrow_and_update());
                }
            }
            _ = stop.cancelled() => {
                handle.pause();
                break handle.current_status();
            }
        }
    };

    handle.settle().await;
    listener.abort();
    render_transfer(&pb, &handle.progress().borrow());
    if daemon {
        daemon::cleanup_pid_file();
    }

    match outcome {
        TransferStatus::Completed { bytes } => {
            pb.finish_with_message(format!("Completed   {} ({})", name, HumanBytes(bytes)));
            Ok(())
        }
        TransferStatus::Paused => {
            pb.abandon_with_message(format!("Paused      {} (run the same command to resume)", name));
            Ok(())
        }
        TransferStatus::Failed { message } => {
            pb.abandon_with_message(format!("Failed      {}", name));
            bail!("Failed to download {}: {}", url, message)
        }
        TransferStatus::Superseded | TransferStatus::Running => {
            pb.abandon();
            bail!("Transfer of {} ended unexpectedly", url)
        }
    }
}

/// One row of the status listing.
struct TransferRow {
    name: String,
    kind: &'static str,
    downloaded: u64,
    total: Option<u64>,
}

async fn collect_transfers(dir: &Path) -> Result<Vec<TransferRow>> {
    let mut rows = vec![];
    let mut metas = HashSet::new();
    let mut partials = vec![];

    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read directory {:?}", dir))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        if let Some(target) = filename.strip_suffix(".meta") {
            if let Some(state) = TransferState::load(&path).await {
                let chunk_size = state.chunk_size.unwrap_or(TransferConfig::default().chunk_size);
                let downloaded = plan_chunks(state.total_bytes, chunk_size)
                    .iter()
                    .filter(|c| state.is_complete(c.start_offset))
                    .map(|c| c.size)
                    .sum();
                metas.insert(target.to_string());
                rows.push(TransferRow {
                    name: target.to_string(),
                    kind: "Chunked",
                    downloaded,
                    total: Some(state.total_bytes),
                });
            }
        } else if let Some(target) = filename.strip_suffix(".downloading") {
            if let Ok(metadata) = entry.metadata().await {
                partials.push((target.to_string(), metadata.len()));
            }
        }
    }

    for (name, len) in partials {
        if !metas.contains(&name) {
            rows.push(TransferRow {
                name,
                kind: "Stream",
                downloaded: len,
                total: None,
            });
        }
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rows)
}

pub async fn list_transfers(dir: PathBuf) -> Result<()> {
    if !dir.exists() {
        println!("Directory '{:?}' does not exist.", dir);
        return Ok(());
    }

    let rows = collect_transfers(&dir).await?;
    let downloaded: u64 = rows.iter().map(|r| r.downloaded).sum();
    let known: u64 = rows.iter().filter_map(|r| r.total).sum();
    let daemon_state = match daemon::daemon_pid() {
        Some(pid) => format!("running (PID: {})", pid),
        None => "not running".to_string(),
    };

    println!(
        "Summary: Transfers: {} | Downloaded: {} / {} | Daemon: {}",
        rows.len(),
        HumanBytes(downloaded),
        HumanBytes(known),
        daemon_state
    );
    println!();

    if rows.is_empty() {
        println!("No in-flight transfers found in '{:?}'.", dir);
        return Ok(());
    }

    println!("{:<50} {:<10} {:<12} {:<15}", "Filename", "Mode", "Progress", "Size");
    println!("{:-<50} {:-<10} {:-<12} {:-<15}", "", "", "", "");
    for row in rows {
        let (progress, size) = match row.total {
            Some(total) if total > 0 => (
                format!("{:.2}%", row.downloaded as f64 / total as f64 * 100.0),
                format!("{}", HumanBytes(total)),
            ),
            _ => ("-".to_string(), format!("{} so far", HumanBytes(row.downloaded))),
        };
        println!("{:<50} {:<10} {:<12} {:<15}", row.name, row.kind, progress, size);
    }
    Ok(())
}

pub async fn follow_status(dir: PathBuf) -> Result<()> {
    loop {
        print!("\x1B[1;1H\x1B[0J");
        list_transfers(dir.clone()).await?;
        println!("\n(Press Ctrl+C to exit view)");
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

fn spawn_scan_bar(pb: ProgressBar, mut rx: mpsc::UnboundedReceiver<ScanProgress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            pb.set_length(p.total_count as u64);
            pb.set_position(p.processed_count as u64);
            pb.set_message(p.current_name);
        }
    })
}

fn spawn_patch_bar(pb: ProgressBar, mut rx: mpsc::UnboundedReceiver<PatchProgress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            pb.set_length(p.total_count as u64);
            pb.set_position(p.processed_count as u64);
            pb.set_message(format!(
                "{} {:.0}% | {}",
                p.current_name,
                p.current_file_percentage,
                HumanBytes(p.total_bytes_downloaded)
            ));
        }
    })
}

pub async fn run_scan(
    install: PathBuf,
    base: Option<PathBuf>,
    patches: Option<String>,
    verify: FingerprintCheck,
) -> Result<()> {
    let scanner = IntegrityScanner::new(verify.verifier(), ScanConfig::default());
    let pb = count_bar()?;
    let (tx, rx) = ProgressSender::channel();
    let bar = spawn_scan_bar(pb.clone(), rx);

    let report = match (base, patches) {
        (Some(base), _) => {
            let manifest = load_base_manifest(&base).await?;
            scanner.scan_base(&install, &manifest, &tx).await?
        }
        (None, Some(source)) => {
            let fetcher = rpatch::Fetcher::new(&TransferConfig::default());
            let manifest = load_patch_manifest(fetcher.client(), &source).await?;
            verify.check_manifest(&manifest)?;
            scanner.scan_patches(&install, &manifest, &tx).await?
        }
        (None, None) => bail!("Either --base or --patches is required"),
    };
    drop(tx);
    let _ = bar.await;
    pb.finish_and_clear();

    if report.is_clean() {
        println!("All files match the manifest.");
    } else {
        println!("{} file(s) need repair:", report.mismatched_files.len());
        for file in &report.mismatched_files {
            println!("  {}", file);
        }
    }
    Ok(())
}

pub async fn run_apply(
    install: PathBuf,
    manifest_source: String,
    base: Option<PathBuf>,
    transfer: TransferConfig,
    patch: PatchConfig,
    verify: FingerprintCheck,
) -> Result<()> {
    let fetcher = rpatch::Fetcher::new(&transfer);
    let manifest = load_patch_manifest(fetcher.client(), &manifest_source).await?;
    verify.check_manifest(&manifest)?;

    let verifier = verify.verifier();
    let applier = PatchApplier::new(fetcher, verifier.clone(), patch);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let pb = count_bar()?;
    let (tx, rx) = ProgressSender::channel();
    let bar = spawn_patch_bar(pb.clone(), rx);

    let result = match base {
        Some(base) => {
            let base_manifest = load_base_manifest(&base).await?;
            let scanner = IntegrityScanner::new(verifier, ScanConfig::default());
            let scan = scanner
                .scan_base(&install, &base_manifest, &ProgressSender::none())
                .await?;
            pb.println(format!("Base scan flagged {} file(s)", scan.mismatched_files.len()));
            applier.apply_repairs(&install, &manifest, &scan, &tx, &cancel).await
        }
        None => applier.apply(&install, &manifest, &tx, &cancel).await,
    };
    drop(tx);
    let _ = bar.await;
    ctrl_c.abort();

    match result {
        Ok(report) => {
            pb.finish_with_message(format!(
                "Done: {} delivered, {} deleted, {} downloaded",
                report.delivered,
                report.deleted,
                HumanBytes(report.bytes_downloaded)
            ));
            Ok(())
        }
        Err(PatchError::Cancelled) => {
            pb.abandon_with_message("Interrupted; run again to continue");
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Failed");
            Err(e).context("Patch process failed")
        }
    }
}

pub async fn run_generate(
    client_dir: PathBuf,
    out_dir: Option<PathBuf>,
    base_url: String,
    pattern: String,
) -> Result<()> {
    let options = GeneratorOptions {
        base_url,
        patch_pattern: pattern,
        ..Default::default()
    };
    println!("Scanning {:?}...", client_dir);
    let manifests = generate_manifests(&client_dir, &options).await?;

    let out_dir = out_dir.unwrap_or_else(|| client_dir.clone());
    let (base_path, patch_path) = write_manifests(&manifests, &out_dir).await?;
    println!("Wrote {} files to {:?}", manifests.base.files.len(), base_path);
    println!(
        "Wrote {} patches (version {}) to {:?}",
        manifests.patches.patches.len(),
        manifests.patches.version,
        patch_path
    );
    Ok(())
}
