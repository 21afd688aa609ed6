//! Terminal monitor for indexing jobs.
//!
//! `firestick-monitor` follows the latest job until it finishes.
//! `firestick-monitor start [ROOT] [EXCLUDE_DIRS] [EXCLUDE_GLOBS]` starts a
//! run first; omitted arguments reuse the parameters of the previous run.

use anyhow::Context;
use firestick_client::{ClientConfig, Session, StreamState, StreamStatus};
use firestick_core::job::{JobHandle, STAT_FILES_DISCOVERED, STAT_FILES_PARSED};
use firestick_core::prefs::JobParams;
use firestick_core::store::JobProgress;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "firestick_client=debug,firestick_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env().context("Invalid configuration")?;
    tracing::info!(base_url = %config.base_url, "Connecting to indexing backend");
    let session = Session::new(config);

    match session.api().health().await {
        Ok(health) if health.healthy => tracing::info!(status = %health.status, "Backend healthy"),
        Ok(health) => tracing::warn!(status = %health.status, "Backend reports unhealthy"),
        Err(e) => tracing::warn!(error = %e, "Health probe failed"),
    }
    match session.api().embedding_info().await {
        Ok(info) => tracing::info!(mode = %info.mode, "Embedding mode"),
        Err(e) => tracing::warn!(error = %e, "Embedding probe failed"),
    }

    // Subscribe before the driver exists so its first transitions are seen.
    let progress = session.store().subscribe();
    let status = session.supervisor().subscribe();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("start") {
        let params = start_params(&session, &args[1..]);
        let job_id = session
            .start_indexing(params)
            .await
            .context("Failed to start indexing")?;
        tracing::info!(job_id = %job_id, "Following new job");
    } else {
        let latest = session
            .refresh_latest()
            .await
            .context("Failed to fetch latest job")?;
        report(&latest);
        if latest.is_terminal() {
            return Ok(());
        }
    }

    follow(progress, status).await;

    session.stop();
    Ok(())
}

/// Log progress and channel state until the job closes or the user
/// interrupts.
async fn follow(
    mut progress: watch::Receiver<JobProgress>,
    mut status: watch::Receiver<StreamStatus>,
) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(job) = progress.borrow_and_update().job.as_ref() {
                    report(job);
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().state;
                tracing::info!(state = state.name(), "Live channel state");
                if state == StreamState::Closed {
                    break;
                }
            }
        }
    }
}

/// Build run parameters from positional arguments, falling back to the
/// ones remembered from the previous run.
fn start_params(session: &Session, args: &[String]) -> JobParams {
    let previous = session.last_job_params();
    let root = args
        .first()
        .cloned()
        .or(previous.root.clone())
        .unwrap_or_default();
    let exclude_dirs = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| previous.exclude_dirs.join(","));
    let exclude_globs = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| previous.exclude_globs.join(","));
    JobParams::from_inputs(&root, &exclude_dirs, &exclude_globs)
}

fn report(job: &JobHandle) {
    tracing::info!(
        job_id = %job.id,
        status = ?job.status,
        percent = job.progress_percent,
        files_discovered = job.stat(STAT_FILES_DISCOVERED).unwrap_or_default(),
        files_parsed = job.stat(STAT_FILES_PARSED).unwrap_or_default(),
        "Job progress",
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use firestick_core::job::JobStatus;
    use firestick_core::types::JobId;

    use super::*;

    #[tokio::test]
    async fn follow_returns_when_job_closes_before_the_loop_starts() {
        let session = Session::new(ClientConfig::default());
        let progress = session.store().subscribe();
        let status = session.supervisor().subscribe();

        let mut finished = JobHandle::new(JobId::from(3));
        finished.status = JobStatus::Completed;
        session.open_job(finished);

        let mut closed = session.supervisor().subscribe();
        closed.wait_for(|s| s.state == StreamState::Closed).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), follow(progress, status))
            .await
            .expect("monitor kept waiting after the job closed");
    }

    #[test]
    fn start_params_fall_back_to_previous_run() {
        let session = Session::new(ClientConfig::default());
        let params = start_params(&session, &["/src".to_string()]);
        assert_eq!(params.root.as_deref(), Some("/src"));
        assert!(params.exclude_dirs.is_empty());
    }
}
