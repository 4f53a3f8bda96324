use std::{path::PathBuf, time::Duration};

use miniboard_agent::{
    InstanceSupervisor, SupervisorError, SupervisorSettings, saves,
    settings::{ProcessEnv, autostart_spec, poll_interval},
};
use miniboard_process::{InstanceState, InstanceStatus, LogChunk};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console logging always; a daily file as well when `MINIBOARD_AGENT_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("MINIBOARD_AGENT_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(PathBuf::from(dir), "miniboard-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn report(err: &SupervisorError) {
    tracing::error!(code = err.code(), "{}", err.to_payload());
}

/// Drains everything queued so far. Returns true once the run's output ended.
fn pump_logs(supervisor: &InstanceSupervisor) -> bool {
    while let Some(chunk) = supervisor.read_log() {
        match &chunk {
            LogChunk::Stdout(text) => tracing::info!(target: "server", "{}", text.trim_end()),
            LogChunk::Stderr(text) => tracing::warn!(target: "server", "{}", text.trim_end()),
            LogChunk::Notice(text) => tracing::info!("{text}"),
            LogChunk::EndOfStream => {
                tracing::info!("{}", chunk.render());
                return true;
            }
        }
    }
    false
}

/// The end of output comes just before the final status; wait briefly for it.
async fn settled_status(supervisor: &InstanceSupervisor) -> InstanceStatus {
    let mut rx = supervisor.subscribe();
    let settled = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|st| st.state == InstanceState::Stopped),
    )
    .await;
    match settled {
        Ok(Ok(st)) => st.clone(),
        _ => supervisor.status(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let settings = SupervisorSettings::from_env();
    tracing::info!(
        data_root = %settings.data_root.display(),
        binary = %settings.binary.display(),
        version = env!("CARGO_PKG_VERSION"),
        "miniboard-agent starting"
    );

    match saves::list_saves(&settings.saves_dir) {
        Ok(list) => {
            for save in list {
                tracing::info!(
                    name = %save.name,
                    size = %save.display_size(),
                    date = %save.display_date(),
                    "save available"
                );
            }
        }
        Err(err) => tracing::warn!(error = %format!("{err:#}"), "cannot list saves"),
    }

    let supervisor = InstanceSupervisor::new(settings).inspect_err(report)?;

    let Some(spec) = autostart_spec(&ProcessEnv) else {
        tracing::info!("MINIBOARD_START_SAVE not set, nothing to supervise");
        return Ok(());
    };

    let status = supervisor.start(spec).await.inspect_err(report)?;
    tracing::info!(pid = ?status.pid, port = ?status.port, save = ?status.save, "instance running");

    let mut ticker = tokio::time::interval(poll_interval(&ProcessEnv));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupt received, stopping instance");
                break;
            }
            _ = ticker.tick() => {
                if pump_logs(&supervisor) {
                    let st = settled_status(&supervisor).await;
                    if let Some(error) = st.error {
                        anyhow::bail!("instance stopped: {error}");
                    }
                    return Ok(());
                }
            }
        }
    }

    match supervisor.stop().await {
        Ok(st) => {
            if let Some(message) = &st.message {
                tracing::warn!(%message, "instance stop incomplete");
            }
            tracing::info!(exit_code = ?st.exit_code, "instance stopped");
        }
        // Exited on its own between the last poll and the interrupt.
        Err(SupervisorError::NoActiveInstance) => {}
        Err(err) => {
            report(&err);
            return Err(err.into());
        }
    }

    // Give the relay a moment to deliver the tail of the output.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !pump_logs(&supervisor) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}
