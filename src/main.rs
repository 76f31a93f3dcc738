use std::collections::BTreeSet;
use std::io::Read;

use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use sesiones::config::EngineConfig;
use sesiones::editor::EditorView;
use sesiones::model::Session;
use sesiones::repository::InMemoryRepository;
use sesiones::timezone::utc_to_local_str;
use sesiones::workspace::DealWorkspace;

#[derive(Serialize)]
struct SessionReport {
    id: Ulid,
    deal_id: Ulid,
    name: String,
    start_local: Option<String>,
    end_local: Option<String>,
    #[serde(flatten)]
    view: EditorView,
}

/// Reads a JSON array of sessions from the file named on the command line
/// (or stdin) and prints one conflict report per session.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SESIONES_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    sesiones::observability::init(metrics_port)?;

    let config = EngineConfig::from_env()?;
    let input = match std::env::args().nth(1) {
        Some(path) if path != "-" => std::fs::read_to_string(&path)?,
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let sessions: Vec<Session> = serde_json::from_str(&input)?;
    let deal_ids: BTreeSet<Ulid> = sessions.iter().map(|s| s.deal_id).collect();
    info!("loaded {} sessions across {} deals", sessions.len(), deal_ids.len());
    info!("  timezone: {}", config.timezone);
    info!("  exempt units: {}", config.exempt_unit_ids.len());

    let repo = InMemoryRepository::load(sessions);
    let tz = config.timezone;
    let mut reports = Vec::new();
    for deal_id in deal_ids {
        let mut workspace = DealWorkspace::load(&repo, deal_id, config.clone()).await?;
        let labels = workspace.display_names();
        for (key, name) in labels {
            let view = workspace.refresh_availability(key, &repo).await?;
            let local = |ms: Option<i64>| ms.map(|ms| utc_to_local_str(ms, tz)).transpose();
            let (start, end) = view.range.map_or((None, None), |r| (Some(r.start), Some(r.end)));
            reports.push(SessionReport {
                id: key,
                deal_id,
                name,
                start_local: local(start)?,
                end_local: local(end)?,
                view,
            });
        }
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
