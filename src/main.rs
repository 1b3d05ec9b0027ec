use std::sync::Arc;

use inbox_triage::settings::TriageSettings;
use inbox_triage::store::{LibSqlBackend, StateBackend, TriageStore};
use inbox_triage::HttpClassifier;

/// Connection-test harness: reads provider settings from the environment,
/// runs the canned classification probe, and prints the verdict. Lets a
/// provider/key/model combination be validated before any real run.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = TriageSettings::from_env().normalized();

    eprintln!("📬 Inbox Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Provider: {}", settings.provider.as_str());
    eprintln!("   Endpoint: {}", settings.endpoint_base);
    eprintln!("   Model: {}", settings.model);

    let db_path =
        std::env::var("TRIAGE_DB_PATH").unwrap_or_else(|_| "./data/triage.db".to_string());
    let backend: Arc<dyn StateBackend> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    let store = TriageStore::new(Arc::clone(&backend));
    store.load().await?;

    let classifier = HttpClassifier::new();
    eprintln!("\n   Running connection test…");
    match classifier.test_connection(&settings).await {
        Ok(verdicts) => match verdicts.first() {
            Some(verdict) => {
                eprintln!(
                    "   ✓ Provider reachable: probe classified as {} (score {}, \"{}\")",
                    verdict.level, verdict.score, verdict.reason
                );
            }
            None => {
                eprintln!("   ✗ Provider reachable but returned no usable verdict");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("   ✗ Connection test failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
