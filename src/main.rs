use lablink::commands::handle_line;
use lablink::core::LabConfig;
use lablink::{logging, LabService};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    logging::init();

    let config = match LabConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("cannot load configuration: {}", e);
            std::process::exit(2);
        }
    };
    let service = match LabService::new(config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("cannot start: {}", e);
            std::process::exit(2);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::info!("lablink {} listening on stdin", env!("CARGO_PKG_VERSION"));

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&service, &line).await;
        let mut encoded = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("cannot encode response: {}", e);
                continue;
            }
        };
        encoded.push(b'\n');
        if stdout.write_all(&encoded).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }

    let closed = service.shutdown();
    tracing::info!("shutting down, {} pooled session(s) closed", closed);
}
