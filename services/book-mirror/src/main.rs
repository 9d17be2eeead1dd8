use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use types::ids::Symbol;

use book_mirror::metrics::FeedMetrics;
use book_mirror::reconciler::Reconciler;
use book_mirror::session::SessionStates;
use book_mirror::transport::WsConnector;
use book_mirror::view::ViewError;
use book_mirror::{BookStore, FeedSession, MirrorConfig, Supervisor, ViewBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = MirrorConfig::from_env()?;

    // RUST_LOG wins over LOG_LEVEL.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::default().add_directive(config.log_level.into())
            }),
        )
        .init();

    info!(
        url = %config.ws_url,
        symbols = ?config.symbols,
        depth = config.depth,
        private = config.private,
        "Starting order book mirror"
    );

    let store = Arc::new(BookStore::new());
    let metrics = Arc::new(FeedMetrics::new());
    let reconciler = Reconciler::new(Arc::clone(&store), config.anomaly_resync_threshold);
    let session = FeedSession::new(reconciler, Arc::clone(&metrics));
    let states = session.states();

    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new(WsConnector, config.clone(), session);
    let supervisor_task = tokio::spawn(supervisor.run(cancel.clone()));

    let monitor_task = {
        let views = ViewBuilder::new(Arc::clone(&store));
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        let every = config.monitor_interval;
        let symbols = config.symbols.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => report(&views, &states, &metrics, &symbols),
                }
            }
        })
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let outcome = supervisor_task.await;
    cancel.cancel();
    let _ = monitor_task.await;

    match outcome {
        Ok(Ok(())) => {
            info!(counters = ?metrics.export(), "Stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Supervisor exited with error");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Supervisor task panicked");
            Err(e.into())
        }
    }
}

fn report(views: &ViewBuilder, states: &SessionStates, metrics: &FeedMetrics, symbols: &[Symbol]) {
    for symbol in symbols {
        let state = states.get(symbol);
        match views.build_ticker(symbol) {
            Ok(ticker) => info!(
                symbol = %symbol,
                state = %state,
                bid = %ticker.bid_price,
                bid_size = %ticker.bid_size,
                ask = %ticker.ask_price,
                ask_size = %ticker.ask_size,
                spread = %ticker.spread(),
                "Top of book"
            ),
            Err(ViewError::NoLiquidity { .. }) => {
                info!(symbol = %symbol, state = %state, "No liquidity")
            }
            Err(e) => warn!(symbol = %symbol, state = %state, error = %e, "Book unavailable"),
        }
    }

    let latency = metrics.apply_latency();
    info!(
        counters = ?metrics.export(),
        apply_p50_ns = latency.p50,
        apply_p99_ns = latency.p99,
        "Feed metrics"
    );
}
