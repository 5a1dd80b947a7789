use std::{io, sync::Arc, time::Duration};

use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use log::*;
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::{
    connection::GeyserConnector,
    dispatcher::{DispatchMetrics, LoggingHandler},
    lifecycle::{LifecycleController, LifecycleError},
    subscription::{Commitment, ConfigError, SubscriptionConfig, DEFAULT_FILTER_NAME},
};

mod connection;
mod dispatcher;
mod lifecycle;
mod subscription;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Yellowstone gRPC endpoint. Eg. `https://grpc.example.com:443`
    #[arg(long, env)]
    grpc_url: String,

    /// Auth token sent in the `x-token` header.
    #[arg(long, env)]
    x_token: Option<String>,

    /// Accounts to watch. Transactions mentioning any of them are logged.
    /// Requires at least one account, comma separated.
    #[arg(long, env, value_delimiter = ',', required(true))]
    accounts: Vec<String>,

    /// Accounts that must all appear in a transaction for it to match, comma separated.
    #[arg(long, env, value_delimiter = ',')]
    account_required: Vec<String>,

    /// Transactions mentioning any of these accounts are dropped by the provider, comma separated.
    #[arg(long, env, value_delimiter = ',')]
    account_exclude: Vec<String>,

    #[arg(long, env, value_enum, default_value_t = Commitment::Processed)]
    commitment: Commitment,

    /// Also receive vote transactions.
    #[arg(long, env, default_value_t = false)]
    include_vote: bool,

    /// Also receive failed transactions.
    #[arg(long, env, default_value_t = false)]
    include_failed: bool,

    /// Subscribe to account updates for `accounts` as well. These are received but not logged.
    #[arg(long, env, default_value_t = false)]
    subscribe_account_updates: bool,

    /// Label the provider echoes back on every matching update.
    #[arg(long, env, default_value = DEFAULT_FILTER_NAME)]
    filter_name: String,

    #[arg(long, env, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Largest update the client will decode, in bytes.
    #[arg(long, env, default_value_t = 64 * 1024 * 1024)]
    max_decoding_message_size: usize,

    /// Interval between logging frame stats to stdout and influx
    #[arg(long, env, default_value_t = 15_000, value_parser = clap::value_parser!(u64).range(1..))]
    metrics_report_interval_ms: u64,
}

impl Args {
    fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            accounts: self.accounts.clone(),
            account_required: self.account_required.clone(),
            account_exclude: self.account_exclude.clone(),
            commitment: self.commitment,
            include_vote: self.include_vote,
            include_failed: self.include_failed,
            subscribe_account_updates: self.subscribe_account_updates,
            filter_name: self.filter_name.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeyserWatcherError {
    #[error("ConfigError {0}")]
    ConfigError(#[from] ConfigError),
    #[error("LifecycleError {0}")]
    LifecycleError(#[from] LifecycleError),
    #[error("IoError {0}")]
    IoError(#[from] io::Error),
}

fn main() -> Result<(), GeyserWatcherError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(Some(TimestampPrecision::Micros))
        .init();
    let args = Args::parse();

    // fail before touching the network
    let descriptor = subscription::build(&args.subscription_config()).map_err(|e| {
        error!("Invalid subscription: {e}");
        e
    })?;

    let connector = GeyserConnector::new(
        args.grpc_url.clone(),
        args.x_token.clone(),
        Duration::from_millis(args.connect_timeout_ms),
        args.max_decoding_message_size,
    );
    let metrics = Arc::new(DispatchMetrics::default());
    let mut controller = LifecycleController::new(
        metrics.clone(),
        Duration::from_millis(args.metrics_report_interval_ms),
    );
    let signals = lifecycle::shutdown_notifier(controller.shutdown_sender())?;

    let runtime = Runtime::new()?;
    let result = runtime.block_on(controller.run(&connector, &descriptor, LoggingHandler::default()));
    signals.close();

    let totals = metrics.totals();
    info!(
        "Exiting geyser watcher, {} frames received, {} transactions, {} handler failures, {} discarded, {} pings.",
        totals.received,
        totals.transactions,
        totals.handler_failures,
        totals.discarded,
        totals.pings,
    );

    debug!("Lifecycle ended in {:?}", controller.state());
    match result {
        Ok(shutdown) => {
            info!(
                "Shut down gracefully: {:?}, logged {} transactions, ignored {} late shutdown triggers.",
                shutdown.reason,
                shutdown.handler.logged(),
                shutdown.ignored_triggers
            );
            Ok(())
        }
        Err(e) => {
            error!("Exiting on fatal error: {e}");
            Err(e.into())
        }
    }
}
