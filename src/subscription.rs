use std::collections::{HashMap, HashSet};

use thiserror::Error;
use yellowstone_grpc_proto::prelude::{
    CommitmentLevel as PbCommitmentLevel, SubscribeRequest, SubscribeRequestFilterAccounts,
    SubscribeRequestFilterTransactions,
};

pub const DEFAULT_FILTER_NAME: &str = "account_monitor";

/// How final a block must be before the provider reports its transactions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Commitment {
    #[default]
    Processed,
    Confirmed,
    Finalized,
}

impl From<Commitment> for PbCommitmentLevel {
    fn from(commitment: Commitment) -> Self {
        match commitment {
            Commitment::Processed => PbCommitmentLevel::Processed,
            Commitment::Confirmed => PbCommitmentLevel::Confirmed,
            Commitment::Finalized => PbCommitmentLevel::Finalized,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no account configured, refusing to subscribe with an empty filter")]
    NoAccounts,
    #[error("empty address at position {0} in {1}")]
    EmptyAddress(usize, &'static str),
    #[error("filter name must not be empty")]
    EmptyFilterName,
}

/// Subscription parameters as read from the command line / environment.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub accounts: Vec<String>,
    pub account_required: Vec<String>,
    pub account_exclude: Vec<String>,
    pub commitment: Commitment,
    pub include_vote: bool,
    pub include_failed: bool,
    pub subscribe_account_updates: bool,
    pub filter_name: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            account_required: Vec::new(),
            account_exclude: Vec::new(),
            commitment: Commitment::default(),
            include_vote: false,
            include_failed: false,
            subscribe_account_updates: false,
            filter_name: DEFAULT_FILTER_NAME.to_string(),
        }
    }
}

/// Immutable filter set sent once per stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    filter_name: String,
    accounts: Vec<String>,
    account_required: Vec<String>,
    account_exclude: Vec<String>,
    commitment: Commitment,
    include_vote: bool,
    include_failed: bool,
    subscribe_account_updates: bool,
}

impl SubscriptionDescriptor {
    pub fn filter_name(&self) -> &str {
        &self.filter_name
    }

    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }

    pub fn account_required(&self) -> &[String] {
        &self.account_required
    }

    pub fn account_exclude(&self) -> &[String] {
        &self.account_exclude
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    /// Wire form understood by the Geyser plugin.
    pub fn to_request(&self) -> SubscribeRequest {
        // `Some(false)` drops vote/failed transactions, `None` lets both through
        let transactions = HashMap::from([(
            self.filter_name.clone(),
            SubscribeRequestFilterTransactions {
                vote: (!self.include_vote).then_some(false),
                failed: (!self.include_failed).then_some(false),
                account_include: self.accounts.clone(),
                account_exclude: self.account_exclude.clone(),
                account_required: self.account_required.clone(),
                ..Default::default()
            },
        )]);

        let accounts = if self.subscribe_account_updates {
            HashMap::from([(
                self.filter_name.clone(),
                SubscribeRequestFilterAccounts {
                    account: self.accounts.clone(),
                    ..Default::default()
                },
            )])
        } else {
            HashMap::new()
        };

        SubscribeRequest {
            accounts,
            transactions,
            commitment: Some(PbCommitmentLevel::from(self.commitment) as i32),
            ..Default::default()
        }
    }
}

/// Validates `config` and produces the descriptor. Fails instead of building a
/// filter that would match every transaction on the cluster.
pub fn build(config: &SubscriptionConfig) -> Result<SubscriptionDescriptor, ConfigError> {
    let accounts = normalize(&config.accounts, "accounts")?;
    if accounts.is_empty() {
        return Err(ConfigError::NoAccounts);
    }
    let filter_name = config.filter_name.trim();
    if filter_name.is_empty() {
        return Err(ConfigError::EmptyFilterName);
    }

    Ok(SubscriptionDescriptor {
        filter_name: filter_name.to_string(),
        accounts,
        account_required: normalize(&config.account_required, "account_required")?,
        account_exclude: normalize(&config.account_exclude, "account_exclude")?,
        commitment: config.commitment,
        include_vote: config.include_vote,
        include_failed: config.include_failed,
        subscribe_account_updates: config.subscribe_account_updates,
    })
}

/// Trims and dedups, keeping first-seen order.
fn normalize(addresses: &[String], field: &'static str) -> Result<Vec<String>, ConfigError> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(addresses.len());
    for (idx, address) in addresses.iter().enumerate() {
        let address = address.trim();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress(idx, field));
        }
        if seen.insert(address) {
            normalized.push(address.to_string());
        }
    }
    Ok(normalized)
}
