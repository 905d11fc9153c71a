//! Read-only balance fan-out across every wallet and every source.
//!
//! Queries run concurrently. A failing or slow source only affects its own
//! reports.
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};

use crate::app_state::SharedVaultContext;
use crate::chain::{ChainAdapter, ChainAdapters};
use crate::errors::{WalletError, WalletResult};
use crate::registry::{WalletId, WalletSummary};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Informational balance provider.
pub trait BalanceSource: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, _chain_type: &str) -> bool {
        true
    }

    fn balance<'a>(&'a self, address: &'a str) -> BoxFuture<'a, WalletResult<u128>>;
}

/// Balance lookups served by a chain adapter's own backend.
pub struct AdapterBalanceSource {
    adapter: Arc<dyn ChainAdapter>,
}

impl AdapterBalanceSource {
    pub fn new(adapter: Arc<dyn ChainAdapter>) -> Self {
        Self { adapter }
    }

    /// One source per registered adapter.
    pub fn all(adapters: &ChainAdapters) -> Vec<Arc<dyn BalanceSource>> {
        adapters
            .iter()
            .map(|adapter| Arc::new(Self::new(Arc::clone(adapter))) as Arc<dyn BalanceSource>)
            .collect()
    }
}

impl BalanceSource for AdapterBalanceSource {
    fn name(&self) -> &str {
        self.adapter.chain_type()
    }

    fn supports(&self, chain_type: &str) -> bool {
        chain_type == self.adapter.chain_type()
    }

    fn balance<'a>(&'a self, address: &'a str) -> BoxFuture<'a, WalletResult<u128>> {
        self.adapter.get_balance(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceReport {
    pub wallet: WalletId,
    pub address: String,
    pub source: String,
    pub result: WalletResult<u128>,
}

/// Ask every supporting source for every wallet's balance.
pub async fn collect_balances(
    wallets: &[WalletSummary],
    sources: &[Arc<dyn BalanceSource>],
    query_timeout: Duration,
) -> Vec<BalanceReport> {
    let queries = wallets.iter().flat_map(|wallet| {
        sources
            .iter()
            .filter(move |source| source.supports(&wallet.chain_type))
            .map(move |source| query(wallet, source.as_ref(), query_timeout))
    });
    join_all(queries).await
}

/// Snapshot the unlocked vault's wallets, then fan out without holding
/// the context lock.
pub async fn portfolio(
    vault: &SharedVaultContext,
    sources: &[Arc<dyn BalanceSource>],
    query_timeout: Duration,
) -> WalletResult<Vec<BalanceReport>> {
    let wallets = vault.write(|ctx| ctx.wallets())?;
    Ok(collect_balances(&wallets, sources, query_timeout).await)
}

async fn query(
    wallet: &WalletSummary,
    source: &dyn BalanceSource,
    query_timeout: Duration,
) -> BalanceReport {
    let result = match tokio::time::timeout(query_timeout, source.balance(&wallet.address)).await
    {
        Ok(result) => result,
        Err(_) => Err(WalletError::NetworkError(format!(
            "{} timed out after {}ms",
            source.name(),
            query_timeout.as_millis()
        ))),
    };

    if let Err(err) = &result {
        log::warn!(
            "Balance query for {} via {} failed: {}",
            wallet.id,
            source.name(),
            err
        );
    }

    BalanceReport {
        wallet: wallet.id.clone(),
        address: wallet.address.clone(),
        source: source.name().to_string(),
        result,
    }
}
