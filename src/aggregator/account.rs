use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::types::{Asset, Exchange};

/// Free/locked holdings of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: Asset,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn zero(asset: Asset) -> Self {
        Balance {
            asset,
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    pub fn has_free(&self) -> bool {
        self.free > Decimal::ZERO
    }

    pub fn has_locked(&self) -> bool {
        self.locked > Decimal::ZERO
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: free={} locked={}",
            self.asset, self.free, self.locked
        )
    }
}

#[derive(Debug, Default)]
struct BalanceBook {
    balances: HashMap<Asset, Balance>,
    update_time: u64,
}

/// Mutable view of one venue account: commission rates, permissions and the
/// balance book kept fresh from user-data events.
#[derive(Debug)]
pub struct Account {
    pub maker_commission: Decimal,
    pub taker_commission: Decimal,
    pub can_trade: bool,
    pub can_withdraw: bool,
    pub can_deposit: bool,
    state: RwLock<BalanceBook>,
}

impl Account {
    pub fn new(update_time: u64, balances: Vec<Balance>) -> Self {
        let mut map = HashMap::new();
        for balance in balances {
            map.insert(balance.asset.clone(), balance);
        }
        Account {
            maker_commission: Decimal::ZERO,
            taker_commission: Decimal::ZERO,
            can_trade: false,
            can_withdraw: false,
            can_deposit: false,
            state: RwLock::new(BalanceBook {
                balances: map,
                update_time,
            }),
        }
    }

    /// Current balance for `asset`; zero when the asset was never reported.
    pub fn balance(&self, asset: &Asset) -> Balance {
        let book = self.state.read().unwrap();
        book.balances
            .get(asset)
            .cloned()
            .unwrap_or_else(|| Balance::zero(asset.clone()))
    }

    pub fn balances(&self) -> Vec<Balance> {
        let book = self.state.read().unwrap();
        book.balances.values().cloned().collect()
    }

    pub fn update_time(&self) -> u64 {
        self.state.read().unwrap().update_time
    }

    /// Applies a balance snapshot stamped `time`. Updates older than the book
    /// are dropped without effect; events may arrive out of order.
    pub fn update_balances(&self, exchange: Exchange, time: u64, updates: Vec<Balance>) {
        let mut book = self.state.write().unwrap();
        if time < book.update_time {
            return;
        }
        for balance in updates {
            info!(%exchange, %balance, "account balance updated");
            book.balances.insert(balance.asset.clone(), balance);
        }
        book.update_time = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn bal(asset: &str, free: &str, locked: &str) -> Balance {
        Balance {
            asset: Asset::new(asset),
            free: Decimal::from_str(free).unwrap(),
            locked: Decimal::from_str(locked).unwrap(),
        }
    }

    #[test]
    fn stale_updates_are_dropped_newer_applied() {
        let account = Account::new(1000, vec![bal("ETH", "2", "0")]);

        // Older than the book: no effect on balances or the clock.
        account.update_balances(Exchange::Binance, 999, vec![bal("ETH", "9", "9")]);
        assert_eq!(account.balance(&Asset::new("ETH")), bal("ETH", "2", "0"));
        assert_eq!(account.update_time(), 1000);

        // Newer: applied, clock advances.
        account.update_balances(Exchange::Binance, 1001, vec![bal("ETH", "3", "1")]);
        assert_eq!(account.balance(&Asset::new("ETH")), bal("ETH", "3", "1"));
        assert_eq!(account.update_time(), 1001);

        // Equal timestamps are accepted.
        account.update_balances(Exchange::Binance, 1001, vec![bal("USDT", "50", "0")]);
        assert_eq!(account.balance(&Asset::new("USDT")), bal("USDT", "50", "0"));
    }

    #[test]
    fn unknown_asset_reads_as_zero() {
        let account = Account::new(0, vec![]);
        let b = account.balance(&Asset::new("BTC"));
        assert_eq!(b.total(), Decimal::ZERO);
        assert!(!b.has_free());
        assert!(!b.has_locked());
    }
}
