use std::sync::Mutex;

use anyhow::bail;

/// Balance of generation credits available to a caller.
///
/// The engine spends before submitting a prediction and refunds when the
/// prediction fails, so a failed job never costs anything.
pub trait CreditLedger: Send + Sync {
    /// Remove `amount` credits, returning the remaining balance.
    fn spend(&self, amount: u64) -> anyhow::Result<u64>;
    /// Return `amount` credits, returning the new balance.
    fn refund(&self, amount: u64) -> anyhow::Result<u64>;
    fn balance(&self) -> u64;
}

#[derive(Debug)]
pub struct InMemoryCreditLedger {
    balance: Mutex<u64>,
}

impl InMemoryCreditLedger {
    pub fn new(initial: u64) -> Self {
        Self {
            balance: Mutex::new(initial),
        }
    }
}

impl CreditLedger for InMemoryCreditLedger {
    fn spend(&self, amount: u64) -> anyhow::Result<u64> {
        let mut balance = self
            .balance
            .lock()
            .map_err(|_| anyhow::anyhow!("credit ledger lock poisoned"))?;
        if *balance < amount {
            bail!(
                "insufficient credits: requested {amount}, available {}",
                *balance
            );
        }
        *balance -= amount;
        Ok(*balance)
    }

    fn refund(&self, amount: u64) -> anyhow::Result<u64> {
        let mut balance = self
            .balance
            .lock()
            .map_err(|_| anyhow::anyhow!("credit ledger lock poisoned"))?;
        *balance = balance.saturating_add(amount);
        Ok(*balance)
    }

    fn balance(&self) -> u64 {
        self.balance.lock().map(|balance| *balance).unwrap_or(0)
    }
}
