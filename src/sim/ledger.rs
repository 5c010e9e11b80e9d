use crate::deploy::{ConversionRate, PaymentGateway, PlatformError};
use crate::registry::{CanisterId, Principal};
use crate::sim::platform::SimulatedPlatform;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_TRANSFER_FEE: u128 = 10_000;
/// 5 XDR per token, expressed in ten-thousandths
pub const DEFAULT_XDR_PERMYRIAD_PER_TOKEN: u128 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBlock {
    pub from: Principal,
    pub amount: u128,
    pub fee: u128,
    pub memo: u64,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<Principal, u128>,
    allowances: HashMap<(Principal, Principal), u128>,
    blocks: Vec<LedgerBlock>,
    by_memo: HashMap<(Principal, u64), u64>,
    notified: HashMap<u64, CanisterId>,
    unavailable: bool,
}

/// Token ledger and minter in one. Notifying a payment creates an instance on the
/// attached [`SimulatedPlatform`].
pub struct SimulatedLedger {
    platform: Arc<SimulatedPlatform>,
    fee: u128,
    rate: ConversionRate,
    state: Mutex<LedgerState>,
}

impl SimulatedLedger {
    pub fn new(platform: Arc<SimulatedPlatform>) -> Self {
        Self {
            platform,
            fee: DEFAULT_TRANSFER_FEE,
            rate: ConversionRate {
                numerator: 100_000_000 * 10_000,
                denominator: DEFAULT_XDR_PERMYRIAD_PER_TOKEN,
            },
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn mint(&self, to: &Principal, amount: u128) {
        *self.state.lock().balances.entry(to.clone()).or_default() += amount;
    }

    pub fn approve(&self, owner: &Principal, spender: &Principal, amount: u128) {
        self.state
            .lock()
            .allowances
            .insert((owner.clone(), spender.clone()), amount);
    }

    pub fn balance(&self, owner: &Principal) -> u128 {
        self.state.lock().balances.get(owner).copied().unwrap_or(0)
    }

    pub fn blocks(&self) -> Vec<LedgerBlock> {
        self.state.lock().blocks.clone()
    }

    /// Every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    fn check_available(state: &LedgerState) -> Result<(), PlatformError> {
        if state.unavailable {
            return Err(PlatformError::Unavailable("ledger is unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for SimulatedLedger {
    async fn allowance(
        &self,
        owner: &Principal,
        spender: &Principal,
    ) -> Result<u128, PlatformError> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state
            .allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn transfer_fee(&self) -> Result<u128, PlatformError> {
        Self::check_available(&self.state.lock())?;
        Ok(self.fee)
    }

    async fn conversion_rate(&self) -> Result<ConversionRate, PlatformError> {
        Self::check_available(&self.state.lock())?;
        Ok(self.rate)
    }

    async fn transfer_from(
        &self,
        spender: &Principal,
        from: &Principal,
        amount: u128,
        memo: u64,
    ) -> Result<u64, PlatformError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        if let Some(block) = state.by_memo.get(&(from.clone(), memo)) {
            return Ok(*block);
        }

        let debit = amount + self.fee;
        let allowance_key = (from.clone(), spender.clone());
        let allowance = state.allowances.get(&allowance_key).copied().unwrap_or(0);
        if allowance < debit {
            return Err(PlatformError::Rejected(format!(
                "insufficient allowance: {} < {}",
                allowance, debit
            )));
        }
        let balance = state.balances.get(from).copied().unwrap_or(0);
        if balance < debit {
            return Err(PlatformError::Rejected(format!(
                "insufficient funds: {} < {}",
                balance, debit
            )));
        }

        state.allowances.insert(allowance_key, allowance - debit);
        state.balances.insert(from.clone(), balance - debit);
        let block = state.blocks.len() as u64;
        state.blocks.push(LedgerBlock {
            from: from.clone(),
            amount,
            fee: self.fee,
            memo,
        });
        state.by_memo.insert((from.clone(), memo), block);
        Ok(block)
    }

    async fn notify_create_canister(
        &self,
        block_index: u64,
        controller: &Principal,
        _subnet_hint: Option<&str>,
    ) -> Result<CanisterId, PlatformError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        if let Some(canister_id) = state.notified.get(&block_index) {
            return Ok(canister_id.clone());
        }
        if block_index as usize >= state.blocks.len() {
            return Err(PlatformError::Rejected(format!("unknown block {}", block_index)));
        }

        let canister_id = self.platform.create_canister(vec![controller.clone()]);
        state.notified.insert(block_index, canister_id.clone());
        Ok(canister_id)
    }
}
