//! Payment gateway simulator
//!
//! Deterministic stand-in for an external payment processor. Instruments are
//! simulated cards/e-wallets carrying a balance; a charge classifies against
//! fixed rules and, on success, moves money from the instrument to the
//! merchant account as one atomic transfer.
//!
//! The simulator itself holds no state: every call is a function of the
//! arguments and the [`PaymentLedger`] handed in at construction.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use pawsly_shared::PaymentMethod;

use crate::error::{DeclineReason, StoreError};

/// Simulated payment instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstrument {
    pub id: Uuid,
    /// Non-negative; a charge never overdraws
    pub balance: Decimal,
    pub is_registered: bool,
    /// Always-decline test instrument
    pub is_blocked: bool,
}

impl PaymentInstrument {
    /// A registered, chargeable instrument with the given balance
    pub fn funded(balance: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            balance,
            is_registered: true,
            is_blocked: false,
        }
    }

    /// A registered instrument that deterministically declines
    pub fn blocked() -> Self {
        Self {
            id: Uuid::new_v4(),
            balance: Decimal::ZERO,
            is_registered: true,
            is_blocked: true,
        }
    }
}

/// Result of the balance transfer step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Applied,
    InsufficientFunds,
}

/// Ledger of simulated instruments plus the singleton merchant account.
///
/// `withdraw_to_merchant` is the critical contract: balance check, debit, and
/// merchant credit must happen as one atomic unit, so two concurrent charges
/// can never both pass the balance check when only one can be honored.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn register_instrument(&self, instrument: PaymentInstrument) -> Result<(), StoreError>;

    async fn get_instrument(&self, id: Uuid) -> Result<Option<PaymentInstrument>, StoreError>;

    async fn list_instruments(&self) -> Result<Vec<PaymentInstrument>, StoreError>;

    /// Atomic check-debit-credit against the merchant account.
    async fn withdraw_to_merchant(
        &self,
        instrument_id: Uuid,
        amount: Decimal,
    ) -> Result<TransferOutcome, StoreError>;

    /// Top up an instrument (simulation convenience; a cardholder payday).
    async fn deposit(&self, instrument_id: Uuid, amount: Decimal) -> Result<(), StoreError>;

    async fn merchant_balance(&self) -> Result<Decimal, StoreError>;
}

#[derive(Default)]
struct LedgerState {
    instruments: HashMap<Uuid, PaymentInstrument>,
    merchant_balance: Decimal,
}

/// In-memory payment ledger. One mutex over instruments and the merchant
/// account serializes concurrent charges, which is what makes the
/// debit+credit pair atomic.
#[derive(Default)]
pub struct InMemoryPaymentLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn register_instrument(&self, instrument: PaymentInstrument) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.instruments.insert(instrument.id, instrument);
        Ok(())
    }

    async fn get_instrument(&self, id: Uuid) -> Result<Option<PaymentInstrument>, StoreError> {
        Ok(self.state.lock().await.instruments.get(&id).cloned())
    }

    async fn list_instruments(&self) -> Result<Vec<PaymentInstrument>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .instruments
            .values()
            .cloned()
            .collect())
    }

    async fn withdraw_to_merchant(
        &self,
        instrument_id: Uuid,
        amount: Decimal,
    ) -> Result<TransferOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let balance = match state.instruments.get(&instrument_id) {
            Some(instrument) => instrument.balance,
            None => {
                return Err(StoreError::Unavailable(format!(
                    "instrument {instrument_id} not in ledger"
                )))
            }
        };
        if balance < amount {
            return Ok(TransferOutcome::InsufficientFunds);
        }
        if let Some(instrument) = state.instruments.get_mut(&instrument_id) {
            instrument.balance -= amount;
        }
        state.merchant_balance += amount;
        Ok(TransferOutcome::Applied)
    }

    async fn deposit(&self, instrument_id: Uuid, amount: Decimal) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.instruments.get_mut(&instrument_id) {
            Some(instrument) => {
                instrument.balance += amount;
                Ok(())
            }
            None => Err(StoreError::Unavailable(format!(
                "instrument {instrument_id} not in ledger"
            ))),
        }
    }

    async fn merchant_balance(&self) -> Result<Decimal, StoreError> {
        Ok(self.state.lock().await.merchant_balance)
    }
}

/// Outcome of a charge attempt. Declines are results, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Succeeded { transaction_id: Uuid },
    Declined { reason: DeclineReason },
}

impl ChargeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChargeOutcome::Succeeded { .. })
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            ChargeOutcome::Succeeded { transaction_id } => Some(*transaction_id),
            ChargeOutcome::Declined { .. } => None,
        }
    }
}

/// Fee breakdown returned by [`PaymentGateway::calculate_fees`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub amount: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
}

/// Percentage + fixed fee for one payment method
#[derive(Debug, Clone, Copy)]
pub struct FeeRate {
    pub percent: Decimal,
    pub fixed: Decimal,
}

/// Per-method fee schedule. Defaults mirror typical processor pricing and can
/// be overridden per method via `GATEWAY_FEE_<METHOD>_PERCENT` /
/// `GATEWAY_FEE_<METHOD>_FIXED` env vars.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    rates: HashMap<PaymentMethod, FeeRate>,
}

fn env_decimal(name: &str, default: Decimal) -> Decimal {
    std::env::var(name)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or(default)
}

impl Default for FeeSchedule {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            PaymentMethod::Card,
            FeeRate {
                percent: Decimal::new(29, 1), // 2.9%
                fixed: Decimal::new(30, 2),   // 0.30
            },
        );
        rates.insert(
            PaymentMethod::EwalletGopay,
            FeeRate {
                percent: Decimal::from(2),
                fixed: Decimal::ZERO,
            },
        );
        rates.insert(
            PaymentMethod::EwalletOvo,
            FeeRate {
                percent: Decimal::new(25, 1), // 2.5%
                fixed: Decimal::ZERO,
            },
        );
        rates.insert(
            PaymentMethod::EwalletDana,
            FeeRate {
                percent: Decimal::new(15, 1), // 1.5%
                fixed: Decimal::ZERO,
            },
        );
        Self { rates }
    }
}

impl FeeSchedule {
    /// Defaults with env overrides applied
    pub fn from_env() -> Self {
        let mut schedule = Self::default();
        for (method, env_key) in [
            (PaymentMethod::Card, "CARD"),
            (PaymentMethod::EwalletGopay, "GOPAY"),
            (PaymentMethod::EwalletOvo, "OVO"),
            (PaymentMethod::EwalletDana, "DANA"),
        ] {
            if let Some(rate) = schedule.rates.get_mut(&method) {
                rate.percent = env_decimal(
                    &format!("GATEWAY_FEE_{env_key}_PERCENT"),
                    rate.percent,
                );
                rate.fixed = env_decimal(&format!("GATEWAY_FEE_{env_key}_FIXED"), rate.fixed);
            }
        }
        schedule
    }

    pub fn rate(&self, method: PaymentMethod) -> FeeRate {
        self.rates.get(&method).copied().unwrap_or(FeeRate {
            percent: Decimal::ZERO,
            fixed: Decimal::ZERO,
        })
    }
}

/// The gateway simulator: classification rules over a payment ledger
#[derive(Clone)]
pub struct PaymentGateway {
    ledger: Arc<dyn PaymentLedger>,
    fees: FeeSchedule,
}

impl PaymentGateway {
    pub fn new(ledger: Arc<dyn PaymentLedger>) -> Self {
        Self {
            ledger,
            fees: FeeSchedule::default(),
        }
    }

    pub fn with_fee_schedule(ledger: Arc<dyn PaymentLedger>, fees: FeeSchedule) -> Self {
        Self { ledger, fees }
    }

    pub fn ledger(&self) -> &Arc<dyn PaymentLedger> {
        &self.ledger
    }

    /// Attempt to charge an instrument.
    ///
    /// Classification order: unregistered, blocked, insufficient funds,
    /// success. On success the instrument debit and the merchant credit are
    /// applied together by the ledger.
    pub async fn charge(
        &self,
        instrument_id: Uuid,
        amount: Decimal,
    ) -> Result<ChargeOutcome, StoreError> {
        let instrument = self.ledger.get_instrument(instrument_id).await?;
        let instrument = match instrument {
            Some(i) if i.is_registered => i,
            _ => {
                debug!(%instrument_id, "charge declined: unregistered instrument");
                return Ok(ChargeOutcome::Declined {
                    reason: DeclineReason::UnregisteredInstrument,
                });
            }
        };

        if instrument.is_blocked {
            debug!(%instrument_id, "charge declined: blocked instrument");
            return Ok(ChargeOutcome::Declined {
                reason: DeclineReason::CardDeclined,
            });
        }

        // The balance rule re-checks inside the ledger lock; the transfer is
        // the only place the decision counts.
        match self.ledger.withdraw_to_merchant(instrument_id, amount).await? {
            TransferOutcome::Applied => {
                let transaction_id = Uuid::new_v4();
                debug!(%instrument_id, %amount, %transaction_id, "charge succeeded");
                Ok(ChargeOutcome::Succeeded { transaction_id })
            }
            TransferOutcome::InsufficientFunds => {
                debug!(%instrument_id, %amount, "charge declined: insufficient funds");
                Ok(ChargeOutcome::Declined {
                    reason: DeclineReason::InsufficientFunds,
                })
            }
        }
    }

    /// Fee a merchant would pay to collect `amount` via `method`, with the
    /// fee rounded to 2 decimals.
    pub fn calculate_fees(&self, amount: Decimal, method: PaymentMethod) -> FeeBreakdown {
        let rate = self.fees.rate(method);
        let fee = (amount * rate.percent / Decimal::from(100) + rate.fixed).round_dp(2);
        FeeBreakdown {
            amount,
            fee,
            total: amount + fee,
        }
    }
}
