//! Background reconciliation of pending payments against wallet state.
//!
//! Each cycle lists pending payments, asks the bound [`CryptoClient`] for every
//! currency whether the payment address has been paid (and, depending on the
//! [`ConfirmationModel`], how deep the paying transaction is), and moves the
//! payment to `confirmed` or `expired`. Failures are isolated per payment and
//! slow the loop down through [`Backoff`]; one clean cycle restores the base
//! interval.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use paygate_wallet::Currency;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::CryptoClient;
use crate::error::{ClientError, PaywallError};
use crate::metrics;
use crate::payment::{Payment, PaymentStatus};
use crate::store::PaymentStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How a sufficient balance turns into a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationModel {
    /// The balance source only reports confirmed funds; a sufficient balance
    /// confirms the payment outright.
    BalanceImpliesConfirmed,
    /// Resolve the paying transaction and require its confirmation count to
    /// reach the minimum.
    TransactionLookup,
}

impl std::str::FromStr for ConfirmationModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "balance" | "balance_implies_confirmed" => Ok(ConfirmationModel::BalanceImpliesConfirmed),
            "transaction" | "transaction_lookup" | "tx" => Ok(ConfirmationModel::TransactionLookup),
            other => Err(format!("unknown confirmation model: {other}")),
        }
    }
}

/// A client together with the confirmation model used for its currency.
#[derive(Clone)]
pub struct ClientBinding {
    pub client: Arc<dyn CryptoClient>,
    pub model: ConfirmationModel,
}

impl ClientBinding {
    pub fn new(client: Arc<dyn CryptoClient>, model: ConfirmationModel) -> Self {
        Self { client, model }
    }
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between cycles while everything succeeds.
    pub base_interval: Duration,
    /// Ceiling for the backoff delay.
    pub max_interval: Duration,
    /// Confirmations required before a payment is confirmed (at least 1).
    pub min_confirmations: u32,
    /// Payments checked concurrently within one cycle.
    pub max_concurrent_checks: usize,
    /// Bound on every individual client call.
    pub rpc_timeout: Duration,
    /// Extra time past expiry granted to payments whose checks are failing.
    pub expiry_grace: Duration,
    /// Extra time past expiry granted to payments whose balance is already
    /// covered but whose transaction is not yet deep enough.
    pub paid_expiry_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_interval: DEFAULT_POLL_INTERVAL,
            max_interval: DEFAULT_MAX_POLL_INTERVAL,
            min_confirmations: 1,
            max_concurrent_checks: 8,
            rpc_timeout: Duration::from_secs(30),
            expiry_grace: Duration::from_secs(10 * 60),
            paid_expiry_grace: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Quadratic backoff: `base * (failures + 1)^2`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay for the current failure count.
    pub fn current(&self) -> Duration {
        let factor = self.failures.saturating_add(1).saturating_pow(2);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current()
    }

    pub fn record_success(&mut self) -> Duration {
        self.failures = 0;
        self.current()
    }
}

/// Observable monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Polling,
    Backoff { failures: u32 },
    Stopped,
}

/// Outcome counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub confirmed: usize,
    pub expired: usize,
    pub failed: usize,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Confirmed,
    Expired,
    Unchanged,
    Skipped,
    Failed,
}

/// Result of checking one currency of one payment.
enum CurrencyCheck {
    /// Balance below the amount due.
    Unpaid,
    /// Paid, but the paying transaction is not visible yet.
    AwaitingTransaction,
    /// Paid, transaction seen, not deep enough yet.
    Confirming { confirmations: u32, tx_id: String },
    Satisfied {
        confirmations: u32,
        tx_id: Option<String>,
    },
}

/// Polls pending payments and settles their status.
pub struct ReconciliationMonitor {
    store: Arc<dyn PaymentStore>,
    clients: HashMap<Currency, ClientBinding>,
    config: MonitorConfig,
    backoff: Mutex<Backoff>,
    state: Mutex<MonitorState>,
    payment_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal shutdown and wait for the loop to exit. An in-flight cycle is
    /// allowed to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "reconciliation monitor task failed");
        }
    }
}

impl ReconciliationMonitor {
    /// Create a monitor for `currencies`. Every currency must have a client
    /// binding.
    pub fn new(
        store: Arc<dyn PaymentStore>,
        currencies: impl IntoIterator<Item = Currency>,
        clients: HashMap<Currency, ClientBinding>,
        mut config: MonitorConfig,
    ) -> Result<Self, PaywallError> {
        if let Some(missing) = currencies.into_iter().find(|c| !clients.contains_key(c)) {
            return Err(PaywallError::Config(format!(
                "no client configured for {missing}"
            )));
        }
        if config.base_interval.is_zero() {
            return Err(PaywallError::Config(
                "poll interval must be positive".to_string(),
            ));
        }
        if config.min_confirmations == 0 {
            tracing::warn!("min_confirmations of 0 raised to 1");
            config.min_confirmations = 1;
        }
        config.max_concurrent_checks = config.max_concurrent_checks.max(1);

        Ok(Self {
            store,
            clients,
            backoff: Mutex::new(Backoff::new(config.base_interval, config.max_interval)),
            config,
            state: Mutex::new(MonitorState::Idle),
            payment_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        *lock(&self.state)
    }

    fn set_state(&self, state: MonitorState) {
        *lock(&self.state) = state;
    }

    /// Spawn the polling loop with an internal shutdown channel.
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = self.start(receiver);
        MonitorHandle { shutdown, task }
    }

    /// Spawn the polling loop. It runs a cycle immediately, then sleeps for
    /// the backoff-adjusted delay; it exits once `shutdown` reads `true` or
    /// its sender is dropped.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.config.base_interval.as_secs(),
                min_confirmations = self.config.min_confirmations,
                "reconciliation monitor started"
            );
            match self.recover_stranded().await {
                Ok(report) if report.checked > 0 => tracing::info!(
                    checked = report.checked,
                    confirmed = report.confirmed,
                    expired = report.expired,
                    failed = report.failed,
                    "stranded payments reconciled"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to scan for stranded payments"),
            }
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let delay = self.poll_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            self.set_state(MonitorState::Stopped);
            tracing::info!("reconciliation monitor stopped");
        })
    }

    /// Run one cycle, update backoff, and return the delay before the next.
    pub async fn poll_once(&self) -> Duration {
        self.set_state(MonitorState::Polling);
        let result = self.run_cycle().await;

        let (delay, failures) = {
            let mut backoff = lock(&self.backoff);
            let delay = match &result {
                Ok(report) if report.is_clean() => {
                    metrics::RECONCILE_CYCLES.with_label_values(&["ok"]).inc();
                    backoff.record_success()
                }
                Ok(report) => {
                    metrics::RECONCILE_CYCLES.with_label_values(&["partial"]).inc();
                    tracing::warn!(failed = report.failed, checked = report.checked, "reconciliation cycle had failures");
                    backoff.record_failure()
                }
                Err(e) => {
                    metrics::RECONCILE_CYCLES.with_label_values(&["error"]).inc();
                    tracing::warn!(error = %e, "reconciliation cycle failed");
                    backoff.record_failure()
                }
            };
            (delay, backoff.failures())
        };

        self.set_state(if failures == 0 {
            MonitorState::Idle
        } else {
            MonitorState::Backoff { failures }
        });
        metrics::POLL_INTERVAL.set(delay.as_secs_f64());
        delay
    }

    /// One pass over every pending payment.
    pub async fn run_cycle(&self) -> Result<CycleReport, PaywallError> {
        let pending = self
            .store
            .list_pending(self.config.min_confirmations)
            .map_err(PaywallError::store("list_pending"))?;
        let report = self.reconcile_batch(pending).await;

        if report.confirmed > 0 || report.expired > 0 {
            tracing::info!(
                checked = report.checked,
                confirmed = report.confirmed,
                expired = report.expired,
                failed = report.failed,
                "reconciliation cycle complete"
            );
        } else {
            tracing::debug!(checked = report.checked, failed = report.failed, "reconciliation cycle complete");
        }
        Ok(report)
    }

    /// Reconcile pending payments that `run_cycle` no longer lists because
    /// they already carry `min_confirmations` or more. That happens when the
    /// threshold is lowered while payments are partly confirmed. Runs once
    /// when the loop starts.
    pub async fn recover_stranded(&self) -> Result<CycleReport, PaywallError> {
        let stranded: Vec<Payment> = self
            .store
            .list_pending(u32::MAX)
            .map_err(PaywallError::store("list_pending"))?
            .into_iter()
            .filter(|p| p.confirmations >= self.config.min_confirmations)
            .collect();
        if stranded.is_empty() {
            return Ok(CycleReport::default());
        }

        tracing::warn!(
            count = stranded.len(),
            min_confirmations = self.config.min_confirmations,
            "reconciling pending payments above the confirmation threshold"
        );
        Ok(self.reconcile_batch(stranded).await)
    }

    async fn reconcile_batch(&self, pending: Vec<Payment>) -> CycleReport {
        let now = Utc::now();

        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|payment| self.reconcile_payment(payment, now))
            .buffer_unordered(self.config.max_concurrent_checks)
            .collect()
            .await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            if outcome != Outcome::Skipped {
                report.checked += 1;
            }
            match outcome {
                Outcome::Confirmed => report.confirmed += 1,
                Outcome::Expired => report.expired += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Unchanged | Outcome::Skipped => {}
            }
        }

        self.prune_payment_locks();
        report
    }

    fn payment_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.payment_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn prune_payment_locks(&self) {
        self.payment_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }

    async fn reconcile_payment(&self, listed: Payment, now: DateTime<Utc>) -> Outcome {
        let lock = self.payment_lock(&listed.id);
        let _guard = lock.lock().await;

        // Re-read under the lock; another writer may have settled it.
        let current = match self.store.get(&listed.id) {
            Ok(Some(p)) if p.is_pending() => p,
            Ok(_) => return Outcome::Skipped,
            Err(e) => {
                tracing::warn!(payment_id = %listed.id, error = %e, "failed to reload payment");
                return Outcome::Failed;
            }
        };

        let mut next = current.clone();
        let mut errored = false;
        let mut paid = false;

        for (&currency, address) in &current.addresses {
            let check = self.check_currency(&current, currency, address).await;
            let label = match &check {
                Ok(CurrencyCheck::Satisfied { .. }) => "satisfied",
                Ok(_) => "unsatisfied",
                Err(_) => "error",
            };
            metrics::PAYMENT_CHECKS
                .with_label_values(&[currency.code(), label])
                .inc();

            match check {
                Ok(CurrencyCheck::Satisfied {
                    confirmations,
                    tx_id,
                }) => {
                    next.status = PaymentStatus::Confirmed;
                    next.confirmations = confirmations;
                    if tx_id.is_some() {
                        next.transaction_id = tx_id;
                    }
                    break;
                }
                Ok(CurrencyCheck::Confirming {
                    confirmations,
                    tx_id,
                }) => {
                    paid = true;
                    next.confirmations = next.confirmations.max(confirmations);
                    next.transaction_id.get_or_insert(tx_id);
                }
                Ok(CurrencyCheck::AwaitingTransaction) => paid = true,
                Ok(CurrencyCheck::Unpaid) => {}
                Err(e) => {
                    errored = true;
                    let err = PaywallError::Client {
                        currency,
                        payment_id: current.id.clone(),
                        source: e,
                    };
                    tracing::warn!(payment_id = %current.id, currency = %currency, error = %err, "payment check failed");
                }
            }
        }

        if next.is_pending() && current.is_expired_at(now) {
            let mut grace = Duration::ZERO;
            if errored {
                grace = grace.max(self.config.expiry_grace);
            }
            if paid {
                grace = grace.max(self.config.paid_expiry_grace);
            }
            // An unrepresentable deadline never passes.
            let deadline = chrono::Duration::from_std(grace)
                .ok()
                .and_then(|g| current.expires_at.checked_add_signed(g));
            match deadline {
                Some(deadline) if now >= deadline => next.status = PaymentStatus::Expired,
                _ => {
                    tracing::debug!(payment_id = %current.id, paid, errored, ?deadline, "expiry deferred");
                }
            }
        }

        if next != current {
            if let Err(e) = self.store.update(&next) {
                tracing::warn!(payment_id = %current.id, error = %e, "failed to record payment update");
                return Outcome::Failed;
            }
        }

        match next.status {
            PaymentStatus::Confirmed => {
                metrics::PAYMENT_TRANSITIONS
                    .with_label_values(&[PaymentStatus::Confirmed.as_str()])
                    .inc();
                tracing::info!(
                    payment_id = %next.id,
                    confirmations = next.confirmations,
                    transaction_id = next.transaction_id.as_deref().unwrap_or("-"),
                    "payment confirmed"
                );
                Outcome::Confirmed
            }
            PaymentStatus::Expired => {
                metrics::PAYMENT_TRANSITIONS
                    .with_label_values(&[PaymentStatus::Expired.as_str()])
                    .inc();
                tracing::info!(payment_id = %next.id, expires_at = %next.expires_at, "payment expired");
                Outcome::Expired
            }
            PaymentStatus::Pending if errored => Outcome::Failed,
            PaymentStatus::Pending => Outcome::Unchanged,
        }
    }

    async fn check_currency(
        &self,
        payment: &Payment,
        currency: Currency,
        address: &str,
    ) -> Result<CurrencyCheck, ClientError> {
        let binding = self
            .clients
            .get(&currency)
            .ok_or_else(|| ClientError::NotConfigured(format!("no client for {currency}")))?;
        let amount = payment
            .amounts
            .get(&currency)
            .ok_or_else(|| ClientError::NotConfigured(format!("no amount recorded for {currency}")))?;

        let balance = self
            .bounded(binding.client.get_address_balance(address))
            .await?;
        if balance < *amount {
            return Ok(CurrencyCheck::Unpaid);
        }

        match binding.model {
            ConfirmationModel::BalanceImpliesConfirmed => Ok(CurrencyCheck::Satisfied {
                confirmations: self.config.min_confirmations,
                tx_id: None,
            }),
            ConfirmationModel::TransactionLookup => {
                let Some(tx_id) = self
                    .bounded(binding.client.find_incoming_transaction(address))
                    .await?
                else {
                    return Ok(CurrencyCheck::AwaitingTransaction);
                };
                let confirmations = self
                    .bounded(binding.client.get_transaction_confirmations(&tx_id))
                    .await?;
                if confirmations >= self.config.min_confirmations {
                    Ok(CurrencyCheck::Satisfied {
                        confirmations,
                        tx_id: Some(tx_id),
                    })
                } else {
                    Ok(CurrencyCheck::Confirming {
                        confirmations,
                        tx_id,
                    })
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::time::timeout(self.config.rpc_timeout, call)
            .await
            .map_err(|_| ClientError::Timeout(self.config.rpc_timeout))?
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("monitor mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
