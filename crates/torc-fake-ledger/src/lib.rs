//! TORC fake ledger backend
//!
//! Used for testing: submitted operations execute against an in-memory
//! balance and escrow model, failures are scriptable, and emitted events can
//! be fed to the ingestor through the standard event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use torc_common::address::Address;
use torc_common::amount::Amount;
use torc_common::escrow::MultiSigApproval;
use torc_common::invoice::LedgerKey;
use torc_common::ledger::{
    payloads, Error, EventStream, LedgerClient, LedgerEscrow, LedgerEvent, LedgerOperation,
    TxHash,
};

/// Scripted failure for an upcoming `submit`
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// RPC timeout; the recovery pipeline should retry
    Transient,
    /// Revert with a reason string; never retried
    Revert(String),
}

#[derive(Debug, Default)]
struct LedgerState {
    escrows: HashMap<LedgerKey, LedgerEscrow>,
    approvals: HashMap<LedgerKey, MultiSigApproval>,
    balances: HashMap<Address, Amount>,
    nft_holders: HashMap<LedgerKey, Address>,
    submissions: Vec<(LedgerOperation, Value)>,
    tx_counter: u64,
}

impl LedgerState {
    fn credit(&mut self, address: &Address, amount: &Amount) {
        let balance = self
            .balances
            .entry(address.clone())
            .or_insert_with(Amount::zero);
        *balance = balance.checked_add(amount);
    }

    fn next_tx_hash(&mut self) -> TxHash {
        self.tx_counter += 1;
        TxHash(format!("0xfake{:08x}", self.tx_counter))
    }
}

/// Fake Ledger
#[derive(Clone)]
pub struct FakeLedger {
    state: Arc<Mutex<LedgerState>>,
    event_tx: mpsc::Sender<LedgerEvent>,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<LedgerEvent>>>>,
    submit_script: Arc<Mutex<HashMap<LedgerOperation, VecDeque<ScriptedFailure>>>>,
}

impl std::fmt::Debug for FakeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeLedger").finish_non_exhaustive()
    }
}

impl Default for FakeLedger {
    fn default() -> Self {
        FakeLedger::new()
    }
}

impl FakeLedger {
    /// Create an empty fake ledger
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        FakeLedger {
            state: Arc::new(Mutex::new(LedgerState::default())),
            event_tx,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            submit_script: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue failures consumed, in order, by upcoming submits of `operation`
    pub async fn script_submit_failures(
        &self,
        operation: LedgerOperation,
        failures: Vec<ScriptedFailure>,
    ) {
        self.submit_script
            .lock()
            .await
            .entry(operation)
            .or_default()
            .extend(failures);
    }

    /// Balance credited to `address` so far
    pub async fn balance_of(&self, address: &Address) -> Amount {
        self.state
            .lock()
            .await
            .balances
            .get(address)
            .cloned()
            .unwrap_or_else(Amount::zero)
    }

    /// Current escrow record, `None` once released (the ledger deletes it)
    pub async fn escrow_record(&self, key: &LedgerKey) -> Option<LedgerEscrow> {
        self.state.lock().await.escrows.get(key).cloned()
    }

    /// Inject or replace an escrow record directly
    pub async fn set_escrow(&self, key: LedgerKey, escrow: LedgerEscrow) {
        self.state.lock().await.escrows.insert(key, escrow);
    }

    /// Delete an escrow record directly
    pub async fn remove_escrow(&self, key: &LedgerKey) {
        self.state.lock().await.escrows.remove(key);
    }

    /// Configure the multi-sig threshold for `key`
    pub async fn set_required_approvals(&self, key: LedgerKey, required: u32) {
        self.state
            .lock()
            .await
            .approvals
            .entry(key)
            .or_insert_with(|| MultiSigApproval {
                approvers: Vec::new(),
                required,
            })
            .required = required;
    }

    /// Current holder of the collateral NFT, when custody was taken
    pub async fn nft_holder(&self, key: &LedgerKey) -> Option<Address> {
        self.state.lock().await.nft_holders.get(key).cloned()
    }

    /// Every accepted submission, in order
    pub async fn submissions(&self) -> Vec<(LedgerOperation, Value)> {
        self.state.lock().await.submissions.clone()
    }

    /// Feed an event into the stream handed out by [`LedgerClient::events`]
    pub async fn emit(&self, event: LedgerEvent) {
        // Dropping on a full buffer is fine for a fake.
        let _ = self.event_tx.try_send(event);
    }

    /// Next transaction hash, also used when emitting synthetic events
    pub async fn next_tx_hash(&self) -> TxHash {
        self.state.lock().await.next_tx_hash()
    }

    async fn apply(&self, operation: LedgerOperation, payload: &Value) -> Result<TxHash, Error> {
        let mut state = self.state.lock().await;
        match operation {
            LedgerOperation::CreateEscrow => {
                let p: payloads::CreateEscrow = serde_json::from_value(payload.clone())?;
                if state.escrows.contains_key(&p.key) {
                    return Err(Error::Reverted("Escrow exists".into()));
                }
                state.escrows.insert(
                    p.key,
                    LedgerEscrow {
                        seller: p.seller.clone(),
                        buyer: p.buyer,
                        amount: p.amount,
                        token: p.token,
                        status_code: 0,
                        seller_confirmed: false,
                        buyer_confirmed: false,
                        dispute_raised: false,
                        created_at: 0,
                        expires_at: p.expires_at,
                    },
                );
                if p.rwa.is_some() {
                    // Custody: the escrow itself holds the NFT until release.
                    state.nft_holders.insert(p.key, Address::new("0xescrow"));
                }
            }
            LedgerOperation::Deposit => {
                let p: payloads::Deposit = serde_json::from_value(payload.clone())?;
                let escrow = state
                    .escrows
                    .get_mut(&p.key)
                    .ok_or_else(|| Error::Reverted("Unknown escrow".into()))?;
                if escrow.status_code != 0 {
                    return Err(Error::Reverted("Not awaiting deposit".into()));
                }
                escrow.status_code = 1;
                escrow.amount = p.payable;
            }
            LedgerOperation::ConfirmRelease => {
                let p: payloads::ConfirmRelease = serde_json::from_value(payload.clone())?;
                let escrow = state
                    .escrows
                    .get_mut(&p.key)
                    .ok_or_else(|| Error::Reverted("Unknown escrow".into()))?;
                if p.party == escrow.seller {
                    escrow.seller_confirmed = true;
                } else if p.party == escrow.buyer {
                    escrow.buyer_confirmed = true;
                } else {
                    return Err(Error::Reverted("Not a party".into()));
                }
            }
            LedgerOperation::ApproveRelease => {
                let p: payloads::ApproveRelease = serde_json::from_value(payload.clone())?;
                let approval = state.approvals.entry(p.key).or_insert_with(|| {
                    MultiSigApproval {
                        approvers: Vec::new(),
                        required: 2,
                    }
                });
                if !approval.approvers.contains(&p.approver) {
                    approval.approvers.push(p.approver);
                }
            }
            LedgerOperation::Release => {
                let p: payloads::Release = serde_json::from_value(payload.clone())?;
                // Payout ordering: fee first, then the winner, then the NFT.
                state.credit(&p.treasury, &p.fee_amount);
                state.credit(&p.winner, &p.payout_amount);
                if let Some(recipient) = &p.nft_recipient {
                    state.nft_holders.insert(p.key, recipient.clone());
                }
                // The ledger deletes released escrows.
                state.escrows.remove(&p.key);
            }
            LedgerOperation::ReclaimExpired => {
                let p: payloads::ReclaimExpired = serde_json::from_value(payload.clone())?;
                let escrow = state
                    .escrows
                    .get_mut(&p.key)
                    .ok_or_else(|| Error::Reverted("Unknown escrow".into()))?;
                if escrow.status_code != 1 && escrow.status_code != 4 {
                    return Err(Error::Reverted("Not reclaimable".into()));
                }
                let amount = escrow.amount.clone();
                escrow.status_code = 4;
                state.credit(&p.buyer, &amount);
                if state.nft_holders.contains_key(&p.key) {
                    state.nft_holders.insert(p.key, p.seller);
                }
            }
            LedgerOperation::RaiseDispute => {
                let p: payloads::RaiseDispute = serde_json::from_value(payload.clone())?;
                let escrow = state
                    .escrows
                    .get_mut(&p.key)
                    .ok_or_else(|| Error::Reverted("Unknown escrow".into()))?;
                if escrow.status_code != 1 {
                    return Err(Error::Reverted("Not funded".into()));
                }
                if escrow.dispute_raised {
                    return Err(Error::Reverted("Already disputed".into()));
                }
                escrow.status_code = 2;
                escrow.dispute_raised = true;
            }
            LedgerOperation::Fund
            | LedgerOperation::UnwindFinancing => {
                // Financing calls are idempotent on the invoice key; the fake
                // only records them.
            }
            LedgerOperation::Refund => {
                let p: payloads::Refund = serde_json::from_value(payload.clone())?;
                state.credit(&p.buyer, &p.amount);
                if let Some(escrow) = state.escrows.get_mut(&p.key) {
                    escrow.status_code = 4;
                }
            }
        }
        state.submissions.push((operation, payload.clone()));
        Ok(state.next_tx_hash())
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn read_escrow(&self, key: &LedgerKey) -> Result<Option<LedgerEscrow>, Error> {
        Ok(self.state.lock().await.escrows.get(key).cloned())
    }

    async fn submit(&self, operation: LedgerOperation, payload: Value) -> Result<TxHash, Error> {
        let scripted = self
            .submit_script
            .lock()
            .await
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = scripted {
            tracing::debug!("fake ledger failing {} by script", operation);
            return Err(match failure {
                ScriptedFailure::Transient => Error::Timeout,
                ScriptedFailure::Revert(reason) => Error::Reverted(reason),
            });
        }
        self.apply(operation, &payload).await
    }

    async fn events(&self) -> Result<EventStream, Error> {
        let receiver = self
            .event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Connection("event stream already taken".into()))?;
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn read_multisig_approvals(&self, key: &LedgerKey) -> Result<MultiSigApproval, Error> {
        Ok(self
            .state
            .lock()
            .await
            .approvals
            .get(key)
            .cloned()
            .unwrap_or(MultiSigApproval {
                approvers: Vec::new(),
                required: 2,
            }))
    }
}
