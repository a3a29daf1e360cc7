//! Operation records and the handles `apply` deals in.

use std::fmt;

/// Identifier of the transaction an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// What an operation does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationType {
    Add,
    Update,
    Remove,
}

/// Why an operation is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyContext {
    /// First, authoritative application on the primary. Strict.
    Primary,

    /// Replication of a committed operation on a secondary.
    SecondaryRedo,

    /// Replay from the log while recovering. May repeat LSNs.
    RecoveryRedo,
}

impl ApplyContext {
    /// Redo contexts tolerate redelivery; `Primary` does not.
    pub fn is_redo(self) -> bool {
        !matches!(self, ApplyContext::Primary)
    }
}

/// The key-level description of an operation passed to `apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMetadata {
    pub modification: ModificationType,
    pub key: Vec<u8>,
}

impl OperationMetadata {
    pub fn new(modification: ModificationType, key: impl Into<Vec<u8>>) -> Self {
        Self {
            modification,
            key: key.into(),
        }
    }
}

/// One committed operation as the log delivers it.
///
/// Records built through the constructors carry
/// [`ApplyContext::RecoveryRedo`]; use [`with_context`](Self::with_context)
/// for anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub commit_lsn: i64,
    pub transaction_id: TransactionId,
    pub modification: ModificationType,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub context: ApplyContext,
}

impl OperationRecord {
    pub fn add(
        commit_lsn: i64,
        txn: TransactionId,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self::build(commit_lsn, txn, ModificationType::Add, key.into(), Some(value.into()))
    }

    pub fn update(
        commit_lsn: i64,
        txn: TransactionId,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self::build(commit_lsn, txn, ModificationType::Update, key.into(), Some(value.into()))
    }

    pub fn remove(commit_lsn: i64, txn: TransactionId, key: impl Into<Vec<u8>>) -> Self {
        Self::build(commit_lsn, txn, ModificationType::Remove, key.into(), None)
    }

    fn build(
        commit_lsn: i64,
        transaction_id: TransactionId,
        modification: ModificationType,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            commit_lsn,
            transaction_id,
            modification,
            key,
            value,
            context: ApplyContext::RecoveryRedo,
        }
    }

    pub fn with_context(mut self, context: ApplyContext) -> Self {
        self.context = context;
        self
    }

    pub fn metadata(&self) -> OperationMetadata {
        OperationMetadata::new(self.modification, self.key.clone())
    }
}

/// Proof that a transaction holds resources in the store.
///
/// Returned by `apply` for the first operation of each transaction and
/// handed back to `unlock` once the transaction is done.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an operation context must be passed to Store::unlock"]
pub struct OperationContext {
    txn: TransactionId,
}

impl OperationContext {
    pub(crate) fn new(txn: TransactionId) -> Self {
        Self { txn }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.txn
    }
}
