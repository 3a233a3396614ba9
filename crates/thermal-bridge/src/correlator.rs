//! Pending-result bookkeeping.
//!
//! Every invocation that waits on the adapter registers a slot and gets back
//! a [`RequestToken`] plus a receiver. The event pump resolves slots by token
//! (or by oldest slot of a kind); a slot is removed when resolved, so a token
//! can complete at most once.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::oneshot;

/// Outcome delivered to a waiting invocation. `Err` carries a reason for logs.
pub type Completion = std::result::Result<(), String>;

/// Identifies one pending invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which invocation a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Scan,
    Connect,
    WriteBytes,
    PrintString,
}

impl InvocationKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::WriteBytes | Self::PrintString)
    }
}

struct PendingSlot {
    kind: InvocationKind,
    // Successful confirmations still needed before the slot resolves.
    remaining: usize,
    tx: oneshot::Sender<Completion>,
}

/// Maps request tokens to their single-use completion senders.
#[derive(Default)]
pub struct ResultCorrelator {
    next_token: u64,
    // BTreeMap keeps tokens in issue order for `resolve_oldest`.
    pending: BTreeMap<RequestToken, PendingSlot>,
}

impl ResultCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending slot.
    pub fn register(&mut self, kind: InvocationKind) -> (RequestToken, oneshot::Receiver<Completion>) {
        self.register_counted(kind, 1)
    }

    /// Register a slot that completes after `confirmations` successful
    /// resolutions via [`Self::resolve_oldest_write`], or on the first failure.
    pub fn register_counted(
        &mut self,
        kind: InvocationKind,
        confirmations: usize,
    ) -> (RequestToken, oneshot::Receiver<Completion>) {
        self.next_token += 1;
        let token = RequestToken(self.next_token);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            token,
            PendingSlot {
                kind,
                remaining: confirmations.max(1),
                tx,
            },
        );
        tracing::trace!(%token, ?kind, confirmations, "Registered pending slot");
        (token, rx)
    }

    /// Deliver `outcome` to `token`. Returns false if the slot is gone.
    pub fn resolve(&mut self, token: RequestToken, outcome: Completion) -> bool {
        let Some(slot) = self.pending.remove(&token) else {
            tracing::debug!(%token, "Resolution for unknown or completed slot ignored");
            return false;
        };
        tracing::trace!(%token, kind = ?slot.kind, ok = outcome.is_ok(), "Resolving slot");
        // The waiter may have timed out and dropped its receiver.
        slot.tx.send(outcome).is_ok()
    }

    /// Resolve the oldest pending slot of `kind`, if any.
    pub fn resolve_oldest(&mut self, kind: InvocationKind, outcome: Completion) -> Option<RequestToken> {
        self.resolve_oldest_where(|k| k == kind, outcome)
    }

    /// Count a write confirmation against the oldest pending write (bytes or
    /// string). A failure resolves it at once. Returns the affected token.
    pub fn resolve_oldest_write(&mut self, outcome: Completion) -> Option<RequestToken> {
        let (token, slot) = self
            .pending
            .iter_mut()
            .find(|(_, slot)| slot.kind.is_write())?;
        let token = *token;
        if outcome.is_ok() && slot.remaining > 1 {
            slot.remaining -= 1;
            return Some(token);
        }
        self.resolve(token, outcome);
        Some(token)
    }

    /// Fail every pending write.
    pub fn fail_writes(&mut self, reason: &str) {
        let tokens: Vec<RequestToken> = self
            .pending
            .iter()
            .filter(|(_, slot)| slot.kind.is_write())
            .map(|(token, _)| *token)
            .collect();
        for token in tokens {
            self.resolve(token, Err(reason.to_string()));
        }
    }

    fn resolve_oldest_where(
        &mut self,
        matches: impl Fn(InvocationKind) -> bool,
        outcome: Completion,
    ) -> Option<RequestToken> {
        let token = self
            .pending
            .iter()
            .find(|(_, slot)| matches(slot.kind))
            .map(|(token, _)| *token)?;
        self.resolve(token, outcome);
        Some(token)
    }

    /// Drop a slot without delivering anything. Returns false if it was
    /// already resolved.
    pub fn cancel(&mut self, token: RequestToken) -> bool {
        self.pending.remove(&token).is_some()
    }

    /// Fail every pending slot.
    pub fn fail_all(&mut self, reason: &str) {
        if self.pending.is_empty() {
            return;
        }
        tracing::debug!(count = self.pending.len(), reason, "Failing all pending slots");
        for (_, slot) in std::mem::take(&mut self.pending) {
            let _ = slot.tx.send(Err(reason.to_string()));
        }
    }

    pub fn is_pending(&self, token: RequestToken) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
