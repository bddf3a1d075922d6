//! Crypto-helper transactions (§4.4).
//!
//! A transaction is an ordered list of commands; only the final command
//! carries a result. At most one transaction executes at a time and
//! transactions never interleave.

use crate::codec::helper::HelperElement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    InFlight,
    /// Cancelling an in-flight transaction forces a sub-process restart
    /// since results cannot be disambiguated after the fact (§4.4).
    Cancelling,
    Failing,
    Done,
}

#[derive(Debug, Clone)]
pub struct HelperCommand {
    pub instruction: u32,
    pub args: Vec<HelperElement>,
    /// Whether this command's response carries a result that must be
    /// drained before the next command is written. Only the final command
    /// of a transaction is expected to set this.
    pub expects_result: bool,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub commands: Vec<HelperCommand>,
    pub status: TransactionStatus,
    pub cursor: usize,
}

impl Transaction {
    pub fn new(id: TransactionId, commands: Vec<HelperCommand>) -> Self {
        Self { id, commands, status: TransactionStatus::Pending, cursor: 0 }
    }

    pub fn current_command(&self) -> Option<&HelperCommand> {
        self.commands.get(self.cursor)
    }

    pub fn is_final_command(&self) -> bool {
        self.cursor + 1 == self.commands.len()
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.commands.len() {
            self.status = TransactionStatus::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(expects_result: bool) -> HelperCommand {
        HelperCommand { instruction: 1, args: Vec::new(), expects_result }
    }

    #[test]
    fn only_final_command_expects_a_result_by_convention() {
        let txn = Transaction::new(TransactionId(1), vec![cmd(false), cmd(false), cmd(true)]);
        assert!(!txn.is_final_command());
        assert!(txn.commands.last().unwrap().expects_result);
    }

    #[test]
    fn advancing_past_last_command_marks_done() {
        let mut txn = Transaction::new(TransactionId(1), vec![cmd(false), cmd(true)]);
        txn.advance();
        assert!(!matches!(txn.status, TransactionStatus::Done));
        txn.advance();
        assert!(matches!(txn.status, TransactionStatus::Done));
    }
}
