//! Transactional session scope.
//!
//! `switchy_database` connections autocommit by default. Batch work here
//! must land all-or-nothing, so drivers wrap each unit of work in a
//! [`SessionScope`]: `BEGIN` on open, then exactly one of [`commit`] or
//! [`rollback`], both of which consume the scope. A scope dropped without
//! either leaves the connection inside an aborted transaction and logs an
//! error so the leak is visible in batch output.
//!
//! [`commit`]: SessionScope::commit
//! [`rollback`]: SessionScope::rollback

use switchy_database::Database;

use crate::DbError;

/// An open transaction on a borrowed connection.
pub struct SessionScope<'a> {
    db: &'a dyn Database,
    finished: bool,
}

impl<'a> SessionScope<'a> {
    /// Issues `BEGIN` and returns the scope guarding the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if `BEGIN` fails.
    pub(crate) async fn begin(db: &'a dyn Database) -> Result<SessionScope<'a>, DbError> {
        db.exec_raw("BEGIN").await?;
        Ok(Self {
            db,
            finished: false,
        })
    }

    /// The connection, for statements that should join the transaction.
    #[must_use]
    pub const fn db(&self) -> &'a dyn Database {
        self.db
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if `COMMIT` fails; the transaction is left to
    /// the server's disposition in that case.
    pub async fn commit(mut self) -> Result<(), DbError> {
        self.finished = true;
        self.db.exec_raw("COMMIT").await?;
        Ok(())
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if `ROLLBACK` fails.
    pub async fn rollback(mut self) -> Result<(), DbError> {
        self.finished = true;
        self.db.exec_raw("ROLLBACK").await?;
        Ok(())
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::error!(
                "session dropped without commit or rollback; connection left in an open transaction"
            );
        }
    }
}
