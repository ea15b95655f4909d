//! Connection lifetime lock.
//!
//! Sessions and changeset containers hold one of these for as long as they
//! exist. It is the moral equivalent of a permanently-open trivial prepared
//! statement: while any lock is outstanding the connection refuses to close,
//! so native row state cannot disappear under an in-flight operation.

use super::SharedConnection;
use crate::error::Result;

/// Keeps a connection open for the lifetime of its holder.
///
/// Released at most once; dropping an unreleased lock releases it.
pub struct ConnectionLock {
    conn: SharedConnection,
    released: bool,
}

impl ConnectionLock {
    /// Open the lock's statement on `conn`.
    pub fn acquire(conn: &SharedConnection) -> Result<Self> {
        conn.write().unwrap().open_statement()?;
        Ok(Self {
            conn: conn.clone(),
            released: false,
        })
    }

    /// The connection this lock protects.
    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    /// Finalize the lock's statement. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.conn.write() {
            Ok(mut conn) => {
                if conn.is_closed() {
                    log::warn!("connection lock released after connection close");
                    return;
                }
                conn.close_statement();
            }
            Err(_) => log::warn!("connection lock released on poisoned connection"),
        }
    }
}

impl Drop for ConnectionLock {
    fn drop(&mut self) {
        self.release();
    }
}
