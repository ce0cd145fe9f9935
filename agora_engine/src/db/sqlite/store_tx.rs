use log::*;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::sync::OwnedMutexGuard;

use crate::db::{PublicData, StoreError};

type CommitHook = Box<dyn FnOnce() + Send>;

/// Handle to a nested savepoint. Obtained from [`StoreTx::savepoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(usize);

struct SavepointMark {
    depth: usize,
    staged: usize,
    hooks: usize,
}

/// An open order store transaction.
///
/// Dropping a `StoreTx` without calling [`StoreTx::commit`] rolls it back. Update transactions hold the store's writer
/// lock for their whole lifetime, so at most one is open at any time.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    writer: Option<OwnedMutexGuard<()>>,
    public: PublicData,
    staged: Vec<(String, Vec<u8>)>,
    savepoints: Vec<SavepointMark>,
    hooks: Vec<CommitHook>,
}

impl StoreTx {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        writer: Option<OwnedMutexGuard<()>>,
        public: PublicData,
    ) -> Self {
        Self { tx, writer, public, staged: Vec::new(), savepoints: Vec::new(), hooks: Vec::new() }
    }

    pub fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(StoreError::ReadOnly)
        }
    }

    /// The underlying connection, for the free query functions in this module.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn savepoint(&mut self) -> Result<Savepoint, StoreError> {
        let depth = self.savepoints.len() + 1;
        sqlx::query(&format!("SAVEPOINT agora_sp_{depth}")).execute(&mut *self.tx).await?;
        self.savepoints.push(SavepointMark { depth, staged: self.staged.len(), hooks: self.hooks.len() });
        trace!("🗃️ Savepoint {depth} opened");
        Ok(Savepoint(depth))
    }

    /// Undoes everything since `savepoint` (rows, staged public files and commit hooks) and discards it.
    pub async fn rollback_to(&mut self, savepoint: Savepoint) -> Result<(), StoreError> {
        let mark = self.pop_savepoint(savepoint)?;
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT agora_sp_{}", mark.depth)).execute(&mut *self.tx).await?;
        sqlx::query(&format!("RELEASE SAVEPOINT agora_sp_{}", mark.depth)).execute(&mut *self.tx).await?;
        self.staged.truncate(mark.staged);
        self.hooks.truncate(mark.hooks);
        trace!("🗃️ Rolled back to savepoint {}", mark.depth);
        Ok(())
    }

    /// Keeps everything since `savepoint` as part of the enclosing transaction.
    pub async fn release(&mut self, savepoint: Savepoint) -> Result<(), StoreError> {
        let mark = self.pop_savepoint(savepoint)?;
        sqlx::query(&format!("RELEASE SAVEPOINT agora_sp_{}", mark.depth)).execute(&mut *self.tx).await?;
        Ok(())
    }

    fn pop_savepoint(&mut self, savepoint: Savepoint) -> Result<SavepointMark, StoreError> {
        match self.savepoints.last() {
            Some(mark) if mark.depth == savepoint.0 => {
                self.savepoints.pop().ok_or(StoreError::UnknownSavepoint(savepoint.0))
            },
            _ => Err(StoreError::UnknownSavepoint(savepoint.0)),
        }
    }

    /// Stages a public file. It reaches the disk only if the transaction commits.
    pub fn write_public_file(&mut self, path: &str, contents: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.public.resolve(path)?;
        self.staged.push((path.to_string(), contents));
        Ok(())
    }

    /// Reads a public file as this transaction sees it, staged writes included.
    pub async fn read_public_file(&mut self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some((_, contents)) = self.staged.iter().rev().find(|(p, _)| p == path) {
            return Ok(Some(contents.clone()));
        }
        self.public.read(path).await
    }

    /// Registers a callback to run once the transaction has committed. Callbacks are dropped on rollback.
    pub fn on_commit<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.hooks.push(Box::new(f));
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        let Self { tx, writer, public, staged, hooks, .. } = self;
        tx.commit().await?;
        let mut latest: Vec<(String, Vec<u8>)> = Vec::new();
        for (path, contents) in staged {
            latest.retain(|(p, _)| *p != path);
            latest.push((path, contents));
        }
        for (path, contents) in latest {
            if let Err(e) = public.write(&path, &contents).await {
                error!("🗃️ Transaction committed but public file {path} could not be written. {e}");
            }
        }
        // Hooks run before the writer lock is released, so they happen-before the next update transaction
        for hook in hooks {
            hook();
        }
        drop(writer);
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
