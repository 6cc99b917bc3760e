use uuid::Uuid;
use vmrun_reconcile::ReconcileError;

/// True for sqlx failures that can succeed on a plain retry.
///
/// Transient: pool timeout/closed, IO, SQLSTATE class 08 (connection),
/// 40001 (serialization), 40P01 (deadlock), 57P01/57P03 (shutdown).
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some(code) => {
                code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P03")
            }
            None => false,
        },
        _ => false,
    }
}

/// Map a plumbing error from inside a reconcile pass onto the caller-facing
/// taxonomy. The sqlx error is found through any `.context()` layers.
pub fn store_failure(instance_id: Uuid, err: anyhow::Error) -> ReconcileError {
    match err.downcast_ref::<sqlx::Error>() {
        Some(e) if is_transient(e) => ReconcileError::TransientStore(format!("{err:#}")),
        _ => ReconcileError::failed(instance_id, format!("{err:#}")),
    }
}
