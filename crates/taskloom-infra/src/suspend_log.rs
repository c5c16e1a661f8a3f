//! Append-only merge rules shared by the durable-log repositories.

use taskloom_types::durable::SuspendLogEntry;
use taskloom_types::error::RepositoryError;

/// A write a repository has to perform to store an incoming log.
#[derive(Debug, PartialEq)]
pub(crate) enum LogChange<'a> {
    /// A new entry at the end of the log.
    Append(&'a SuspendLogEntry),
    /// An existing entry whose outcome was missing and is now known.
    Resolve(&'a SuspendLogEntry),
}

/// Compare `incoming` against the `stored` log and list the writes needed.
///
/// Stored entries are never renumbered, dropped or rewritten: an entry
/// whose fingerprint differs is a conflict, an outcome is only filled in
/// when none is stored, and new entries must continue the sequence densely.
pub(crate) fn plan_changes<'a>(
    stored: &[SuspendLogEntry],
    incoming: &'a [SuspendLogEntry],
) -> Result<Vec<LogChange<'a>>, RepositoryError> {
    let mut changes = Vec::new();
    let mut next = stored.len() as u64 + 1;

    for entry in incoming {
        if entry.sequence == 0 {
            return Err(RepositoryError::Conflict(
                "suspend log sequences start at 1".to_string(),
            ));
        }
        if entry.sequence < next && entry.sequence <= stored.len() as u64 {
            let existing = &stored[(entry.sequence - 1) as usize];
            if existing.fingerprint != entry.fingerprint {
                return Err(RepositoryError::Conflict(format!(
                    "suspend log entry {} already holds a different condition",
                    entry.sequence
                )));
            }
            if existing.outcome.is_none() && entry.outcome.is_some() {
                changes.push(LogChange::Resolve(entry));
            }
        } else if entry.sequence == next {
            changes.push(LogChange::Append(entry));
            next += 1;
        } else {
            return Err(RepositoryError::Conflict(format!(
                "suspend log entry {} does not follow {}",
                entry.sequence,
                next - 1
            )));
        }
    }
    Ok(changes)
}
