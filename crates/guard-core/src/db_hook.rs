//! Shared post-operation hook for the persistence layer.

use std::{fmt, sync::Arc};

use crate::report::ErrorReporter;

/// Persistence operations that pass through the shared error hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbOperation {
    Validate,
    Save,
    Update,
    InsertMany,
    Find,
    FindOne,
    FindOneAndUpdate,
    FindOneAndRemove,
}

impl DbOperation {
    pub const ALL: [DbOperation; 8] = [
        DbOperation::Validate,
        DbOperation::Save,
        DbOperation::Update,
        DbOperation::InsertMany,
        DbOperation::Find,
        DbOperation::FindOne,
        DbOperation::FindOneAndUpdate,
        DbOperation::FindOneAndRemove,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DbOperation::Validate => "validate",
            DbOperation::Save => "save",
            DbOperation::Update => "update",
            DbOperation::InsertMany => "insertMany",
            DbOperation::Find => "find",
            DbOperation::FindOne => "findOne",
            DbOperation::FindOneAndUpdate => "findOneAndUpdate",
            DbOperation::FindOneAndRemove => "findOneAndRemove",
        }
    }
}

impl fmt::Display for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-operation callback installed on every persistence operation.
#[derive(Clone)]
pub struct DbErrorHook {
    reporter: Arc<ErrorReporter>,
}

impl DbErrorHook {
    pub fn new(reporter: Arc<ErrorReporter>) -> Self {
        Self { reporter }
    }

    /// Report `error` (if any) and always hand control to `next` with the error unchanged.
    pub fn after<E, T>(&self, op: DbOperation, error: Option<E>, next: impl FnOnce(Option<E>) -> T) -> T
    where
        E: fmt::Display,
    {
        if let Some(e) = &error {
            self.reporter
                .report_unfiltered(e, Some(&format!("global db error ({op})")));
        }
        next(error)
    }
}
