//! Compile-time authorization. The callback is consulted while code is
//! generated, never at execution time; IGNORE turns a column read into a
//! compiled NULL and a write into a no-op.

/// Action codes passed to the authorizer. The set is fixed and part of
/// the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthAction {
    Copy,
    CreateIndex,
    CreateTable,
    CreateTempIndex,
    CreateTempTable,
    CreateTempTrigger,
    CreateTempView,
    CreateTrigger,
    CreateView,
    Delete,
    DropIndex,
    DropTable,
    DropTempIndex,
    DropTempTable,
    DropTempTrigger,
    DropTempView,
    DropTrigger,
    DropView,
    Insert,
    Pragma,
    Read,
    Select,
    Transaction,
    Update,
    Attach,
    Detach,
}

/// Authorizer verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Allow the operation.
    Allow,
    /// Compile a NULL read or a no-op write instead.
    Ignore,
    /// Fail compilation with an AUTH error.
    Deny,
}

/// The callback: `(action, arg1, arg2, database, trigger)` where the two
/// string arguments depend on the action (table/column, index/table, ...)
/// and `trigger` names the trigger being expanded, if any.
pub type Authorizer =
    Box<dyn FnMut(AuthAction, Option<&str>, Option<&str>, Option<&str>, Option<&str>) -> AuthResult>;
