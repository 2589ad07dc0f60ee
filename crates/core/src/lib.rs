//! An embeddable SQL database engine over a transactional key-value
//! store. SQL statements are parsed, compiled to byte-code for a small
//! virtual machine (the VDBE), and executed against `squill-kv`
//! containers.
//!
//! ```no_run
//! use squill_core::{Connection, StepOutcome};
//!
//! let conn = Connection::open(":memory:")?;
//! conn.exec("CREATE TABLE t(a INTEGER PRIMARY KEY, b TEXT)", |_, _| false)?;
//! conn.exec("INSERT INTO t VALUES(NULL, 'hello')", |_, _| false)?;
//! let (stmt, _) = conn.prepare("SELECT a, b FROM t")?;
//! let mut stmt = stmt.unwrap();
//! while stmt.step()? == StepOutcome::Row {
//!     println!("{:?}", stmt.row());
//! }
//! # Ok::<(), squill_core::Error>(())
//! ```

pub mod ast;
pub mod auth;
pub mod catalog;
pub mod compile;
pub mod errors;
pub mod func;
pub mod parser;
pub mod resolve;
pub mod schema;
pub mod session;
pub mod store;
pub mod tokenizer;
pub mod vdbe;

pub use ast::ConflictAction;
pub use auth::{AuthAction, AuthResult, Authorizer};
pub use errors::{Error, ErrorCode, Result};
pub use session::{Connection, InterruptHandle, OpenConfig, RuntimeFlags, Statement, StepOutcome};
pub use tokenizer::is_complete;
pub use vdbe::value::Value;
