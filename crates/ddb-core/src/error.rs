pub use ddb_types::error::{DdbError, Result, WriteGate};
