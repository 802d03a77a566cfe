pub mod inspector;
pub mod snapshot;

pub use inspector::SchemaInspector;
pub use snapshot::{ColumnInfo, SchemaSnapshot, TableSchema};
