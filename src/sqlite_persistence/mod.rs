mod versioned_schema;

pub use versioned_schema::{
    read_schema_version, validate_and_migrate, Column, ForeignKey, ForeignKeyOnChange, SqlType,
    Table, VersionedSchema, BASE_DB_VERSION,
};
