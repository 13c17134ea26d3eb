/// A fresh identifier for one export.
///
/// Used both as the temporary table name and as the shard prefix, so it
/// only contains characters valid in a table name: hex digits and `_`.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "_")
}
