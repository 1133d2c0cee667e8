//! SQLite-backed ledger of downloaded datasets and their extracted metadata
use crate::error::{Error, Result};
use crate::eumetsat::DatasetId;
use crate::metadata::{is_identifier, Datatype, FieldValue, RESERVED_FIELDS};
use crate::table::MarkdownTable;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    id TEXT PRIMARY KEY NOT NULL,
    downloaded TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS metadata_fields (
    name TEXT PRIMARY KEY NOT NULL,
    datatype TEXT NOT NULL
);
"#;

#[derive(Clone, Debug, PartialEq)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub fields: Vec<(String, FieldValue)>,
    pub downloaded: DateTime<Utc>,
}

impl DatasetRecord {
    pub fn new(id: DatasetId, fields: Vec<(String, FieldValue)>) -> Self {
        Self {
            id,
            fields,
            downloaded: Utc::now(),
        }
    }

    pub fn get(self: &Self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn contains(self: &Self, id: &DatasetId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM metadata WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn len(self: &Self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM metadata", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(self: &Self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Inserts a new row, adding columns for fields the table has not seen yet.
    /// An id can only ever be inserted once.
    pub fn insert(self: &mut Self, record: &DatasetRecord) -> Result<()> {
        if self.contains(&record.id)? {
            return Err(Error::DuplicateKey(record.id.to_string()));
        }

        let tx = self.conn.transaction()?;

        for (name, value) in &record.fields {
            if !is_identifier(name) || RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(Error::Config(format!("'{name}' cannot be used as a column name")));
            }
            let known: Option<String> = tx
                .query_row(
                    "SELECT datatype FROM metadata_fields WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            match known {
                Some(datatype) if datatype == value.datatype().as_str() => {}
                Some(stored) => {
                    return Err(Error::FieldType {
                        field: name.clone(),
                        stored,
                        found: value.datatype().as_str().to_string(),
                    });
                }
                None => {
                    debug!(field = %name, "Adding metadata column");
                    tx.execute(
                        &format!(
                            "ALTER TABLE metadata ADD COLUMN \"{name}\" {}",
                            sql_type(value.datatype())
                        ),
                        [],
                    )?;
                    tx.execute(
                        "INSERT INTO metadata_fields (name, datatype) VALUES (?1, ?2)",
                        params![name, value.datatype().as_str()],
                    )?;
                }
            }
        }

        let columns = record
            .fields
            .iter()
            .map(|(name, _)| format!(", \"{name}\""))
            .collect::<String>();
        let placeholders = (0..record.fields.len())
            .map(|i| format!(", ?{}", i + 3))
            .collect::<String>();

        let mut values: Vec<Value> = vec![
            Value::Text(record.id.to_string()),
            Value::Text(record.downloaded.to_rfc3339()),
        ];
        values.extend(record.fields.iter().map(|(_, v)| to_sql_value(v)));

        tx.execute(
            &format!(
                "INSERT INTO metadata (id, downloaded{columns}) VALUES (?1, ?2{placeholders})"
            ),
            params_from_iter(values),
        )?;
        tx.commit()?;

        debug!(dataset = %record.id, "Metadata recorded");
        Ok(())
    }

    /// Every row, ordered by id. Columns a row never populated are left out of its fields;
    /// a value that cannot be read back as its column's datatype is an error.
    pub fn all(self: &Self) -> Result<Vec<DatasetRecord>> {
        let fields = self.fields()?;

        let columns = fields
            .iter()
            .map(|(name, _)| format!(", \"{name}\""))
            .collect::<String>();
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id, downloaded{columns} FROM metadata ORDER BY id"))?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let downloaded: String = row.get(1)?;
            let values = (0..fields.len())
                .map(|i| row.get::<_, Value>(i + 2))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((id, downloaded, values))
        })?;

        let mut records = vec![];
        for row in rows {
            let (id, downloaded, values) = row?;
            let downloaded = DateTime::parse_from_rfc3339(&downloaded)
                .map_err(|e| {
                    Error::CorruptStore(format!("timestamp of '{id}' is not RFC 3339: {e}"))
                })?
                .with_timezone(&Utc);

            let mut record_fields = vec![];
            for ((name, datatype), value) in fields.iter().zip(values) {
                let value = from_sql_value(value, *datatype).map_err(|reason| {
                    Error::CorruptStore(format!("column '{name}' of '{id}': {reason}"))
                })?;
                if let Some(value) = value {
                    record_fields.push((name.clone(), value));
                }
            }

            records.push(DatasetRecord {
                id: DatasetId::new(id),
                fields: record_fields,
                downloaded,
            });
        }
        Ok(records)
    }

    /// The store as a markdown table indexed by dataset id.
    pub fn to_markdown(self: &Self) -> Result<String> {
        let mut table = MarkdownTable::new("id");
        for record in self.all()? {
            let mut cells: Vec<(String, String)> = record
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), value.to_string()))
                .collect();
            cells.push((
                "downloaded".to_string(),
                record.downloaded.format("%Y-%m-%d %H:%M:%S").to_string(),
            ));
            table.push_row(record.id.to_string(), cells);
        }
        Ok(table.render())
    }

    fn fields(self: &Self) -> Result<Vec<(String, Datatype)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, datatype FROM metadata_fields ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut fields = vec![];
        for row in rows {
            let (name, datatype) = row?;
            let datatype = Datatype::parse(&datatype).ok_or_else(|| {
                Error::CorruptStore(format!("unknown datatype '{datatype}' for column '{name}'"))
            })?;
            fields.push((name, datatype));
        }
        Ok(fields)
    }
}

fn sql_type(datatype: Datatype) -> &'static str {
    match datatype {
        Datatype::Datetime | Datatype::Str => "TEXT",
        Datatype::Int => "INTEGER",
        Datatype::Float => "REAL",
    }
}

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Datetime(dt) => Value::Text(dt.to_rfc3339()),
        FieldValue::Str(s) => Value::Text(s.clone()),
        FieldValue::Int(i) => Value::Integer(*i),
        FieldValue::Float(x) => Value::Real(*x),
    }
}

/// `None` for NULL, which is how rows that predate a column read back.
fn from_sql_value(
    value: Value,
    datatype: Datatype,
) -> std::result::Result<Option<FieldValue>, String> {
    let value = match (value, datatype) {
        (Value::Null, _) => return Ok(None),
        (Value::Text(s), Datatype::Datetime) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| FieldValue::Datetime(dt.with_timezone(&Utc)))
            .map_err(|e| format!("'{s}' is not an RFC 3339 datetime: {e}"))?,
        (Value::Text(s), Datatype::Str) => FieldValue::Str(s),
        (Value::Integer(i), Datatype::Int) => FieldValue::Int(i),
        (Value::Integer(i), Datatype::Float) => FieldValue::Float(i as f64),
        (Value::Real(x), Datatype::Float) => FieldValue::Float(x),
        (other, datatype) => {
            return Err(format!(
                "{:?} value where {} was expected",
                other.data_type(),
                datatype.as_str()
            ))
        }
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> DatasetRecord {
        DatasetRecord::new(
            DatasetId::new(id),
            vec![
                (
                    "start_date".to_string(),
                    FieldValue::Datetime(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 9).unwrap()),
                ),
                ("instrument_name".to_string(), FieldValue::Str("SEVIRI".to_string())),
                ("file_size".to_string(), FieldValue::Int(1234)),
                ("missing_pct".to_string(), FieldValue::Float(0.05)),
            ],
        )
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        let original = record("A");
        store.insert(&original).unwrap();

        let records = store.all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, original.id);
        assert_eq!(records[0].fields, original.fields);
        assert_eq!(
            records[0].downloaded.timestamp(),
            original.downloaded.timestamp()
        );
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store.insert(&record("A")).unwrap();

        let result = store.insert(&record("A"));
        assert!(matches!(result, Err(Error::DuplicateKey(id)) if id == "A"));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_all_is_ordered_by_id() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        for id in ["C", "A", "B"] {
            store.insert(&record(id)).unwrap();
        }
        let ids: Vec<String> = store.all().unwrap().iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert!(store.contains(&DatasetId::new("B")).unwrap());
        assert!(!store.contains(&DatasetId::new("D")).unwrap());
    }

    #[test]
    fn test_schema_grows_with_new_fields() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store.insert(&record("A")).unwrap();

        let other = DatasetRecord::new(
            DatasetId::new("B"),
            vec![("orbit".to_string(), FieldValue::Int(7))],
        );
        store.insert(&other).unwrap();

        let records = store.all().unwrap();
        assert_eq!(records[0].fields.len(), 4);
        assert_eq!(records[1].fields, vec![("orbit".to_string(), FieldValue::Int(7))]);
    }

    #[test]
    fn test_conflicting_datatype_is_rejected() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store.insert(&record("A")).unwrap();

        let conflicting = DatasetRecord::new(
            DatasetId::new("B"),
            vec![("file_size".to_string(), FieldValue::Str("big".to_string()))],
        );
        match store.insert(&conflicting) {
            Err(Error::FieldType { field, stored, found }) => {
                assert_eq!(field, "file_size");
                assert_eq!(stored, "int");
                assert_eq!(found, "str");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!store.contains(&DatasetId::new("B")).unwrap());
    }

    #[test]
    fn test_unreadable_value_is_reported() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store.insert(&record("A")).unwrap();
        store
            .conn
            .execute("UPDATE metadata SET start_date = 'yesterday' WHERE id = 'A'", [])
            .unwrap();

        match store.all() {
            Err(Error::CorruptStore(reason)) => {
                assert!(reason.contains("start_date"));
                assert!(reason.contains("yesterday"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_download_timestamp_is_reported() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store.insert(&record("A")).unwrap();
        store
            .conn
            .execute("UPDATE metadata SET downloaded = 'soon' WHERE id = 'A'", [])
            .unwrap();

        assert!(matches!(store.all(), Err(Error::CorruptStore(_))));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("metadata.db");
        {
            let mut store = MetadataStore::open(&path).unwrap();
            store.insert(&record("A")).unwrap();
        }
        let store = MetadataStore::open(&path).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_to_markdown() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        store.insert(&record("A")).unwrap();

        let table = store.to_markdown().unwrap();
        let header = table.lines().next().unwrap();
        assert!(header.starts_with("| id "));
        assert!(header.contains("instrument_name"));
        assert!(header.contains("downloaded"));
        assert!(table.contains("SEVIRI"));
    }
}
