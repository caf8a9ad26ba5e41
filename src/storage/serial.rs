// # Binary Serialization
//
// Hand-encoded little-endian layouts for values, rows, tables and foreign
// keys. These layouts are the on-disk contract: the WAL payloads, the
// per-table files and the foreign-key file are all built from them, so the
// byte forms are fixed and self-describing rather than produced by a codec.
//
// Layout summary:
//
// - Value:     type u32 | is_null u8 | payload (Int/Float 8B, Bool 1B,
//              Varchar/Text UTF-8 + NUL)
// - Row:       row_id u64 | value_count u64 | (len u64 | Value)*
// - ColumnDef: fixed 192B record, see `COLUMN_DEF_SIZE`
// - Table:     name[64] | column_count u64 | ColumnDef* | row_count u64 |
//              (len u64 | Row)* | primary_key[64] | next_row_id u64
// - ForeignKey: four 64B NUL-padded names, 256B total

use crate::common::{ColumnDef, DataType, ForeignKey, Row, Table, Value};
use crate::error::{DbError, Result};

/// Width of fixed name fields (NUL-padded UTF-8).
pub const NAME_FIELD_SIZE: usize = 64;

/// Fixed size of an encoded column definition.
pub const COLUMN_DEF_SIZE: usize = 192;

/// Fixed size of an encoded foreign-key record.
pub const FOREIGN_KEY_SIZE: usize = 4 * NAME_FIELD_SIZE;

const FLAG_PRIMARY: u32 = 0x1;
const FLAG_UNIQUE: u32 = 0x2;
const FLAG_NULLABLE: u32 = 0x4;
const FLAG_FOREIGN: u32 = 0x8;

// Short string fields inside the 192-byte column record.
const COLUMN_STR_SIZE: usize = 32;

// ============================================================================
// Bounded Reader
// ============================================================================

/// Bounds-checked cursor over an input slice. Truncated input surfaces as
/// `Corruption`, never as a panic.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(DbError::Corruption(format!(
                "truncated input: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }
}

// ============================================================================
// Fixed-Width String Fields
// ============================================================================

/// Append `s` as a NUL-padded field of `width` bytes. The string must leave
/// room for at least one terminating NUL.
pub fn write_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= width {
        return Err(DbError::Serialization(format!(
            "string '{}' does not fit in a {}-byte field",
            s, width
        )));
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + (width - bytes.len()), 0);
    Ok(())
}

/// Decode a NUL-padded field of `width` bytes into a String.
pub fn read_fixed_str(r: &mut Reader<'_>, width: usize) -> Result<String> {
    let field = r.take(width)?;
    let end = field.iter().position(|&b| b == 0).ok_or_else(|| {
        DbError::Corruption(format!("{}-byte string field lacks NUL terminator", width))
    })?;
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| DbError::Corruption("string field is not valid UTF-8".to_string()))
}

// ============================================================================
// Values
// ============================================================================

pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.data_type().code().to_le_bytes());
    out.push(u8::from(value.is_null()));
    match value {
        Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
        Value::Varchar(s) | Value::Text(s) => {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Null(_) => {}
    }
}

pub fn encoded_value_len(value: &Value) -> usize {
    5 + match value {
        Value::Int(_) | Value::Float(_) => 8,
        Value::Varchar(s) | Value::Text(s) => s.len() + 1,
        Value::Bool(_) => 1,
        Value::Null(_) => 0,
    }
}

pub fn decode_value(r: &mut Reader<'_>) -> Result<Value> {
    let data_type = DataType::from_code(r.read_u32()?)?;
    let is_null = r.read_u8()?;
    if is_null > 1 {
        return Err(DbError::Corruption(format!(
            "is_null byte must be 0 or 1, got {}",
            is_null
        )));
    }
    if is_null == 1 {
        return Ok(Value::Null(data_type));
    }
    match data_type {
        DataType::Int => Ok(Value::Int(r.read_i64()?)),
        DataType::Float => Ok(Value::Float(r.read_f64()?)),
        DataType::Varchar | DataType::Text => {
            let rest = &r.data[r.pos..];
            let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                DbError::Corruption("string value lacks NUL terminator".to_string())
            })?;
            let s = std::str::from_utf8(&rest[..end])
                .map_err(|_| DbError::Corruption("string value is not valid UTF-8".to_string()))?
                .to_owned();
            r.pos += end + 1;
            Ok(match data_type {
                DataType::Varchar => Value::Varchar(s),
                _ => Value::Text(s),
            })
        }
        DataType::Bool => {
            let b = r.read_u8()?;
            if b > 1 {
                return Err(DbError::Corruption(format!(
                    "bool payload must be 0 or 1, got {}",
                    b
                )));
            }
            Ok(Value::Bool(b == 1))
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

pub fn encode_row(row: &Row, out: &mut Vec<u8>) {
    out.extend_from_slice(&row.id.to_le_bytes());
    out.extend_from_slice(&(row.values.len() as u64).to_le_bytes());
    for value in &row.values {
        out.extend_from_slice(&(encoded_value_len(value) as u64).to_le_bytes());
        encode_value(value, out);
    }
}

pub fn encode_row_bytes(row: &Row) -> Vec<u8> {
    let mut out = Vec::new();
    encode_row(row, &mut out);
    out
}

pub fn decode_row(r: &mut Reader<'_>) -> Result<Row> {
    let row_id = r.read_u64()?;
    let value_count = r.read_u64()? as usize;
    let mut values = Vec::with_capacity(value_count.min(1024));
    for _ in 0..value_count {
        let len = r.read_u64()? as usize;
        let slice = r.take(len)?;
        let mut vr = Reader::new(slice);
        let value = decode_value(&mut vr)?;
        if !vr.is_empty() {
            return Err(DbError::Corruption(format!(
                "value encoding has {} trailing bytes",
                vr.remaining()
            )));
        }
        values.push(value);
    }
    Ok(Row::new(row_id, values))
}

pub fn decode_row_bytes(bytes: &[u8]) -> Result<Row> {
    let mut r = Reader::new(bytes);
    let row = decode_row(&mut r)?;
    if !r.is_empty() {
        return Err(DbError::Corruption(format!(
            "row encoding has {} trailing bytes",
            r.remaining()
        )));
    }
    Ok(row)
}

/// Encode a query result set: row count followed by length-prefixed rows.
pub fn encode_row_set(rows: &[Row]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    for row in rows {
        let encoded = encode_row_bytes(row);
        out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        out.extend_from_slice(&encoded);
    }
    out
}

pub fn decode_row_set(bytes: &[u8]) -> Result<Vec<Row>> {
    let mut r = Reader::new(bytes);
    let count = r.read_u64()? as usize;
    let mut rows = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let len = r.read_u64()? as usize;
        rows.push(decode_row_bytes(r.take(len)?)?);
    }
    if !r.is_empty() {
        return Err(DbError::Corruption(format!(
            "row set has {} trailing bytes",
            r.remaining()
        )));
    }
    Ok(rows)
}

// ============================================================================
// Column Definitions
// ============================================================================

pub fn encode_column_def(col: &ColumnDef, out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();
    write_fixed_str(out, &col.name, NAME_FIELD_SIZE)?;
    out.extend_from_slice(&col.data_type.code().to_le_bytes());
    out.extend_from_slice(&col.max_length.to_le_bytes());
    let mut flags = 0u32;
    if col.primary_key {
        flags |= FLAG_PRIMARY;
    }
    if col.unique {
        flags |= FLAG_UNIQUE;
    }
    if col.nullable {
        flags |= FLAG_NULLABLE;
    }
    if col.is_foreign {
        flags |= FLAG_FOREIGN;
    }
    out.extend_from_slice(&flags.to_le_bytes());
    write_fixed_str(out, &col.default_value, COLUMN_STR_SIZE)?;
    write_fixed_str(out, &col.foreign_table, COLUMN_STR_SIZE)?;
    write_fixed_str(out, &col.foreign_column, COLUMN_STR_SIZE)?;
    out.resize(start + COLUMN_DEF_SIZE, 0);
    Ok(())
}

pub fn decode_column_def(r: &mut Reader<'_>) -> Result<ColumnDef> {
    let record = r.take(COLUMN_DEF_SIZE)?;
    let mut cr = Reader::new(record);
    let name = read_fixed_str(&mut cr, NAME_FIELD_SIZE)?;
    let data_type = DataType::from_code(cr.read_u32()?)?;
    let max_length = cr.read_u32()?;
    let flags = cr.read_u32()?;
    let default_value = read_fixed_str(&mut cr, COLUMN_STR_SIZE)?;
    let foreign_table = read_fixed_str(&mut cr, COLUMN_STR_SIZE)?;
    let foreign_column = read_fixed_str(&mut cr, COLUMN_STR_SIZE)?;
    Ok(ColumnDef {
        name,
        data_type,
        max_length,
        primary_key: flags & FLAG_PRIMARY != 0,
        unique: flags & FLAG_UNIQUE != 0,
        nullable: flags & FLAG_NULLABLE != 0,
        is_foreign: flags & FLAG_FOREIGN != 0,
        default_value,
        foreign_table,
        foreign_column,
    })
}

// ============================================================================
// Tables
// ============================================================================

pub fn encode_table(table: &Table) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_fixed_str(&mut out, &table.name, NAME_FIELD_SIZE)?;
    out.extend_from_slice(&(table.columns.len() as u64).to_le_bytes());
    for col in &table.columns {
        encode_column_def(col, &mut out)?;
    }
    out.extend_from_slice(&(table.rows.len() as u64).to_le_bytes());
    for row in &table.rows {
        let encoded = encode_row_bytes(row);
        out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        out.extend_from_slice(&encoded);
    }
    write_fixed_str(&mut out, &table.primary_key, NAME_FIELD_SIZE)?;
    out.extend_from_slice(&table.next_row_id.to_le_bytes());
    Ok(out)
}

pub fn decode_table(bytes: &[u8]) -> Result<Table> {
    let mut r = Reader::new(bytes);
    let name = read_fixed_str(&mut r, NAME_FIELD_SIZE)?;
    let column_count = r.read_u64()? as usize;
    let mut columns = Vec::with_capacity(column_count.min(1024));
    for _ in 0..column_count {
        columns.push(decode_column_def(&mut r)?);
    }
    let row_count = r.read_u64()? as usize;
    let mut rows = Vec::with_capacity(row_count.min(65_536));
    for _ in 0..row_count {
        let len = r.read_u64()? as usize;
        rows.push(decode_row_bytes(r.take(len)?)?);
    }
    let primary_key = read_fixed_str(&mut r, NAME_FIELD_SIZE)?;
    let next_row_id = r.read_u64()?;
    if !r.is_empty() {
        return Err(DbError::Corruption(format!(
            "table encoding has {} trailing bytes",
            r.remaining()
        )));
    }
    Ok(Table {
        name,
        columns,
        rows,
        primary_key,
        next_row_id,
    })
}

// ============================================================================
// Foreign Keys
// ============================================================================

pub fn encode_foreign_key(fk: &ForeignKey) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(FOREIGN_KEY_SIZE);
    write_fixed_str(&mut out, &fk.table, NAME_FIELD_SIZE)?;
    write_fixed_str(&mut out, &fk.column, NAME_FIELD_SIZE)?;
    write_fixed_str(&mut out, &fk.referenced_table, NAME_FIELD_SIZE)?;
    write_fixed_str(&mut out, &fk.referenced_column, NAME_FIELD_SIZE)?;
    Ok(out)
}

pub fn decode_foreign_key(r: &mut Reader<'_>) -> Result<ForeignKey> {
    Ok(ForeignKey {
        table: read_fixed_str(r, NAME_FIELD_SIZE)?,
        column: read_fixed_str(r, NAME_FIELD_SIZE)?,
        referenced_table: read_fixed_str(r, NAME_FIELD_SIZE)?,
        referenced_column: read_fixed_str(r, NAME_FIELD_SIZE)?,
    })
}

/// Decode the concatenated foreign-key file.
pub fn decode_foreign_keys(bytes: &[u8]) -> Result<Vec<ForeignKey>> {
    if bytes.len() % FOREIGN_KEY_SIZE != 0 {
        return Err(DbError::Corruption(format!(
            "foreign-key file length {} is not a multiple of {}",
            bytes.len(),
            FOREIGN_KEY_SIZE
        )));
    }
    let mut r = Reader::new(bytes);
    let mut keys = Vec::with_capacity(bytes.len() / FOREIGN_KEY_SIZE);
    while !r.is_empty() {
        keys.push(decode_foreign_key(&mut r)?);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Vec<Value> {
        vec![
            Value::Int(-42),
            Value::Float(3.5),
            Value::Varchar("hello".into()),
            Value::Text("a longer text body".into()),
            Value::Bool(true),
            Value::Null(DataType::Varchar),
        ]
    }

    #[test]
    fn test_value_round_trip() {
        for value in sample_values() {
            let mut buf = Vec::new();
            encode_value(&value, &mut buf);
            assert_eq!(buf.len(), encoded_value_len(&value));
            let mut r = Reader::new(&buf);
            let decoded = decode_value(&mut r).unwrap();
            assert!(r.is_empty());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_value_bytes_round_trip_exactly() {
        // encode(decode(bytes)) == bytes for well-formed encodings.
        for value in sample_values() {
            let mut buf = Vec::new();
            encode_value(&value, &mut buf);
            let mut r = Reader::new(&buf);
            let decoded = decode_value(&mut r).unwrap();
            let mut buf2 = Vec::new();
            encode_value(&decoded, &mut buf2);
            assert_eq!(buf, buf2);
        }
    }

    #[test]
    fn test_truncated_value_is_corruption() {
        let mut buf = Vec::new();
        encode_value(&Value::Int(7), &mut buf);
        buf.truncate(buf.len() - 1);
        let mut r = Reader::new(&buf);
        assert!(matches!(decode_value(&mut r), Err(DbError::Corruption(_))));
    }

    #[test]
    fn test_string_without_nul_is_corruption() {
        let mut buf = Vec::new();
        encode_value(&Value::Varchar("abc".into()), &mut buf);
        buf.pop(); // strip terminator
        let mut r = Reader::new(&buf);
        assert!(matches!(decode_value(&mut r), Err(DbError::Corruption(_))));
    }

    #[test]
    fn test_row_round_trip() {
        let row = Row::new(9, sample_values());
        let bytes = encode_row_bytes(&row);
        assert_eq!(decode_row_bytes(&bytes).unwrap(), row);
    }

    #[test]
    fn test_row_set_round_trip() {
        let rows = vec![
            Row::new(1, vec![Value::Int(1)]),
            Row::new(2, vec![Value::Varchar("x".into())]),
        ];
        let bytes = encode_row_set(&rows);
        assert_eq!(decode_row_set(&bytes).unwrap(), rows);
    }

    #[test]
    fn test_column_def_is_fixed_width() {
        let col = ColumnDef::new("user_id", DataType::Int)
            .primary_key()
            .references("users", "id");
        let mut buf = Vec::new();
        encode_column_def(&col, &mut buf).unwrap();
        assert_eq!(buf.len(), COLUMN_DEF_SIZE);
        let mut r = Reader::new(&buf);
        let decoded = decode_column_def(&mut r).unwrap();
        assert_eq!(decoded, col);
    }

    #[test]
    fn test_table_round_trip() {
        let mut table = Table::new(
            "users",
            vec![
                ColumnDef::new("id", DataType::Int).primary_key(),
                ColumnDef::new("name", DataType::Varchar).max_length(64),
            ],
        );
        table.rows.push(Row::new(
            1,
            vec![Value::Int(1), Value::Varchar("Alice".into())],
        ));
        table.rows.push(Row::new(
            2,
            vec![Value::Int(2), Value::Varchar("Bob".into())],
        ));
        table.next_row_id = 3;

        let bytes = encode_table(&table).unwrap();
        let decoded = decode_table(&bytes).unwrap();
        assert_eq!(decoded, table);

        // Byte-exact re-encode.
        assert_eq!(encode_table(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_table_with_trailing_garbage_is_corruption() {
        let table = Table::new("t", vec![ColumnDef::new("id", DataType::Int)]);
        let mut bytes = encode_table(&table).unwrap();
        bytes.push(0xAB);
        assert!(matches!(decode_table(&bytes), Err(DbError::Corruption(_))));
    }

    #[test]
    fn test_foreign_key_file_round_trip() {
        let fks = vec![
            ForeignKey {
                table: "orders".into(),
                column: "user_id".into(),
                referenced_table: "users".into(),
                referenced_column: "id".into(),
            },
            ForeignKey {
                table: "orders".into(),
                column: "item_id".into(),
                referenced_table: "items".into(),
                referenced_column: "id".into(),
            },
        ];
        let mut bytes = Vec::new();
        for fk in &fks {
            bytes.extend_from_slice(&encode_foreign_key(fk).unwrap());
        }
        assert_eq!(decode_foreign_keys(&bytes).unwrap(), fks);
        assert!(decode_foreign_keys(&bytes[..FOREIGN_KEY_SIZE - 1]).is_err());
    }

    #[test]
    fn test_fixed_str_overflow_rejected() {
        let long = "x".repeat(NAME_FIELD_SIZE);
        let mut out = Vec::new();
        assert!(write_fixed_str(&mut out, &long, NAME_FIELD_SIZE).is_err());
    }
}
