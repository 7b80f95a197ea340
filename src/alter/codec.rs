//! Durable record layout of a schema change job
//!
//! ```text
//! [JOB_TYPE u8][STATE u8][DB_ID][TABLE_ID][TXN_ID][CREATE_TIME][FINISHED_TIME][CANCEL_MSG]
//! [TABLE_NAME]
//! [HAS_SCHEMA u8] ([COUNT u32] { [INDEX_ID][COLUMNS][VERSION i32][HASH i32][SHORT_KEY i16] })?
//! [HAS_DELTAS u8] ([COUNT u32] { [PARTITION_ID][N u32] { delta } })?
//! meta version >= 9:  [HAS_BF_CHANGE u8] ([PRESENT u8] ([N u32] { name } [FPP f64])?)?
//! meta version >= 39: [TO_COLUMNAR u8]
//! ```
//!
//! Integers are big-endian, strings are u32 length + UTF-8. The decoder
//! honors the meta version the record was written with.

use crate::alter::delta::{DeltaOp, ReplicaDelta, VersionInfo};
use crate::alter::job::{
    BloomFilterChange, ChangeSet, JobBody, JobCore, JobState, SchemaChangeJob, SchemaInfo,
};
use crate::catalog::{AggregateType, BloomFilterInfo, Column, ColumnType};
use crate::common::{Error, Result};
use crate::journal::meta_version::{
    CURRENT_META_VERSION, VERSION_BLOOM_FILTER, VERSION_STORAGE_ENCODING,
};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;

const JOB_TYPE_SCHEMA_CHANGE: u8 = 1;

const DELTA_OP_UPDATE: u8 = 1;
const DELTA_OP_DELETE: u8 = 2;

/// Encode with the current meta version
pub fn encode(job: &SchemaChangeJob) -> Result<Vec<u8>> {
    encode_versioned(job, CURRENT_META_VERSION)
}

/// Encode for readers at `meta_version`; fields newer than that are omitted.
pub fn encode_versioned(job: &SchemaChangeJob, meta_version: u32) -> Result<Vec<u8>> {
    let core = job.lock();
    encode_locked(job, &core, meta_version)
}

pub(crate) fn encode_locked(
    job: &SchemaChangeJob,
    core: &JobCore,
    meta_version: u32,
) -> Result<Vec<u8>> {
    let body = job.live(core)?;
    let mut buf = BytesMut::with_capacity(256);

    buf.put_u8(JOB_TYPE_SCHEMA_CHANGE);
    buf.put_u8(core.state.code());
    buf.put_i64(job.db_id);
    buf.put_i64(job.table_id);
    buf.put_i64(core.transaction_id);
    buf.put_i64(job.create_time);
    buf.put_i64(core.finished_time);
    put_string(&mut buf, &core.cancel_msg);

    put_string(&mut buf, &job.table_name);

    if body.changed_schema.is_empty() {
        buf.put_u8(0);
    } else {
        buf.put_u8(1);
        buf.put_u32(body.changed_schema.len() as u32);
        for (index_id, columns) in &body.changed_schema {
            let info = body.schema_info.get(index_id).ok_or_else(|| {
                Error::InvariantViolation(format!("index[{}] has no schema info", index_id))
            })?;
            buf.put_i64(*index_id);
            buf.put_u32(columns.len() as u32);
            for column in columns {
                put_column(&mut buf, column);
            }
            buf.put_i32(info.schema_version);
            buf.put_i32(info.schema_hash);
            buf.put_i16(info.short_key_column_count);
        }
    }

    if body.replica_deltas.is_empty() {
        buf.put_u8(0);
    } else {
        buf.put_u8(1);
        buf.put_u32(body.replica_deltas.len() as u32);
        for (partition_id, deltas) in &body.replica_deltas {
            buf.put_i64(*partition_id);
            buf.put_u32(deltas.len() as u32);
            for delta in deltas {
                put_delta(&mut buf, delta);
            }
        }
    }

    if meta_version >= VERSION_BLOOM_FILTER {
        match &body.bloom_filter_change {
            None => buf.put_u8(0),
            Some(change) => {
                buf.put_u8(1);
                match change {
                    BloomFilterChange::Drop => buf.put_u8(0),
                    BloomFilterChange::Set(info) => {
                        buf.put_u8(1);
                        buf.put_u32(info.columns.len() as u32);
                        for name in &info.columns {
                            put_string(&mut buf, name);
                        }
                        buf.put_f64(info.false_positive_probability);
                    }
                }
            }
        }
    }

    if meta_version >= VERSION_STORAGE_ENCODING {
        buf.put_u8(body.convert_to_columnar as u8);
    }

    Ok(buf.to_vec())
}

/// Decode a record written at `meta_version`
pub fn decode(payload: &[u8], meta_version: u32) -> Result<SchemaChangeJob> {
    let mut r = Reader::new(payload);

    let job_type = r.u8()?;
    if job_type != JOB_TYPE_SCHEMA_CHANGE {
        return Err(Error::Corrupted(format!("unknown job type {}", job_type)));
    }
    let state_code = r.u8()?;
    let state = JobState::from_code(state_code)
        .ok_or_else(|| Error::Corrupted(format!("unknown job state {}", state_code)))?;
    let db_id = r.i64()?;
    let table_id = r.i64()?;
    let transaction_id = r.i64()?;
    let create_time = r.i64()?;
    let finished_time = r.i64()?;
    let cancel_msg = r.string()?;

    let table_name = r.string()?;
    let mut body = ChangeSet::default();

    if r.flag()? {
        let count = r.u32()?;
        for _ in 0..count {
            let index_id = r.i64()?;
            let column_count = r.u32()?;
            let mut columns = Vec::with_capacity(column_count.min(1024) as usize);
            for _ in 0..column_count {
                columns.push(r.column()?);
            }
            let info = SchemaInfo {
                schema_version: r.i32()?,
                schema_hash: r.i32()?,
                short_key_column_count: r.i16()?,
            };
            body.changed_schema.insert(index_id, columns);
            body.schema_info.insert(index_id, info);
        }
    }

    if r.flag()? {
        let count = r.u32()?;
        for _ in 0..count {
            let partition_id = r.i64()?;
            let n = r.u32()?;
            let mut deltas = Vec::with_capacity(n.min(4096) as usize);
            for _ in 0..n {
                deltas.push(r.delta()?);
            }
            body.replica_deltas.insert(partition_id, deltas);
        }
    }

    if meta_version >= VERSION_BLOOM_FILTER && r.flag()? {
        let change = if r.flag()? {
            let n = r.u32()?;
            let mut columns = BTreeSet::new();
            for _ in 0..n {
                columns.insert(r.string()?);
            }
            BloomFilterChange::Set(BloomFilterInfo {
                columns,
                false_positive_probability: r.f64()?,
            })
        } else {
            BloomFilterChange::Drop
        };
        body.bloom_filter_change = Some(change);
    }

    if meta_version >= VERSION_STORAGE_ENCODING {
        body.convert_to_columnar = r.flag()?;
    }

    if r.remaining() > 0 {
        tracing::warn!(
            "{} trailing bytes after job record for table {}",
            r.remaining(),
            table_id
        );
    }

    Ok(SchemaChangeJob::from_parts(
        db_id,
        table_id,
        table_name,
        create_time,
        JobCore {
            state,
            transaction_id,
            finished_time,
            cancel_msg,
            body: JobBody::Live(Box::new(body)),
        },
    ))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_column(buf: &mut BytesMut, column: &Column) {
    put_string(buf, &column.name);
    buf.put_u8(column.column_type.tag());
    buf.put_u32(column.length);
    buf.put_u8(column.is_key as u8);
    buf.put_u8(column.aggregation.map_or(0, AggregateType::tag));
    buf.put_u8(column.nullable as u8);
    match &column.default_value {
        Some(value) => {
            buf.put_u8(1);
            put_string(buf, value);
        }
        None => buf.put_u8(0),
    }
    put_string(buf, &column.comment);
}

fn put_delta(buf: &mut BytesMut, delta: &ReplicaDelta) {
    buf.put_i64(delta.partition_id);
    buf.put_i64(delta.index_id);
    buf.put_i64(delta.tablet_id);
    buf.put_i64(delta.backend_id);
    match &delta.op {
        DeltaOp::Update(v) => {
            buf.put_u8(DELTA_OP_UPDATE);
            buf.put_i64(v.version);
            buf.put_i64(v.version_hash);
            buf.put_i64(v.data_size);
            buf.put_i64(v.row_count);
            buf.put_i64(v.last_failed_version);
            buf.put_i64(v.last_failed_version_hash);
            buf.put_i64(v.last_success_version);
            buf.put_i64(v.last_success_version_hash);
        }
        DeltaOp::Delete => buf.put_u8(DELTA_OP_DELETE),
    }
}

/// Bounds-checked cursor; every read fails with `Corrupted` on underflow.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Corrupted(format!(
                "record truncated: need {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Corrupted(format!("invalid flag byte {}", other))),
        }
    }

    fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec())
            .map_err(|e| Error::Corrupted(format!("invalid utf-8 string: {}", e)))
    }

    fn column(&mut self) -> Result<Column> {
        let name = self.string()?;
        let type_tag = self.u8()?;
        let column_type = ColumnType::from_tag(type_tag)
            .ok_or_else(|| Error::Corrupted(format!("unknown column type {}", type_tag)))?;
        let length = self.u32()?;
        let is_key = self.flag()?;
        let aggregation = match self.u8()? {
            0 => None,
            tag => Some(
                AggregateType::from_tag(tag)
                    .ok_or_else(|| Error::Corrupted(format!("unknown aggregation {}", tag)))?,
            ),
        };
        let nullable = self.flag()?;
        let default_value = if self.flag()? {
            Some(self.string()?)
        } else {
            None
        };
        let comment = self.string()?;
        Ok(Column {
            name,
            column_type,
            length,
            is_key,
            aggregation,
            nullable,
            default_value,
            comment,
        })
    }

    fn delta(&mut self) -> Result<ReplicaDelta> {
        let partition_id = self.i64()?;
        let index_id = self.i64()?;
        let tablet_id = self.i64()?;
        let backend_id = self.i64()?;
        let op = match self.u8()? {
            DELTA_OP_UPDATE => DeltaOp::Update(VersionInfo {
                version: self.i64()?,
                version_hash: self.i64()?,
                data_size: self.i64()?,
                row_count: self.i64()?,
                last_failed_version: self.i64()?,
                last_failed_version_hash: self.i64()?,
                last_success_version: self.i64()?,
                last_success_version_hash: self.i64()?,
            }),
            DELTA_OP_DELETE => DeltaOp::Delete,
            other => {
                return Err(Error::Corrupted(format!("unknown delta op {}", other)));
            }
        };
        Ok(ReplicaDelta {
            partition_id,
            index_id,
            tablet_id,
            backend_id,
            op,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Replica, StorageEncoding};

    fn sample_job() -> SchemaChangeJob {
        let job = SchemaChangeJob::new(1, 10, "orders", 5);
        job.put_changed_schema(
            10,
            vec![
                Column::key("id", ColumnType::BigInt),
                Column::value("amount", ColumnType::Decimal)
                    .with_aggregation(AggregateType::Sum)
                    .with_default("0"),
                Column::value("note", ColumnType::Varchar).with_length(64),
            ],
        )
        .unwrap();
        job.set_schema_info(10, 2, 123_456, 1).unwrap();
        job.set_bloom_filter_change(BloomFilterChange::Set(BloomFilterInfo {
            columns: ["id".to_string()].into_iter().collect(),
            false_positive_probability: 0.05,
        }))
        .unwrap();
        job.set_storage_encoding(StorageEncoding::Column).unwrap();

        {
            let mut core = job.lock();
            core.state = JobState::Finishing;
            core.finished_time = 1_700_000_000_000;
            let body = job.live_mut(&mut core).unwrap();
            let mut replica = Replica::new(7, 100, 3, 42);
            replica.update_info(3, 42, 1024, 17);
            body.replica_deltas.insert(
                20,
                vec![
                    ReplicaDelta::updated(20, 10, 30, &replica),
                    ReplicaDelta::deleted(20, 10, 31, 101),
                ],
            );
        }
        job
    }

    #[test]
    fn test_round_trip_current_version() {
        let job = sample_job();
        let bytes = encode(&job).unwrap();
        let decoded = decode(&bytes, CURRENT_META_VERSION).unwrap();

        assert_eq!(decoded.table_name(), "orders");
        assert_eq!(decoded.state(), JobState::Finishing);
        assert_eq!(decoded.transaction_id(), 5);
        assert_eq!(decoded.create_time(), job.create_time());
        assert_eq!(decoded.changed_schema(10), job.changed_schema(10));
        assert_eq!(decoded.schema_info(10), job.schema_info(10));
        assert_eq!(decoded.replica_deltas(20), job.replica_deltas(20));
        assert_eq!(decoded.bloom_filter_change(), job.bloom_filter_change());
        assert_eq!(decoded.new_storage_encoding(), Some(StorageEncoding::Column));
    }

    #[test]
    fn test_old_meta_version_omits_newer_fields() {
        let job = sample_job();

        let bytes = encode_versioned(&job, VERSION_BLOOM_FILTER).unwrap();
        let decoded = decode(&bytes, VERSION_BLOOM_FILTER).unwrap();
        assert!(decoded.bloom_filter_change().is_some());
        assert_eq!(decoded.new_storage_encoding(), None);

        let bytes = encode_versioned(&job, VERSION_BLOOM_FILTER - 1).unwrap();
        let decoded = decode(&bytes, VERSION_BLOOM_FILTER - 1).unwrap();
        assert!(decoded.bloom_filter_change().is_none());
        assert_eq!(decoded.changed_schema(10), job.changed_schema(10));
    }

    #[test]
    fn test_drop_bloom_filter_round_trip() {
        let job = SchemaChangeJob::new(1, 10, "t", 1);
        job.set_bloom_filter_change(BloomFilterChange::Drop).unwrap();
        let decoded = decode(&encode(&job).unwrap(), CURRENT_META_VERSION).unwrap();
        assert_eq!(decoded.bloom_filter_change(), Some(BloomFilterChange::Drop));
        assert!(decoded.changed_index_ids().is_empty());
    }

    #[test]
    fn test_truncated_record_is_corrupted() {
        let bytes = encode(&sample_job()).unwrap();
        for cut in [0, 1, 10, bytes.len() / 2, bytes.len() - 1] {
            assert!(matches!(
                decode(&bytes[..cut], CURRENT_META_VERSION),
                Err(Error::Corrupted(_))
            ));
        }
    }

    #[test]
    fn test_retired_job_cannot_be_encoded() {
        let job = SchemaChangeJob::new(1, 10, "t", 1);
        job.lock().state = JobState::Cancelled;
        job.clear().unwrap();
        assert!(matches!(encode(&job), Err(Error::JobRetired(10))));
    }
}
