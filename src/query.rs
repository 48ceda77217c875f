//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Worker-side query execution: materialize engine results as Arrow IPC
//! streams or JSON record arrays, and ingest Arrow files as tables.
//!
//! Everything here runs on a pool thread with a cursor the task owns;
//! results are fully materialized before crossing back to the async layer.

use std::fs::File;

use arrow::compute::concat_batches;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::StreamWriter;
use arrow::json::ArrayWriter;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::vtab::arrow::arrow_recordbatch_to_query_params;
use duckdb::Connection;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Execute `sql` and serialize the result as an Arrow IPC stream.
pub fn get_arrow_ipc(conn: &Connection, sql: &str) -> Result<Vec<u8>> {
    let mut stmt = conn.prepare(sql)?;
    let arrow = stmt.query_arrow([])?;
    let schema = arrow.get_schema();
    let batches: Vec<RecordBatch> = arrow.collect();
    debug!(batches = batches.len(), "materialized columnar result");

    let mut buf = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buf, &schema)?;
    for batch in &batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    drop(writer);
    Ok(buf)
}

/// Execute `sql` and serialize the result as a JSON array of record objects.
pub fn get_json(conn: &Connection, sql: &str) -> Result<String> {
    let mut stmt = conn.prepare(sql)?;
    let arrow = stmt.query_arrow([])?;
    let batches: Vec<RecordBatch> = arrow.collect();

    let mut writer = ArrayWriter::new(Vec::new());
    for batch in &batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    let buf = writer.into_inner();
    if buf.is_empty() {
        // ArrayWriter emits nothing for zero rows.
        return Ok("[]".to_string());
    }
    String::from_utf8(buf).map_err(|e| GatewayError::Engine(e.to_string()))
}

/// Map an Arrow IPC file into the session and materialize it as a table.
///
/// The table name is passed through as the caller wrote it; callers control
/// their own table namespace.
pub fn insert_arrow_file(conn: &Connection, file_name: &str, table_name: &str) -> Result<()> {
    let file = File::open(file_name)?;
    let reader = FileReader::try_new(file, None)?;
    let schema = reader.schema();

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    let combined = concat_batches(&schema, &batches)?;
    debug!(
        rows = combined.num_rows(),
        table_name, "registering arrow file contents"
    );

    let params = arrow_recordbatch_to_query_params(combined);
    conn.execute(
        &format!("CREATE OR REPLACE TABLE {table_name} AS SELECT * FROM arrow(?, ?)"),
        params,
    )?;
    Ok(())
}
