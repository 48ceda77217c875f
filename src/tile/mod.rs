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

//! Dynamic vector tile pipeline.
//!
//! Each tile request composes one multi-stage spatial SQL plan: tile
//! envelope, pixel-proportional buffer, CRS transform, intersection filter
//! with a deterministic reservoir sample, simplification and clipping. The
//! resulting WKT rows plus the exact Mercator tile bbox feed the MVT
//! encoder.

pub mod encode;

use serde_json::json;
use tracing::{debug, warn};

use crate::cache::cache_key;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::pool::generate_query_id;

/// Pixels per tile edge used for the meters-per-pixel scale.
const TILE_PX: f64 = 256.0;
/// Anti-clipping margin around the tile envelope, in pixels.
const BUFFER_PX: f64 = 20.0;
/// Reservoir sample cap per tile.
const SAMPLE_ROWS: u32 = 50_000;
/// Fixed sample seed so a tile is deterministic across requests.
const SAMPLE_SEED: u32 = 4321;
/// Simplification tolerance as a fraction of one pixel.
const SIMPLIFY_PX: f64 = 0.75;

/// Web-Mercator extent of the whole world, the fallback quantization bbox.
const MERCATOR_MAX: f64 = 20_037_508.342_789_244;

/// Validate and quote a possibly schema-qualified SQL identifier.
///
/// Each dot-separated segment must be non-empty ASCII alphanumerics or
/// underscores; anything else is rejected before it can reach composed SQL.
pub fn quote_ident(identifier: &str) -> Result<String> {
    let mut quoted = Vec::new();
    for part in identifier.split('.') {
        if part.is_empty()
            || !part
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(GatewayError::InvalidIdentifier(identifier.to_string()));
        }
        quoted.push(format!("\"{part}\""));
    }
    Ok(quoted.join("."))
}

fn rtree_index_name(table: &str, column: &str) -> String {
    format!("idx_rtree_{}_{}", table.replace('.', "_"), column)
}

/// The single-statement tile plan. `q_table`/`q_column` must already be
/// quoted.
fn tile_sql(q_table: &str, q_column: &str, z: u32, x: u32, y: u32) -> String {
    format!(
        r#"WITH bbox AS (
  SELECT ST_TileEnvelope({z}, {x}, {y}) AS b3857
), params AS (
  SELECT
    b3857,
    (ST_XMax(b3857) - ST_XMin(b3857)) / {TILE_PX} AS meters_per_px
  FROM bbox
), buffered AS (
  SELECT ST_Buffer(b3857, meters_per_px * {BUFFER_PX}) AS bbuf
  FROM params
), envelope AS (
  SELECT ST_Transform(bbuf, 'EPSG:3857', 'CRS84') AS env4326
  FROM buffered
), candidates AS (
  SELECT ST_Transform({q_column}, 'CRS84', 'EPSG:3857') AS g3857
  FROM {q_table}, envelope
  WHERE ST_Intersects({q_column}, envelope.env4326)
  USING SAMPLE reservoir({SAMPLE_ROWS} ROWS)
  REPEATABLE ({SAMPLE_SEED})
), simplified AS (
  SELECT ST_SimplifyPreserveTopology(g3857, meters_per_px * {SIMPLIFY_PX}) AS gs
  FROM candidates, params
), clipped AS (
  SELECT ST_Intersection(gs, bbuf) AS gc
  FROM simplified, buffered
)
SELECT ST_AsText(gc) AS wkt
FROM clipped
WHERE NOT ST_IsEmpty(gc)"#
    )
}

/// Exact Mercator bbox of the tile, queried separately for quantization.
fn bounds_sql(z: u32, x: u32, y: u32) -> String {
    format!(
        r#"SELECT
  ST_XMin(bbox) AS minx,
  ST_YMin(bbox) AS miny,
  ST_XMax(bbox) AS maxx,
  ST_YMax(bbox) AS maxy
FROM (
  SELECT ST_TileEnvelope({z}, {x}, {y}) AS bbox
) t"#
    )
}

/// Render one XYZ tile for `table`/`column` as MVT bytes.
pub async fn render_tile(
    gateway: &Gateway,
    table: &str,
    column: &str,
    z: u32,
    x: u32,
    y: u32,
) -> Result<Vec<u8>> {
    let q_table = quote_ident(table)?;
    let q_column = quote_ident(column)?;

    // Best-effort R-tree index so ST_Intersects can prune; failure (or an
    // engine without the index type) never fails the tile.
    let index_sql = format!(
        "CREATE INDEX IF NOT EXISTS \"{}\" ON {} USING RTREE ({})",
        rtree_index_name(table, column),
        q_table,
        q_column
    );
    gateway
        .run_db_task(&generate_query_id(), move |cursor| {
            if let Err(e) = cursor.execute_batch(&index_sql) {
                debug!(error = %e, "rtree index creation skipped");
            }
            Ok(())
        })
        .await?;

    let sql = tile_sql(&q_table, &q_column, z, x, y);
    let key = cache_key(&sql, "tile-mvt");
    if let Some(cached) = gateway.cache().get(&key) {
        debug!(z, x, y, "cache hit for dynamic tile");
        return Ok(cached);
    }

    let query_id = generate_query_id();
    let rows_sql = sql.clone();
    let rows: Vec<String> = gateway
        .run_db_task(&query_id, move |cursor| {
            let mut stmt = cursor.prepare(&rows_sql)?;
            let mapped = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut wkt = Vec::new();
            for row in mapped {
                wkt.push(row?);
            }
            Ok(wkt)
        })
        .await?;

    let bbox_sql = bounds_sql(z, x, y);
    let bounds = gateway
        .run_db_task(&query_id, move |cursor| {
            let row: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) = cursor
                .query_row(&bbox_sql, [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
            Ok(row)
        })
        .await?;
    let bounds = match bounds {
        (Some(minx), Some(miny), Some(maxx), Some(maxy)) => (minx, miny, maxx, maxy),
        _ => {
            warn!(z, x, y, "tile bounds unavailable, falling back to the world extent");
            (-MERCATOR_MAX, -MERCATOR_MAX, MERCATOR_MAX, MERCATOR_MAX)
        }
    };
    debug!(z, x, y, rows = rows.len(), ?bounds, "encoding dynamic tile");

    let tile = encode::encode_tile(table, &rows, bounds)?;
    gateway.cache().put(&key, &tile);
    Ok(tile)
}

/// Tile metadata: extent-derived center and bounds plus the table's
/// non-geometry columns. Returns `{}` when the extent cannot be computed.
pub async fn tile_metadata(gateway: &Gateway, table: &str, column: &str) -> Result<String> {
    let q_table = quote_ident(table)?;
    let q_column = quote_ident(column)?;

    let extent_sql = format!(
        r#"WITH envelope AS (
  SELECT ST_Envelope({q_column}) AS envelope
  FROM {q_table}
)
SELECT
  MIN(ST_XMin(envelope)) AS minx,
  MIN(ST_YMin(envelope)) AS miny,
  MAX(ST_XMax(envelope)) AS maxx,
  MAX(ST_YMax(envelope)) AS maxy
FROM envelope"#
    );
    let extent = gateway
        .run_db_task(&generate_query_id(), move |cursor| {
            let row: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) = cursor
                .query_row(&extent_sql, [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
            Ok(row)
        })
        .await?;
    let (minx, miny, maxx, maxy) = match extent {
        (Some(minx), Some(miny), Some(maxx), Some(maxy)) => (minx, miny, maxx, maxy),
        _ => return Ok("{}".to_string()),
    };

    let (schema_name, plain_table) = table
        .split_once('.')
        .unwrap_or(("main", table));
    let (schema_name, plain_table) = (schema_name.to_string(), plain_table.to_string());
    let columns: Vec<(String, String)> = gateway
        .run_db_task(&generate_query_id(), move |cursor| {
            let mut stmt = cursor.prepare(
                r#"SELECT column_name, data_type
FROM information_schema.columns
WHERE table_schema = ? AND table_name = ?
ORDER BY ordinal_position"#,
            )?;
            let mapped = stmt.query_map(duckdb::params![schema_name, plain_table], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            let mut columns = Vec::new();
            for row in mapped {
                columns.push(row?);
            }
            Ok(columns)
        })
        .await
        .unwrap_or_default();

    let fields: Vec<_> = columns
        .into_iter()
        .filter(|(name, _)| !name.is_empty() && !name.eq_ignore_ascii_case(column))
        .map(|(name, data_type)| json!({ "name": name, "type": data_type }))
        .collect();

    let metadata = json!({
        "center": format!("{:.6},{:.6},0", (minx + maxx) / 2.0, (miny + maxy) / 2.0),
        "bounds": format!("{minx:.6},{miny:.6},{maxx:.6},{maxy:.6}"),
        "name": format!("{table}.{column}"),
        "fields": fields,
    });
    Ok(metadata.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_per_segment() {
        assert_eq!(quote_ident("roads").unwrap(), "\"roads\"");
        assert_eq!(quote_ident("public.roads").unwrap(), "\"public\".\"roads\"");
        assert_eq!(quote_ident("a_1.b_2").unwrap(), "\"a_1\".\"b_2\"");
    }

    #[test]
    fn hostile_identifiers_are_rejected() {
        for bad in [
            "",
            ".",
            "a.",
            ".b",
            "a..b",
            "ro ads",
            "roads;drop table x",
            "ro\"ads",
            "naïve",
            "a-b",
        ] {
            let err = quote_ident(bad).unwrap_err();
            assert!(
                matches!(err, GatewayError::InvalidIdentifier(_)),
                "{bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn tile_sql_carries_pipeline_constants() {
        let sql = tile_sql("\"public\".\"roads\"", "\"geom\"", 3, 2, 1);
        assert!(sql.contains("ST_TileEnvelope(3, 2, 1)"));
        assert!(sql.contains("/ 256 AS meters_per_px"));
        assert!(sql.contains("meters_per_px * 20"));
        assert!(sql.contains("reservoir(50000 ROWS)"));
        assert!(sql.contains("REPEATABLE (4321)"));
        assert!(sql.contains("meters_per_px * 0.75"));
        assert!(sql.contains("ST_Transform(bbuf, 'EPSG:3857', 'CRS84')"));
        assert!(sql.contains("NOT ST_IsEmpty(gc)"));
    }

    #[test]
    fn index_name_flattens_schema_qualification() {
        assert_eq!(
            rtree_index_name("public.roads", "geom"),
            "idx_rtree_public_roads_geom"
        );
    }

    #[test]
    fn same_tile_same_cache_key() {
        let a = cache_key(&tile_sql("\"t\"", "\"g\"", 0, 0, 0), "tile-mvt");
        let b = cache_key(&tile_sql("\"t\"", "\"g\"", 0, 0, 0), "tile-mvt");
        let c = cache_key(&tile_sql("\"t\"", "\"g\"", 1, 0, 0), "tile-mvt");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
