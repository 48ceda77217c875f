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

//! Encode WKT geometry rows into Mapbox Vector Tile bytes.
//!
//! One tile, one layer named after the requested table, one feature per WKT
//! row with an empty property map. Coordinates are quantized against the
//! exact Mercator bbox of the tile, y-flipped into MVT screen orientation.

use geo_types::{Geometry, LineString, Point, Polygon};
use mvt::{GeomEncoder, GeomType, Layer, Tile};
use tracing::debug;
use wkt::Wkt;

use crate::error::{GatewayError, Result};

/// MVT coordinate extent per tile edge.
const TILE_EXTENT: u32 = 4096;

/// Maps Mercator coordinates into tile-local space.
#[derive(Clone, Copy)]
struct Quantizer {
    minx: f64,
    maxy: f64,
    scale_x: f64,
    scale_y: f64,
}

impl Quantizer {
    fn new(bounds: (f64, f64, f64, f64)) -> Result<Quantizer> {
        let (minx, miny, maxx, maxy) = bounds;
        let width = maxx - minx;
        let height = maxy - miny;
        if width <= 0.0 || height <= 0.0 {
            return Err(GatewayError::Engine(format!(
                "degenerate tile bounds: {bounds:?}"
            )));
        }
        Ok(Quantizer {
            minx,
            maxy,
            scale_x: f64::from(TILE_EXTENT) / width,
            scale_y: f64::from(TILE_EXTENT) / height,
        })
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        // MVT y grows downward from the top-left corner.
        ((x - self.minx) * self.scale_x, (self.maxy - y) * self.scale_y)
    }
}

fn mvt_err(e: mvt::Error) -> GatewayError {
    GatewayError::Engine(format!("mvt encoding: {e}"))
}

/// Build the tile. Rows that fail to parse or collapse during quantization
/// are skipped; the tile itself still encodes.
pub fn encode_tile(
    layer_name: &str,
    wkt_rows: &[String],
    bounds: (f64, f64, f64, f64),
) -> Result<Vec<u8>> {
    let quantizer = Quantizer::new(bounds)?;
    let mut tile = Tile::new(TILE_EXTENT);
    let mut layer = tile.create_layer(layer_name);
    let mut feature_id = 1u64;

    for row in wkt_rows {
        if row.is_empty() {
            continue;
        }
        let geometry: Geometry<f64> = match row.parse::<Wkt<f64>>().map(Geometry::try_from) {
            Ok(Ok(geometry)) => geometry,
            _ => {
                debug!(wkt = row.as_str(), "skipping unparseable WKT row");
                continue;
            }
        };
        for part in flatten(geometry) {
            layer = add_feature(layer, &part, quantizer, &mut feature_id)?;
        }
    }

    tile.add_layer(layer).map_err(mvt_err)?;
    tile.to_bytes().map_err(mvt_err)
}

/// Geometry collections become one feature per member; everything else is a
/// single feature.
fn flatten(geometry: Geometry<f64>) -> Vec<Geometry<f64>> {
    match geometry {
        Geometry::GeometryCollection(collection) => {
            collection.0.into_iter().flat_map(flatten).collect()
        }
        Geometry::Line(line) => vec![Geometry::LineString(LineString::from(line))],
        Geometry::Rect(rect) => vec![Geometry::Polygon(rect.to_polygon())],
        Geometry::Triangle(triangle) => vec![Geometry::Polygon(triangle.to_polygon())],
        other => vec![other],
    }
}

fn add_feature(
    layer: Layer,
    geometry: &Geometry<f64>,
    quantizer: Quantizer,
    feature_id: &mut u64,
) -> Result<Layer> {
    let encoded = match encode_geometry(geometry, quantizer) {
        Ok(data) => data,
        Err(e) => {
            // A geometry that quantizes to nothing is not an error for the tile.
            debug!(error = %e, "skipping unencodable geometry");
            return Ok(layer);
        }
    };
    let mut feature = layer.into_feature(encoded);
    feature.set_id(*feature_id);
    *feature_id += 1;
    Ok(feature.into_layer())
}

fn encode_geometry(geometry: &Geometry<f64>, quantizer: Quantizer) -> Result<mvt::GeomData> {
    match geometry {
        Geometry::Point(point) => {
            encode_points(GeomType::Point, std::slice::from_ref(point), quantizer)
        }
        Geometry::MultiPoint(points) => encode_points(GeomType::Point, &points.0, quantizer),
        Geometry::LineString(line) => encode_lines(std::slice::from_ref(line), quantizer),
        Geometry::MultiLineString(lines) => encode_lines(&lines.0, quantizer),
        Geometry::Polygon(polygon) => encode_polygons(std::slice::from_ref(polygon), quantizer),
        Geometry::MultiPolygon(polygons) => encode_polygons(&polygons.0, quantizer),
        // Line/Rect/Triangle/collections are normalized away by `flatten`.
        other => Err(GatewayError::Engine(format!(
            "unsupported geometry type: {other:?}"
        ))),
    }
}

fn encode_points(
    geom_type: GeomType,
    points: &[Point<f64>],
    quantizer: Quantizer,
) -> Result<mvt::GeomData> {
    let mut encoder = GeomEncoder::new(geom_type);
    for point in points {
        let (x, y) = quantizer.apply(point.x(), point.y());
        encoder = encoder.point(x, y).map_err(mvt_err)?;
    }
    encoder.encode().map_err(mvt_err)
}

fn encode_lines(lines: &[LineString<f64>], quantizer: Quantizer) -> Result<mvt::GeomData> {
    let mut encoder = GeomEncoder::new(GeomType::Linestring);
    for line in lines {
        for coord in line.coords() {
            let (x, y) = quantizer.apply(coord.x, coord.y);
            encoder = encoder.point(x, y).map_err(mvt_err)?;
        }
        encoder.complete_geom().map_err(mvt_err)?;
    }
    encoder.encode().map_err(mvt_err)
}

fn encode_polygons(polygons: &[Polygon<f64>], quantizer: Quantizer) -> Result<mvt::GeomData> {
    let mut encoder = GeomEncoder::new(GeomType::Polygon);
    for polygon in polygons {
        encoder = encode_ring(encoder, polygon.exterior(), quantizer)?;
        for interior in polygon.interiors() {
            encoder = encode_ring(encoder, interior, quantizer)?;
        }
    }
    encoder.encode().map_err(mvt_err)
}

fn encode_ring(
    mut encoder: GeomEncoder<f64>,
    ring: &LineString<f64>,
    quantizer: Quantizer,
) -> Result<GeomEncoder<f64>> {
    // WKT rings repeat the first point at the end; MVT closes rings itself.
    let len = ring.0.len();
    for coord in ring.0.iter().take(len.saturating_sub(1)) {
        let (x, y) = quantizer.apply(coord.x, coord.y);
        encoder = encoder.point(x, y).map_err(mvt_err)?;
    }
    encoder.complete_geom().map_err(mvt_err)?;
    Ok(encoder)
}
