//! Streaming master-frame raster encoder.
//!
//! A coverage response can be far larger than memory, so the encoder
//! creates the output file pre-sized for the full master frame and writes
//! decoded tiles at their `(off_x, off_y)` as they arrive, in any order.
//! Peer batches arrive as whole worker files with the same frame dimensions
//! and are merged window by window.
//!
//! Two on-disk layouts are produced directly: single-strip GeoTIFF
//! (band-interleaved f32, little-endian) and classic NetCDF with 64-bit
//! offsets (one fixed-size variable per band, big-endian). Unknown formats
//! use the GeoTIFF layout under the protocol's own extension.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use ows_common::error::{OwsError, OwsResult};

use crate::tile::DecodedTile;

const BYTES_PER_SAMPLE: u64 = 4;

/// Coverage output format, with its response naming rules.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterFormat {
    GeoTiff,
    NetCdf,
    Other(String),
}

impl RasterFormat {
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "geotiff" => RasterFormat::GeoTiff,
            "netcdf" => RasterFormat::NetCdf,
            other => RasterFormat::Other(other.to_string()),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            RasterFormat::GeoTiff => "tiff",
            RasterFormat::NetCdf => "nc",
            RasterFormat::Other(_) => "wcs",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            RasterFormat::GeoTiff => "application/geotiff",
            RasterFormat::NetCdf => "application/netcdf",
            RasterFormat::Other(_) => "application/wcs",
        }
    }
}

enum Layout {
    /// Band-interleaved pixels at one offset, little-endian.
    TiffInterleaved { data_offset: u64 },
    /// One plane per band, big-endian.
    CdfPlanar { plane_offsets: Vec<u64> },
}

/// The single-writer encoder handle. Not safe for concurrent use; the
/// coverage orchestrator serializes every mutation on it.
pub struct MasterEncoder {
    file: File,
    width: usize,
    height: usize,
    bands: usize,
    layout: Layout,
}

impl MasterEncoder {
    /// Create the master file pre-sized for the full frame.
    pub fn create(
        path: &Path,
        format: &RasterFormat,
        geotransform: [f64; 6],
        epsg: u32,
        width: usize,
        height: usize,
        band_names: &[String],
    ) -> OwsResult<MasterEncoder> {
        if width == 0 || height == 0 {
            return Err(OwsError::EncodeError(
                "master frame has zero dimensions".to_string(),
            ));
        }
        let bands = band_names.len().max(1);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| OwsError::EncodeError(format!("{}: {}", path.display(), e)))?;

        let layout = match format {
            RasterFormat::NetCdf => {
                let header = cdf_header(width, height, band_names, 0.0)?;
                file.write_all(&header.bytes)
                    .map_err(|e| OwsError::EncodeError(e.to_string()))?;
                let total = header.plane_offsets.last().unwrap()
                    + width as u64 * height as u64 * BYTES_PER_SAMPLE;
                file.set_len(total)
                    .map_err(|e| OwsError::EncodeError(e.to_string()))?;
                Layout::CdfPlanar {
                    plane_offsets: header.plane_offsets,
                }
            }
            _ => {
                let header = tiff_header(width, height, bands, geotransform, epsg);
                let data_offset = header.len() as u64;
                file.write_all(&header)
                    .map_err(|e| OwsError::EncodeError(e.to_string()))?;
                let total =
                    data_offset + (width * height * bands) as u64 * BYTES_PER_SAMPLE;
                file.set_len(total)
                    .map_err(|e| OwsError::EncodeError(e.to_string()))?;
                Layout::TiffInterleaved { data_offset }
            }
        };

        Ok(MasterEncoder {
            file,
            width,
            height,
            bands,
            layout,
        })
    }

    /// Write one decoded tile into the frame at its offsets.
    pub fn write_window(&mut self, tile: &DecodedTile) -> OwsResult<()> {
        if tile.is_empty() {
            return Ok(());
        }
        let m = self;
        if tile.off_x + tile.width > m.width || tile.off_y + tile.height > m.height {
            return Err(OwsError::EncodeError(format!(
                "tile {}x{} at ({}, {}) exceeds the {}x{} master frame",
                tile.width, tile.height, tile.off_x, tile.off_y, m.width, m.height
            )));
        }
        if tile.bands.len() < m.bands {
            return Err(OwsError::EncodeError(format!(
                "tile has {} bands, master has {}",
                tile.bands.len(),
                m.bands
            )));
        }

        match &m.layout {
            Layout::TiffInterleaved { data_offset } => {
                let mut row = vec![0u8; tile.width * m.bands * 4];
                for r in 0..tile.height {
                    for x in 0..tile.width {
                        for b in 0..m.bands {
                            let v = tile.bands[b][r * tile.width + x];
                            row[(x * m.bands + b) * 4..(x * m.bands + b) * 4 + 4]
                                .copy_from_slice(&v.to_le_bytes());
                        }
                    }
                    let pos = data_offset
                        + (((tile.off_y + r) * m.width + tile.off_x) * m.bands) as u64
                            * BYTES_PER_SAMPLE;
                    m.file
                        .seek(SeekFrom::Start(pos))
                        .and_then(|_| m.file.write_all(&row))
                        .map_err(|e| OwsError::EncodeError(e.to_string()))?;
                }
            }
            Layout::CdfPlanar { plane_offsets } => {
                let mut row = vec![0u8; tile.width * 4];
                for (b, plane) in plane_offsets.iter().enumerate().take(m.bands) {
                    for r in 0..tile.height {
                        for x in 0..tile.width {
                            let v = tile.bands[b][r * tile.width + x];
                            row[x * 4..x * 4 + 4].copy_from_slice(&v.to_be_bytes());
                        }
                        let pos = plane
                            + ((tile.off_y + r) * m.width + tile.off_x) as u64
                                * BYTES_PER_SAMPLE;
                        m.file
                            .seek(SeekFrom::Start(pos))
                            .and_then(|_| m.file.write_all(&row))
                            .map_err(|e| OwsError::EncodeError(e.to_string()))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge the listed windows of a worker file (always GeoTIFF, same
    /// frame dimensions) into the master.
    pub fn merge(&mut self, worker_path: &Path, windows: &[MergeWindow]) -> OwsResult<()> {
        let mut reader = TiffWindowReader::open(worker_path)?;
        if reader.width != self.width || reader.height != self.height {
            return Err(OwsError::EncodeError(format!(
                "worker frame {}x{} does not match master {}x{}",
                reader.width, reader.height, self.width, self.height
            )));
        }
        for w in windows {
            let tile = reader.read_window(w.off_x, w.off_y, w.width, w.height)?;
            self.write_window(&tile)?;
        }
        Ok(())
    }

    /// Checkpoint: push written windows to stable storage.
    pub fn flush(&mut self) -> OwsResult<()> {
        self.file
            .sync_data()
            .map_err(|e| OwsError::EncodeError(e.to_string()))
    }

    pub fn close(mut self) -> OwsResult<()> {
        self.flush()
    }
}

/// One rectangle of a peer batch, in master-frame coordinates.
#[derive(Debug, Clone, Copy)]
pub struct MergeWindow {
    pub off_x: usize,
    pub off_y: usize,
    pub width: usize,
    pub height: usize,
}

// ---------------------------------------------------------------------------
// GeoTIFF header
// ---------------------------------------------------------------------------

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIG: u16 = 284;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Inline value, or bytes placed after the IFD with the offset patched.
    value: IfdValue,
}

enum IfdValue {
    Inline(u32),
    External(Vec<u8>),
}

fn shorts_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn doubles_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Build a little-endian single-strip TIFF header with geo tags. The strip
/// offset points just past the header, where the pre-sized pixel block
/// starts.
fn tiff_header(
    width: usize,
    height: usize,
    bands: usize,
    geotransform: [f64; 6],
    epsg: u32,
) -> Vec<u8> {
    let pixel_bytes = (width * height * bands) as u64 * BYTES_PER_SAMPLE;

    // GeoKeyDirectory: version header plus model type, raster type and the
    // (geographic or projected) CRS code.
    let geographic = epsg == 4326 || epsg == 4283 || epsg == 4269;
    let model_type: u16 = if geographic { 2 } else { 1 };
    let crs_key: u16 = if geographic { 2048 } else { 3072 };
    let geokeys: Vec<u16> = vec![
        1, 1, 0, 3, // version, revision, minor, key count
        1024, 0, 1, model_type, // GTModelType
        1025, 0, 1, 1, // GTRasterType = PixelIsArea
        crs_key, 0, 1, epsg as u16,
    ];

    let bits: Vec<u16> = vec![32; bands];
    let formats: Vec<u16> = vec![3; bands]; // IEEE float

    let mut entries = vec![
        IfdEntry {
            tag: TAG_IMAGE_WIDTH,
            field_type: TYPE_LONG,
            count: 1,
            value: IfdValue::Inline(width as u32),
        },
        IfdEntry {
            tag: TAG_IMAGE_LENGTH,
            field_type: TYPE_LONG,
            count: 1,
            value: IfdValue::Inline(height as u32),
        },
        IfdEntry {
            tag: TAG_BITS_PER_SAMPLE,
            field_type: TYPE_SHORT,
            count: bands as u32,
            value: if bands <= 2 {
                IfdValue::Inline(inline_shorts(&bits))
            } else {
                IfdValue::External(shorts_bytes(&bits))
            },
        },
        IfdEntry {
            tag: TAG_COMPRESSION,
            field_type: TYPE_SHORT,
            count: 1,
            value: IfdValue::Inline(1),
        },
        IfdEntry {
            tag: TAG_PHOTOMETRIC,
            field_type: TYPE_SHORT,
            count: 1,
            value: IfdValue::Inline(1),
        },
        IfdEntry {
            tag: TAG_STRIP_OFFSETS,
            field_type: TYPE_LONG,
            count: 1,
            value: IfdValue::Inline(0), // patched below
        },
        IfdEntry {
            tag: TAG_SAMPLES_PER_PIXEL,
            field_type: TYPE_SHORT,
            count: 1,
            value: IfdValue::Inline(bands as u32),
        },
        IfdEntry {
            tag: TAG_ROWS_PER_STRIP,
            field_type: TYPE_LONG,
            count: 1,
            value: IfdValue::Inline(height as u32),
        },
        IfdEntry {
            tag: TAG_STRIP_BYTE_COUNTS,
            field_type: TYPE_LONG,
            count: 1,
            value: IfdValue::Inline(pixel_bytes as u32),
        },
        IfdEntry {
            tag: TAG_PLANAR_CONFIG,
            field_type: TYPE_SHORT,
            count: 1,
            value: IfdValue::Inline(1),
        },
        IfdEntry {
            tag: TAG_SAMPLE_FORMAT,
            field_type: TYPE_SHORT,
            count: bands as u32,
            value: if bands <= 2 {
                IfdValue::Inline(inline_shorts(&formats))
            } else {
                IfdValue::External(shorts_bytes(&formats))
            },
        },
        IfdEntry {
            tag: TAG_MODEL_PIXEL_SCALE,
            field_type: TYPE_DOUBLE,
            count: 3,
            value: IfdValue::External(doubles_bytes(&[
                geotransform[1],
                -geotransform[5],
                0.0,
            ])),
        },
        IfdEntry {
            tag: TAG_MODEL_TIEPOINT,
            field_type: TYPE_DOUBLE,
            count: 6,
            value: IfdValue::External(doubles_bytes(&[
                0.0,
                0.0,
                0.0,
                geotransform[0],
                geotransform[3],
                0.0,
            ])),
        },
        IfdEntry {
            tag: TAG_GEO_KEY_DIRECTORY,
            field_type: TYPE_SHORT,
            count: geokeys.len() as u32,
            value: IfdValue::External(shorts_bytes(&geokeys)),
        },
    ];

    // Layout: 8-byte preamble, IFD, external arrays, pixel data.
    let ifd_size = 2 + entries.len() * 12 + 4;
    let mut external_offset = 8 + ifd_size;
    let mut external_total = 0usize;
    for entry in &entries {
        if let IfdValue::External(bytes) = &entry.value {
            external_total += bytes.len();
        }
    }
    let data_offset = (8 + ifd_size + external_total) as u32;
    if let IfdValue::Inline(v) = &mut entries[5].value {
        *v = data_offset;
    }

    let mut header = Vec::with_capacity(data_offset as usize);
    header.extend_from_slice(&[0x49, 0x49, 0x2A, 0x00]); // II, 42
    header.extend_from_slice(&8u32.to_le_bytes()); // first IFD offset

    header.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    let mut externals: Vec<u8> = Vec::with_capacity(external_total);
    for entry in &entries {
        header.extend_from_slice(&entry.tag.to_le_bytes());
        header.extend_from_slice(&entry.field_type.to_le_bytes());
        header.extend_from_slice(&entry.count.to_le_bytes());
        match &entry.value {
            IfdValue::Inline(v) => header.extend_from_slice(&v.to_le_bytes()),
            IfdValue::External(bytes) => {
                header.extend_from_slice(&(external_offset as u32).to_le_bytes());
                external_offset += bytes.len();
                externals.extend_from_slice(bytes);
            }
        }
    }
    header.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
    header.extend_from_slice(&externals);
    header
}

/// Pack up to two SHORT values into the inline value field.
fn inline_shorts(values: &[u16]) -> u32 {
    let lo = values.first().copied().unwrap_or(0) as u32;
    let hi = values.get(1).copied().unwrap_or(0) as u32;
    lo | (hi << 16)
}

// ---------------------------------------------------------------------------
// Worker-file window reader
// ---------------------------------------------------------------------------

/// Minimal reader for the single-strip interleaved f32 layout written
/// above, enough to merge worker files into the master.
pub struct TiffWindowReader {
    file: File,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    data_offset: u64,
}

impl TiffWindowReader {
    pub fn open(path: &Path) -> OwsResult<TiffWindowReader> {
        let mut file = File::open(path)
            .map_err(|e| OwsError::EncodeError(format!("{}: {}", path.display(), e)))?;

        let mut preamble = [0u8; 8];
        file.read_exact(&mut preamble)
            .map_err(|e| OwsError::EncodeError(format!("worker file header: {}", e)))?;
        if &preamble[0..4] != b"II\x2A\x00" {
            return Err(OwsError::EncodeError(
                "worker file is not a little-endian TIFF".to_string(),
            ));
        }
        let ifd_offset = u32::from_le_bytes(preamble[4..8].try_into().unwrap()) as u64;
        file.seek(SeekFrom::Start(ifd_offset))
            .map_err(|e| OwsError::EncodeError(e.to_string()))?;

        let mut count_buf = [0u8; 2];
        file.read_exact(&mut count_buf)
            .map_err(|e| OwsError::EncodeError(e.to_string()))?;
        let n_entries = u16::from_le_bytes(count_buf);

        let (mut width, mut height, mut bands, mut data_offset) = (0usize, 0usize, 1usize, 0u64);
        for _ in 0..n_entries {
            let mut entry = [0u8; 12];
            file.read_exact(&mut entry)
                .map_err(|e| OwsError::EncodeError(e.to_string()))?;
            let tag = u16::from_le_bytes(entry[0..2].try_into().unwrap());
            let value = u32::from_le_bytes(entry[8..12].try_into().unwrap());
            match tag {
                TAG_IMAGE_WIDTH => width = value as usize,
                TAG_IMAGE_LENGTH => height = value as usize,
                TAG_SAMPLES_PER_PIXEL => bands = (value & 0xFFFF) as usize,
                TAG_STRIP_OFFSETS => data_offset = value as u64,
                _ => {}
            }
        }
        if width == 0 || height == 0 || data_offset == 0 {
            return Err(OwsError::EncodeError(
                "worker file missing required TIFF tags".to_string(),
            ));
        }

        Ok(TiffWindowReader {
            file,
            width,
            height,
            bands,
            data_offset,
        })
    }

    pub fn read_window(
        &mut self,
        off_x: usize,
        off_y: usize,
        width: usize,
        height: usize,
    ) -> OwsResult<DecodedTile> {
        if off_x + width > self.width || off_y + height > self.height {
            return Err(OwsError::EncodeError(format!(
                "window {}x{} at ({}, {}) exceeds the {}x{} worker frame",
                width, height, off_x, off_y, self.width, self.height
            )));
        }
        let mut bands = vec![vec![0f32; width * height]; self.bands];
        let mut row = vec![0u8; width * self.bands * 4];
        for r in 0..height {
            let pos = self.data_offset
                + (((off_y + r) * self.width + off_x) * self.bands) as u64 * BYTES_PER_SAMPLE;
            self.file
                .seek(SeekFrom::Start(pos))
                .and_then(|_| self.file.read_exact(&mut row))
                .map_err(|e| OwsError::EncodeError(e.to_string()))?;
            for x in 0..width {
                for (b, band) in bands.iter_mut().enumerate() {
                    let i = (x * self.bands + b) * 4;
                    band[r * width + x] =
                        f32::from_le_bytes(row[i..i + 4].try_into().unwrap());
                }
            }
        }
        Ok(DecodedTile {
            width,
            height,
            raster_type: "Float32".to_string(),
            bands,
            nodata: 0.0,
            off_x,
            off_y,
        })
    }
}

// ---------------------------------------------------------------------------
// Classic NetCDF header (64-bit offsets)
// ---------------------------------------------------------------------------

struct CdfHeader {
    bytes: Vec<u8>,
    plane_offsets: Vec<u64>,
}

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn cdf_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend(std::iter::repeat(0u8).take(pad4(name.len())));
}

/// Build a CDF-2 header with `y`/`x` dimensions and one float variable per
/// band, returning the data plane offsets.
fn cdf_header(
    width: usize,
    height: usize,
    band_names: &[String],
    fill_value: f32,
) -> OwsResult<CdfHeader> {
    let bands: Vec<String> = if band_names.is_empty() {
        vec!["band_1".to_string()]
    } else {
        band_names.to_vec()
    };

    // Two passes: the variable `begin` fields depend on the header size.
    let build = |begins: &[u64]| -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(b"CDF\x02");
        h.extend_from_slice(&0u32.to_be_bytes()); // numrecs

        // dim_list
        h.extend_from_slice(&0x0Au32.to_be_bytes());
        h.extend_from_slice(&2u32.to_be_bytes());
        cdf_name(&mut h, "y");
        h.extend_from_slice(&(height as u32).to_be_bytes());
        cdf_name(&mut h, "x");
        h.extend_from_slice(&(width as u32).to_be_bytes());

        // gatt_list: absent
        h.extend_from_slice(&0u32.to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes());

        // var_list
        h.extend_from_slice(&0x0Bu32.to_be_bytes());
        h.extend_from_slice(&(bands.len() as u32).to_be_bytes());
        for (i, name) in bands.iter().enumerate() {
            cdf_name(&mut h, name);
            h.extend_from_slice(&2u32.to_be_bytes()); // rank
            h.extend_from_slice(&0u32.to_be_bytes()); // dim y
            h.extend_from_slice(&1u32.to_be_bytes()); // dim x

            // vatt_list: _FillValue
            h.extend_from_slice(&0x0Cu32.to_be_bytes());
            h.extend_from_slice(&1u32.to_be_bytes());
            cdf_name(&mut h, "_FillValue");
            h.extend_from_slice(&5u32.to_be_bytes()); // NC_FLOAT
            h.extend_from_slice(&1u32.to_be_bytes());
            h.extend_from_slice(&fill_value.to_be_bytes());

            h.extend_from_slice(&5u32.to_be_bytes()); // NC_FLOAT
            let vsize = (width as u64 * height as u64 * 4).min(u32::MAX as u64) as u32;
            h.extend_from_slice(&vsize.to_be_bytes());
            h.extend_from_slice(&begins.get(i).copied().unwrap_or(0).to_be_bytes());
        }
        h
    };

    let probe = build(&vec![0u64; bands.len()]);
    let header_len = probe.len() as u64;
    let plane = width as u64 * height as u64 * BYTES_PER_SAMPLE;
    let plane_offsets: Vec<u64> = (0..bands.len())
        .map(|i| header_len + i as u64 * plane)
        .collect();

    let bytes = build(&plane_offsets);
    debug_assert_eq!(bytes.len() as u64, header_len);
    Ok(CdfHeader {
        bytes,
        plane_offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn tile(w: usize, h: usize, off_x: usize, off_y: usize, base: f32) -> DecodedTile {
        let mut bands = vec![vec![0f32; w * h]];
        for (i, v) in bands[0].iter_mut().enumerate() {
            *v = base + i as f32;
        }
        DecodedTile {
            width: w,
            height: h,
            raster_type: "Float32".to_string(),
            bands,
            nodata: 0.0,
            off_x,
            off_y,
        }
    }

    fn new_encoder(path: &Path, format: RasterFormat, w: usize, h: usize) -> MasterEncoder {
        MasterEncoder::create(
            path,
            &format,
            [100.0, 0.1, 0.0, -10.0, 0.0, -0.1],
            4326,
            w,
            h,
            &["band_1".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_format_naming_table() {
        assert_eq!(RasterFormat::from_name("GeoTIFF").extension(), "tiff");
        assert_eq!(
            RasterFormat::from_name("geotiff").content_type(),
            "application/geotiff"
        );
        assert_eq!(RasterFormat::from_name("netcdf").extension(), "nc");
        assert_eq!(
            RasterFormat::from_name("netcdf").content_type(),
            "application/netcdf"
        );
        assert_eq!(RasterFormat::from_name("png").extension(), "wcs");
        assert_eq!(
            RasterFormat::from_name("png").content_type(),
            "application/wcs"
        );
    }

    #[test]
    fn test_geotiff_window_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut enc = new_encoder(tmp.path(), RasterFormat::GeoTiff, 8, 8);
        enc.write_window(&tile(4, 4, 0, 0, 1.0)).unwrap();
        enc.write_window(&tile(4, 4, 4, 4, 100.0)).unwrap();
        enc.close().unwrap();

        let mut reader = TiffWindowReader::open(tmp.path()).unwrap();
        assert_eq!(reader.width, 8);
        assert_eq!(reader.height, 8);
        assert_eq!(reader.bands, 1);

        let win = reader.read_window(0, 0, 4, 4).unwrap();
        assert_eq!(win.bands[0][0], 1.0);
        assert_eq!(win.bands[0][15], 16.0);

        let win = reader.read_window(4, 4, 4, 4).unwrap();
        assert_eq!(win.bands[0][0], 100.0);

        // Untouched area stays zero: tiles partition the frame.
        let win = reader.read_window(4, 0, 4, 4).unwrap();
        assert!(win.bands[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_write_window_bounds_check() {
        let tmp = NamedTempFile::new().unwrap();
        let mut enc = new_encoder(tmp.path(), RasterFormat::GeoTiff, 8, 8);
        assert!(enc.write_window(&tile(4, 4, 6, 6, 0.0)).is_err());
    }

    #[test]
    fn test_empty_tile_write_is_noop() {
        let tmp = NamedTempFile::new().unwrap();
        let mut enc = new_encoder(tmp.path(), RasterFormat::GeoTiff, 8, 8);
        enc.write_window(&DecodedTile::empty(0, 0)).unwrap();
    }

    #[test]
    fn test_merge_from_worker_file() {
        let master_tmp = NamedTempFile::new().unwrap();
        let worker_tmp = NamedTempFile::new().unwrap();

        // The worker writes its batch into a frame of master dimensions.
        let mut worker_enc = new_encoder(worker_tmp.path(), RasterFormat::GeoTiff, 8, 8);
        worker_enc.write_window(&tile(4, 4, 4, 0, 50.0)).unwrap();
        worker_enc.close().unwrap();

        let mut master = new_encoder(master_tmp.path(), RasterFormat::GeoTiff, 8, 8);
        master.write_window(&tile(4, 4, 0, 0, 1.0)).unwrap();
        master
            .merge(
                worker_tmp.path(),
                &[MergeWindow {
                    off_x: 4,
                    off_y: 0,
                    width: 4,
                    height: 4,
                }],
            )
            .unwrap();
        master.close().unwrap();

        let mut reader = TiffWindowReader::open(master_tmp.path()).unwrap();
        let win = reader.read_window(4, 0, 4, 4).unwrap();
        assert_eq!(win.bands[0][0], 50.0);
        let win = reader.read_window(0, 0, 4, 4).unwrap();
        assert_eq!(win.bands[0][0], 1.0);
    }

    #[test]
    fn test_netcdf_magic_and_size() {
        let tmp = NamedTempFile::new().unwrap();
        let mut enc = new_encoder(tmp.path(), RasterFormat::NetCdf, 8, 8);
        enc.write_window(&tile(8, 8, 0, 0, 1.0)).unwrap();
        enc.close().unwrap();

        let bytes = std::fs::read(tmp.path()).unwrap();
        assert_eq!(&bytes[0..4], b"CDF\x02");
        // header plus one 8x8 float plane
        assert!(bytes.len() > 8 * 8 * 4);
    }

    #[test]
    fn test_zero_frame_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let result = MasterEncoder::create(
            tmp.path(),
            &RasterFormat::GeoTiff,
            [0.0; 6],
            4326,
            0,
            0,
            &[],
        );
        assert!(result.is_err());
    }
}
