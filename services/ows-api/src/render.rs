//! Map-tile rendering: post-decode value transform, palette lookup, and
//! PNG encoding.
//!
//! Two encoding modes: indexed PNG (colour type 3) when a single band is
//! drawn through a palette with no transparent pixels, RGBA (colour type 6)
//! otherwise.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use ows_common::config::Palette;
use ows_common::error::{OwsError, OwsResult};

use crate::tile::{DecodedTile, ScaleParams};

/// A byte raster produced by the scale transform. `alpha` is zero where the
/// source was nodata.
#[derive(Debug, Clone)]
pub struct ByteRaster {
    pub width: usize,
    pub height: usize,
    pub bands: Vec<Vec<u8>>,
    pub alpha: Vec<u8>,
}

impl ByteRaster {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.bands.is_empty()
    }
}

/// Apply the per-layer `offset/scale/clip` transform, mapping raw band
/// values to bytes. A zero scale auto-normalises each band over its finite
/// value range.
pub fn scale_tile(tile: &DecodedTile, params: ScaleParams) -> ByteRaster {
    let n = tile.width * tile.height;
    let mut alpha = vec![255u8; n];
    let mut bands = Vec::with_capacity(tile.bands.len());

    for band in &tile.bands {
        let (auto_min, auto_range) = if params.scale == 0.0 {
            let mut min = f32::INFINITY;
            let mut max = f32::NEG_INFINITY;
            for &v in band.iter() {
                if v.is_finite() && v != tile.nodata {
                    min = min.min(v);
                    max = max.max(v);
                }
            }
            if min.is_finite() && max > min {
                (min, max - min)
            } else {
                (0.0, 1.0)
            }
        } else {
            (0.0, 0.0)
        };

        let mut out = vec![0u8; n];
        for (i, &v) in band.iter().enumerate() {
            if !v.is_finite() || v == tile.nodata {
                alpha[i] = 0;
                continue;
            }
            let scaled = if params.scale == 0.0 {
                (v - auto_min) as f64 / auto_range as f64 * 255.0
            } else {
                let mut s = (v as f64 + params.offset) * params.scale;
                if params.clip > 0.0 {
                    s = s.min(params.clip) / params.clip * 255.0;
                }
                s
            };
            out[i] = scaled.clamp(0.0, 255.0) as u8;
        }
        bands.push(out);
    }

    ByteRaster {
        width: tile.width,
        height: tile.height,
        bands,
        alpha,
    }
}

/// Interpolate palette control points to a 256-entry lookup table.
pub fn palette_lut(palette: &Palette) -> OwsResult<[[u8; 4]; 256]> {
    let colours = &palette.colours;
    if colours.is_empty() {
        return Err(OwsError::RenderError("palette has no colours".to_string()));
    }
    let mut lut = [[0u8; 4]; 256];
    if colours.len() == 1 || !palette.interpolate {
        for (i, entry) in lut.iter_mut().enumerate() {
            let idx = i * colours.len() / 256;
            *entry = colours[idx.min(colours.len() - 1)];
        }
        return Ok(lut);
    }

    let spans = colours.len() - 1;
    for (i, entry) in lut.iter_mut().enumerate() {
        let pos = i as f64 / 255.0 * spans as f64;
        let lo = (pos.floor() as usize).min(spans - 1);
        let frac = pos - lo as f64;
        for c in 0..4 {
            let a = colours[lo][c] as f64;
            let b = colours[lo + 1][c] as f64;
            entry[c] = (a + (b - a) * frac).round() as u8;
        }
    }
    Ok(lut)
}

/// Encode a byte raster to PNG, using the palette for single-band rasters.
pub fn render_png(raster: &ByteRaster, palette: Option<&Palette>) -> OwsResult<Vec<u8>> {
    if raster.is_empty() {
        return Err(OwsError::RenderError("empty raster".to_string()));
    }

    if raster.bands.len() == 1 {
        if let Some(palette) = palette {
            let lut = palette_lut(palette)?;
            let fully_opaque = raster.alpha.iter().all(|&a| a == 255);
            if fully_opaque {
                return create_png_indexed(raster.width, raster.height, &lut, &raster.bands[0]);
            }
            // Transparency needs the RGBA path.
            let mut pixels = Vec::with_capacity(raster.width * raster.height * 4);
            for (i, &idx) in raster.bands[0].iter().enumerate() {
                let [r, g, b, a] = lut[idx as usize];
                pixels.extend_from_slice(&[r, g, b, a.min(raster.alpha[i])]);
            }
            return create_png(&pixels, raster.width, raster.height);
        }
        // Greyscale without a palette.
        let mut pixels = Vec::with_capacity(raster.width * raster.height * 4);
        for (i, &v) in raster.bands[0].iter().enumerate() {
            pixels.extend_from_slice(&[v, v, v, raster.alpha[i]]);
        }
        return create_png(&pixels, raster.width, raster.height);
    }

    // RGB(A) from the first three bands.
    if raster.bands.len() < 3 {
        return Err(OwsError::RenderError(format!(
            "expected 1 or 3 bands, got {}",
            raster.bands.len()
        )));
    }
    let mut pixels = Vec::with_capacity(raster.width * raster.height * 4);
    for i in 0..raster.width * raster.height {
        pixels.extend_from_slice(&[
            raster.bands[0][i],
            raster.bands[1][i],
            raster.bands[2][i],
            raster.alpha[i],
        ]);
    }
    create_png(&pixels, raster.width, raster.height)
}

/// Placeholder tile: the configured legend asset when present, otherwise a
/// transparent PNG of the requested size.
pub fn placeholder_png(path: &str, width: usize, height: usize) -> OwsResult<Vec<u8>> {
    if !path.is_empty() {
        if let Ok(bytes) = std::fs::read(path) {
            return Ok(bytes);
        }
    }
    let pixels = vec![0u8; width.max(1) * height.max(1) * 4];
    create_png(&pixels, width.max(1), height.max(1))
}

/// Create a PNG from RGBA pixel data (colour type 6).
pub fn create_png(pixels: &[u8], width: usize, height: usize) -> OwsResult<Vec<u8>> {
    let mut png = Vec::new();
    png.extend_from_slice(&[137, 80, 78, 71, 13, 10, 26, 10]);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&(width as u32).to_be_bytes());
    ihdr.extend_from_slice(&(height as u32).to_be_bytes());
    ihdr.push(8); // bit depth
    ihdr.push(6); // colour type RGBA
    ihdr.push(0);
    ihdr.push(0);
    ihdr.push(0);
    write_chunk(&mut png, b"IHDR", &ihdr);

    let mut raw = Vec::with_capacity(height * (1 + width * 4));
    for y in 0..height {
        raw.push(0); // filter: none
        raw.extend_from_slice(&pixels[y * width * 4..(y + 1) * width * 4]);
    }
    let idat = deflate(&raw)?;
    write_chunk(&mut png, b"IDAT", &idat);
    write_chunk(&mut png, b"IEND", &[]);
    Ok(png)
}

/// Create an indexed PNG (colour type 3) from a 256-entry palette.
pub fn create_png_indexed(
    width: usize,
    height: usize,
    lut: &[[u8; 4]; 256],
    indices: &[u8],
) -> OwsResult<Vec<u8>> {
    let mut png = Vec::new();
    png.extend_from_slice(&[137, 80, 78, 71, 13, 10, 26, 10]);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&(width as u32).to_be_bytes());
    ihdr.extend_from_slice(&(height as u32).to_be_bytes());
    ihdr.push(8); // bit depth per palette index
    ihdr.push(3); // colour type indexed
    ihdr.push(0);
    ihdr.push(0);
    ihdr.push(0);
    write_chunk(&mut png, b"IHDR", &ihdr);

    let mut plte = Vec::with_capacity(256 * 3);
    for [r, g, b, _] in lut {
        plte.extend_from_slice(&[*r, *g, *b]);
    }
    write_chunk(&mut png, b"PLTE", &plte);

    if lut.iter().any(|[_, _, _, a]| *a < 255) {
        let trns: Vec<u8> = lut.iter().map(|[_, _, _, a]| *a).collect();
        write_chunk(&mut png, b"tRNS", &trns);
    }

    let mut raw = Vec::with_capacity(height * (1 + width));
    for y in 0..height {
        raw.push(0);
        raw.extend_from_slice(&indices[y * width..(y + 1) * width]);
    }
    let idat = deflate(&raw)?;
    write_chunk(&mut png, b"IDAT", &idat);
    write_chunk(&mut png, b"IEND", &[]);
    Ok(png)
}

fn deflate(raw: &[u8]) -> OwsResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(raw)
        .map_err(|e| OwsError::RenderError(format!("IDAT compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| OwsError::RenderError(format!("IDAT compression failed: {}", e)))
}

fn write_chunk(png: &mut Vec<u8>, chunk_type: &[u8; 4], data: &[u8]) {
    png.extend_from_slice(&(data.len() as u32).to_be_bytes());
    png.extend_from_slice(chunk_type);
    png.extend_from_slice(data);
    let crc_data = [chunk_type.as_slice(), data].concat();
    png.extend_from_slice(&crc32fast::hash(&crc_data).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

    fn one_band_tile() -> DecodedTile {
        DecodedTile {
            width: 2,
            height: 2,
            raster_type: "Float32".to_string(),
            bands: vec![vec![0.0, 50.0, 100.0, -999.0]],
            nodata: -999.0,
            off_x: 0,
            off_y: 0,
        }
    }

    #[test]
    fn test_scale_auto_normalise() {
        let raster = scale_tile(&one_band_tile(), ScaleParams::default());
        assert_eq!(raster.bands[0][0], 0);
        assert_eq!(raster.bands[0][2], 255);
        assert_eq!(raster.alpha[3], 0); // nodata
    }

    #[test]
    fn test_scale_with_clip() {
        let params = ScaleParams {
            offset: 0.0,
            scale: 1.0,
            clip: 100.0,
        };
        let raster = scale_tile(&one_band_tile(), params);
        assert_eq!(raster.bands[0][0], 0);
        assert_eq!(raster.bands[0][1], 127); // 50/100 * 255
        assert_eq!(raster.bands[0][2], 255);
    }

    #[test]
    fn test_palette_lut_interpolation() {
        let palette = Palette {
            colours: vec![[0, 0, 0, 255], [255, 255, 255, 255]],
            interpolate: true,
        };
        let lut = palette_lut(&palette).unwrap();
        assert_eq!(lut[0], [0, 0, 0, 255]);
        assert_eq!(lut[255], [255, 255, 255, 255]);
        assert_eq!(lut[128][0], 128);
    }

    #[test]
    fn test_render_indexed_png_when_opaque() {
        let palette = Palette {
            colours: vec![[0, 0, 255, 255], [255, 0, 0, 255]],
            interpolate: true,
        };
        let raster = ByteRaster {
            width: 2,
            height: 2,
            bands: vec![vec![0, 64, 128, 255]],
            alpha: vec![255; 4],
        };
        let png = render_png(&raster, Some(&palette)).unwrap();
        assert_eq!(&png[0..8], &PNG_MAGIC);
        // indexed colour type
        assert_eq!(png[25], 3);
    }

    #[test]
    fn test_render_rgba_with_nodata() {
        let palette = Palette {
            colours: vec![[0, 0, 255, 255], [255, 0, 0, 255]],
            interpolate: true,
        };
        let raster = ByteRaster {
            width: 2,
            height: 1,
            bands: vec![vec![0, 255]],
            alpha: vec![255, 0],
        };
        let png = render_png(&raster, Some(&palette)).unwrap();
        assert_eq!(png[25], 6);
    }

    #[test]
    fn test_render_rejects_two_bands() {
        let raster = ByteRaster {
            width: 1,
            height: 1,
            bands: vec![vec![0], vec![0]],
            alpha: vec![255],
        };
        assert!(render_png(&raster, None).is_err());
    }

    #[test]
    fn test_placeholder_falls_back_to_transparent() {
        let png = placeholder_png("", 16, 16).unwrap();
        assert_eq!(&png[0..8], &PNG_MAGIC);

        let png = placeholder_png("/nonexistent/zoom.png", 16, 16).unwrap();
        assert_eq!(&png[0..8], &PNG_MAGIC);
    }
}
