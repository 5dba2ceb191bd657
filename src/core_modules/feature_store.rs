// THEORY:
// The `FeatureStore` is the read path between the corpus and the scoring
// pass. It supplies precomputed bin-count vectors by image identifier so the
// engine never re-derives corpus histograms on every query when a stored row
// exists.
//
// Two sources feed it:
// 1.  **Persisted tables**: plain fixed-width numeric text tables, one row
//     per image (`id,c0,c1,...`), columns in bin order — 25 for intensity,
//     64 for color code. Rows are kept in file order, which defines the
//     corpus order used for deterministic tie-breaking downstream.
// 2.  **Fallback extraction**: an optional image directory. A lookup miss
//     decodes the image, derives both histograms in one pass, and caches
//     them in memory for the rest of the session. Decode buffers are dropped
//     as soon as the histograms exist.
//
// A miss with no fallback configured is a `NotFound` error; a missing row
// breaks feature-matrix alignment, so callers abort the pass on it.
//
// `precompute_tables` is the offline writer that produces both tables for a
// directory of images, so deployments can ship bins instead of re-extracting
// on device.

use crate::core_modules::histogram::{
    BinHistogram, COLOR_CODE_BIN_COUNT, INTENSITY_BIN_COUNT, Method,
};
use crate::core_modules::pixel::pixel;
use crate::error::{RetrievalError, Result};
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type ImageId = String;

/// Extensions tried when resolving an identifier inside the fallback
/// directory.
const FALLBACK_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Read-only lookup from image identifier to precomputed bin-count vectors,
/// with optional on-miss extraction.
pub struct FeatureStore {
    /// Corpus identifiers in their stable, deterministic order.
    order: Vec<ImageId>,
    intensity: HashMap<ImageId, BinHistogram>,
    color_code: HashMap<ImageId, BinHistogram>,
    /// Directory of source images used when no stored row exists.
    fallback_root: Option<PathBuf>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            intensity: HashMap::new(),
            color_code: HashMap::new(),
            fallback_root: None,
        }
    }

    pub fn with_fallback(root: impl Into<PathBuf>) -> Self {
        let mut store = Self::new();
        store.fallback_root = Some(root.into());
        store
    }

    /// Corpus identifiers in corpus order. Populated by table loads and
    /// fallback scans/extractions.
    pub fn corpus_ids(&self) -> &[ImageId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Loads the persisted intensity table (25 columns per row).
    pub fn load_intensity_table(&mut self, path: &Path) -> Result<usize> {
        let rows = load_table(path, INTENSITY_BIN_COUNT)?;
        let loaded = rows.len();
        for (id, counts) in rows {
            self.register(&id);
            self.intensity.insert(id, BinHistogram::from_counts(counts));
        }
        info!("loaded {loaded} intensity rows from {}", path.display());
        Ok(loaded)
    }

    /// Loads the persisted color-code table (64 columns per row).
    pub fn load_color_code_table(&mut self, path: &Path) -> Result<usize> {
        let rows = load_table(path, COLOR_CODE_BIN_COUNT)?;
        let loaded = rows.len();
        for (id, counts) in rows {
            self.register(&id);
            self.color_code
                .insert(id, BinHistogram::from_counts(counts));
        }
        info!("loaded {loaded} color-code rows from {}", path.display());
        Ok(loaded)
    }

    /// Enumerates the fallback directory and registers every decodable image
    /// file as a corpus member, in deterministic order. Extraction itself
    /// stays lazy. Returns the number of identifiers registered.
    pub fn scan_fallback(&mut self) -> Result<usize> {
        let Some(root) = self.fallback_root.clone() else {
            warn!("fallback scan requested but no image directory is configured");
            return Ok(0);
        };
        let entries = fs::read_dir(&root).map_err(|e| RetrievalError::Store {
            path: root.display().to_string(),
            line: 0,
            reason: e.to_string(),
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RetrievalError::Store {
                path: root.display().to_string(),
                line: 0,
                reason: e.to_string(),
            })?;
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    FALLBACK_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
                });
            if !is_image {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort_by(|a, b| corpus_order(a, b));

        let mut registered = 0;
        for id in ids {
            if !self.order.contains(&id) {
                self.order.push(id);
                registered += 1;
            }
        }
        info!("registered {registered} corpus images from {}", root.display());
        Ok(registered)
    }

    /// The raw store interface: a fixed-length bin-count vector for the
    /// identifier and method, or `NotFound`. The combined method requires
    /// both primitive vectors and returns their concatenation.
    pub fn lookup(&mut self, id: &str, method: Method) -> Result<Vec<u64>> {
        match method {
            Method::Intensity => Ok(self.intensity_histogram(id)?.counts().to_vec()),
            Method::ColorCode => Ok(self.color_code_histogram(id)?.counts().to_vec()),
            Method::Combined => {
                let mut counts = self.intensity_histogram(id)?.counts().to_vec();
                counts.extend_from_slice(self.color_code_histogram(id)?.counts());
                Ok(counts)
            }
        }
    }

    pub fn intensity_histogram(&mut self, id: &str) -> Result<BinHistogram> {
        if !self.intensity.contains_key(id) {
            self.extract_and_cache(id, Method::Intensity)?;
        }
        Ok(self.intensity[id].clone())
    }

    pub fn color_code_histogram(&mut self, id: &str) -> Result<BinHistogram> {
        if !self.color_code.contains_key(id) {
            self.extract_and_cache(id, Method::ColorCode)?;
        }
        Ok(self.color_code[id].clone())
    }

    /// The 89-wide combined feature vector: intensity frequencies followed
    /// by color-code frequencies, each part normalized exactly once by its
    /// own pixel total.
    pub fn combined_features(&mut self, id: &str) -> Result<Vec<f64>> {
        let mut features = self.intensity_histogram(id)?.frequencies();
        features.extend(self.color_code_histogram(id)?.frequencies());
        Ok(features)
    }

    /// Derives both tables for every image in `image_dir` and writes them as
    /// persisted feature tables. Returns the number of images processed.
    pub fn precompute_tables(
        image_dir: &Path,
        intensity_out: &Path,
        color_code_out: &Path,
    ) -> Result<usize> {
        let mut store = FeatureStore::with_fallback(image_dir);
        store.scan_fallback()?;

        let ids = store.corpus_ids().to_vec();
        let mut intensity_rows = String::new();
        let mut color_code_rows = String::new();
        for id in &ids {
            let intensity = store.intensity_histogram(id)?;
            let color_code = store.color_code_histogram(id)?;
            intensity_rows.push_str(&format_row(id, intensity.counts()));
            color_code_rows.push_str(&format_row(id, color_code.counts()));
        }

        write_table(intensity_out, &intensity_rows)?;
        write_table(color_code_out, &color_code_rows)?;
        info!(
            "precomputed feature tables for {} images from {}",
            ids.len(),
            image_dir.display()
        );
        Ok(ids.len())
    }

    /// On-miss extraction: decode the source image once, derive and cache
    /// both histograms. Fails with `NotFound` when no fallback is configured
    /// or the identifier resolves to no file.
    fn extract_and_cache(&mut self, id: &str, method: Method) -> Result<()> {
        let Some(root) = self.fallback_root.as_deref() else {
            return Err(RetrievalError::NotFound {
                id: id.to_string(),
                method,
            });
        };
        let Some(path) = resolve_fallback_path(root, id) else {
            return Err(RetrievalError::NotFound {
                id: id.to_string(),
                method,
            });
        };

        debug!("extracting features for image {id} from {}", path.display());
        let colors = pixel::colors_from_file(&path)?;
        self.register(id);
        self.intensity
            .insert(id.to_string(), BinHistogram::intensity(&colors));
        self.color_code
            .insert(id.to_string(), BinHistogram::color_code(&colors));
        Ok(())
    }

    fn register(&mut self, id: &str) {
        if !self.order.iter().any(|existing| existing == id) {
            self.order.push(id.to_string());
        }
    }
}

impl Default for FeatureStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric-aware ordering so "2" sorts before "10" in all-numeric corpora,
/// falling back to lexical order otherwise.
fn corpus_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn resolve_fallback_path(root: &Path, id: &str) -> Option<PathBuf> {
    let direct = root.join(id);
    if direct.is_file() {
        return Some(direct);
    }
    FALLBACK_EXTENSIONS
        .iter()
        .map(|ext| root.join(format!("{id}.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn load_table(path: &Path, expected_columns: usize) -> Result<Vec<(ImageId, Vec<u64>)>> {
    let content = fs::read_to_string(path).map_err(|e| RetrievalError::Store {
        path: path.display().to_string(),
        line: 0,
        reason: e.to_string(),
    })?;

    let mut rows = Vec::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split(',');
        let id = fields
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RetrievalError::Store {
                path: path.display().to_string(),
                line: line_number,
                reason: "missing image identifier".to_string(),
            })?;

        let counts = fields
            .map(|field| {
                field.trim().parse::<u64>().map_err(|e| RetrievalError::Store {
                    path: path.display().to_string(),
                    line: line_number,
                    reason: format!("bad bin count {:?}: {e}", field.trim()),
                })
            })
            .collect::<Result<Vec<u64>>>()?;

        if counts.len() != expected_columns {
            return Err(RetrievalError::Store {
                path: path.display().to_string(),
                line: line_number,
                reason: format!("expected {expected_columns} bins, found {}", counts.len()),
            });
        }
        rows.push((id.to_string(), counts));
    }
    Ok(rows)
}

fn format_row(id: &str, counts: &[u64]) -> String {
    let mut row = id.to_string();
    for count in counts {
        row.push(',');
        row.push_str(&count.to_string());
    }
    row.push('\n');
    row
}

fn write_table(path: &Path, rows: &str) -> Result<()> {
    fs::write(path, rows).map_err(|e| RetrievalError::Store {
        path: path.display().to_string(),
        line: 0,
        reason: e.to_string(),
    })
}
